//! Per-shard session state machine.
//!
//! ```text
//! Disconnected ──socket open──▶ Handshaking ──Hello, no session──▶ (Identify) ──READY──▶ Connected
//!                                    │
//!                                    └──Hello, resumable session──▶ Resuming ──RESUMED──▶ Connected
//! any state ──socket error / close──▶ Disconnected
//! ```
//!
//! Backoff is owned by the WsManager and only applies on the way out of
//! Disconnected.

use serde::Serialize;

/// Connection state of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Disconnected,
    Handshaking,
    Resuming,
    Connected,
}

/// What to send in answer to Hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloAction {
    Identify,
    Resume { session_id: String, sequence: u64 },
}

/// Heartbeat was due but the previous one was never acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zombie;

#[derive(Debug, Clone)]
pub struct Session {
    state: ShardState,
    session_id: Option<String>,
    sequence: Option<u64>,
    resume_url: Option<String>,
    heartbeat_acked: bool,
    /// Resume attempts since the last READY/RESUMED.
    resume_attempts: u32,
    max_resume_attempts: u32,
}

impl Session {
    pub fn new(max_resume_attempts: u32) -> Self {
        Self {
            state: ShardState::Disconnected,
            session_id: None,
            sequence: None,
            resume_url: None,
            heartbeat_acked: true,
            resume_attempts: 0,
            max_resume_attempts,
        }
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Whether the next Hello will be answered with Resume.
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
            && self.sequence.is_some()
            && self.resume_attempts < self.max_resume_attempts
    }

    /// URL for the next connection attempt, when it differs from the default.
    pub fn resume_url(&self) -> Option<&str> {
        if self.can_resume() {
            self.resume_url.as_deref()
        } else {
            None
        }
    }

    /// The socket is open; waiting for Hello.
    pub fn on_connected(&mut self) {
        self.state = ShardState::Handshaking;
        self.heartbeat_acked = true;
    }

    /// Decide between Resume and Identify.
    ///
    /// Falls back to Identify (and forgets the session) once the resume
    /// attempts are used up.
    pub fn on_hello(&mut self) -> HelloAction {
        if let (true, Some(session_id), Some(sequence)) =
            (self.can_resume(), self.session_id.clone(), self.sequence)
        {
            self.resume_attempts += 1;
            self.state = ShardState::Resuming;
            return HelloAction::Resume {
                session_id,
                sequence,
            };
        }

        self.invalidate();
        self.state = ShardState::Handshaking;
        HelloAction::Identify
    }

    pub fn on_ready(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        self.resume_url = resume_url;
        self.resume_attempts = 0;
        self.state = ShardState::Connected;
    }

    pub fn on_resumed(&mut self) {
        self.resume_attempts = 0;
        self.state = ShardState::Connected;
    }

    /// Record a dispatch sequence number.
    ///
    /// Returns `false` for a number at or below the last one seen, i.e. an
    /// event replayed by a resume that was already processed.
    pub fn observe_sequence(&mut self, sequence: u64) -> bool {
        match self.sequence {
            Some(last) if sequence <= last => false,
            _ => {
                self.sequence = Some(sequence);
                true
            }
        }
    }

    /// Forget the session; the next Hello identifies from scratch.
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
        self.resume_attempts = 0;
    }

    pub fn on_disconnect(&mut self) {
        self.state = ShardState::Disconnected;
    }

    /// Mark a heartbeat as sent. Fails when the previous one is still unacknowledged.
    pub fn heartbeat_sent(&mut self) -> Result<(), Zombie> {
        if !self.heartbeat_acked {
            return Err(Zombie);
        }
        self.heartbeat_acked = false;
        Ok(())
    }

    pub fn heartbeat_acked(&mut self) {
        self.heartbeat_acked = true;
    }
}
