//! Shared view of every shard owned by this worker.

use crate::error::ShardError;
use crate::session::ShardState;
use common::ControlCommand;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Snapshot of one shard, as reported by `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub shard_id: u64,
    pub state: ShardState,
    /// Last dispatch sequence number of the current session.
    pub sequence: Option<u64>,
    /// Unix millis of the last dispatch received.
    pub last_event_at: Option<i64>,
    /// Connections lost since start.
    pub disconnects: u64,
}

impl ShardStatus {
    fn new(shard_id: u64) -> Self {
        Self {
            shard_id,
            state: ShardState::Disconnected,
            sequence: None,
            last_event_at: None,
            disconnects: 0,
        }
    }
}

struct ShardEntry {
    status: ShardStatus,
    command_tx: Option<mpsc::Sender<ControlCommand>>,
}

/// Shard states plus the command senders of their managers.
///
/// Handlers write their state here; the supervisor and the HTTP API read it.
#[derive(Clone, Default)]
pub struct ShardRegistry {
    shards: Arc<DashMap<u64, ShardEntry>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard with the sender of its manager's command channel.
    pub fn register(&self, shard_id: u64, command_tx: mpsc::Sender<ControlCommand>) {
        self.shards.insert(
            shard_id,
            ShardEntry {
                status: ShardStatus::new(shard_id),
                command_tx: Some(command_tx),
            },
        );
    }

    /// Apply `f` to a shard's status, creating the entry if needed.
    pub fn update<F: FnOnce(&mut ShardStatus)>(&self, shard_id: u64, f: F) {
        let mut entry = self.shards.entry(shard_id).or_insert_with(|| ShardEntry {
            status: ShardStatus::new(shard_id),
            command_tx: None,
        });
        f(&mut entry.status);
    }

    pub fn state(&self, shard_id: u64) -> Option<ShardState> {
        self.shards.get(&shard_id).map(|e| e.status.state)
    }

    /// Queue `payload` for writing on the shard's socket.
    ///
    /// Only Connected shards accept payloads; nothing is buffered for later.
    pub fn send(&self, shard_id: u64, payload: String) -> Result<(), ShardError> {
        let entry = self
            .shards
            .get(&shard_id)
            .ok_or(ShardError::NotConnected(shard_id))?;

        if entry.status.state != ShardState::Connected {
            return Err(ShardError::NotConnected(shard_id));
        }

        let tx = entry
            .command_tx
            .as_ref()
            .ok_or(ShardError::NotConnected(shard_id))?;

        tx.try_send(ControlCommand::Send(payload))
            .map_err(|e| match e {
                TrySendError::Full(_) => ShardError::QueueFull(shard_id),
                TrySendError::Closed(_) => ShardError::NotConnected(shard_id),
            })
    }

    /// Ask every registered shard to close its socket and stop.
    pub fn shutdown_all(&self) {
        for entry in self.shards.iter() {
            if let Some(tx) = &entry.command_tx {
                let _ = tx.try_send(ControlCommand::Shutdown);
            }
        }
    }

    /// Status of every shard, ordered by shard id.
    pub fn statuses(&self) -> Vec<ShardStatus> {
        let mut statuses: Vec<ShardStatus> =
            self.shards.iter().map(|e| e.status.clone()).collect();
        statuses.sort_by_key(|s| s.shard_id);
        statuses
    }

    pub fn connected_count(&self) -> usize {
        self.shards
            .iter()
            .filter(|e| e.status.state == ShardState::Connected)
            .count()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_unknown_shard() {
        let registry = ShardRegistry::new();
        assert_eq!(
            registry.send(3, "{}".into()),
            Err(ShardError::NotConnected(3))
        );
    }

    #[test]
    fn test_send_requires_connected_state() {
        let registry = ShardRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(0, tx);

        assert_eq!(
            registry.send(0, "a".into()),
            Err(ShardError::NotConnected(0))
        );
        registry.update(0, |s| s.state = ShardState::Resuming);
        assert_eq!(
            registry.send(0, "a".into()),
            Err(ShardError::NotConnected(0))
        );

        registry.update(0, |s| s.state = ShardState::Connected);
        assert_eq!(registry.send(0, "b".into()), Ok(()));
        match rx.try_recv() {
            Ok(ControlCommand::Send(payload)) => assert_eq!(payload, "b"),
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_full_and_closed_channel() {
        let registry = ShardRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        registry.register(1, tx);
        registry.update(1, |s| s.state = ShardState::Connected);

        assert!(registry.send(1, "first".into()).is_ok());
        assert_eq!(
            registry.send(1, "second".into()),
            Err(ShardError::QueueFull(1))
        );

        drop(rx);
        assert_eq!(
            registry.send(1, "third".into()),
            Err(ShardError::NotConnected(1))
        );
    }

    #[test]
    fn test_statuses_sorted() {
        let registry = ShardRegistry::new();
        for id in [2, 0, 1] {
            let (tx, _rx) = mpsc::channel(1);
            registry.register(id, tx);
        }
        registry.update(1, |s| s.state = ShardState::Connected);

        let ids: Vec<u64> = registry.statuses().iter().map(|s| s.shard_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(registry.connected_count(), 1);
        assert_eq!(registry.len(), 3);
    }
}
