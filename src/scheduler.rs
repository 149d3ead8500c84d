//! Periodic playlist refresh.
//!
//! The refresh loop doesn't start ticking until the bot has seen its first
//! READY. After that it runs a sync immediately and then once per interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::playlist::{PlaylistSync, SyncError};

/// One-way "the bot is ready" flag. Clones share the same flag.
#[derive(Debug, Clone)]
pub struct ReadyGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Open the gate. Returns `true` only for the call that opened it.
    pub fn open(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this can't observe a closed channel.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// Spawn the refresh loop. It idles until `gate` opens.
pub fn spawn(sync: Arc<PlaylistSync>, gate: ReadyGate, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        gate.wait().await;
        info!(interval_secs = every.as_secs(), "playlist refresh loop started");

        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            refresh(&sync).await;
        }
    })
}

async fn refresh(sync: &PlaylistSync) {
    match sync.synchronize().await {
        Ok(summary) => info!(songs = summary.song_count, "scheduled playlist refresh done"),
        Err(SyncError::InProgress) => warn!("skipping scheduled refresh, another update is running"),
        Err(e) => error!(error = %e, "scheduled playlist refresh failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rank::RankClient;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn gate_opens_once() {
        let gate = ReadyGate::new();
        assert!(!gate.is_open());
        assert!(gate.open());
        assert!(!gate.open(), "second READY must not reopen");
        assert!(gate.clone().is_open());
    }

    #[tokio::test]
    async fn wait_returns_after_open() {
        let gate = ReadyGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        gate.open();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_waits_for_ready_then_runs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/leaderboards"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "leaderboards": [] })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let rank = RankClient::new(reqwest::Client::new(), server.uri(), server.uri());
        let sync = Arc::new(PlaylistSync::new(rank, dir.path().join("p.json")));
        let gate = ReadyGate::new();

        let task = spawn(sync, gate.clone(), Duration::from_secs(3600));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(server.received_requests().await.unwrap().is_empty());

        gate.open();
        let mut ran = false;
        for _ in 0..50 {
            if dir.path().join("p.json").exists() {
                ran = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        task.abort();

        assert!(ran, "first refresh should run right after READY");
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
