//! Shared runtime state for otr-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The book itself is not
//! cached here: every request loads it from the repo, and writes for one
//! owner are serialised through [`AppState::owner_lock`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use otr_md::PriceCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

use crate::repo::BookRepo;

// ---------------------------------------------------------------------------
// BusMsg
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat {
        ts_millis: i64,
    },
    /// A write landed for this owner; clients should reload.
    BookChanged {
        owner_id: Uuid,
        action: String,
        entries: usize,
    },
    LogLine {
        level: String,
        msg: String,
    },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub repo: Arc<dyn BookRepo>,
    pub prices: Arc<PriceCache>,
    owner_locks: Mutex<HashMap<Uuid, Arc<RwLock<()>>>>,
}

impl AppState {
    pub fn new(repo: Arc<dyn BookRepo>, prices: Arc<PriceCache>) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            bus,
            build: BuildInfo {
                service: "otr-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            repo,
            prices,
            owner_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Exclusive write guard for one owner's book. Held across
    /// load, apply and commit so concurrent writes cannot interleave.
    pub async fn owner_lock(&self, owner: Uuid) -> OwnedRwLockWriteGuard<()> {
        let slot = {
            let mut locks = self.owner_locks.lock().await;
            Arc::clone(locks.entry(owner).or_default())
        };
        slot.write_owned().await
    }

    pub fn publish_change(&self, owner_id: Uuid, action: &str, entries: usize) {
        let _ = self.bus.send(BusMsg::BookChanged {
            owner_id,
            action: action.to_string(),
            entries,
        });
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
