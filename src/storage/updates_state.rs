use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::file_store;

/// Per-user update-protocol cursor, as the platform hands it out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    #[serde(rename = "Pts")]
    pub pts: i32,
    #[serde(rename = "Qts")]
    pub qts: i32,
    #[serde(rename = "Seq")]
    pub seq: i32,
    #[serde(rename = "Date")]
    pub date: i32,
}

/// Snapshot of the update-protocol cursors for every authorized user and
/// their channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatesState {
    #[serde(default)]
    pub states: HashMap<i64, UserState>,
    #[serde(default)]
    pub channels: HashMap<i64, HashMap<i64, i32>>,
}

/// Persistence for the updates state the platform protocol requires.
///
/// The session collaborator drives it; this store only guarantees the
/// reset invariant and atomic durable writes.
pub struct UpdatesStateStore {
    path: PathBuf,
    state: StdMutex<UpdatesState>,
}

impl UpdatesStateStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => UpdatesState::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(Self {
            path,
            state: StdMutex::new(state),
        })
    }

    pub fn user_state(&self, user_id: i64) -> Option<UserState> {
        self.state.lock().unwrap().states.get(&user_id).copied()
    }

    /// Setting a user's top-level state resets that user's channel map:
    /// the fresh cursor invalidates every per-channel pts.
    pub fn set_user_state(&self, user_id: i64, user_state: UserState) {
        let mut state = self.state.lock().unwrap();
        state.states.insert(user_id, user_state);
        state.channels.remove(&user_id);
        debug!(user = user_id, "updates state reset");
    }

    pub fn channel_pts(&self, user_id: i64, channel_id: i64) -> Option<i32> {
        self.state
            .lock()
            .unwrap()
            .channels
            .get(&user_id)
            .and_then(|channels| channels.get(&channel_id))
            .copied()
    }

    pub fn set_channel_pts(&self, user_id: i64, channel_id: i64, pts: i32) {
        self.state
            .lock()
            .unwrap()
            .channels
            .entry(user_id)
            .or_default()
            .insert(channel_id, pts);
    }

    pub async fn save(&self) -> Result<()> {
        let snapshot = self.state.lock().unwrap().clone();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        file_store::write_atomic(&self.path, bytes).await
    }
}
