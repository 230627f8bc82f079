// =============================================================================
// Spread-state persistence — resume across restarts
// =============================================================================
//
// Written after every grid mutation and read back at startup. The file
// carries the open spreads plus the realised-since-session-start figure so a
// mid-session restart keeps the risk ledger honest. Saves use the atomic
// tmp + rename pattern.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::tracker::SpreadState;
use crate::types::SpreadSide;

/// One persisted spread, schema-stable across versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSpread {
    pub spread_id: String,
    pub side: SpreadSide,
    pub entry_z: f64,
    pub last_z_entry: f64,
    pub next_z_entry: f64,
    pub first_entry_spread_mean: f64,
    pub primary_lots: f64,
    pub secondary_lots: f64,
    pub entry_hedge_ratio: f64,
    pub entry_time: String,
}

impl From<&SpreadState> for PersistedSpread {
    fn from(state: &SpreadState) -> Self {
        Self {
            spread_id: state.spread_id.clone(),
            side: state.side,
            entry_z: state.entry_z,
            last_z_entry: state.last_z_entry,
            next_z_entry: state.next_z_entry,
            first_entry_spread_mean: state.first_entry_spread_mean,
            primary_lots: state.primary_lots,
            secondary_lots: state.secondary_lots,
            entry_hedge_ratio: state.entry_hedge_ratio,
            entry_time: state.entry_time.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub spread_states: Vec<PersistedSpread>,
    #[serde(default)]
    pub realised_since_session_start: f64,
    /// Session the realised figure belongs to; a restart in a different
    /// session discards it.
    #[serde(default)]
    pub session_key: String,
}

/// Read the state file. A missing file is a clean start, not an error.
pub fn load(path: impl AsRef<Path>) -> Result<Option<StateFile>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    let state: StateFile = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse state file {}", path.display()))?;
    info!(
        path = %path.display(),
        spreads = state.spread_states.len(),
        realised = state.realised_since_session_start,
        "state file loaded"
    );
    Ok(Some(state))
}

/// Atomic save (tmp + rename).
pub fn save(path: impl AsRef<Path>, state: &StateFile) -> Result<()> {
    let path = path.as_ref();
    let content = serde_json::to_string_pretty(state).context("failed to serialise state file")?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;

    debug!(path = %path.display(), spreads = state.spread_states.len(), "state file saved");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StateFile {
        StateFile {
            spread_states: vec![PersistedSpread {
                spread_id: "101-102".to_string(),
                side: SpreadSide::Long,
                entry_z: -2.1,
                last_z_entry: -2.1,
                next_z_entry: -2.6,
                first_entry_spread_mean: 1700.0,
                primary_lots: 0.10,
                secondary_lots: -3.00,
                entry_hedge_ratio: 30.0,
                entry_time: "2026-01-05T10:00:00Z".to_string(),
            }],
            realised_since_session_start: -1200.0,
            session_key: "2026-01-05".to_string(),
        }
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = std::env::temp_dir().join("meridian-persist-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("spread_state.json");

        save(&path, &sample()).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.spread_states.len(), 1);
        assert_eq!(loaded.spread_states[0].spread_id, "101-102");
        assert_eq!(loaded.realised_since_session_start, -1200.0);
        assert_eq!(loaded.session_key, "2026-01-05");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_is_clean_start() {
        let path = std::env::temp_dir().join("meridian-persist-missing.json");
        std::fs::remove_file(&path).ok();
        assert!(load(&path).unwrap().is_none());
    }

    #[test]
    fn empty_object_deserialises_with_defaults() {
        let state: StateFile = serde_json::from_str("{}").unwrap();
        assert!(state.spread_states.is_empty());
        assert_eq!(state.realised_since_session_start, 0.0);
    }
}
