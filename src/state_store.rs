// =============================================================================
// Persisted state — `{active: {<symbol>: PositionState}}` on disk
// =============================================================================
//
// The atomic tmp+rename write is teacher's `runtime_config.rs::save` idiom,
// reused here for a different payload shape. The load-side semantics —
// missing or corrupt file quietly becomes an empty state rather than an
// error — are grounded on `original_source/state_store.py::load_state`
// (`except Exception: return {}`), per spec.md §7(f).
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::position_state::PositionState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub active: HashMap<String, PositionState>,
}

/// Loads persisted state from `path`. A missing file, an unreadable file,
/// or a file that fails to parse as `PersistedState` JSON all resolve to an
/// empty state rather than propagating an error — the engine always has
/// somewhere to start from.
pub fn load_state(path: impl AsRef<Path>) -> PersistedState {
    let path = path.as_ref();
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return PersistedState::default(),
    };
    match serde_json::from_str(&content) {
        Ok(state) => {
            info!(path = %path.display(), "loaded persisted state");
            state
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state file corrupt — starting from empty state");
            PersistedState::default()
        }
    }
}

/// Persists `state` to `path` via write-to-temp-then-rename so a crash
/// mid-write cannot corrupt the previous file. Write failures are logged
/// and swallowed — every control tick tries again, matching
/// `original_source/state_store.py::save_state`'s best-effort semantics.
pub fn save_state(state: &PersistedState, path: impl AsRef<Path>) {
    let path = path.as_ref();
    let content = match serde_json::to_string_pretty(state) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to serialise state — skipping save");
            return;
        }
    };

    let tmp_path = path.with_extension("json.tmp");
    if let Err(e) = std::fs::write(&tmp_path, &content) {
        warn!(path = %tmp_path.display(), error = %e, "failed to write tmp state file");
        return;
    }
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        warn!(path = %path.display(), error = %e, "failed to rename tmp state file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::TradeLevels;
    use crate::types::Side;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("aurora-futures-engine-test-{name}-{}.json", std::process::id()));
        p
    }

    #[test]
    fn missing_file_loads_as_empty_state() {
        let path = temp_path("missing");
        let _ = std::fs::remove_file(&path);
        let state = load_state(&path);
        assert!(state.active.is_empty());
    }

    #[test]
    fn corrupt_file_loads_as_empty_state() {
        let path = temp_path("corrupt");
        std::fs::write(&path, b"{ not json at all").unwrap();
        let state = load_state(&path);
        assert!(state.active.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = temp_path("roundtrip");
        let mut state = PersistedState::default();
        state.active.insert(
            "BTCUSDT".to_string(),
            PositionState::Open(crate::position_state::OpenPosition::new(
                "BTCUSDT",
                Side::Buy,
                TradeLevels { entry: 100.0, sl: 99.0, tp1: 101.0, tp2: 102.0 },
                1.0,
                0.5,
            )),
        );
        save_state(&state, &path);
        let loaded = load_state(&path);
        assert_eq!(loaded.active.len(), 1);
        assert!(loaded.active["BTCUSDT"].is_open());
        let _ = std::fs::remove_file(&path);
    }
}
