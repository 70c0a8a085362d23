//! Plan persistence — best-effort JSON snapshots.
//!
//! The snapshot exists so an interrupted session can resume its plan; the
//! in-memory plan stays authoritative. The file is overwritten wholesale on
//! every save (last-writer-wins, one session per snapshot path) and every
//! failure is a warning, never fatal.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::plan::Plan;

pub trait PlanStore: Send + Sync {
    /// Missing snapshot means a fresh session, not an error.
    fn load(&self) -> Option<Plan>;
    fn save(&self, plan: &Plan);
    fn clear(&self);
}

/// Store for sub-agents and tests: persists nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlanStore;

impl PlanStore for NullPlanStore {
    fn load(&self) -> Option<Plan> {
        None
    }

    fn save(&self, _plan: &Plan) {}

    fn clear(&self) {}
}

pub struct JsonPlanStore {
    path: PathBuf,
}

impl JsonPlanStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl PlanStore for JsonPlanStore {
    fn load(&self) -> Option<Plan> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "failed to read plan snapshot");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(plan) => Some(plan),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "plan snapshot unreadable; starting fresh");
                None
            }
        }
    }

    fn save(&self, plan: &Plan) {
        if let Some(parent) = self.path.parent()
            && let Err(err) = std::fs::create_dir_all(parent)
        {
            warn!(path = %parent.display(), %err, "failed to create snapshot directory");
            return;
        }
        let json = match serde_json::to_string_pretty(plan) {
            Ok(json) => json,
            Err(err) => {
                warn!(%err, "failed to serialize plan snapshot");
                return;
            }
        };
        if let Err(err) = std::fs::write(&self.path, json) {
            warn!(path = %self.path.display(), %err, "failed to write plan snapshot");
        }
    }

    fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), %err, "failed to clear plan snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{StepStatus, step};

    #[test]
    fn missing_snapshot_loads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonPlanStore::new(&tmp.path().join("plan.json"));
        assert!(store.load().is_none());
    }

    #[test]
    fn save_then_load_round_trips_the_plan() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonPlanStore::new(&tmp.path().join("state").join("plan.json"));

        let plan = Plan::new(vec![
            step("build", StepStatus::Completed, &[], Some("cargo build")),
            step("test", StepStatus::Pending, &["build"], Some("cargo test")),
        ]);
        store.save(&plan);

        let loaded = store.load().expect("snapshot should load");
        assert_eq!(loaded, plan);
    }

    #[test]
    fn clear_removes_the_snapshot_and_tolerates_absence() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("plan.json");
        let store = JsonPlanStore::new(&path);

        store.save(&Plan::default());
        assert!(path.exists());
        store.clear();
        assert!(!path.exists());
        // Clearing again is fine.
        store.clear();
    }

    #[test]
    fn corrupt_snapshot_is_treated_as_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("plan.json");
        std::fs::write(&path, "not json at all").unwrap();
        assert!(JsonPlanStore::new(&path).load().is_none());
    }
}
