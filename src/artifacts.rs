//! Artifact and checkpoint store.
//!
//! Layout under the artifacts root:
//! - `plan/` — PRD, architecture, review, per-issue specs, rationale
//! - `execution/checkpoint.json` — the serialized DAG state
//! - `execution/iterations/<issue>/<NN>.json` — per-iteration records
//! - `verification/` — criterion-by-criterion results
//! - `logs/` — per-role invocation transcripts
//!
//! The checkpoint write is atomic: temp sibling, fsync, rename. A missing,
//! empty, or unparsable checkpoint loads as "no checkpoint".

use crate::dag::state::DagState;
use crate::errors::CheckpointError;
use crate::plan::PlanResult;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plan_dir(&self) -> PathBuf {
        self.root.join("plan")
    }

    pub fn execution_dir(&self) -> PathBuf {
        self.root.join("execution")
    }

    pub fn verification_dir(&self) -> PathBuf {
        self.root.join("verification")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.execution_dir().join("checkpoint.json")
    }

    pub fn ensure_layout(&self) -> Result<(), CheckpointError> {
        for dir in [
            self.plan_dir().join("issues"),
            self.execution_dir().join("iterations"),
            self.verification_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| CheckpointError::Write {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Atomically persist the DAG state.
    pub fn write_checkpoint(&self, state: &DagState) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path();
        let body = serde_json::to_vec_pretty(state)?;
        self.write_atomic(&path, &body)
    }

    /// Load the checkpoint, treating corruption as absence.
    pub fn load_checkpoint(&self) -> Option<DagState> {
        let path = self.checkpoint_path();
        let body = fs::read(&path).ok()?;
        if body.is_empty() {
            warn!(path = %path.display(), "checkpoint file is empty; ignoring");
            return None;
        }
        match serde_json::from_slice(&body) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "checkpoint unreadable; ignoring");
                None
            }
        }
    }

    /// Record one coding-loop iteration. Structured inputs and outputs
    /// only; prompt text is never persisted.
    pub fn write_iteration(
        &self,
        issue: &str,
        iteration: u32,
        record: &serde_json::Value,
    ) -> Result<(), CheckpointError> {
        let dir = self.execution_dir().join("iterations").join(issue);
        fs::create_dir_all(&dir).map_err(|e| CheckpointError::Write {
            path: dir.clone(),
            source: e,
        })?;
        let path = dir.join(format!("{iteration:02}.json"));
        let body = serde_json::to_vec_pretty(record)?;
        self.write_atomic(&path, &body)
    }

    /// Persist the plan artifacts.
    pub fn write_plan(&self, plan: &PlanResult) -> Result<(), CheckpointError> {
        self.ensure_layout()?;
        let dir = self.plan_dir();
        self.write_json(&dir.join("prd.json"), &plan.prd)?;
        self.write_json(&dir.join("architecture.json"), &plan.architecture)?;
        self.write_json(&dir.join("review.json"), &plan.review)?;
        self.write_json(&dir.join("issues.json"), &plan.issues)?;
        self.write_atomic(&self.root.join("rationale.md"), plan.rationale.as_bytes())?;
        Ok(())
    }

    pub fn write_verification(
        &self,
        cycle: u32,
        report: &serde_json::Value,
    ) -> Result<(), CheckpointError> {
        let path = self.verification_dir().join(format!("cycle-{cycle:02}.json"));
        let body = serde_json::to_vec_pretty(report)?;
        self.write_atomic(&path, &body)
    }

    fn write_json<T: serde::Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec_pretty(value)?;
        self.write_atomic(path, &body)
    }

    fn write_atomic(&self, path: &Path, body: &[u8]) -> Result<(), CheckpointError> {
        let wrap = |e: std::io::Error| CheckpointError::Write {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(wrap)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp).map_err(wrap)?;
            file.write_all(body).map_err(wrap)?;
            file.sync_all().map_err(wrap)?;
        }
        fs::rename(&tmp, path).map_err(wrap)
    }
}
