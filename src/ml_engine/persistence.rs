//! Model bundle persistence
//!
//! The whole `ModelState` is one JSON document, written to a temp file and
//! renamed so a crash never leaves half a bundle behind.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::ml_engine::predictor::ModelState;

pub struct ModelStore {
    path: PathBuf,
}

impl ModelStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("model").join("model_state.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn save(&self, state: &ModelState) -> EngineResult<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        info!(
            "💾 Model generation {} saved to {}",
            state.generation,
            self.path.display()
        );
        Ok(())
    }

    /// Load and validate the bundle. `Ok(None)` when nothing was saved yet;
    /// an inconsistent bundle is a `ModelBundle` error.
    pub fn load(&self) -> EngineResult<Option<ModelState>> {
        if !self.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path)?;
        let state: ModelState = serde_json::from_str(&json)
            .map_err(|e| EngineError::ModelBundle(format!("unreadable bundle: {}", e)))?;
        state.validate()?;
        info!(
            "📂 Model generation {} loaded from {} (accuracy {:.3})",
            state.generation,
            self.path.display(),
            state.metrics.holdout_accuracy
        );
        Ok(Some(state))
    }
}
