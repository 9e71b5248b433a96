// Session state persistence
// JSON file rewritten after every position change
//
// Lets a restarted process recover the stop, the applied steps and the
// scale-in plan of a position the exchange still reports as open.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::lifecycle::{ScaleInPlan, TrackedPosition};
use crate::ExchangePosition;

// =============================================================================
// Data Model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub saved_at: DateTime<Utc>,
    pub position: Option<TrackedPosition>,
    pub scale_in: Option<ScaleInPlan>,
    /// Re-arm from the current higher-timeframe direction once flat
    pub rearm_after_close: bool,
    pub initial_balance: Option<f64>,
}

impl SessionSnapshot {
    /// The saved position, if it describes the same side the exchange holds
    pub fn position_matching(&self, live: &ExchangePosition) -> Option<&TrackedPosition> {
        self.position.as_ref().filter(|p| p.side == live.side)
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<SessionSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        let snapshot = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))?;
        Ok(Some(snapshot))
    }

    /// Writes through a temp file and rename so a crash never leaves a
    /// truncated state file
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("State saved to: {}", self.path.display());
        Ok(())
    }

    /// Logs instead of failing; trading continues without persistence
    pub fn save_or_warn(&self, snapshot: &SessionSnapshot) {
        if let Err(e) = self.save(snapshot) {
            warn!(error = %e, "Failed to persist session state");
        }
    }
}
