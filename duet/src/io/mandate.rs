//! Owner mandate: steps exempted from scope-related rejection.
//!
//! Authored by the project owner; the controller only reads it and passes
//! the answer for the current step to the worker.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::step_id::StepId;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerMandate {
    #[serde(default)]
    pub steps: Vec<StepId>,
}

impl OwnerMandate {
    pub fn contains(&self, step: &StepId) -> bool {
        self.steps.contains(step)
    }
}

/// Load the mandate; a missing file means no step is mandated.
pub fn load_mandate(path: &Path) -> Result<OwnerMandate> {
    if !path.exists() {
        return Ok(OwnerMandate::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
