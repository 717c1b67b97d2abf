//! # Process Stages
//!
//! The stage machine of an [`super::ImportContext`].
//!
//! | Stage | Accepts |
//! |-------|---------|
//! | Init | library and item registration, bulk enumeration |
//! | Linking | override creation, `set_item_resolved` |
//! | Appending | (internal) |
//! | Instantiating | re-running instantiation |
//! | Done | queries only |
//!
//! Stages only move forward. Appending and Instantiating may be skipped;
//! nothing may be entered twice.

use crate::TetherError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ProcessStage {
    #[default]
    Init,
    Linking,
    Appending,
    Instantiating,
    Done,
}

impl ProcessStage {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ProcessStage::Init => "Init",
            ProcessStage::Linking => "Linking",
            ProcessStage::Appending => "Appending",
            ProcessStage::Instantiating => "Instantiating",
            ProcessStage::Done => "Done",
        }
    }

    /// Get the next stage, if any.
    #[must_use]
    pub fn next(&self) -> Option<ProcessStage> {
        match self {
            ProcessStage::Init => Some(ProcessStage::Linking),
            ProcessStage::Linking => Some(ProcessStage::Appending),
            ProcessStage::Appending => Some(ProcessStage::Instantiating),
            ProcessStage::Instantiating => Some(ProcessStage::Done),
            ProcessStage::Done => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStage::Done)
    }

    /// Whether `target` may be entered from this stage.
    ///
    /// Linking cannot be skipped; every later stage may be.
    #[must_use]
    pub fn can_enter(&self, target: ProcessStage) -> bool {
        match self {
            ProcessStage::Init => target == ProcessStage::Linking,
            _ => target > *self,
        }
    }

    /// Move to `target`, or fail with `StageViolation`.
    pub(crate) fn advance(&mut self, target: ProcessStage) -> Result<(), TetherError> {
        if !self.can_enter(target) {
            return Err(TetherError::StageViolation {
                expected: format!("a stage before {}", target.name()),
                found: self.name().to_string(),
            });
        }
        *self = target;
        Ok(())
    }

    /// Fail unless the current stage is exactly `expected`.
    pub(crate) fn require(&self, expected: ProcessStage) -> Result<(), TetherError> {
        if *self != expected {
            return Err(TetherError::StageViolation {
                expected: expected.name().to_string(),
                found: self.name().to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for ProcessStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// TESTS
// =============================================================================
