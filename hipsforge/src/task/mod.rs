//! Task registry.
//!
//! Every engine operation is exposed as an [`Action`] that resolves to a
//! [`PyramidTask`]. Running a task always goes through the same contract:
//! validate preconditions, skip when the work is already done, then run
//! with a shared [`ProgressTracker`].

mod actions;

use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::config::BuildContext;
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;

/// The closed set of operations the engine performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Associate source images with leaf cells (provenance index).
    Index,
    /// Aggregate leaf tiles into all interior orders, plus the all-sky
    /// preview.
    Tiles,
    /// Regenerate the coverage map from the leaf tile tree.
    Moc,
    /// Merge another store into this one.
    Concat,
    /// Stamp or verify the store-level check codes.
    CheckCode,
    /// Recompute per-tile checksums.
    CheckDatasum,
    /// Gzip every FITS tile in place.
    Gzip,
    /// Expand gzipped FITS tiles back in place.
    Gunzip,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::Index,
        Action::Tiles,
        Action::Moc,
        Action::Concat,
        Action::CheckCode,
        Action::CheckDatasum,
        Action::Gzip,
        Action::Gunzip,
    ];

    fn label(self) -> &'static str {
        match self {
            Action::Index => "index",
            Action::Tiles => "tiles",
            Action::Moc => "moc",
            Action::Concat => "concat",
            Action::CheckCode => "checkcode",
            Action::CheckDatasum => "checkdatasum",
            Action::Gzip => "gzip",
            Action::Gunzip => "gunzip",
        }
    }

    /// Resolve this action to its task implementation.
    pub fn into_task(self) -> Box<dyn PyramidTask> {
        actions::make_task(self)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Action> {
        let wanted = s.to_ascii_lowercase();
        Action::ALL
            .into_iter()
            .find(|a| a.label() == wanted)
            .ok_or_else(|| Error::Config(format!("unknown action '{s}'")))
    }
}

/// Contract every engine operation implements.
pub trait PyramidTask {
    /// Stable task name used in logs.
    fn name(&self) -> &'static str;

    /// Check preconditions and resolve derivable settings. Runs before any
    /// write; a validation failure leaves the store untouched.
    fn validate(&mut self, ctx: &BuildContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Whether this task's product is already present and current.
    fn is_already_done(&self, ctx: &BuildContext) -> bool {
        let _ = ctx;
        false
    }

    /// Perform the operation.
    fn run(&mut self, ctx: &BuildContext, progress: &ProgressTracker) -> Result<()>;
}

/// How a task invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Validation passed but the product was already in place.
    Skipped,
}

/// Validate and run one action under the standard contract.
pub fn run_action(
    action: Action,
    ctx: &BuildContext,
    progress: &ProgressTracker,
) -> Result<TaskOutcome> {
    let mut task = action.into_task();
    task.validate(ctx)?;
    if task.is_already_done(ctx) {
        info!(task = task.name(), "already done, skipping");
        return Ok(TaskOutcome::Skipped);
    }
    info!(task = task.name(), root = %ctx.output_root.display(), "running");
    task.run(ctx, progress)?;
    Ok(TaskOutcome::Completed)
}
