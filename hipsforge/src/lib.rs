//! HiPS Forge - HEALPix tile pyramid construction and verification
//!
//! This library builds hierarchical sky-tile pyramids from calibrated source
//! images and keeps them verifiable: spatial indexing, bottom-up tile
//! aggregation, coverage maps, store merging and integrity checking, all
//! driven through the [`task`] registry.

pub mod cell;
pub mod compress;
pub mod config;
pub mod error;
pub mod fits;
pub mod index;
pub mod integrity;
pub mod logging;
pub mod merge;
pub mod moc;
pub mod progress;
pub mod pyramid;
pub mod sphere;
pub mod store;
pub mod task;
pub mod tile;
pub mod wcs;

pub use cell::CellId;
pub use config::BuildContext;
pub use error::{Error, Result};
pub use merge::MergePolicy;
pub use moc::Moc;
pub use progress::ProgressTracker;
pub use store::TileStore;
pub use task::{run_action, Action, PyramidTask, TaskOutcome};
pub use tile::{AggKernel, TileEncoding};
