//! Task implementations behind the [`Action`](super::Action) registry.

use tracing::info;

use crate::config::BuildContext;
use crate::error::{Error, Result};
use crate::integrity::{self, CodeStatus};
use crate::moc::{builder, Moc};
use crate::progress::ProgressTracker;
use crate::store::{TileStore, KEY_ORDER, KEY_TILE_FORMAT, KEY_TILE_WIDTH};
use crate::{compress, index, merge, pyramid};

use super::{Action, PyramidTask};

pub(super) fn make_task(action: Action) -> Box<dyn PyramidTask> {
    match action {
        Action::Index => Box::new(IndexTask),
        Action::Tiles => Box::new(TilesTask),
        Action::Moc => Box::new(MocTask),
        Action::Concat => Box::new(ConcatTask),
        Action::CheckCode => Box::new(CheckCodeTask),
        Action::CheckDatasum => Box::new(CheckDatasumTask),
        Action::Gzip => Box::new(GzipTask),
        Action::Gunzip => Box::new(GunzipTask),
    }
}

/// Resolve the leaf order from the context or the store on disk.
fn resolve_leaf_order(ctx: &BuildContext) -> Result<u8> {
    if let Some(order) = ctx.leaf_order {
        return Ok(order);
    }
    TileStore::new(&ctx.output_root)
        .max_order()?
        .ok_or_else(|| {
            Error::Config("leaf order not set and no Norder directories to derive it from".to_string())
        })
}

struct IndexTask;

impl PyramidTask for IndexTask {
    fn name(&self) -> &'static str {
        "index"
    }

    fn validate(&mut self, ctx: &BuildContext) -> Result<()> {
        let input = ctx
            .input_root
            .as_ref()
            .ok_or_else(|| Error::Config("index: no input directory given".to_string()))?;
        if !input.is_dir() {
            return Err(Error::Config(format!(
                "index: input directory {} does not exist",
                input.display()
            )));
        }
        if ctx.leaf_order.is_none() {
            return Err(Error::Config("index: leaf order must be set".to_string()));
        }
        Ok(())
    }

    fn run(&mut self, ctx: &BuildContext, progress: &ProgressTracker) -> Result<()> {
        index::run(ctx, progress)?;

        // Coverage of what has been indexed, next to the records.
        let store = TileStore::new(&ctx.output_root);
        let order = ctx.leaf_order.unwrap_or_default();
        let moc = builder::from_index_tree(&store, order, progress)?;
        if !moc.is_empty() {
            moc.write_fits(&store.index_moc_path())?;
        }
        Ok(())
    }
}

struct TilesTask;

impl PyramidTask for TilesTask {
    fn name(&self) -> &'static str {
        "tiles"
    }

    fn validate(&mut self, ctx: &BuildContext) -> Result<()> {
        resolve_leaf_order(ctx).map(|_| ())
    }

    fn run(&mut self, ctx: &BuildContext, progress: &ProgressTracker) -> Result<()> {
        pyramid::build(ctx, progress)?;
        pyramid::build_allsky(ctx, progress)?;
        Ok(())
    }
}

struct MocTask;

impl PyramidTask for MocTask {
    fn name(&self) -> &'static str {
        "moc"
    }

    fn validate(&mut self, ctx: &BuildContext) -> Result<()> {
        resolve_leaf_order(ctx).map(|_| ())
    }

    /// Done when the stored coverage map equals one freshly derived from
    /// the leaf tiles.
    fn is_already_done(&self, ctx: &BuildContext) -> bool {
        let store = TileStore::new(&ctx.output_root);
        let Ok(existing) = Moc::read_fits(&store.moc_path()) else {
            return false;
        };
        let Ok(order) = resolve_leaf_order(ctx) else {
            return false;
        };
        let progress = ProgressTracker::new();
        matches!(
            builder::from_tile_tree(&store, order, None, &progress),
            Ok((fresh, _)) if fresh == existing
        )
    }

    fn run(&mut self, ctx: &BuildContext, progress: &ProgressTracker) -> Result<()> {
        let store = TileStore::new(&ctx.output_root);
        let order = resolve_leaf_order(ctx)?;
        let (moc, encoding) = builder::from_tile_tree(&store, order, None, progress)?;
        moc.write_fits(&store.moc_path())?;

        let mut props = store.properties()?;
        props.set(KEY_ORDER, order.to_string());
        props.set(KEY_TILE_WIDTH, ctx.tile_width.to_string());
        if let Some(encoding) = encoding {
            props.set(KEY_TILE_FORMAT, encoding.to_string());
        }
        props.save(&store.properties_path())?;

        info!(order, cells = moc.n_leaf_cells(), "coverage map written");
        Ok(())
    }
}

struct ConcatTask;

impl PyramidTask for ConcatTask {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn validate(&mut self, ctx: &BuildContext) -> Result<()> {
        let input = ctx
            .input_root
            .as_ref()
            .ok_or_else(|| Error::Config("concat: no incoming store given".to_string()))?;
        if !input.is_dir() {
            return Err(Error::Config(format!(
                "concat: incoming store {} does not exist",
                input.display()
            )));
        }
        Ok(())
    }

    fn run(&mut self, ctx: &BuildContext, progress: &ProgressTracker) -> Result<()> {
        merge::run(ctx, progress).map(|_| ())
    }
}

struct CheckCodeTask;

impl PyramidTask for CheckCodeTask {
    fn name(&self) -> &'static str {
        "checkcode"
    }

    fn run(&mut self, ctx: &BuildContext, progress: &ProgressTracker) -> Result<()> {
        let statuses = integrity::verify_check_codes(ctx, progress)?;
        let mut unstamped = false;
        for (encoding, status) in statuses {
            match status {
                CodeStatus::Match(code) => {
                    info!(encoding = %encoding, code, "check code verified");
                }
                CodeStatus::Unstamped(_) => unstamped = true,
                CodeStatus::Mismatch { stored, computed } => {
                    return Err(Error::CheckCodeMismatch {
                        encoding: encoding.extension(),
                        stored,
                        computed,
                    });
                }
            }
        }
        if unstamped {
            integrity::stamp(ctx, progress)?;
        }
        Ok(())
    }
}

struct CheckDatasumTask;

impl PyramidTask for CheckDatasumTask {
    fn name(&self) -> &'static str {
        "checkdatasum"
    }

    fn run(&mut self, ctx: &BuildContext, progress: &ProgressTracker) -> Result<()> {
        integrity::verify_datasums(ctx, progress).map(|_| ())
    }
}

struct GzipTask;

impl PyramidTask for GzipTask {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn is_already_done(&self, ctx: &BuildContext) -> bool {
        compress::tree_is_gzipped(ctx)
    }

    fn run(&mut self, ctx: &BuildContext, progress: &ProgressTracker) -> Result<()> {
        compress::gzip_tree(ctx, progress).map(|_| ())
    }
}

struct GunzipTask;

impl PyramidTask for GunzipTask {
    fn name(&self) -> &'static str {
        "gunzip"
    }

    fn is_already_done(&self, ctx: &BuildContext) -> bool {
        compress::tree_is_plain(ctx)
    }

    fn run(&mut self, ctx: &BuildContext, progress: &ProgressTracker) -> Result<()> {
        compress::gunzip_tree(ctx, progress).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellId;
    use crate::fits::FitsImage;
    use crate::task::{run_action, TaskOutcome};
    use crate::tile::{TileBuf, TileEncoding};
    use tempfile::tempdir;

    fn write_leaf(store: &TileStore, order: u8, npix: u64) {
        let img = FitsImage::filled_blank(4, 4, -32, None);
        store
            .write_tile(CellId::new(order, npix), TileEncoding::Fits, &TileBuf::Numeric(img))
            .unwrap();
    }

    #[test]
    fn test_tiles_task_derives_leaf_order_from_disk() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        write_leaf(&store, 4, 100);

        let ctx = BuildContext::new(dir.path()).with_tile_width(4);
        let progress = ProgressTracker::new();
        let outcome = run_action(Action::Tiles, &ctx, &progress).unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        assert!(store.tile_exists(CellId::new(3, 25), TileEncoding::Fits));
        assert!(store.allsky_path(TileEncoding::Fits).is_file());
    }

    #[test]
    fn test_tiles_task_rejects_empty_store() {
        let dir = tempdir().unwrap();
        let ctx = BuildContext::new(dir.path());
        let progress = ProgressTracker::new();
        let err = run_action(Action::Tiles, &ctx, &progress).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_moc_task_writes_coverage_and_properties() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        write_leaf(&store, 5, 100);
        write_leaf(&store, 5, 101);

        let ctx = BuildContext::new(dir.path());
        let progress = ProgressTracker::new();
        run_action(Action::Moc, &ctx, &progress).unwrap();

        assert!(store.moc_path().is_file());
        let props = store.properties().unwrap();
        assert_eq!(props.get_u8(KEY_ORDER), Some(5));
        assert_eq!(props.get(KEY_TILE_FORMAT), Some("fits"));
    }

    #[test]
    fn test_moc_task_skips_when_coverage_is_current() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        write_leaf(&store, 5, 100);

        let ctx = BuildContext::new(dir.path());
        let progress = ProgressTracker::new();
        assert_eq!(run_action(Action::Moc, &ctx, &progress).unwrap(), TaskOutcome::Completed);
        assert_eq!(run_action(Action::Moc, &ctx, &progress).unwrap(), TaskOutcome::Skipped);

        // New leaf tiles invalidate the stored coverage.
        write_leaf(&store, 5, 101);
        assert_eq!(run_action(Action::Moc, &ctx, &progress).unwrap(), TaskOutcome::Completed);
    }

    #[test]
    fn test_compress_tasks_skip_when_already_converged() {
        let dir = tempdir().unwrap();
        write_leaf(&TileStore::new(dir.path()), 5, 100);

        let ctx = BuildContext::new(dir.path());
        let progress = ProgressTracker::new();
        assert_eq!(run_action(Action::Gzip, &ctx, &progress).unwrap(), TaskOutcome::Completed);
        assert_eq!(run_action(Action::Gzip, &ctx, &progress).unwrap(), TaskOutcome::Skipped);
        assert_eq!(run_action(Action::Gunzip, &ctx, &progress).unwrap(), TaskOutcome::Completed);
        assert_eq!(run_action(Action::Gunzip, &ctx, &progress).unwrap(), TaskOutcome::Skipped);
    }

    #[test]
    fn test_checkcode_task_stamps_then_verifies_then_detects() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        write_leaf(&store, 5, 100);

        let ctx = BuildContext::new(dir.path());
        let progress = ProgressTracker::new();

        // First run stamps, second verifies.
        run_action(Action::CheckCode, &ctx, &progress).unwrap();
        run_action(Action::CheckCode, &ctx, &progress).unwrap();

        // Growing the tree invalidates the stamp.
        write_leaf(&store, 5, 101);
        let err = run_action(Action::CheckCode, &ctx, &progress).unwrap_err();
        assert!(matches!(err, Error::CheckCodeMismatch { .. }), "got {err}");
    }

    #[test]
    fn test_gzip_action_end_to_end() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        write_leaf(&store, 5, 100);
        let path = store.tile_path(CellId::new(5, 100), TileEncoding::Fits);
        let plain = std::fs::read(&path).unwrap();

        let ctx = BuildContext::new(dir.path());
        let progress = ProgressTracker::new();
        run_action(Action::Gzip, &ctx, &progress).unwrap();
        assert_ne!(std::fs::read(&path).unwrap(), plain);
        run_action(Action::Gunzip, &ctx, &progress).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), plain);
    }
}
