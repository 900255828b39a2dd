//! End-to-end build scenarios driven through the task registry.

use std::path::Path;

use hipsforge::cell::CellId;
use hipsforge::fits::{FitsImage, HeaderWriter};
use hipsforge::moc::Moc;
use hipsforge::store::{TileStore, KEY_CHECK_CODE, KEY_NB_TILES, KEY_ORDER};
use hipsforge::tile::TileBuf;
use hipsforge::{run_action, Action, BuildContext, Error, MergePolicy, ProgressTracker, TaskOutcome, TileEncoding};

fn write_leaf(store: &TileStore, order: u8, npix: u64, value: f64) {
    let mut img = FitsImage::filled_blank(4, 4, -32, None);
    for v in img.data.iter_mut() {
        *v = value;
    }
    store
        .write_tile(CellId::new(order, npix), TileEncoding::Fits, &TileBuf::Numeric(img))
        .unwrap();
}

fn leaf_values(store: &TileStore, cell: CellId) -> Vec<f64> {
    match store.read_tile(cell, TileEncoding::Fits).unwrap() {
        Some(TileBuf::Numeric(img)) => img.data,
        _ => panic!("missing tile {cell}"),
    }
}

#[test]
fn test_full_build_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let store = TileStore::new(dir.path());
    for npix in [100u64, 101, 102, 103] {
        write_leaf(&store, 5, npix, npix as f64);
    }
    write_leaf(&store, 5, 40_000, 7.0);

    let ctx = BuildContext::new(dir.path()).with_tile_width(4);
    let progress = ProgressTracker::new();

    for action in [Action::Tiles, Action::Moc, Action::CheckCode, Action::CheckDatasum] {
        let outcome = run_action(action, &ctx, &progress).unwrap();
        assert_eq!(outcome, TaskOutcome::Completed, "{action} did not complete");
    }

    // The four siblings collapse into a single ancestor chain.
    assert!(store.tile_exists(CellId::new(4, 25), TileEncoding::Fits));
    assert!(store.tile_exists(CellId::new(3, 6), TileEncoding::Fits));
    // The isolated leaf gets its own chain.
    assert!(store.tile_exists(CellId::new(4, 10_000), TileEncoding::Fits));
    assert!(store.tile_exists(CellId::new(3, 2_500), TileEncoding::Fits));
    // Nothing else materializes at order 4.
    assert_eq!(store.leaf_cells(4, TileEncoding::Fits).unwrap().len(), 2);

    assert!(store.allsky_path(TileEncoding::Fits).is_file());

    let moc = Moc::read_fits(&store.moc_path()).unwrap();
    assert_eq!(moc.n_leaf_cells(), 5);
    assert!(moc.contains(CellId::new(5, 100)));
    assert!(!moc.contains(CellId::new(5, 99)));

    let props = store.properties().unwrap();
    assert_eq!(props.get_u8(KEY_ORDER), Some(5));
    // Check code covers leaves plus the rebuilt interior orders.
    assert_eq!(props.get_u64(KEY_NB_TILES), Some(9));
    assert!(props.get(KEY_CHECK_CODE).unwrap().starts_with("fits:"));
}

#[test]
fn test_aggregate_mean_flows_to_root() {
    let dir = tempfile::tempdir().unwrap();
    let store = TileStore::new(dir.path());
    // Four constant-valued siblings: every aggregated sample is their mean
    // only where quadrants mix, but each quadrant keeps its child's value.
    for (k, value) in [(100u64, 1.0), (101, 2.0), (102, 3.0), (103, 4.0)] {
        write_leaf(&store, 5, k, value);
    }
    let ctx = BuildContext::new(dir.path()).with_tile_width(4);
    let progress = ProgressTracker::new();
    run_action(Action::Tiles, &ctx, &progress).unwrap();

    let parent = leaf_values(&store, CellId::new(4, 25));
    assert_eq!(parent[0], 1.0, "child 0 quadrant");
    assert_eq!(parent[3], 2.0, "child 1 quadrant");
    assert_eq!(parent[12], 3.0, "child 2 quadrant");
    assert_eq!(parent[15], 4.0, "child 3 quadrant");
}

#[test]
fn test_merge_pipeline_unions_everything() {
    let dir = tempfile::tempdir().unwrap();
    let out_root = dir.path().join("survey");
    let in_root = dir.path().join("delivery");
    write_leaf(&TileStore::new(&out_root), 5, 100, 1.0);
    write_leaf(&TileStore::new(&in_root), 5, 4000, 2.0);

    let ctx = BuildContext::new(&out_root)
        .with_input(&in_root)
        .with_merge_policy(MergePolicy::Average)
        .with_tile_width(4);
    let progress = ProgressTracker::new();
    run_action(Action::Concat, &ctx, &progress).unwrap();

    let store = TileStore::new(&out_root);
    assert_eq!(leaf_values(&store, CellId::new(5, 4000)), vec![2.0; 16]);
    assert_eq!(leaf_values(&store, CellId::new(5, 100)), vec![1.0; 16]);

    let moc = Moc::read_fits(&store.moc_path()).unwrap();
    assert!(moc.contains(CellId::new(5, 100)));
    assert!(moc.contains(CellId::new(5, 4000)));

    // Interior orders follow both branches.
    assert!(store.tile_exists(CellId::new(3, 6), TileEncoding::Fits));
    assert!(store.tile_exists(CellId::new(3, 250), TileEncoding::Fits));
}

#[test]
fn test_merge_replaces_then_checkcode_restamps() {
    let dir = tempfile::tempdir().unwrap();
    let out_root = dir.path().join("survey");
    let in_root = dir.path().join("delivery");
    write_leaf(&TileStore::new(&out_root), 5, 100, 1.0);
    write_leaf(&TileStore::new(&in_root), 5, 100, 9.0);

    let base = BuildContext::new(&out_root).with_tile_width(4);
    let progress = ProgressTracker::new();
    run_action(Action::CheckCode, &base, &progress).unwrap();

    let ctx = base
        .clone()
        .with_input(&in_root)
        .with_merge_policy(MergePolicy::ReplaceTile);
    run_action(Action::Concat, &ctx, &progress).unwrap();
    assert_eq!(
        leaf_values(&TileStore::new(&out_root), CellId::new(5, 100)),
        vec![9.0; 16]
    );

    // The merge grew the tree (interior orders), so the old stamp fails.
    let err = run_action(Action::CheckCode, &base, &progress).unwrap_err();
    assert!(matches!(err, Error::CheckCodeMismatch { .. }), "got {err}");
}

#[test]
fn test_index_action_covers_whole_sky_at_order_1() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sources");
    std::fs::create_dir_all(&input).unwrap();

    // A plate-carree all-sky image.
    let mut h = HeaderWriter::new();
    h.logical("SIMPLE", true)
        .integer("BITPIX", 8)
        .integer("NAXIS", 2)
        .integer("NAXIS1", 360)
        .integer("NAXIS2", 180)
        .string("CTYPE1", "RA---CAR")
        .float("CRVAL1", 180.0)
        .float("CRVAL2", 0.0)
        .float("CRPIX1", 180.0)
        .float("CRPIX2", 90.0)
        .float("CD1_1", -1.0)
        .float("CD1_2", 0.0)
        .float("CD2_1", 0.0)
        .float("CD2_2", 1.0);
    std::fs::write(input.join("allsky.fits"), h.finish()).unwrap();

    let out = dir.path().join("survey");
    let ctx = BuildContext::new(&out).with_input(&input).with_leaf_order(1);
    let progress = ProgressTracker::new();
    run_action(Action::Index, &ctx, &progress).unwrap();

    let store = TileStore::new(&out);
    let moc = Moc::read_fits(&store.index_moc_path()).unwrap();
    assert_eq!(moc.n_leaf_cells(), 48, "all 48 order-1 cells indexed");

    // A second run resumes past the checkpoint and changes nothing.
    let before = std::fs::read(store.index_moc_path()).unwrap();
    run_action(Action::Index, &ctx, &progress).unwrap();
    assert_eq!(std::fs::read(store.index_moc_path()).unwrap(), before);
}

#[test]
fn test_compression_survives_datasum_check_after_gunzip() {
    let dir = tempfile::tempdir().unwrap();
    let store = TileStore::new(dir.path());
    write_leaf(&store, 4, 7, 3.5);

    let ctx = BuildContext::new(dir.path());
    let progress = ProgressTracker::new();
    run_action(Action::Gzip, &ctx, &progress).unwrap();
    run_action(Action::Gunzip, &ctx, &progress).unwrap();
    run_action(Action::CheckDatasum, &ctx, &progress).unwrap();
}

#[test]
fn test_abort_flag_stops_a_running_task() {
    let dir = tempfile::tempdir().unwrap();
    let store = TileStore::new(dir.path());
    write_leaf(&store, 5, 100, 1.0);

    let ctx = BuildContext::new(dir.path()).with_tile_width(4);
    let progress = ProgressTracker::new();
    progress.abort();
    let err = run_action(Action::Tiles, &ctx, &progress).unwrap_err();
    assert!(err.is_abort());
}

#[test]
fn test_moc_regeneration_is_idempotent_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = TileStore::new(dir.path());
    for npix in [7u64, 42, 40_001] {
        write_leaf(&store, 6, npix, 1.0);
    }
    let ctx = BuildContext::new(dir.path());
    let progress = ProgressTracker::new();

    run_action(Action::Moc, &ctx, &progress).unwrap();
    let first = std::fs::read(store.moc_path()).unwrap();
    run_action(Action::Moc, &ctx, &progress).unwrap();
    let second = std::fs::read(store.moc_path()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_incompatible_merge_leaves_output_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let out_root = dir.path().join("survey");
    let in_root = dir.path().join("delivery");
    write_leaf(&TileStore::new(&out_root), 5, 100, 1.0);
    write_leaf(&TileStore::new(&in_root), 6, 400, 2.0);

    let snapshot = |root: &Path| {
        let mut files: Vec<_> = walk(root);
        files.sort();
        files
    };
    let before = snapshot(&out_root);

    let ctx = BuildContext::new(&out_root)
        .with_input(&in_root)
        .with_tile_width(4);
    let progress = ProgressTracker::new();
    let err = run_action(Action::Concat, &ctx, &progress).unwrap_err();
    assert!(matches!(err, Error::IncompatibleStores(_)), "got {err}");
    assert_eq!(snapshot(&out_root), before);
}

fn walk(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path.display().to_string());
            }
        }
    }
    out
}
