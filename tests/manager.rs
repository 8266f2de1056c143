mod common;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use assert_matches::assert_matches;

use st_atlas_datasets::cancel::CancelToken;
use st_atlas_datasets::checksum::ChecksumValidator;
use st_atlas_datasets::domain::{DataFile, DataFileRecord, Policy, ResourceEntry};
use st_atlas_datasets::error::AtlasError;
use st_atlas_datasets::manager::{BatchStatus, DownloadManager};
use st_atlas_datasets::progress::{TASK_CHECKSUM, TASK_DOWNLOAD, TASK_EXTRACT};
use st_atlas_datasets::store::Store;

use common::{
    MockTransport, RecordingProgress, config, md5_hex, not_found, tar_gz_bytes, unavailable,
};

const SPATIAL: &str = "https://example.org/samples/V1_Mouse_Brain_spatial.tar.gz";
const MATRIX: &str = "https://example.org/samples/filtered_feature_bc_matrix.h5";

fn spatial_archive() -> Vec<u8> {
    tar_gz_bytes(&[
        ("spatial/tissue_hires_image.png", &b"\x89PNG"[..]),
        ("spatial/tissue_positions_list.csv", &b"AAAC-1,1,0,0\n"[..]),
    ])
}

fn manager_with(
    temp: &tempfile::TempDir,
    adjust: impl FnOnce(&mut st_atlas_datasets::config::DownloadConfig),
) -> DownloadManager<MockTransport> {
    let mut cfg = config(temp.path());
    adjust(&mut cfg);
    DownloadManager::with_transport(cfg, MockTransport::new())
}

#[test]
fn local_resource_needs_no_transfer() {
    let temp = tempfile::tempdir().unwrap();
    let local = temp.path().join("counts.csv");
    fs::write(&local, b"gene,count\n").unwrap();
    let manager = manager_with(&temp, |_| {});

    let path = manager.download(local.as_path()).unwrap();
    assert_eq!(path, local);

    let resolved = manager.download_and_extract(local.as_path()).unwrap();
    assert_eq!(resolved.path, local);
    assert!(!resolved.fetched);
    assert_eq!(resolved.md5, md5_hex(b"gene,count\n"));
    assert_eq!(manager.transport().total_calls(), 0);
}

#[test]
fn repeated_runs_transfer_and_extract_once() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |_| {});
    manager.transport().serve(SPATIAL, spatial_archive());

    let first = manager.download_and_extract(SPATIAL).unwrap();
    let second = manager.download_and_extract(SPATIAL).unwrap();

    assert_eq!(manager.transport().calls(SPATIAL), 1);
    assert!(first.fetched && first.extracted);
    assert!(!second.fetched && !second.extracted);
    assert_eq!(first.path, second.path);

    let file: DataFile = SPATIAL.parse().unwrap();
    let target = manager.store().extraction_dir(&file);
    assert_eq!(first.path, Store::manifest_path(&target));
    assert!(target.join("spatial/tissue_positions_list.csv").is_file());
}

#[test]
fn fresh_manager_reuses_cache_across_runs() {
    let temp = tempfile::tempdir().unwrap();
    let first = manager_with(&temp, |_| {});
    first.transport().serve(SPATIAL, spatial_archive());
    let before = first.download_and_extract(SPATIAL).unwrap();

    let second = manager_with(&temp, |_| {});
    let after = second.download_and_extract(SPATIAL).unwrap();
    assert_eq!(second.transport().total_calls(), 0);
    assert_eq!(before.path, after.path);
}

#[test]
fn checksum_mismatch_stops_before_extraction() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |_| {});
    let archive = spatial_archive();
    let actual = md5_hex(&archive);
    manager.transport().serve(SPATIAL, archive);

    let record = DataFileRecord::new(SPATIAL).with_checksum("0123456789abcdef0123456789abcdef");
    let err = manager.download_and_extract(record).unwrap_err();
    assert_matches!(
        err,
        AtlasError::ChecksumMismatch { ref expected, ref computed, .. }
            if expected == "0123456789abcdef0123456789abcdef" && *computed == actual
    );
    assert!(!manager.store().extracted_dir().as_std_path().exists());

    // Mismatches are never retried.
    assert_eq!(manager.transport().calls(SPATIAL), 1);
}

#[test]
fn disabled_validation_still_memoizes_digest() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |cfg| cfg.validate_checksums = false);
    manager.transport().serve(MATRIX, b"HDF".to_vec());

    let record = DataFileRecord::new(MATRIX).with_checksum("not-the-digest");
    let resolved = manager.download_and_extract(record).unwrap();
    assert_eq!(resolved.md5, md5_hex(b"HDF"));
    assert_eq!(
        ChecksumValidator::load_memo(&resolved.local_file),
        Some(md5_hex(b"HDF"))
    );
}

#[test]
fn batch_reports_partial_success() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |_| {});
    manager.transport().serve(SPATIAL, spatial_archive());
    manager.transport().serve(MATRIX, b"HDF".to_vec());

    let mut inputs = BTreeMap::new();
    inputs.insert(
        "a",
        ResourceEntry::Detailed(DataFileRecord::new(SPATIAL).with_checksum("bad")),
    );
    inputs.insert("b", ResourceEntry::Shorthand(MATRIX.to_string()));
    let report = manager.download_and_extract_batch(inputs);

    assert_eq!(report.status(), BatchStatus::PartialSuccess);
    assert_matches!(report.get(&"a"), Some(Err(AtlasError::ChecksumMismatch { .. })));
    let b = report.get(&"b").unwrap().as_ref().unwrap();
    assert!(b.path.is_file());
    assert_eq!(b.format, None);
    assert_eq!(report.paths().len(), 1);
    assert!(report.finished_at() >= report.started_at());
    assert_matches!(
        report.into_result(),
        Err(AtlasError::BatchFailed { failed: 1, total: 2 })
    );
}

#[test]
fn batch_reports_total_failure() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |_| {});

    let report = manager.download_and_extract_all([SPATIAL, MATRIX]);
    assert_eq!(report.status(), BatchStatus::TotalFailure);
    assert_eq!(report.failures().count(), 2);
}

#[test]
fn invalid_entries_fail_alone() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |_| {});
    manager.transport().serve(MATRIX, b"HDF".to_vec());

    let report = manager.download_and_extract_all(["gopher://old/x", MATRIX]);
    assert_matches!(report.get(&0), Some(Err(AtlasError::InvalidResource(_))));
    assert_matches!(report.get(&1), Some(Ok(_)));
}

#[test]
fn never_download_requires_a_cached_copy() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |cfg| cfg.download_policy = Policy::Never);
    manager.transport().serve(MATRIX, b"HDF".to_vec());

    assert_matches!(
        manager.download(MATRIX),
        Err(AtlasError::DownloadDisallowed(uri)) if uri == MATRIX
    );
    assert_eq!(manager.transport().total_calls(), 0);

    let file: DataFile = MATRIX.parse().unwrap();
    let cached = manager.store().download_path(&file);
    fs::create_dir_all(cached.parent().unwrap()).unwrap();
    fs::write(&cached, b"HDF").unwrap();
    assert_eq!(manager.download(MATRIX).unwrap(), cached);
    assert_eq!(manager.transport().total_calls(), 0);
}

#[test]
fn always_policies_redo_the_work() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |cfg| {
        cfg.download_policy = Policy::Always;
        cfg.extract_policy = Policy::Always;
    });
    manager.transport().serve(SPATIAL, spatial_archive());

    manager.download_and_extract(SPATIAL).unwrap();
    let second = manager.download_and_extract(SPATIAL).unwrap();
    assert_eq!(manager.transport().calls(SPATIAL), 2);
    assert!(second.fetched && second.extracted);
}

#[test]
fn never_extract_passes_file_through() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |cfg| cfg.extract_policy = Policy::Never);
    manager.transport().serve(SPATIAL, spatial_archive());

    let resolved = manager.download_and_extract(SPATIAL).unwrap();
    assert_eq!(resolved.path, resolved.local_file);
    assert!(!resolved.extracted);
    assert!(!manager.store().extracted_dir().as_std_path().exists());
}

#[test]
fn transient_failures_are_retried() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |_| {});
    manager.transport().serve(MATRIX, b"HDF".to_vec());
    manager.transport().fail_next(MATRIX, unavailable(MATRIX));
    manager.transport().fail_next(MATRIX, unavailable(MATRIX));

    let resolved = manager.download_and_extract(MATRIX).unwrap();
    assert!(resolved.fetched);
    assert_eq!(manager.transport().calls(MATRIX), 3);
}

#[test]
fn retry_budget_is_bounded() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |cfg| cfg.max_attempts = 2);
    manager.transport().serve(MATRIX, b"HDF".to_vec());
    for _ in 0..3 {
        manager.transport().fail_next(MATRIX, unavailable(MATRIX));
    }

    let err = manager.download_and_extract(MATRIX).unwrap_err();
    assert_matches!(err, AtlasError::Fetch { attempts: 2, transient: true, .. });
    assert_eq!(manager.transport().calls(MATRIX), 2);
}

#[test]
fn permanent_failures_are_not_retried() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |_| {});
    manager.transport().fail_next(MATRIX, not_found(MATRIX));

    let err = manager.download(MATRIX).unwrap_err();
    assert_matches!(err, AtlasError::Fetch { transient: false, .. });
    assert_eq!(manager.transport().calls(MATRIX), 1);
}

#[test]
fn short_transfer_is_not_published() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |_| {});
    manager.transport().serve(MATRIX, b"HDF".to_vec());

    let record = DataFileRecord {
        size: Some(1024),
        ..DataFileRecord::new(MATRIX)
    };
    let err = manager.download_and_extract(record).unwrap_err();
    assert_matches!(err, AtlasError::Fetch { attempts: 3, .. });
    assert_eq!(manager.transport().calls(MATRIX), 3);

    let file: DataFile = MATRIX.parse().unwrap();
    let destination = manager.store().download_path(&file);
    assert!(!destination.exists());
    assert!(Store::partial_path(&destination).exists());
    assert!(!ChecksumValidator::sidecar_path(&destination).exists());
}

#[test]
fn cancelled_manager_does_no_work() {
    let temp = tempfile::tempdir().unwrap();
    let token = CancelToken::new();
    let manager = manager_with(&temp, |_| {}).with_cancel_token(token.clone());
    manager.transport().serve(MATRIX, b"HDF".to_vec());
    token.cancel();

    let report = manager.download_and_extract_all([MATRIX]);
    assert_matches!(report.get(&0), Some(Err(AtlasError::Cancelled(_))));
    assert_eq!(manager.transport().total_calls(), 0);
}

#[test]
fn cancellation_mid_transfer_leaves_nothing_marked_complete() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |cfg| cfg.io_buffer_size = 4);
    manager.transport().serve(MATRIX, vec![1u8; 64]);
    manager
        .transport()
        .cancel_while_reading(MATRIX, manager.cancel_token());

    let err = manager.download_and_extract(MATRIX).unwrap_err();
    assert_matches!(err, AtlasError::Cancelled(_));
    assert_eq!(manager.transport().calls(MATRIX), 1);

    let file: DataFile = MATRIX.parse().unwrap();
    let destination = manager.store().download_path(&file);
    assert!(!destination.exists());
    assert!(!ChecksumValidator::sidecar_path(&destination).exists());
    let partial = fs::read(Store::partial_path(&destination)).unwrap();
    assert!(partial.len() < 64);
}

#[test]
fn duplicate_keys_share_one_pipeline() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |_| {});
    manager.transport().serve(SPATIAL, spatial_archive());

    let report = manager.download_and_extract_batch([
        ("visium", SPATIAL),
        ("visium-again", SPATIAL),
    ]);
    assert_eq!(report.status(), BatchStatus::AllSucceeded);
    assert_eq!(manager.transport().calls(SPATIAL), 1);
    let paths = report.paths();
    assert_eq!(paths[&"visium"], paths[&"visium-again"]);
}

#[test]
fn stages_are_callable_one_by_one() {
    let temp = tempfile::tempdir().unwrap();
    let manager = manager_with(&temp, |_| {});
    manager.transport().serve(SPATIAL, spatial_archive());

    assert_matches!(
        manager.compute_checksum(SPATIAL),
        Err(AtlasError::MissingLocalFile(_))
    );

    let downloaded = manager.download(SPATIAL).unwrap();
    assert_eq!(
        manager.compute_checksum(SPATIAL).unwrap(),
        md5_hex(&fs::read(&downloaded).unwrap())
    );
    let manifest = manager.extract(SPATIAL).unwrap();
    assert!(manifest.ends_with("extracted_files.json"));
    assert_eq!(manager.transport().calls(SPATIAL), 1);
}

#[test]
fn progress_covers_every_stage_and_is_flushed() {
    let temp = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingProgress::default());
    let manager = manager_with(&temp, |_| {}).with_progress(sink.clone());
    manager.transport().serve(SPATIAL, spatial_archive());

    let report = manager.download_and_extract_all([SPATIAL]);
    assert_eq!(report.status(), BatchStatus::AllSucceeded);
    assert_eq!(
        sink.started_labels(),
        vec![TASK_DOWNLOAD, TASK_CHECKSUM, TASK_EXTRACT]
    );
    assert_eq!(sink.flushes(), 1);

    manager.download_and_extract_all([MATRIX]);
    assert_eq!(sink.flushes(), 2);
}

#[test]
fn same_basename_archives_extract_separately() {
    let sample_a = "https://example.org/sample_a/spatial.tar.gz";
    let sample_b = "https://example.org/sample_b/spatial.tar.gz";
    for policy in [Policy::Missing, Policy::Always] {
        let temp = tempfile::tempdir().unwrap();
        let manager = manager_with(&temp, |cfg| cfg.extract_policy = policy);
        manager
            .transport()
            .serve(sample_a, tar_gz_bytes(&[("positions.csv", &b"sample-A"[..])]));
        manager
            .transport()
            .serve(sample_b, tar_gz_bytes(&[("positions.csv", &b"sample-B"[..])]));

        let report = manager.download_and_extract_batch([("a", sample_a), ("b", sample_b)]);
        assert_eq!(report.status(), BatchStatus::AllSucceeded, "{policy:?}");

        let a = report.get(&"a").unwrap().as_ref().unwrap();
        let b = report.get(&"b").unwrap().as_ref().unwrap();
        assert!(a.extracted && b.extracted, "{policy:?}");
        assert_ne!(a.path, b.path);

        let read_positions = |manifest: &std::path::Path| {
            let manifest = st_atlas_datasets::archive::ExtractionManifest::read(manifest).unwrap();
            fs::read_to_string(manifest.get("positions.csv").unwrap()).unwrap()
        };
        assert_eq!(read_positions(&a.path), "sample-A");
        assert_eq!(read_positions(&b.path), "sample-B");
    }
}
