use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use flate2::{Compression, write::GzEncoder};
use libtransfer::{
    ArchiveForm, ArchiveTransfer, ExecutionStore, LocalFsBlobStore, TransferError, TransferKind,
    archive::{SINGLE_FILE_MARKER, list_entries},
};
use tempfile::{TempDir, tempdir};

struct Harness {
    store_dir: TempDir,
    scratch_dir: TempDir,
    work_dir: TempDir,
    transfer: ArchiveTransfer,
}

fn harness() -> Harness {
    let store_dir = tempdir().unwrap();
    let scratch_dir = tempdir().unwrap();
    let work_dir = tempdir().unwrap();
    let store = Arc::new(LocalFsBlobStore::new(store_dir.path()));
    let transfer = ArchiveTransfer::new(store).with_scratch_root(scratch_dir.path());
    Harness {
        store_dir,
        scratch_dir,
        work_dir,
        transfer,
    }
}

/// Relative path -> file content (`None` for directories).
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|e| {
            let e = e.unwrap();
            let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
            let content = if e.file_type().is_dir() {
                None
            } else {
                Some(fs::read(e.path()).unwrap())
            };
            (rel, content)
        })
        .collect()
}

fn assert_scratch_empty(h: &Harness) {
    let leftovers: Vec<_> = fs::read_dir(h.scratch_dir.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "scratch not cleaned: {leftovers:?}");
}

#[tokio::test]
async fn test_directory_round_trip() {
    let h = harness();
    let source = h.work_dir.path().join("source");
    for i in 1..10 {
        let subdir = source.join(i.to_string());
        fs::create_dir_all(&subdir).unwrap();
        fs::write(source.join(format!("tempfile{i}")), format!("testfile contents {i}")).unwrap();
        fs::write(
            subdir.join(format!("subdir_tempfile{i}")),
            format!("subdir testfile contents {i}"),
        )
        .unwrap();
    }
    fs::create_dir_all(source.join("empty/nested_empty")).unwrap();
    fs::write(source.join("binary.bin"), [0u8, 159, 146, 150, 255]).unwrap();

    let key = h
        .transfer
        .upload(&source, "keyPrefix", "docName")
        .await
        .unwrap();
    assert_eq!(key.as_str(), "keyPrefix/docName.tar.gz");
    assert!(h.store_dir.path().join("keyPrefix/docName.tar.gz").is_file());
    assert_scratch_empty(&h);

    let destination = h.work_dir.path().join("extract");
    let form = h
        .transfer
        .download("keyPrefix", "docName", &destination)
        .await
        .unwrap();
    assert_eq!(form, ArchiveForm::Directory);
    assert_eq!(snapshot(&source), snapshot(&destination));
    assert_scratch_empty(&h);
}

#[tokio::test]
async fn test_single_file_round_trip() {
    let h = harness();
    let source = h.work_dir.path().join("tempfile");
    fs::write(&source, "testfile contents").unwrap();

    h.transfer
        .upload(&source, "keyPrefix", "docName")
        .await
        .unwrap();

    let blob = h.store_dir.path().join("keyPrefix/docName.tar.gz");
    let entries = list_entries(&blob).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e == SINGLE_FILE_MARKER));

    let destination = h.work_dir.path().join("extract/sub/renamed");
    let form = h
        .transfer
        .download("keyPrefix", "docName", &destination)
        .await
        .unwrap();
    assert_eq!(form, ArchiveForm::SingleFile);
    assert_eq!(fs::read(&destination).unwrap(), fs::read(&source).unwrap());
    // only the payload lands next to the destination
    let siblings: Vec<_> = fs::read_dir(destination.parent().unwrap()).unwrap().collect();
    assert_eq!(siblings.len(), 1);
    assert_scratch_empty(&h);
}

#[tokio::test]
async fn test_nested_document_name() {
    let h = harness();
    let source = h.work_dir.path().join("tempfile");
    fs::write(&source, "nested").unwrap();

    let key = h
        .transfer
        .upload(&source, "keyPrefix", "docpath/docName")
        .await
        .unwrap();
    assert_eq!(key.as_str(), "keyPrefix/docpath/docName.tar.gz");

    let destination = h.work_dir.path().join("out");
    h.transfer
        .download("keyPrefix", "docpath/docName", &destination)
        .await
        .unwrap();
    assert_eq!(fs::read_to_string(destination).unwrap(), "nested");
}

#[tokio::test]
async fn test_marker_archive_with_three_entries_is_rejected() {
    let h = harness();
    let blob = h.store_dir.path().join("keyPrefix/bad.tar.gz");
    fs::create_dir_all(blob.parent().unwrap()).unwrap();
    {
        let file = File::create(&blob).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for name in ["a.txt", "b.txt", SINGLE_FILE_MARKER] {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(0);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, std::io::empty()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    let err = h
        .transfer
        .download("keyPrefix", "bad", &h.work_dir.path().join("out"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::MalformedArchive { .. }), "{err:?}");
    assert_scratch_empty(&h);
}

#[tokio::test]
async fn test_upload_missing_path_fails_and_cleans_up() {
    let h = harness();
    let err = h
        .transfer
        .upload(&h.work_dir.path().join("missing"), "keyPrefix", "docName")
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::UnsupportedPath(_)));
    assert_scratch_empty(&h);
}

#[tokio::test]
async fn test_download_missing_blob() {
    let h = harness();
    let err = h
        .transfer
        .download("keyPrefix", "absent", &h.work_dir.path().join("out"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::NotFound(_)));
    assert_scratch_empty(&h);
}

#[tokio::test]
async fn test_execution_store_layout() {
    let h = harness();
    let store = ExecutionStore::new(h.transfer.clone(), "simfleet", "exec-1");
    let db = h.work_dir.path().join("1.mdb");
    fs::write(&db, "results").unwrap();

    let kind = TransferKind::results("AB", 1);
    let key = store.upload(&kind, &db).await.unwrap();
    assert_eq!(key.as_str(), "simfleet/exec-1/results/AB_1.tar.gz");
    assert_eq!(key, store.key_for(&kind));

    let restored = h.work_dir.path().join("restored/AB_1.mdb");
    store.download(&kind, &restored).await.unwrap();
    assert_eq!(fs::read_to_string(restored).unwrap(), "results");
}

#[tokio::test]
async fn test_directory_with_long_relative_paths() {
    let h = harness();
    let source = h.work_dir.path().join("AB_1");
    let deep = source
        .join("temp_files_1/Makelist/output_tables_for_scenario_baseline")
        .join("a".repeat(60));
    fs::create_dir_all(&deep).unwrap();
    fs::write(deep.join("flux_indicators.csv"), "year,flux\n1,0.5\n").unwrap();
    fs::create_dir_all(source.join("b".repeat(120))).unwrap();
    let rel = deep.join("flux_indicators.csv");
    assert!(rel.strip_prefix(&source).unwrap().as_os_str().len() > 100);

    h.transfer
        .upload(&source, "keyPrefix", "deep")
        .await
        .unwrap();

    let destination = h.work_dir.path().join("extract");
    let form = h
        .transfer
        .download("keyPrefix", "deep", &destination)
        .await
        .unwrap();
    assert_eq!(form, ArchiveForm::Directory);
    assert_eq!(snapshot(&source), snapshot(&destination));
    assert_scratch_empty(&h);
}

#[tokio::test]
async fn test_single_file_with_long_name() {
    let h = harness();
    let source = h.work_dir.path().join(format!("{}.mdb", "p".repeat(110)));
    fs::write(&source, "long named project").unwrap();

    h.transfer
        .upload(&source, "keyPrefix", "longName")
        .await
        .unwrap();

    let blob = h.store_dir.path().join("keyPrefix/longName.tar.gz");
    let entries = list_entries(&blob).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.len() > 100));

    let destination = h.work_dir.path().join("restored.mdb");
    let form = h
        .transfer
        .download("keyPrefix", "longName", &destination)
        .await
        .unwrap();
    assert_eq!(form, ArchiveForm::SingleFile);
    assert_eq!(fs::read_to_string(&destination).unwrap(), "long named project");
    assert_scratch_empty(&h);
}
