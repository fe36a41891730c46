use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[path = "../src/backup.rs"]
mod backup;

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

#[test]
fn bundle_roundtrip_preserves_database_bytes() {
    let src_workspace = temp_dir("tuition-bundle-src");
    let dst_workspace = temp_dir("tuition-bundle-dst");
    let out_dir = temp_dir("tuition-bundle-out");
    let db_bytes = b"sqlite-test-payload-2024".to_vec();
    std::fs::write(src_workspace.join("tuition.sqlite3"), &db_bytes).expect("write db");

    let bundle_path = out_dir.join("backup.zip");
    let summary = backup::export_workspace_bundle(&src_workspace, &bundle_path)
        .expect("export bundle");
    assert_eq!(summary.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(summary.entry_count, 3);
    assert_eq!(summary.db_sha256.len(), 64);

    let mut archive =
        zip::ZipArchive::new(std::fs::File::open(&bundle_path).expect("open bundle"))
            .expect("read zip");
    let mut manifest_text = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest_text)
        .expect("read manifest");
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).expect("parse manifest");
    assert_eq!(
        manifest.get("format").and_then(|v| v.as_str()),
        Some(backup::BUNDLE_FORMAT_V1)
    );
    assert_eq!(
        manifest.get("dbSha256").and_then(|v| v.as_str()),
        Some(summary.db_sha256.as_str())
    );
    let mut stored = Vec::new();
    archive
        .by_name("db/tuition.sqlite3")
        .expect("database entry")
        .read_to_end(&mut stored)
        .expect("read database entry");
    assert_eq!(stored, db_bytes);

    let imported = backup::import_workspace_bundle(&bundle_path, &dst_workspace)
        .expect("import bundle");
    assert_eq!(imported.bundle_format_detected, backup::BUNDLE_FORMAT_V1);
    let restored = std::fs::read(dst_workspace.join("tuition.sqlite3")).expect("read restored db");
    assert_eq!(restored, db_bytes);

    let _ = std::fs::remove_dir_all(src_workspace);
    let _ = std::fs::remove_dir_all(dst_workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn raw_sqlite_files_import_without_a_manifest() {
    let dst_workspace = temp_dir("tuition-raw-dst");
    let out_dir = temp_dir("tuition-raw-out");
    let db_bytes = b"SQLite format 3\0legacy-backup".to_vec();
    let raw_path = out_dir.join("old-backup.sqlite3");
    std::fs::write(&raw_path, &db_bytes).expect("write raw backup");

    let imported =
        backup::import_workspace_bundle(&raw_path, &dst_workspace).expect("import raw backup");
    assert_eq!(imported.bundle_format_detected, "raw-sqlite3");
    let restored = std::fs::read(dst_workspace.join("tuition.sqlite3")).expect("read restored db");
    assert_eq!(restored, db_bytes);

    let _ = std::fs::remove_dir_all(dst_workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn tampered_database_entry_is_rejected() {
    let src_workspace = temp_dir("tuition-tamper-src");
    let dst_workspace = temp_dir("tuition-tamper-dst");
    let out_dir = temp_dir("tuition-tamper-out");
    std::fs::write(src_workspace.join("tuition.sqlite3"), b"honest-bytes").expect("write db");

    let bundle_path = out_dir.join("backup.zip");
    let _ = backup::export_workspace_bundle(&src_workspace, &bundle_path).expect("export bundle");

    // Rebuild the bundle with the original manifest but different db bytes.
    let mut archive =
        zip::ZipArchive::new(std::fs::File::open(&bundle_path).expect("open bundle"))
            .expect("read zip");
    let mut manifest_text = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest_text)
        .expect("read manifest");
    drop(archive);

    let forged_path = out_dir.join("forged.zip");
    let mut writer =
        zip::ZipWriter::new(std::fs::File::create(&forged_path).expect("create forged bundle"));
    let opts = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    writer.start_file("manifest.json", opts).expect("start manifest");
    writer
        .write_all(manifest_text.as_bytes())
        .expect("write manifest");
    writer
        .start_file("db/tuition.sqlite3", opts)
        .expect("start db entry");
    writer.write_all(b"swapped-bytes").expect("write db entry");
    writer.finish().expect("finish forged bundle");

    let err = backup::import_workspace_bundle(&forged_path, &dst_workspace)
        .expect_err("tampered bundle must be rejected");
    assert!(
        err.to_string().contains("digest mismatch"),
        "unexpected error: {}",
        err
    );
    assert!(!dst_workspace.join("tuition.sqlite3").exists());

    let _ = std::fs::remove_dir_all(src_workspace);
    let _ = std::fs::remove_dir_all(dst_workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn export_requires_an_existing_database() {
    let empty_workspace = temp_dir("tuition-empty-src");
    let out_dir = temp_dir("tuition-empty-out");

    let err = backup::export_workspace_bundle(&empty_workspace, &out_dir.join("backup.zip"))
        .expect_err("export without a database must fail");
    assert!(
        err.to_string().contains("workspace database not found"),
        "unexpected error: {}",
        err
    );

    let _ = std::fs::remove_dir_all(empty_workspace);
    let _ = std::fs::remove_dir_all(out_dir);
}
