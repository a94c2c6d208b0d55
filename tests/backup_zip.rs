#[path = "../src/auth.rs"]
mod auth;
#[path = "../src/backup.rs"]
mod backup;
#[path = "../src/db.rs"]
mod db;

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

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

fn write_sqlite(path: &Path, marker: &str) {
    let conn = rusqlite::Connection::open(path).expect("create sqlite file");
    conn.execute("CREATE TABLE marker(v TEXT NOT NULL)", [])
        .expect("create marker table");
    conn.execute("INSERT INTO marker(v) VALUES(?)", [marker])
        .expect("insert marker");
}

fn read_marker(path: &Path) -> String {
    let conn = rusqlite::Connection::open(path).expect("open restored sqlite");
    conn.query_row("SELECT v FROM marker", [], |r| r.get(0))
        .expect("marker row")
}

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("counseld-backup-src");
    let workspace2 = temp_dir("counseld-backup-dst");
    let out_dir = temp_dir("counseld-backup-out");

    let db_src = workspace.join(db::DB_FILE_NAME);
    write_sqlite(&db_src, "exported");
    let bytes = std::fs::read(&db_src).expect("read source db");

    let bundle_path = out_dir.join("nested").join("workspace.counseld.zip");
    let export = backup::export_workspace_bundle(&workspace, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT_V1);
    assert_eq!(export.entry_count, 3);
    assert_eq!(export.db_sha256, auth::sha256_hex(&bytes));

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["format"], backup::BUNDLE_FORMAT_V1);
    assert_eq!(manifest["dbSha256"], export.db_sha256.as_str());
    archive
        .by_name("db/counseld.sqlite3")
        .expect("database entry in bundle");
    archive
        .by_name("meta/workspace.json")
        .expect("workspace metadata entry");

    let import = backup::import_workspace_bundle(&bundle_path, &workspace2).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT_V1);

    let restored = std::fs::read(workspace2.join(db::DB_FILE_NAME)).expect("read restored db");
    assert_eq!(restored, bytes);
    assert_eq!(read_marker(&workspace2.join(db::DB_FILE_NAME)), "exported");
    assert!(!workspace2
        .join(format!("{}.importing", db::DB_FILE_NAME))
        .exists());

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn export_without_database_fails() {
    let workspace = temp_dir("counseld-backup-empty");
    let out = workspace.join("out.zip");
    let err = backup::export_workspace_bundle(&workspace, &out).expect_err("no db to export");
    assert!(err.to_string().contains("workspace database not found"));
    assert!(!out.exists());
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn tampered_bundle_is_rejected_and_existing_db_kept() {
    let out_dir = temp_dir("counseld-backup-tampered");
    let workspace = temp_dir("counseld-backup-tampered-dst");
    let existing = workspace.join(db::DB_FILE_NAME);
    std::fs::write(&existing, b"current-db").expect("write existing db");

    let bundle_path = out_dir.join("tampered.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        let manifest = serde_json::json!({
            "format": backup::BUNDLE_FORMAT_V1,
            "version": 1,
            "dbSha256": auth::sha256_hex(b"exported-bytes"),
        });
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(manifest.to_string().as_bytes())
            .expect("write manifest");
        zip.start_file("db/counseld.sqlite3", opts).expect("db entry");
        zip.write_all(b"edited-bytes").expect("write db");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("checksum mismatch must fail");
    assert!(format!("{:#}", err).contains("checksum mismatch"));
    let kept = std::fs::read(&existing).expect("read existing db");
    assert_eq!(kept, b"current-db");

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_bundle_format_is_rejected() {
    let out_dir = temp_dir("counseld-backup-foreign");
    let workspace = temp_dir("counseld-backup-foreign-dst");

    let bundle_path = out_dir.join("foreign.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        zip.start_file("manifest.json", zip::write::FileOptions::default())
            .expect("manifest entry");
        zip.write_all(br#"{"format":"someone-else-v9"}"#)
            .expect("write manifest");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("foreign format must fail");
    assert!(err.to_string().contains("unsupported bundle format"));
    assert!(!workspace.join(db::DB_FILE_NAME).exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn legacy_sqlite_import_is_supported() {
    let out_dir = temp_dir("counseld-backup-legacy");
    let workspace = temp_dir("counseld-backup-legacy-dst");
    write_sqlite(&workspace.join(db::DB_FILE_NAME), "current");

    let legacy_file = out_dir.join("legacy.sqlite3");
    write_sqlite(&legacy_file, "legacy");

    let import =
        backup::import_workspace_bundle(&legacy_file, &workspace).expect("import legacy sqlite");
    assert_eq!(import.bundle_format_detected, backup::LEGACY_SQLITE_FORMAT);
    assert_eq!(read_marker(&workspace.join(db::DB_FILE_NAME)), "legacy");
    assert!(!workspace
        .join(format!("{}.importing", db::DB_FILE_NAME))
        .exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn non_database_input_is_rejected_and_existing_db_kept() {
    let out_dir = temp_dir("counseld-backup-junk");
    let workspace = temp_dir("counseld-backup-junk-dst");
    let existing = workspace.join(db::DB_FILE_NAME);
    write_sqlite(&existing, "current");
    let before = std::fs::read(&existing).expect("read existing db");

    let notes = out_dir.join("notes.txt");
    std::fs::write(&notes, b"this is not a database, just some text").expect("write notes");
    let err = backup::import_workspace_bundle(&notes, &workspace).expect_err("junk must fail");
    assert!(err
        .to_string()
        .contains("neither a workspace bundle nor a SQLite database"));

    // Right header, garbage pages: caught by the staged open, not after the swap.
    let truncated = out_dir.join("truncated.sqlite3");
    let mut forged = b"SQLite format 3\0".to_vec();
    forged.extend_from_slice(&[0xAB; 200]);
    std::fs::write(&truncated, &forged).expect("write forged file");
    assert!(backup::import_workspace_bundle(&truncated, &workspace).is_err());

    let after = std::fs::read(&existing).expect("read existing db again");
    assert_eq!(after, before);
    assert_eq!(read_marker(&existing), "current");
    assert!(!workspace
        .join(format!("{}.importing", db::DB_FILE_NAME))
        .exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bundle_with_non_sqlite_entry_is_rejected() {
    let out_dir = temp_dir("counseld-backup-textentry");
    let workspace = temp_dir("counseld-backup-textentry-dst");
    let payload = b"plain text pretending to be a database";

    let bundle_path = out_dir.join("text.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        let manifest = serde_json::json!({
            "format": backup::BUNDLE_FORMAT_V1,
            "dbSha256": auth::sha256_hex(payload),
        });
        zip.start_file("manifest.json", opts).expect("manifest entry");
        zip.write_all(manifest.to_string().as_bytes())
            .expect("write manifest");
        zip.start_file("db/counseld.sqlite3", opts).expect("db entry");
        zip.write_all(payload).expect("write db");
        zip.finish().expect("finish zip");
    }

    let err = backup::import_workspace_bundle(&bundle_path, &workspace)
        .expect_err("text entry must fail");
    assert!(err.to_string().contains("not a SQLite database"));
    assert!(!workspace.join(db::DB_FILE_NAME).exists());

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}
