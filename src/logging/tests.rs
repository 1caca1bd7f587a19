use super::*;
use std::io::Write;
use tempfile::TempDir;

#[test]
fn test_log_file_is_appended_to() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pgpulse.log");

    writeln!(open_log_file(&path).unwrap(), "first run").unwrap();
    writeln!(open_log_file(&path).unwrap(), "second run").unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content, "first run\nsecond run\n");
}

#[test]
fn test_unwritable_log_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing-dir").join("pgpulse.log");
    let err = open_log_file(&path).unwrap_err();
    assert!(err.contains("Failed to open log file"), "{err}");
}
