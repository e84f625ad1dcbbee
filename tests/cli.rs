//! End-to-end tests driving the `gzbackup` binary.

use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use flate2::read::MultiGzDecoder;
use predicates::prelude::*;
use tempfile::{tempdir, TempDir};

fn gzbackup() -> Command {
    let mut cmd = Command::cargo_bin("gzbackup").expect("binary should be built");
    cmd.arg("--no-progress").env_remove("RUST_LOG");
    cmd
}

/// `<tmp>/data/project` with `a.txt`, `b.txt` and `secret/creds.txt`.
fn project() -> (TempDir, PathBuf) {
    let temp = tempdir().expect("Failed to create temp dir");
    let project = temp.path().join("data/project");
    fs::create_dir_all(project.join("secret")).unwrap();
    fs::write(project.join("a.txt"), "alpha").unwrap();
    fs::write(project.join("b.txt"), "bravo").unwrap();
    fs::write(project.join("secret/creds.txt"), "hunter2").unwrap();
    (temp, project)
}

fn archive_names(path: &Path) -> BTreeSet<String> {
    let mut tar_bytes = Vec::new();
    MultiGzDecoder::new(fs::File::open(path).unwrap())
        .read_to_end(&mut tar_bytes)
        .unwrap();
    let mut archive = tar::Archive::new(&tar_bytes[..]);
    archive
        .entries()
        .unwrap()
        .map(|e| {
            e.unwrap()
                .path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string()
        })
        .collect()
}

#[test]
fn test_help_exits_with_one() {
    Command::cargo_bin("gzbackup")
        .unwrap()
        .arg("--help")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("--source").and(predicate::str::contains(".tar.gz")));
}

#[test]
fn test_version_succeeds() {
    Command::cargo_bin("gzbackup")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("gzbackup"));
}

#[test]
fn test_unknown_flag_exits_with_one() {
    gzbackup().arg("--frobnicate").assert().code(1);
}

#[test]
fn test_scenario_exclude_secret() {
    let (temp, project) = project();
    let target = temp.path().join("backups/out.tar.gz");

    gzbackup()
        .arg(format!("--source={}", project.display()))
        .arg(format!("--target={}", target.display()))
        .arg("--exclude=secret")
        .assert()
        .success()
        .stderr(predicate::str::contains("Compression started"));

    let names = archive_names(&target);
    assert!(names.contains("project/a.txt"));
    assert!(names.contains("project/b.txt"));
    assert!(names.iter().all(|n| !n.contains("secret")), "{names:?}");
    assert!(!temp.path().join("backups/out.tar.gz.tmp").exists());
}

#[test]
fn test_positional_form() {
    let (temp, project) = project();
    let target = temp.path().join("out.tar.gz");

    gzbackup()
        .arg(&project)
        .arg(&target)
        .arg("--threads=2")
        .assert()
        .success();

    assert!(archive_names(&target).contains("project/secret/creds.txt"));
}

#[test]
fn test_bad_suffix_creates_nothing() {
    let (temp, project) = project();
    let backups = temp.path().join("backups");

    gzbackup()
        .arg(format!("--source={}", project.display()))
        .arg(format!("--target={}", backups.join("out.zip").display()))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("must end in .tar.gz"));

    assert!(!backups.exists());
}

#[test]
fn test_missing_arguments_exit_with_one() {
    gzbackup()
        .arg("--target=/tmp/whatever.tar.gz")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("missing source"));
}

#[test]
fn test_second_run_without_overwrite_fails() {
    let (temp, project) = project();
    let target = temp.path().join("out.tar.gz");

    gzbackup().arg(&project).arg(&target).assert().success();
    let original = fs::read(&target).unwrap();

    gzbackup()
        .arg(&project)
        .arg(&target)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));
    assert_eq!(fs::read(&target).unwrap(), original);

    fs::write(project.join("c.txt"), "charlie").unwrap();
    gzbackup()
        .arg(&project)
        .arg(&target)
        .arg("--overwrite")
        .assert()
        .success();
    assert!(archive_names(&target).contains("project/c.txt"));
}

#[test]
fn test_dry_run_publishes_nothing() {
    let (temp, project) = project();
    let target = temp.path().join("out.tar.gz");

    gzbackup()
        .arg(&project)
        .arg(&target)
        .arg("--dry")
        .assert()
        .success()
        .stderr(predicate::str::contains("dry mode"));

    assert!(!target.exists());
    assert!(!temp.path().join("out.tar.gz.tmp").exists());
}

#[test]
fn test_missing_source_fails() {
    let temp = tempdir().unwrap();

    gzbackup()
        .arg(temp.path().join("nope"))
        .arg(temp.path().join("out.tar.gz"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("is not readable"));

    assert!(!temp.path().join("out.tar.gz.tmp").exists());
}

#[test]
fn test_oversized_thread_request_is_clamped_not_rejected() {
    let (temp, project) = project();
    let target = temp.path().join("out.tar.gz");

    gzbackup()
        .arg(&project)
        .arg(&target)
        .arg("--threads=100000")
        .assert()
        .success()
        .stderr(predicate::str::contains("requested 100000 threads"));
}

#[test]
fn test_oversized_chunk_size_is_rejected_before_any_file_is_created() {
    let (temp, project) = project();
    let target = temp.path().join("backups/out.tar.gz");

    gzbackup()
        .arg(&project)
        .arg(&target)
        .arg("--chunk-size=1099511627776")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("chunk-size"));

    assert!(!target.exists());
    assert!(!temp.path().join("backups/out.tar.gz.tmp").exists());
}

#[test]
fn test_exclude_glob_matches_nested_paths() {
    let (temp, project) = project();
    fs::create_dir_all(project.join("logs/old")).unwrap();
    fs::write(project.join("logs/old/x.log"), "noise").unwrap();
    fs::write(project.join("a1.txt"), "one").unwrap();
    let target = temp.path().join("out.tar.gz");

    gzbackup()
        .arg(&project)
        .arg(&target)
        .arg("--exclude=project/*.log,a[0-9].txt")
        .assert()
        .success();

    let names = archive_names(&target);
    assert!(names.contains("project/logs/old"), "{names:?}");
    assert!(!names.contains("project/logs/old/x.log"), "{names:?}");
    assert!(!names.contains("project/a1.txt"), "{names:?}");
    assert!(names.contains("project/a.txt"), "{names:?}");
}
