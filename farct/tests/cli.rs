//! End-to-end tests for the farct binary.
//!
//! Every test builds from the JSON fixtures into a temp directory and drives
//! the real binary through `assert_cmd`.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// `farct` with an empty config so no user config leaks in
fn farct(dir: &TempDir) -> Command {
    let config = dir.path().join("farct.toml");
    if !config.exists() {
        std::fs::write(&config, "").unwrap();
    }
    let mut cmd = Command::cargo_bin("farct").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("FARCT_LOG")
        .env_remove("FARCT_VERBOSE")
        .arg("--config")
        .arg(&config)
        .arg("--no-color");
    cmd
}

fn build(dir: &TempDir, graph: &str, output: &str, extra: &[&str]) -> PathBuf {
    let out = dir.path().join(output);
    farct(dir)
        .arg("build")
        .arg("--graph")
        .arg(fixture(graph))
        .arg("--output")
        .arg(&out)
        .args(extra)
        .assert()
        .success();
    out
}

fn verify_json(dir: &TempDir, file: &Path, extra: &[&str]) -> serde_json::Value {
    let output = farct(dir)
        .arg("verify")
        .arg(file)
        .arg("--json")
        .args(extra)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_build_reports_summary() {
    let dir = TempDir::new().unwrap();
    farct(&dir)
        .arg("build")
        .arg("--graph")
        .arg(fixture("app.json"))
        .arg("--output")
        .arg(dir.path().join("app.farc"))
        .assert()
        .success()
        .stdout(predicate::str::contains("static archive"))
        .stdout(predicate::str::contains("1 nullified"))
        .stdout(predicate::str::contains("1 subgraph roots"));
    assert!(dir.path().join("app.farc").exists());
}

#[test]
fn test_inspect_prints_region_table() {
    let dir = TempDir::new().unwrap();
    let archive = build(&dir, "app.json", "app.farc", &[]);

    farct(&dir)
        .arg("inspect")
        .arg(&archive)
        .arg("--classes")
        .assert()
        .success()
        .stdout(predicate::str::contains("(static)"))
        .stdout(predicate::str::contains("regions:"))
        .stdout(predicate::str::contains("  rw "))
        .stdout(predicate::str::contains("app/Cache"))
        .stdout(predicate::str::contains("app/Main"));
}

/// **Bug this finds:** verify passing without actually relocating
#[test]
fn test_verify_at_foreign_base() {
    let dir = TempDir::new().unwrap();
    let archive = build(&dir, "app.json", "app.farc", &[]);

    let at_home = verify_json(&dir, &archive, &["--relocate-to", "0x8_0000_0000"]);
    assert_eq!(at_home["relocated_pointers"], 0);
    assert_eq!(at_home["classes"], 2);
    assert_eq!(at_home["subgraph_records"], 1);
    assert_eq!(at_home["heap_roots"].as_u64().map(|n| n > 0), Some(true));

    let moved = verify_json(
        &dir,
        &archive,
        &["--relocate-to", "0x20_0000_0000", "--heap-relocate-to", "0x30_0000_0000"],
    );
    assert_eq!(moved["actual_base"], 0x20_0000_0000u64);
    assert!(moved["relocated_pointers"].as_u64().unwrap() > 0);
    assert!(moved["heap_references_patched"].as_u64().unwrap() > 0);
    assert_eq!(moved["spliced_vtables"], at_home["spliced_vtables"]);
}

#[test]
fn test_no_heap_build_has_no_heap_regions() {
    let dir = TempDir::new().unwrap();
    let archive = build(&dir, "app.json", "app.farc", &["--no-heap"]);

    let report = verify_json(&dir, &archive, &[]);
    assert!(report["heap_roots"].is_null());
    assert_eq!(report["subgraph_records"], 0);
}

#[test]
fn test_base_override_moves_requested_base() {
    let dir = TempDir::new().unwrap();
    let archive = build(&dir, "app.json", "app.farc", &["--base", "0x9_0000_0000"]);

    let report = verify_json(&dir, &archive, &["--relocate-to", "0x9_0000_0000"]);
    assert_eq!(report["requested_base"], 0x9_0000_0000u64);
    assert_eq!(report["relocated_pointers"], 0);

    let elsewhere = verify_json(&dir, &archive, &[]);
    assert_eq!(elsewhere["requested_base"], 0x9_0000_0000u64);
}

#[test]
fn test_map_log_is_written() {
    let dir = TempDir::new().unwrap();
    let map = dir.path().join("app.map");
    build(&dir, "app.json", "app.farc", &["--map", map.to_str().unwrap()]);

    let text = std::fs::read_to_string(&map).unwrap();
    assert!(text.contains("app/Main"));
}

/// **Bug this finds:** corrupted headers accepted by the loader
#[test]
fn test_verify_rejects_corrupted_header() {
    let dir = TempDir::new().unwrap();
    let archive = build(&dir, "app.json", "app.farc", &[]);
    let mut bytes = std::fs::read(&archive).unwrap();
    bytes[200] ^= 0x01;
    std::fs::write(&archive, &bytes).unwrap();

    farct(&dir)
        .arg("verify")
        .arg(&archive)
        .assert()
        .failure()
        .stderr(predicate::str::contains("checksum mismatch"));
}

#[test]
fn test_dynamic_archive_needs_its_base() {
    let dir = TempDir::new().unwrap();
    let base = build(&dir, "app.json", "base.farc", &[]);
    let top = build(
        &dir,
        "plugin.json",
        "top.farc",
        &["--base-archive", base.to_str().unwrap()],
    );

    farct(&dir)
        .arg("inspect")
        .arg(&top)
        .assert()
        .success()
        .stdout(predicate::str::contains("(dynamic)"))
        .stdout(predicate::str::contains("base.farc"));

    farct(&dir)
        .arg("verify")
        .arg(&top)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--base-archive"));

    let report = verify_json(&dir, &top, &["--base-archive", base.to_str().unwrap()]);
    assert_eq!(report["classes"], 1);
    assert!(report["heap_roots"].is_null());
}

#[test]
fn test_config_file_is_validated() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("farct.toml"),
        "[archive]\ncore_region_alignment = 100\n",
    )
    .unwrap();

    farct(&dir)
        .arg("inspect")
        .arg("missing.farc")
        .assert()
        .failure()
        .stderr(predicate::str::contains("core_region_alignment"));
}

#[test]
fn test_missing_graph_fails() {
    let dir = TempDir::new().unwrap();
    farct(&dir)
        .arg("build")
        .arg("--graph")
        .arg(dir.path().join("nope.json"))
        .arg("--output")
        .arg(dir.path().join("out.farc"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.json"));
}
