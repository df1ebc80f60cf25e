//! Integration tests for the imagepipe binary.
//!
//! Each test points `HOME` and `XDG_CACHE_HOME` at a temporary directory so
//! the config file, logs and disk caches never touch the real home.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

fn run_cli(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_imagepipe"))
        .args(args)
        .env("HOME", home)
        .env("XDG_CACHE_HOME", home.join("cache"))
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute CLI command")
}

/// Assert a command succeeded.
fn assert_success(output: &Output, context: &str) {
    if !output.status.success() {
        panic!(
            "{} failed:\nstdout: {}\nstderr: {}",
            context,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn write_png(dir: &Path, width: u32, height: u32) -> PathBuf {
    let path = dir.join("sample.png");
    image::RgbaImage::new(width, height).save(&path).unwrap();
    path
}

#[test]
fn test_config_path_is_under_home() {
    let home = TempDir::new().unwrap();
    let output = run_cli(home.path(), &["config", "path"]);

    assert_success(&output, "config path");
    assert!(stdout(&output).trim().ends_with(".imagepipe/config.ini"));
}

#[test]
fn test_config_init_then_show() {
    let home = TempDir::new().unwrap();

    assert_success(&run_cli(home.path(), &["config", "init"]), "config init");
    assert!(home.path().join(".imagepipe/config.ini").exists());

    let output = run_cli(home.path(), &["config", "show"]);
    assert_success(&output, "config show");
    let text = stdout(&output);
    assert!(text.contains("Loaded from"));
    assert!(text.contains("[disk]"));
}

#[test]
fn test_config_init_keeps_existing_file() {
    let home = TempDir::new().unwrap();
    let path = home.path().join(".imagepipe/config.ini");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "[disk]\nmax_size = 10MB\n").unwrap();

    let output = run_cli(home.path(), &["config", "init"]);

    assert_success(&output, "config init");
    assert!(stdout(&output).contains("already exists"));
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "[disk]\nmax_size = 10MB\n"
    );
}

#[test]
fn test_fetch_local_file_reports_dimensions() {
    let home = TempDir::new().unwrap();
    let image = write_png(home.path(), 8, 6);

    let output = run_cli(home.path(), &["fetch", image.to_str().unwrap()]);

    assert_success(&output, "fetch");
    assert!(stdout(&output).contains("Decoded 8x6"));
}

#[test]
fn test_fetch_writes_encoded_output() {
    let home = TempDir::new().unwrap();
    let image = write_png(home.path(), 4, 4);
    let copy = home.path().join("copy.png");

    let output = run_cli(
        home.path(),
        &[
            "fetch",
            image.to_str().unwrap(),
            "--output",
            copy.to_str().unwrap(),
        ],
    );

    assert_success(&output, "fetch --output");
    assert_eq!(std::fs::read(&copy).unwrap(), std::fs::read(&image).unwrap());
}

#[test]
fn test_unsupported_scheme_exits_with_usage_code() {
    let home = TempDir::new().unwrap();
    let output = run_cli(home.path(), &["fetch", "gopher://example.com/a.png"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("gopher"));
}

#[test]
fn test_cache_stats_on_empty_cache() {
    let home = TempDir::new().unwrap();
    let output = run_cli(home.path(), &["cache", "stats"]);

    assert_success(&output, "cache stats");
    assert!(stdout(&output).contains("Entries: 0"));
}

#[test]
fn test_missing_local_file_fails_request() {
    let home = TempDir::new().unwrap();
    let missing = home.path().join("missing.png");

    let output = run_cli(home.path(), &["fetch", missing.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(3));
}
