//! End-to-end process tests for the `ytdlp-nfo-server` binary.

#![allow(deprecated)] // Command::cargo_bin vs the newer cargo::cargo_bin_cmd! macro

use std::io::Read;
use std::process::Stdio;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_binary_help_displays_usage() {
    let mut cmd = Command::cargo_bin("ytdlp-nfo-server").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("download manager"));
}

#[test]
fn test_binary_version_displays_version() {
    let mut cmd = Command::cargo_bin("ytdlp-nfo-server").unwrap();
    cmd.arg("--version").assert().success();
}

#[test]
fn test_binary_invalid_flag_is_rejected() {
    let mut cmd = Command::cargo_bin("ytdlp-nfo-server").unwrap();
    cmd.arg("--bogus-flag").assert().failure();
}

#[test]
fn test_binary_rejects_zero_max_concurrent() {
    let mut cmd = Command::cargo_bin("ytdlp-nfo-server").unwrap();
    cmd.args(["--max-concurrent", "0"]).assert().failure();
}

/// Starts the server against empty download/data directories, waits for it
/// to log readiness, sends `SIGINT`, and checks it exits cleanly and has
/// flushed a `jobs.json` snapshot on the way out.
#[test]
fn test_sigint_triggers_graceful_shutdown_and_final_save() {
    let download_dir = TempDir::new().unwrap();
    let data_dir = TempDir::new().unwrap();

    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_ytdlp-nfo-server"))
        .arg("--download-dir")
        .arg(download_dir.path())
        .arg("--data-dir")
        .arg(data_dir.path())
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn server binary");

    // Give the process a moment to finish construction and start waiting on
    // the shutdown signal before we interrupt it.
    std::thread::sleep(Duration::from_millis(300));

    // SAFETY: `child.id()` is a live child PID owned by this process; SIGINT
    // is the same signal a terminal Ctrl-C would deliver.
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGINT) };
    assert_eq!(rc, 0, "failed to send SIGINT to child process");

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("server did not exit within the timeout after SIGINT");
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    assert!(status.success(), "server exited non-zero after SIGINT: {status:?}");
    assert!(
        data_dir.path().join("jobs.json").exists(),
        "expected a final jobs.json snapshot after graceful shutdown"
    );

    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        let _ = pipe.read_to_string(&mut stdout);
    }
    assert!(stdout.contains("shutdown complete"), "expected shutdown log, got: {stdout}");
}

/// A persisted snapshot from a prior run reloads as `queued` and is ready to
/// be picked up by a subsequent process start, without ever invoking the
/// real `ytdlp-nfo` downloader.
#[test]
fn test_empty_data_dir_starts_with_no_persisted_jobs() {
    let download_dir = TempDir::new().unwrap();
    let data_dir = TempDir::new().unwrap();
    std::fs::write(data_dir.path().join("jobs.json"), r#"{"next_id":1,"jobs":[]}"#).unwrap();

    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_ytdlp-nfo-server"))
        .arg("--download-dir")
        .arg(download_dir.path())
        .arg("--data-dir")
        .arg(data_dir.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn server binary");

    std::thread::sleep(Duration::from_millis(200));
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("server did not exit within the timeout after SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert!(status.success());
}
