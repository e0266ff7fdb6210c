//! Integration tests for the two-stage pipeline using shell-script stand-ins
//! for the producer and transformer.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tigertunes_server::pipeline::{Pipeline, PipelineConfig, SpawnError};
use tokio::io::AsyncReadExt;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Producer that logs in, emits a marker on stdout, then idles.
fn authenticating_producer(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "producer",
        r#"echo "$1 $2" > "$2/args.txt"
echo "starting receiver" >&2
echo "user xyz authenticated to service" >&2
echo "connected to accesspoint" >&2
printf 'PCMDATA'
exec sleep 30"#,
    )
}

fn silent_producer(dir: &Path) -> PathBuf {
    write_script(dir, "producer", "printf 'PCM'\nexec sleep 30")
}

fn passthrough_transformer(dir: &Path) -> PathBuf {
    write_script(dir, "transformer", "exec cat")
}

#[tokio::test]
async fn test_producer_output_flows_through_transformer() {
    let tmp = TempDir::new().unwrap();
    let config = PipelineConfig::new(
        authenticating_producer(tmp.path()),
        passthrough_transformer(tmp.path()),
        tmp.path().to_path_buf(),
    );

    let mut pipeline = Pipeline::start(&config).unwrap();
    assert!(pipeline.wait_ready(Duration::from_secs(5)).await);
    assert!(pipeline.readiness().is_ready());

    let mut output = pipeline.take_output().unwrap();
    assert!(pipeline.take_output().is_none());

    let mut buf = [0u8; 7];
    tokio::time::timeout(Duration::from_secs(5), output.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"PCMDATA");

    let args = fs::read_to_string(tmp.path().join("args.txt")).unwrap();
    assert_eq!(args.trim(), format!("--config_dir {}", tmp.path().display()));

    pipeline.terminate();
    pipeline.terminate();
    tokio::time::timeout(Duration::from_secs(5), pipeline.wait())
        .await
        .expect("pipeline did not exit after SIGTERM")
        .unwrap();
}

#[tokio::test]
async fn test_silent_producer_times_out_not_ready() {
    let tmp = TempDir::new().unwrap();
    let config = PipelineConfig::new(
        silent_producer(tmp.path()),
        passthrough_transformer(tmp.path()),
        tmp.path().to_path_buf(),
    );

    let pipeline = Pipeline::start(&config).unwrap();
    assert!(!pipeline.wait_ready(Duration::from_millis(300)).await);
    assert!(!pipeline.readiness().is_ready());
}

#[tokio::test]
async fn test_missing_producer_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let config = PipelineConfig::new(
        tmp.path().join("does-not-exist"),
        passthrough_transformer(tmp.path()),
        tmp.path().to_path_buf(),
    );

    let err = Pipeline::start(&config).unwrap_err();
    assert!(matches!(err, SpawnError::Missing { role: "producer", .. }), "{err}");
}

#[tokio::test]
async fn test_non_executable_transformer_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let transformer = tmp.path().join("transformer");
    fs::write(&transformer, "not a program").unwrap();
    let config = PipelineConfig::new(authenticating_producer(tmp.path()), transformer, tmp.path().to_path_buf());

    let err = Pipeline::start(&config).unwrap_err();
    assert!(matches!(err, SpawnError::NotExecutable { role: "transformer", .. }), "{err}");
}

#[tokio::test]
async fn test_invalid_utf8_diagnostics_do_not_stall_output() {
    let tmp = TempDir::new().unwrap();
    let transformer = write_script(
        tmp.path(),
        "transformer",
        r#"printf 'size= \377\376 kB\n' >&2
while true; do printf 'frame=1\n' >&2; printf 'X'; sleep 0.01; done"#,
    );
    let config = PipelineConfig::new(silent_producer(tmp.path()), transformer, tmp.path().to_path_buf());

    let mut pipeline = Pipeline::start(&config).unwrap();
    let mut output = pipeline.take_output().unwrap();

    let mut buf = [0u8; 50];
    tokio::time::timeout(Duration::from_secs(5), output.read_exact(&mut buf))
        .await
        .expect("transformer output stalled")
        .unwrap();
    assert!(buf.iter().all(|&b| b == b'X'));
}

#[tokio::test]
async fn test_kill_stops_stages_that_ignore_sigterm() {
    let tmp = TempDir::new().unwrap();
    let producer = write_script(
        tmp.path(),
        "producer",
        r#"trap '' TERM
echo "authenticated" >&2
while true; do sleep 0.1; done"#,
    );
    let config = PipelineConfig::new(producer, passthrough_transformer(tmp.path()), tmp.path().to_path_buf());

    let mut pipeline = Pipeline::start(&config).unwrap();
    assert!(pipeline.wait_ready(Duration::from_secs(5)).await);

    pipeline.terminate();
    assert!(
        tokio::time::timeout(Duration::from_secs(1), pipeline.wait()).await.is_err(),
        "producer exited despite ignoring SIGTERM"
    );

    pipeline.kill().await;
    tokio::time::timeout(Duration::from_secs(2), pipeline.wait())
        .await
        .expect("pipeline still running after kill")
        .unwrap();
}
