//! Drives the built binary end to end.

mod common;

use base64::Engine;
use common::scratch_trace;
use p256::ecdsa::SigningKey;
use p256::pkcs8::EncodePrivateKey;
use std::process::Command;

fn traceship() -> Command {
    Command::new(env!("CARGO_BIN_EXE_traceship"))
}

fn secret_bundle() -> String {
    let key = SigningKey::from_slice(&[7u8; 32]).unwrap();
    let der = key.to_pkcs8_der().unwrap();
    let encoded = base64::engine::general_purpose::STANDARD.encode(der.as_bytes());
    format!("AKIDEXAMPLE,secret,{encoded}")
}

#[test]
fn prepare_writes_manifest_and_archives() {
    let trace = scratch_trace(r#"{"relevant_binaries":["bin0"],"files":{}}"#);
    let output = traceship()
        .args(["prepare", "--trace"])
        .arg(trace.path())
        .output()
        .expect("run traceship");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(trace.path().join("sources.user").is_file());
    assert!(trace.path().join("files.user/sources.zip").is_file());
    assert!(trace.path().join("files.user/placeholders.zip").is_file());
}

#[test]
fn prepare_fails_on_directory_without_version_marker() {
    let dir = tempfile::TempDir::new().unwrap();
    let output = traceship()
        .args(["prepare", "--trace"])
        .arg(dir.path())
        .output()
        .expect("run traceship");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("version"), "stderr: {stderr}");
}

#[test]
fn upload_fails_without_credentials_in_environment() {
    let trace = scratch_trace(r#"{"relevant_binaries":["bin0"],"files":{}}"#);
    let output = traceship()
        .args(["upload", "--dry-run", "--trace"])
        .arg(trace.path())
        .env_remove("TRACESHIP_USER")
        .env_remove("TRACESHIP_GROUP")
        .env_remove("TRACESHIP_USER_SECRET_KEY")
        .output()
        .expect("run traceship");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TRACESHIP_USER"), "stderr: {stderr}");
}

#[test]
fn compression_stage_failure_aborts_the_upload() {
    let trace = scratch_trace(r#"{"relevant_binaries":["bin0"],"files":{}}"#);
    // An empty PATH makes the tar stage unspawnable: the run must fail
    // before any remote interaction.
    let empty_path = tempfile::TempDir::new().unwrap();
    let output = traceship()
        .args(["upload", "--dry-run", "--trace"])
        .arg(trace.path())
        .env("TRACESHIP_USER", "user@example.com")
        .env("TRACESHIP_GROUP", "examples")
        .env("TRACESHIP_USER_SECRET_KEY", secret_bundle())
        .env("PATH", empty_path.path())
        .output()
        .expect("run traceship");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("tar"), "stderr: {stderr}");
}

#[cfg(unix)]
#[test]
fn noisy_compression_stage_does_not_stall_the_pipeline() {
    use std::os::unix::fs::PermissionsExt;

    let trace = scratch_trace(r#"{"relevant_binaries":["bin0"],"files":{}}"#);
    // A stand-in tar that floods stderr well past a pipe buffer before
    // writing any payload: the pipeline must drain it and still finish.
    let bin_dir = tempfile::TempDir::new().unwrap();
    let tar_path = bin_dir.path().join("tar");
    std::fs::write(
        &tar_path,
        "#!/bin/sh\n\
         i=0\n\
         while [ $i -lt 4000 ]; do\n\
           echo 'tar: file changed as we read it' >&2\n\
           i=$((i+1))\n\
         done\n\
         echo compressed-payload\n\
         exit 0\n",
    )
    .unwrap();
    std::fs::set_permissions(&tar_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let output = traceship()
        .args(["upload", "--dry-run", "--trace"])
        .arg(trace.path())
        .env("TRACESHIP_USER", "user@example.com")
        .env("TRACESHIP_GROUP", "examples")
        .env("TRACESHIP_USER_SECRET_KEY", secret_bundle())
        .env("PATH", bin_dir.path())
        .output()
        .expect("run traceship");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Dry run"), "stdout: {stdout}");
}

#[test]
fn dry_run_prints_the_derived_upload_key() {
    let trace = scratch_trace(r#"{"relevant_binaries":["bin0"],"files":{}}"#);
    let output = traceship()
        .args(["upload", "--dry-run", "--trace"])
        .arg(trace.path())
        .env("TRACESHIP_USER", "user@example.com")
        .env("TRACESHIP_GROUP", "examples")
        .env("TRACESHIP_USER_SECRET_KEY", secret_bundle())
        .output()
        .expect("run traceship");
    if !output.status.success() {
        // tar --zstd may be unavailable in minimal environments.
        eprintln!(
            "Skipping: pipeline unavailable ({})",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Dry run"), "stdout: {stdout}");
    assert!(stdout.contains(".tar.zst"), "stdout: {stdout}");
}
