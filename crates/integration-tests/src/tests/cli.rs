//! CLI integration tests against scratch partitions.
//!
//! These build archives with [`ArchiveBuilder`], write them next to a
//! [`TestDisk`], then run the `imgsync` binary with
//! `--allow-non-mountpoint`.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use crate::fixture::{ArchiveBuilder, TestDisk, sample_rootfs};
use crate::integration_test;

/// Get the path to the imgsync binary.
fn imgsync_binary() -> PathBuf {
    // Find the binary in target/debug or target/release
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let workspace_root = PathBuf::from(manifest_dir)
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf();

    let debug_path = workspace_root.join("target/debug/imgsync");
    if debug_path.exists() {
        return debug_path;
    }

    let release_path = workspace_root.join("target/release/imgsync");
    if release_path.exists() {
        return release_path;
    }

    panic!("imgsync binary not found. Run `cargo build` first.");
}

fn run_imgsync(args: &[&str]) -> std::io::Result<Output> {
    Command::new(imgsync_binary()).args(args).output()
}

/// Run imgsync with `input` on standard input.
fn run_imgsync_stdin(args: &[&str], input: &[u8]) -> std::io::Result<Output> {
    let mut child = Command::new(imgsync_binary())
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input)?;
    }
    child.wait_with_output()
}

/// Write `archive` next to the partition and return its path.
fn write_archive(disk: &TestDisk, archive: &[u8]) -> std::io::Result<String> {
    let path = disk.scratch_path("rootfs.tar");
    std::fs::write(&path, archive)?;
    Ok(path.to_string_lossy().into_owned())
}

fn stdout_json(output: &Output) -> serde_json::Result<serde_json::Value> {
    serde_json::from_slice(&output.stdout)
}

integration_test!(test_cli_sync_json_report, || {
    let disk = TestDisk::new()?;
    std::fs::write(disk.host_path("/stale"), b"old")?;
    let tar = write_archive(&disk, &sample_rootfs()?)?;
    let root = disk.root_path().to_string_lossy();

    let output = run_imgsync(&[
        "sync",
        &root,
        "--tar",
        &tar,
        "--allow-non-mountpoint",
        "--format",
        "json",
    ])?;
    assert!(
        output.status.success(),
        "sync should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report = stdout_json(&output)?;
    assert_eq!(report["stats"]["entries"], 12);
    assert_eq!(report["stats"]["added"], 11);
    assert_eq!(report["stats"]["deleted"], 1);

    let changes = report["changes"].as_array().expect("changes array");
    let hostname = changes
        .iter()
        .find(|c| c["path"] == "/etc/hostname")
        .expect("hostname change");
    assert_eq!(hostname["added"], true);
    assert_eq!(hostname["mtime"], "2025-01-01T00:00:00Z");
    let stale = changes
        .iter()
        .find(|c| c["path"] == "/stale")
        .expect("stale change");
    assert_eq!(stale["deleted"], true);

    assert_eq!(std::fs::read(disk.host_path("/etc/hostname"))?, b"pi\n");

    Ok(())
});

integration_test!(test_cli_sync_from_stdin, || {
    let disk = TestDisk::new()?;
    let root = disk.root_path().to_string_lossy();
    let args = ["sync", &*root, "--allow-non-mountpoint", "-v"];

    let output = run_imgsync_stdin(&args, &sample_rootfs()?)?;
    assert!(
        output.status.success(),
        "sync should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("+ /etc/hostname"), "change lines: {stdout}");
    assert!(stdout.contains("Added"), "stats table: {stdout}");

    // A second run reports nothing but the summary.
    let output = run_imgsync_stdin(&["sync", &*root, "--allow-non-mountpoint"], &sample_rootfs()?)?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("0 added, 0 modified, 0 deleted, 12 unchanged"),
        "summary: {stdout}"
    );

    Ok(())
});

integration_test!(test_cli_sync_requires_mountpoint, || {
    let disk = TestDisk::new()?;
    let tar = write_archive(&disk, &sample_rootfs()?)?;
    let root = disk.root_path().to_string_lossy();

    let output = run_imgsync(&["sync", &root, "--tar", &tar])?;
    assert!(!output.status.success(), "plain directory must be refused");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("nothing mounted"), "stderr: {stderr}");
    assert!(!disk.host_path("/etc").exists());

    Ok(())
});

integration_test!(test_cli_config_file, || {
    let disk = TestDisk::new()?;
    let tar = write_archive(&disk, &sample_rootfs()?)?;
    let config = disk.scratch_path("imgsync.toml");
    std::fs::write(
        &config,
        format!(
            "[disk]\nroot = {:?}\nrequire_mountpoint = false\n\n[sync]\norder_check = \"error\"\n",
            disk.root_path()
        ),
    )?;
    let config = config.to_string_lossy();

    let output = run_imgsync(&["-c", &config, "sync", "--tar", &tar])?;
    assert!(
        output.status.success(),
        "sync should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(disk.host_path("/usr/share/zoneinfo/UTC").is_file());

    Ok(())
});

integration_test!(test_cli_order_check_error, || {
    let disk = TestDisk::new()?;
    let archive = ArchiveBuilder::new()
        .dir("etc/", 0o755)?
        .file("etc/hostname", 0o644, b"pi\n")?
        .dir("etc/", 0o755)?
        .finish()?;
    let tar = write_archive(&disk, &archive)?;
    let root = disk.root_path().to_string_lossy();

    let output = run_imgsync(&[
        "sync",
        &root,
        "--tar",
        &tar,
        "--allow-non-mountpoint",
        "--order-check",
        "error",
    ])?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("archive lists directory /etc after its contents"),
        "stderr: {stderr}"
    );

    Ok(())
});

integration_test!(test_cli_inventory_json, || {
    let disk = TestDisk::new()?;
    std::fs::create_dir(disk.host_path("/etc"))?;
    std::fs::write(disk.host_path("/etc/hostname"), b"pi\n")?;
    let root = disk.root_path().to_string_lossy();

    let output = run_imgsync(&["ls", &root, "--allow-non-mountpoint", "--format", "json"])?;
    assert!(
        output.status.success(),
        "inventory should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let rows = stdout_json(&output)?;
    let rows = rows.as_array().expect("rows array");
    let paths: Vec<&str> = rows.iter().filter_map(|r| r["path"].as_str()).collect();
    assert_eq!(paths, ["/", "/etc", "/etc/hostname"]);
    assert_eq!(rows[2]["type"], "file");
    assert_eq!(rows[2]["size"], 3);

    Ok(())
});
