// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::Write;
use std::os::unix::io::FromRawFd;

use nails::execution::ExitCode;

use crate::pidfile::{Metadata, PidFile, config_fingerprint, read_metadata};
use crate::server::{RawFdExecution, Server};

fn echoing_runner(exec: RawFdExecution) -> ExitCode {
    // Write the args to stdout, and exit with the number of args. The handles belong to
    // the server, so the write goes through a duplicated fd.
    let mut stdout = unsafe { std::fs::File::from_raw_fd(libc::dup(exec.stdout_fd)) };
    let _ = writeln!(stdout, "{}", exec.cmd.args.join(" "));
    let _ = stdout.flush();
    ExitCode(exec.cmd.args.len() as i32)
}

#[tokio::test]
async fn server_starts_and_shuts_down() {
    let executor = pool::Executor::new();
    let server = Server::new(executor, 0, echoing_runner).await.unwrap();
    assert_ne!(server.port(), 0);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn client_roundtrip_returns_exit_code() {
    let executor = pool::Executor::new();
    let server = Server::new(executor, 0, echoing_runner).await.unwrap();

    let exit_code = crate::client_execute(
        server.port(),
        "check".to_owned(),
        vec!["a".to_owned(), "b".to_owned()],
        vec![],
    )
    .await
    .unwrap();
    assert_eq!(exit_code, 2);

    server.shutdown().await.unwrap();
}

#[test]
fn pid_file_is_exclusive_per_build_root() {
    let build_root = tempfile::TempDir::new().unwrap();
    let first = PidFile::acquire(build_root.path()).unwrap();
    assert!(PidFile::acquire(build_root.path()).is_err());
    drop(first);
    // After release, the lock is acquirable again.
    let _second = PidFile::acquire(build_root.path()).unwrap();
}

#[test]
fn metadata_roundtrip_and_fingerprint_comparison() {
    let build_root = tempfile::TempDir::new().unwrap();
    assert_eq!(read_metadata(build_root.path()).unwrap(), None);

    let mut pid_file = PidFile::acquire(build_root.path()).unwrap();
    let metadata = Metadata {
        pid: std::process::id(),
        port: 12345,
        fingerprint: config_fingerprint(b"config-v1"),
    };
    pid_file.write_metadata(&metadata).unwrap();

    let observed = read_metadata(build_root.path()).unwrap().unwrap();
    assert_eq!(observed, metadata);

    // A client started with different configuration detects the stale server.
    assert_ne!(observed.fingerprint, config_fingerprint(b"config-v2"));
}
