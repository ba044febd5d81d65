// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha256Digest, Sha256};

///
/// What a running server advertises about itself: its pid and port, plus a fingerprint of
/// the configuration it was started with. A client observing a mismatched fingerprint
/// should restart the server rather than connect to it.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Metadata {
    pub pid: u32,
    pub port: u16,
    pub fingerprint: String,
}

///
/// A fingerprint over the serialized configuration the server was started with. Any inputs
/// which would change server behaviour must be included by the embedder.
///
pub fn config_fingerprint(serialized_config: &[u8]) -> String {
    let mut hasher = Sha256::default();
    hasher.update(serialized_config);
    hex_of(&hasher.finalize())
}

fn hex_of(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write;
        write!(&mut out, "{byte:02x}").unwrap();
    }
    out
}

///
/// An advisory-locked pid file guaranteeing at most one server per build root.
///
/// The lock is held for the lifetime of the `PidFile`: a second server attempting to start
/// for the same build root fails to acquire it and exits.
///
pub struct PidFile {
    // Holding the Flock keeps the advisory lock; the file is unlocked on drop.
    lock: Flock<File>,
    path: PathBuf,
}

impl PidFile {
    pub fn lock_path(build_root: &Path) -> PathBuf {
        build_root.join(".gantry.d").join("server.json")
    }

    ///
    /// Acquires the server lock for the given build root, failing if another live server
    /// holds it.
    ///
    pub fn acquire(build_root: &Path) -> Result<PidFile, String> {
        let path = Self::lock_path(build_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| format!("Failed to open {}: {e}", path.display()))?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_file, err)| {
            format!(
                "Another server holds the lock for this build root ({}): {err}",
                path.display()
            )
        })?;

        Ok(PidFile { lock, path })
    }

    ///
    /// Records this server's metadata in the locked file.
    ///
    pub fn write_metadata(&mut self, metadata: &Metadata) -> Result<(), String> {
        let serialized = serde_json::to_vec(metadata)
            .map_err(|e| format!("Failed to serialize server metadata: {e}"))?;
        self.lock
            .set_len(0)
            .and_then(|()| self.lock.rewind())
            .and_then(|()| self.lock.write_all(&serialized))
            .and_then(|()| self.lock.sync_all())
            .map_err(|e| format!("Failed to write {}: {e}", self.path.display()))
    }

    pub fn fd(&self) -> i32 {
        self.lock.as_raw_fd()
    }
}

///
/// Reads the metadata of the server for the given build root, if one has ever started.
/// Liveness is probed by the caller (by connecting); staleness by comparing fingerprints.
///
pub fn read_metadata(build_root: &Path) -> Result<Option<Metadata>, String> {
    let path = PidFile::lock_path(build_root);
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("Failed to open {}: {e}", path.display())),
    };
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    if contents.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|e| format!("Invalid server metadata in {}: {e}", path.display()))
}
