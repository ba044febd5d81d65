// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;

use crate::gen::build::bazel::remote::execution::v2 as remexec;

/// Verifies that the given `Directory` is in canonical form: entry lists sorted by name, no
/// duplicate names across entry kinds, and no name containing a path separator. Canonical
/// form is what makes directory serialisation content-addressable.
pub fn verify_directory_canonical(
    digest: fingerprint::Digest,
    directory: &remexec::Directory,
) -> Result<(), String> {
    let mut child_names: HashSet<&str> = HashSet::new();
    let all_names = directory
        .files
        .iter()
        .map(|file| file.name.as_str())
        .chain(directory.directories.iter().map(|dir| dir.name.as_str()))
        .chain(directory.symlinks.iter().map(|link| link.name.as_str()));
    for name in all_names {
        if name.is_empty() {
            return Err(format!(
                "Directory {digest:?} contained an entry with an empty name"
            ));
        }
        if name.contains('/') {
            return Err(format!(
                "Directory {digest:?} contained an entry with a path separator in its name: {name:?}"
            ));
        }
        if !child_names.insert(name) {
            return Err(format!(
                "Directory {digest:?} contained multiple entries named {name:?}"
            ));
        }
    }

    verify_sorted(digest, "files", directory.files.iter().map(|f| &f.name))?;
    verify_sorted(
        digest,
        "directories",
        directory.directories.iter().map(|d| &d.name),
    )?;
    verify_sorted(
        digest,
        "symlinks",
        directory.symlinks.iter().map(|s| &s.name),
    )?;

    for file in &directory.files {
        if file.digest.is_none() {
            return Err(format!(
                "Directory {digest:?} contained a file {:?} with no digest",
                file.name
            ));
        }
    }
    for dir in &directory.directories {
        if dir.digest.is_none() {
            return Err(format!(
                "Directory {digest:?} contained a directory {:?} with no digest",
                dir.name
            ));
        }
    }

    Ok(())
}

fn verify_sorted<'a>(
    digest: fingerprint::Digest,
    kind: &str,
    names: impl Iterator<Item = &'a String>,
) -> Result<(), String> {
    let mut previous: Option<&String> = None;
    for name in names {
        if let Some(previous) = previous {
            if name <= previous {
                return Err(format!(
                    "Directory {digest:?} had unsorted {kind}: {name:?} after {previous:?}"
                ));
            }
        }
        previous = Some(name);
    }
    Ok(())
}
