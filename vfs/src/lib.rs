// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod directory;
#[cfg(test)]
mod directory_tests;
pub mod gitignore;
mod glob_matching;
#[cfg(test)]
mod glob_matching_tests;
mod posixfs;
#[cfg(test)]
mod posixfs_tests;

pub use crate::directory::{
    DigestTrie, DirectoryDigest, EMPTY_DIGEST_TREE, EMPTY_DIRECTORY_DIGEST, Entry, SymlinkBehavior,
    TypedPath,
};
pub use crate::gitignore::GitignoreStyleExcludes;
pub use crate::glob_matching::{
    DOUBLE_STAR_GLOB, FilespecMatcher, GlobMatching, PathGlob, PreparedPathGlobs, SINGLE_STAR_GLOB,
};
pub use crate::posixfs::PosixFS;

use std::cmp::min;
use std::fmt;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

const XDG_CACHE_HOME: &str = "XDG_CACHE_HOME";

/// NB: Linux limits path lookups to 40 symlink traversals. We use a higher limit because this
/// is not exactly the same operation: we walk recursively while matching globs, so a
/// traversal may pass through non-link destinations.
pub const MAX_LINK_DEPTH: u8 = 64;

pub type LinkDepth = u8;

/// Follows the XDG base dir spec: <http://standards.freedesktop.org/basedir-spec/latest/index.html>.
pub fn default_cache_path() -> PathBuf {
    let cache_path = std::env::var(XDG_CACHE_HOME)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs_next::home_dir().map(|home| home.join(".cache")))
        .unwrap_or_else(|| panic!("Could not find home dir or {XDG_CACHE_HOME}."));
    cache_path.join("gantry")
}

/// Simplified filesystem Permissions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Permissions {
    ReadOnly,
    Writable,
}

/// A normalised relative path: no leading root, no `..` escaping the root, no Windows
/// prefixes.
#[derive(Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Serialize)]
pub struct RelativePath(PathBuf);

impl RelativePath {
    pub fn empty() -> RelativePath {
        RelativePath(PathBuf::new())
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Result<RelativePath, String> {
        let mut relative_path = PathBuf::new();
        let candidate = path.as_ref();
        for component in candidate.components() {
            match component {
                Component::Prefix(_) => {
                    return Err(format!("Windows paths are not allowed: {candidate:?}"));
                }
                Component::RootDir => {
                    return Err(format!("Absolute paths are not allowed: {candidate:?}"));
                }
                Component::CurDir => continue,
                Component::ParentDir => {
                    if !relative_path.pop() {
                        return Err(format!(
                            "Relative paths that escape the root are not allowed: {candidate:?}"
                        ));
                    }
                }
                Component::Normal(path) => relative_path.push(path),
            }
        }
        Ok(RelativePath(relative_path))
    }

    pub fn to_str(&self) -> Option<&str> {
        self.0.to_str()
    }

    pub fn join(&self, other: Self) -> RelativePath {
        RelativePath(self.0.join(other))
    }
}

impl Deref for RelativePath {
    type Target = PathBuf;

    fn deref(&self) -> &PathBuf {
        &self.0
    }
}

impl AsRef<Path> for RelativePath {
    fn as_ref(&self) -> &Path {
        self.0.as_path()
    }
}

impl From<RelativePath> for PathBuf {
    fn from(p: RelativePath) -> Self {
        p.0
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Stat {
    Link(Link),
    Dir(Dir),
    File(File),
}

impl Stat {
    pub fn path(&self) -> &Path {
        match self {
            Stat::Dir(Dir(p)) => p.as_path(),
            Stat::File(File { path, .. }) => path.as_path(),
            Stat::Link(Link { path, .. }) => path.as_path(),
        }
    }

    pub fn dir(path: PathBuf) -> Stat {
        Stat::Dir(Dir(path))
    }

    pub fn file(path: PathBuf, is_executable: bool) -> Stat {
        Stat::File(File {
            path,
            is_executable,
        })
    }

    pub fn link(path: PathBuf, target: PathBuf) -> Stat {
        Stat::Link(Link { path, target })
    }

    pub fn within(&self, directory: &Path) -> Stat {
        match self {
            Stat::Dir(Dir(p)) => Stat::Dir(Dir(directory.join(p))),
            Stat::File(File {
                path,
                is_executable,
            }) => Stat::File(File {
                path: directory.join(path),
                is_executable: *is_executable,
            }),
            Stat::Link(Link { path, target }) => Stat::Link(Link {
                path: directory.join(path),
                target: target.to_owned(),
            }),
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Link {
    pub path: PathBuf,
    pub target: PathBuf,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Dir(pub PathBuf);

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct File {
    pub path: PathBuf,
    pub is_executable: bool,
}

/// A symbolic path name (context specific) paired with the canonical Stat it refers to.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum PathStat {
    Dir { path: PathBuf, stat: Dir },
    File { path: PathBuf, stat: File },
    Link { path: PathBuf, stat: Link },
}

impl PathStat {
    pub fn dir(path: PathBuf, stat: Dir) -> PathStat {
        PathStat::Dir { path, stat }
    }

    pub fn file(path: PathBuf, stat: File) -> PathStat {
        PathStat::File { path, stat }
    }

    pub fn link(path: PathBuf, stat: Link) -> PathStat {
        PathStat::Link { path, stat }
    }

    pub fn path(&self) -> &Path {
        match self {
            PathStat::Dir { path, .. } => path.as_path(),
            PathStat::File { path, .. } => path.as_path(),
            PathStat::Link { path, .. } => path.as_path(),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct DirectoryListing(pub Vec<Stat>);

#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub enum StrictGlobMatching {
    // The Error and Warn variants carry a description of the origin of the glob request, to
    // make unmatched-glob diagnostics actionable.
    Error(String),
    Warn(String),
    Ignore,
}

impl StrictGlobMatching {
    pub fn create(behavior: &str, description_of_origin: Option<String>) -> Result<Self, String> {
        match (behavior, description_of_origin) {
            ("ignore", None) => Ok(StrictGlobMatching::Ignore),
            ("warn", Some(origin)) => Ok(StrictGlobMatching::Warn(origin)),
            ("error", Some(origin)) => Ok(StrictGlobMatching::Error(origin)),
            ("ignore", Some(_)) => {
                Err("Provided description_of_origin while ignoring glob match errors".to_string())
            }
            ("warn", None) | ("error", None) => Err(
                "Must provide a description_of_origin when warning or erroring on glob match \
         errors"
                    .to_string(),
            ),
            _ => Err(format!("Unrecognized strict glob matching behavior: {behavior}.")),
        }
    }

    pub fn should_check_glob_matches(&self) -> bool {
        !matches!(self, &StrictGlobMatching::Ignore)
    }

    pub fn should_throw_on_error(&self) -> bool {
        matches!(self, &StrictGlobMatching::Error(_))
    }
}

#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub enum GlobExpansionConjunction {
    AllMatch,
    AnyMatch,
}

impl GlobExpansionConjunction {
    pub fn create(spec: &str) -> Result<Self, String> {
        match spec {
            "all_match" => Ok(GlobExpansionConjunction::AllMatch),
            "any_match" => Ok(GlobExpansionConjunction::AnyMatch),
            _ => Err(format!("Unrecognized conjunction: {spec}.")),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PathGlobs {
    globs: Vec<String>,
    strict_match_behavior: StrictGlobMatching,
    conjunction: GlobExpansionConjunction,
}

impl PathGlobs {
    pub fn new(
        globs: Vec<String>,
        strict_match_behavior: StrictGlobMatching,
        conjunction: GlobExpansionConjunction,
    ) -> PathGlobs {
        PathGlobs {
            globs,
            strict_match_behavior,
            conjunction,
        }
    }

    pub fn globs(&self) -> &[String] {
        &self.globs
    }

    pub fn parse(self) -> Result<glob_matching::PreparedPathGlobs, String> {
        glob_matching::PreparedPathGlobs::create(
            self.globs,
            self.strict_match_behavior,
            self.conjunction,
        )
    }
}

impl fmt::Display for PathGlobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.globs.join(", "))
    }
}

///
/// A context for filesystem operations parameterized on an error type 'E'.
///
/// Implemented both by `PosixFS` (the workspace) and by `DigestTrie` (an in-memory tree), so
/// that glob expansion can run against either.
///
#[async_trait]
pub trait Vfs<E: Send + Sync + 'static>: Clone + Send + Sync + 'static {
    async fn read_link(&self, link: &Link) -> Result<PathBuf, E>;
    async fn scandir(&self, dir: Dir) -> Result<Arc<DirectoryListing>, E>;
    fn is_ignored(&self, stat: &Stat) -> bool;
    fn mk_error(msg: &str) -> E;
}

#[async_trait]
impl Vfs<String> for DigestTrie {
    async fn read_link(&self, link: &Link) -> Result<PathBuf, String> {
        let entry = self
            .entry(&link.path)?
            .ok_or_else(|| format!("{link:?} does not exist within this Snapshot."))?;
        match entry {
            directory::Entry::Symlink(s) => Ok(s.target().to_path_buf()),
            directory::Entry::File(_) => Err(format!(
                "Path `{}` was a file rather than a symlink.",
                link.path.display()
            )),
            directory::Entry::Directory(_) => Err(format!(
                "Path `{}` was a directory rather than a symlink.",
                link.path.display()
            )),
        }
    }

    async fn scandir(&self, dir: Dir) -> Result<Arc<DirectoryListing>, String> {
        let entries = if dir.0.components().next().is_none() {
            self.entries()
        } else {
            let entry = self
                .entry(&dir.0)?
                .ok_or_else(|| format!("{dir:?} does not exist within this Snapshot."))?;
            match entry {
                directory::Entry::Directory(d) => d.tree().entries(),
                directory::Entry::File(_) => {
                    return Err(format!(
                        "Path `{}` was a file rather than a directory.",
                        dir.0.display()
                    ));
                }
                directory::Entry::Symlink(_) => {
                    return Err(format!(
                        "Path `{}` was a symlink rather than a directory.",
                        dir.0.display()
                    ));
                }
            }
        };

        Ok(Arc::new(DirectoryListing(
            entries
                .iter()
                .map(|child| match child {
                    directory::Entry::File(f) => Stat::File(File {
                        path: f.name().as_ref().into(),
                        is_executable: f.is_executable(),
                    }),
                    directory::Entry::Symlink(s) => Stat::Link(Link {
                        path: s.name().as_ref().into(),
                        target: s.target().to_path_buf(),
                    }),
                    directory::Entry::Directory(d) => Stat::Dir(Dir(d.name().as_ref().into())),
                })
                .collect(),
        )))
    }

    fn is_ignored(&self, _stat: &Stat) -> bool {
        false
    }

    fn mk_error(msg: &str) -> String {
        msg.to_owned()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: PathBuf,
    pub content: Bytes,
    pub is_executable: bool,
}

impl fmt::Debug for FileContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = min(self.content.len(), 5);
        let describer = if len < self.content.len() {
            "starting "
        } else {
            ""
        };
        write!(
            f,
            "FileContent(path={:?}, content={} bytes {}{:?})",
            self.path,
            self.content.len(),
            describer,
            &self.content[..len]
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub digest: fingerprint::Digest,
    pub is_executable: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymlinkEntry {
    pub path: PathBuf,
    pub target: PathBuf,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DigestEntry {
    File(FileEntry),
    Symlink(SymlinkEntry),
    EmptyDirectory(PathBuf),
}

impl DigestEntry {
    pub fn path(&self) -> &Path {
        match self {
            DigestEntry::File(file_entry) => &file_entry.path,
            DigestEntry::Symlink(symlink_entry) => &symlink_entry.path,
            DigestEntry::EmptyDirectory(path) => path,
        }
    }
}
