// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::hash::{self, Hash};
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use fingerprint::{Digest, EMPTY_DIGEST};
use internment::Intern;
use itertools::Itertools;
use lazy_static::lazy_static;
use log::warn;
use reapi::MessageExt;
use reapi::gen::build::bazel::remote::execution::v2 as remexec;
use reapi::require_digest;
use serde::Serialize;

use crate::{LinkDepth, MAX_LINK_DEPTH, PathStat, RelativePath};

lazy_static! {
    pub static ref EMPTY_DIGEST_TREE: DigestTrie = DigestTrie(vec![].into());
    pub static ref EMPTY_DIRECTORY_DIGEST: DirectoryDigest = DirectoryDigest {
        digest: EMPTY_DIGEST,
        tree: Some(EMPTY_DIGEST_TREE.clone()),
    };
}

#[derive(Clone, Copy)]
pub enum SymlinkBehavior {
    /// Report symlinks as distinct entries.
    Aware,
    /// Follow symlinks to their targets.
    Oblivious,
}

/// A digest of a directory, optionally holding the `DigestTrie` it identifies.
///
/// When the trie is absent, the digest must already be persisted in a store (local or
/// remote); when present, the trie acts as a cache that also permits structural operations
/// without store round trips.
#[derive(Clone, Serialize)]
pub struct DirectoryDigest {
    // Private to force callers through `as_digest`, which documents the persistence caveat.
    digest: Digest,
    #[serde(skip_serializing)]
    pub tree: Option<DigestTrie>,
}

impl Eq for DirectoryDigest {}

impl PartialEq for DirectoryDigest {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Hash for DirectoryDigest {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl Debug for DirectoryDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tree = if self.tree.is_some() { "Some(..)" } else { "None" };
        f.debug_struct("DirectoryDigest")
            .field("digest", &self.digest)
            .field("tree", &tree)
            .finish()
    }
}

impl DirectoryDigest {
    /// Constructs a DirectoryDigest from a digest which is asserted to identify the trie.
    pub fn new(digest: Digest, tree: DigestTrie) -> Self {
        if cfg!(debug_assertions) {
            let actual = tree.compute_root_digest();
            assert!(digest == actual, "Expected {digest:?} but got {actual:?}");
        }
        Self {
            digest,
            tree: Some(tree),
        }
    }

    /// Asserts that the given digest identifies a Directory structure already persisted in a
    /// store. Prefer passing around a `DirectoryDigest` over reconstituting one with this.
    pub fn from_persisted_digest(digest: Digest) -> Self {
        Self { digest, tree: None }
    }

    pub fn as_digest(&self) -> Digest {
        self.digest
    }

    /// The digests reachable from this DirectoryDigest. If the trie has been discarded, only
    /// the root digest is known.
    pub fn digests(&self) -> Vec<Digest> {
        if let Some(tree) = &self.tree {
            let mut digests = tree.digests();
            digests.push(self.digest);
            digests
        } else {
            vec![self.digest]
        }
    }
}

impl From<DigestTrie> for DirectoryDigest {
    fn from(tree: DigestTrie) -> Self {
        Self {
            digest: tree.compute_root_digest(),
            tree: Some(tree),
        }
    }
}

/// A single interned component of a path: never empty, never containing `/`.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Name(Intern<String>);

impl Name {
    pub fn new(name: &str) -> Self {
        if cfg!(debug_assertions) {
            assert!(Path::new(name).components().count() < 2)
        }
        Name(Intern::from(name))
    }
}

impl Deref for Name {
    type Target = Intern<String>;

    fn deref(&self) -> &Intern<String> {
        &self.0
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{}", self.0.as_ref())
    }
}

#[derive(Clone, Debug)]
pub enum Entry {
    Directory(Directory),
    File(File),
    Symlink(Symlink),
}

impl Entry {
    pub fn name(&self) -> Name {
        match self {
            Entry::Directory(d) => d.name,
            Entry::File(f) => f.name,
            Entry::Symlink(s) => s.name,
        }
    }

    pub fn digest(&self) -> Digest {
        match self {
            Entry::Directory(d) => d.digest,
            Entry::File(f) => f.digest,
            Entry::Symlink(_) => EMPTY_DIGEST,
        }
    }
}

#[derive(Clone)]
pub struct Directory {
    name: Name,
    digest: Digest,
    tree: DigestTrie,
}

impl Directory {
    pub(crate) fn new(name: Name, entries: Vec<Entry>) -> Self {
        Self::from_digest_tree(name, DigestTrie(entries.into()))
    }

    fn from_digest_tree(name: Name, tree: DigestTrie) -> Self {
        Self {
            name,
            digest: tree.compute_root_digest(),
            tree,
        }
    }

    fn from_remexec_directory_node(
        dir_node: &remexec::DirectoryNode,
        directories_by_digest: &HashMap<Digest, remexec::Directory>,
    ) -> Result<Self, String> {
        let digest = require_digest(&dir_node.digest)?;
        let directory = directories_by_digest.get(&digest).ok_or_else(|| {
            format!(
                "Child of {name} with {digest:?} was not present.",
                name = dir_node.name
            )
        })?;
        Ok(Self {
            name: Name(Intern::from(&dir_node.name)),
            digest,
            tree: DigestTrie::from_remexec_directories(directory, directories_by_digest)?,
        })
    }

    pub fn name(&self) -> Name {
        self.name
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn tree(&self) -> &DigestTrie {
        &self.tree
    }

    pub fn as_remexec_directory(&self) -> remexec::Directory {
        self.tree.as_remexec_directory()
    }
}

impl Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory")
            .field("name", &self.name)
            .field("digest", &self.digest)
            .field("tree", &"..")
            .finish()
    }
}

impl From<&Directory> for remexec::DirectoryNode {
    fn from(dir: &Directory) -> Self {
        remexec::DirectoryNode {
            name: dir.name.as_ref().to_owned(),
            digest: Some((&dir.digest).into()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct File {
    name: Name,
    digest: Digest,
    is_executable: bool,
}

impl File {
    pub fn name(&self) -> Name {
        self.name
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn is_executable(&self) -> bool {
        self.is_executable
    }
}

impl TryFrom<&remexec::FileNode> for File {
    type Error = String;

    fn try_from(file_node: &remexec::FileNode) -> Result<Self, Self::Error> {
        Ok(Self {
            name: Name(Intern::from(&file_node.name)),
            digest: require_digest(&file_node.digest)?,
            is_executable: file_node.is_executable,
        })
    }
}

impl From<&File> for remexec::FileNode {
    fn from(file: &File) -> Self {
        remexec::FileNode {
            name: file.name.as_ref().to_owned(),
            digest: Some(file.digest.into()),
            is_executable: file.is_executable,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Symlink {
    name: Name,
    target: PathBuf,
}

impl Symlink {
    pub fn name(&self) -> Name {
        self.name
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl TryFrom<&remexec::SymlinkNode> for Symlink {
    type Error = String;

    fn try_from(symlink_node: &remexec::SymlinkNode) -> Result<Self, Self::Error> {
        Ok(Self {
            name: Name(Intern::from(&symlink_node.name)),
            target: PathBuf::from(&symlink_node.target),
        })
    }
}

impl From<&Symlink> for remexec::SymlinkNode {
    fn from(symlink: &Symlink) -> Self {
        remexec::SymlinkNode {
            name: symlink.name.as_ref().to_owned(),
            target: symlink.target.to_str().unwrap().to_string(),
        }
    }
}

/// A path paired with the kind of entry it refers to, for trie construction.
pub enum TypedPath<'a> {
    File { path: &'a Path, is_executable: bool },
    Link { path: &'a Path, target: &'a Path },
    Dir(&'a Path),
}

impl Deref for TypedPath<'_> {
    type Target = Path;

    fn deref(&self) -> &Path {
        match self {
            TypedPath::File { path, .. } => path,
            TypedPath::Link { path, .. } => path,
            TypedPath::Dir(d) => d,
        }
    }
}

impl<'a> From<&'a PathStat> for TypedPath<'a> {
    fn from(p: &'a PathStat) -> Self {
        match p {
            PathStat::File { path, stat } => TypedPath::File {
                path,
                is_executable: stat.is_executable,
            },
            PathStat::Link { path, stat } => TypedPath::Link {
                path,
                target: &stat.target,
            },
            PathStat::Dir { path, .. } => TypedPath::Dir(path),
        }
    }
}

/// An in-memory, content-addressed directory tree. Entries are sorted by name, with unique
/// names per directory: the canonical serialised form (a REAPI `Directory`) is therefore
/// byte-identical for byte-identical trees.
#[derive(Clone)]
pub struct DigestTrie(Arc<[Entry]>);

impl DigestTrie {
    /// Creates a DigestTrie from unique TypedPaths. Fails for duplicate paths.
    pub fn from_unique_paths(
        mut path_stats: Vec<TypedPath>,
        file_digests: &HashMap<PathBuf, Digest>,
    ) -> Result<Self, String> {
        #[allow(clippy::unnecessary_sort_by)]
        path_stats.sort_by(|a, b| (**a).cmp(&**b));

        // The recursive helper treats a path with multiple children as a directory, so
        // identically named files would otherwise silently become empty directories.
        let pre_dedupe_len = path_stats.len();
        path_stats.dedup_by(|a, b| **a == **b);
        if path_stats.len() != pre_dedupe_len {
            return Err(format!(
                "Snapshots must be constructed from unique path stats; got duplicates in {:?}",
                path_stats.iter().map(|p| (**p).to_str()).collect::<Vec<_>>()
            ));
        }

        Self::from_sorted_paths(PathBuf::new(), path_stats, file_digests)
    }

    fn from_sorted_paths(
        prefix: PathBuf,
        paths: Vec<TypedPath>,
        file_digests: &HashMap<PathBuf, Digest>,
    ) -> Result<Self, String> {
        let mut entries = Vec::new();

        for (name_res, group) in &paths
            .into_iter()
            .chunk_by(|s| first_path_component_to_name(s))
        {
            let name = name_res?;
            let mut path_group: Vec<TypedPath> = group.collect();
            if path_group.len() == 1 && path_group[0].components().count() == 1 {
                // A single entry with a single component is a leaf of this directory: a
                // file, a symlink, or an empty directory. Non-empty child directories have
                // multiple entries with this prefix and recurse below.
                match path_group.pop().unwrap() {
                    TypedPath::File {
                        path,
                        is_executable,
                    } => {
                        let digest = *file_digests.get(prefix.join(path).as_path()).unwrap();
                        entries.push(Entry::File(File {
                            name,
                            digest,
                            is_executable,
                        }));
                    }
                    TypedPath::Link { target, .. } => {
                        entries.push(Entry::Symlink(Symlink {
                            name,
                            target: target.to_path_buf(),
                        }));
                    }
                    TypedPath::Dir { .. } => {
                        entries.push(Entry::Directory(Directory::new(name, vec![])));
                    }
                }
            } else {
                entries.push(Entry::Directory(Directory::from_digest_tree(
                    name,
                    Self::from_sorted_paths(
                        prefix.join(name.as_ref()),
                        paths_of_child_dir(name, path_group),
                        file_digests,
                    )?,
                )));
            }
        }

        Ok(Self(entries.into()))
    }

    /// Creates a DigestTrie from a root remexec Directory and a map of its transitive
    /// children keyed by digest.
    pub fn from_remexec_directories(
        root: &remexec::Directory,
        children_by_digest: &HashMap<Digest, remexec::Directory>,
    ) -> Result<Self, String> {
        let mut entries = root
            .files
            .iter()
            .map(|f| File::try_from(f).map(Entry::File))
            .chain(
                root.symlinks
                    .iter()
                    .map(|s| Symlink::try_from(s).map(Entry::Symlink)),
            )
            .chain(root.directories.iter().map(|d| {
                Directory::from_remexec_directory_node(d, children_by_digest).map(Entry::Directory)
            }))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.name());
        Ok(Self(entries.into()))
    }

    pub fn as_remexec_directory(&self) -> remexec::Directory {
        let mut files = Vec::new();
        let mut directories = Vec::new();
        let mut symlinks = Vec::new();

        for entry in &*self.0 {
            match entry {
                Entry::File(f) => files.push(f.into()),
                Entry::Symlink(s) => symlinks.push(s.into()),
                Entry::Directory(d) => directories.push(d.into()),
            }
        }

        remexec::Directory {
            files,
            directories,
            symlinks,
        }
    }

    pub fn compute_root_digest(&self) -> Digest {
        if self.0.is_empty() {
            return EMPTY_DIGEST;
        }

        Digest::of_bytes(&self.as_remexec_directory().to_bytes())
    }

    pub fn entries(&self) -> &[Entry] {
        &self.0
    }

    /// All digests reachable from this trie.
    pub fn digests(&self) -> Vec<Digest> {
        let mut digests = Vec::new();
        let mut stack = self.0.iter().collect::<Vec<_>>();
        while let Some(entry) = stack.pop() {
            match entry {
                Entry::Directory(d) => {
                    digests.push(d.digest);
                    stack.extend(d.tree.0.iter());
                }
                Entry::File(f) => digests.push(f.digest),
                // Symlinks have no digest.
                Entry::Symlink(_) => (),
            }
        }
        digests
    }

    pub fn files(&self, symlink_behavior: SymlinkBehavior) -> Vec<PathBuf> {
        let mut files = Vec::new();
        self.walk(symlink_behavior, &mut |path, entry| {
            if let Entry::File(_) = entry {
                files.push(path.to_owned())
            }
        });
        files
    }

    pub fn directories(&self, symlink_behavior: SymlinkBehavior) -> Vec<PathBuf> {
        let mut directories = Vec::new();
        self.walk(symlink_behavior, &mut |path, entry| match entry {
            Entry::Directory(d) if d.name.is_empty() => {
                // The root directory, which is not reported.
            }
            Entry::Directory(_) => directories.push(path.to_owned()),
            _ => (),
        });
        directories
    }

    pub fn symlinks(&self) -> Vec<PathBuf> {
        let mut symlinks = Vec::new();
        self.walk(SymlinkBehavior::Aware, &mut |path, entry| {
            if let Entry::Symlink(_) = entry {
                symlinks.push(path.to_owned())
            }
        });
        symlinks
    }

    /// The paths of all leaves of the trie: files, symlinks, and empty directories.
    pub fn leaf_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        self.walk(SymlinkBehavior::Aware, &mut |path, entry| match entry {
            Entry::Directory(d) if d.tree.0.is_empty() => paths.push(path.to_owned()),
            Entry::Directory(_) => {}
            Entry::File(_) | Entry::Symlink(_) => paths.push(path.to_owned()),
        });
        paths
    }

    /// Visits every entry in the trie. With SymlinkBehavior::Oblivious, symlinks are
    /// resolved and the callback never observes a Symlink entry.
    pub fn walk(&self, symlink_behavior: SymlinkBehavior, f: &mut impl FnMut(&Path, &Entry)) {
        {
            let root = Entry::Directory(Directory::from_digest_tree(
                Name(Intern::from("")),
                self.clone(),
            ));
            f(&PathBuf::new(), &root);
        }
        self.walk_helper(self, PathBuf::new(), symlink_behavior, 0, f)
    }

    fn walk_helper(
        &self,
        root: &DigestTrie,
        path_so_far: PathBuf,
        symlink_behavior: SymlinkBehavior,
        mut link_depth: LinkDepth,
        f: &mut impl FnMut(&Path, &Entry),
    ) {
        for entry in &*self.0 {
            let path = path_so_far.join(entry.name().as_ref());
            let mut entry = entry;
            if let SymlinkBehavior::Oblivious = symlink_behavior {
                if let Entry::Symlink(s) = entry {
                    link_depth += 1;
                    if link_depth >= MAX_LINK_DEPTH {
                        warn!(
                            "Exceeded the maximum link depth while traversing links. Stopping traversal."
                        );
                        return;
                    }

                    let destination_path = path_so_far.join(&s.target);
                    match root.entry_helper(root, &destination_path, link_depth) {
                        Ok(Some(destination_entry)) => entry = destination_entry,
                        _ => continue,
                    }
                }
            }

            match entry {
                Entry::Directory(d) => {
                    f(&path, entry);
                    d.tree
                        .walk_helper(root, path.to_path_buf(), symlink_behavior, link_depth, f);
                }
                _ => f(&path, entry),
            }
        }
    }

    /// Returns the Entry at the given relative path, following symlinks in directory
    /// components, or None if no such path exists (including when a symlink escapes the
    /// root, or when the link depth limit is exceeded).
    ///
    /// Errors if the path traverses below a file.
    pub fn entry<'a>(&'a self, path: &Path) -> Result<Option<&'a Entry>, String> {
        self.entry_helper(self, path, 0)
    }

    fn entry_helper<'a>(
        &'a self,
        root: &'a DigestTrie,
        requested_path: &Path,
        link_depth: LinkDepth,
    ) -> Result<Option<&'a Entry>, String> {
        let mut tree = self;
        let mut path_so_far = PathBuf::new();
        let mut components = requested_path.components();
        let mut current_entry: Option<&Entry> = None;
        while let Some(component) = components.next() {
            if component == Component::CurDir {
                continue;
            }

            if let Some(Entry::File(_)) = current_entry {
                return Err(format!(
                    "{tree_digest:?} cannot contain a path at {requested_path:?}, \
           because a file was encountered at {path_so_far:?}.",
                    tree_digest = self.compute_root_digest()
                ));
            }

            if let Some(Entry::Directory(d)) = current_entry {
                tree = &d.tree;
            }

            path_so_far.push(component);
            if component == Component::ParentDir {
                // A symlink target may climb out of its containing directory, but never out
                // of the root.
                if let Some(grandparent) = path_so_far.parent().and_then(Path::parent) {
                    let full_path = grandparent.join(components.as_path());
                    return root.entry_helper(root, &full_path, link_depth);
                }
                return Ok(None);
            }

            let component = component.as_os_str();
            let maybe_matching_entry = tree
                .entries()
                .binary_search_by_key(&component, |entry| {
                    Path::new(entry.name().as_ref()).as_os_str()
                })
                .ok()
                .map(|idx| &tree.entries()[idx]);
            let Some(matching_entry) = maybe_matching_entry else {
                return Ok(None);
            };

            if let Entry::Symlink(s) = matching_entry {
                if link_depth >= MAX_LINK_DEPTH {
                    warn!(
                        "Exceeded the maximum link depth while traversing links. Stopping traversal."
                    );
                    return Ok(None);
                }

                let full_path = path_so_far
                    .parent()
                    .unwrap()
                    .join(&s.target)
                    .join(components.as_path());
                return root.entry_helper(root, &full_path, link_depth + 1);
            }

            current_entry = Some(matching_entry);
        }
        Ok(current_entry)
    }

    /// Adds the given prefix to this trie, returning the result.
    pub fn add_prefix(self, prefix: &RelativePath) -> Result<DigestTrie, String> {
        let mut prefix_iter = prefix.iter();
        let mut tree = self;
        while let Some(parent) = prefix_iter.next_back() {
            let directory =
                Directory::from_digest_tree(first_path_component_to_name(parent.as_ref())?, tree);
            tree = DigestTrie(vec![Entry::Directory(directory)].into());
        }

        Ok(tree)
    }

    /// Removes the given prefix from this trie, returning the result. Fails if any entry
    /// does not lie under the prefix.
    pub fn remove_prefix(self, prefix: &RelativePath) -> Result<DigestTrie, String> {
        let root = self.clone();
        let mut tree = self;
        let mut already_stripped = PathBuf::new();
        for component_to_strip in prefix.components() {
            let component_to_strip = component_to_strip.as_os_str();
            let mut matching_dir = None;
            let mut extra_entries = Vec::new();
            for entry in tree.entries() {
                match entry {
                    Entry::Directory(d)
                        if Path::new(d.name.as_ref()).as_os_str() == component_to_strip =>
                    {
                        matching_dir = Some(d)
                    }
                    entry => extra_entries.push(entry.name().as_ref().to_owned()),
                }
            }

            match (matching_dir, extra_entries.is_empty()) {
                (None, true) => {
                    tree = EMPTY_DIGEST_TREE.clone();
                    break;
                }
                (None, false) => {
                    return Err(strip_prefix_error(
                        prefix,
                        &root,
                        &already_stripped,
                        &format!(
                            "didn't contain a directory named {:?} but did contain {}",
                            Path::new(component_to_strip),
                            extra_entries.iter().map(|name| format!("{name:?}")).join(", "),
                        ),
                    ));
                }
                (Some(_), false) => {
                    return Err(strip_prefix_error(
                        prefix,
                        &root,
                        &already_stripped,
                        &format!(
                            "contained non-matching {}",
                            extra_entries.iter().map(|name| format!("{name:?}")).join(", "),
                        ),
                    ));
                }
                (Some(d), true) => {
                    already_stripped = already_stripped.join(component_to_strip);
                    tree = d.tree.clone();
                }
            }
        }

        Ok(tree)
    }

    /// Merges DigestTries, recursively unioning their directories.
    ///
    /// A file or symlink that appears identically in multiple trees appears once in the
    /// output; entries with the same name but different content (or different kinds) are a
    /// `MergeError::Collision`.
    pub fn merge(trees: Vec<DigestTrie>) -> Result<DigestTrie, MergeError> {
        Self::merge_helper(PathBuf::new(), trees)
    }

    fn merge_helper(parent_path: PathBuf, trees: Vec<DigestTrie>) -> Result<DigestTrie, MergeError> {
        if trees.is_empty() {
            return Ok(EMPTY_DIGEST_TREE.clone());
        } else if trees.len() == 1 {
            let mut trees = trees;
            return Ok(trees.pop().unwrap());
        }

        // Merge the (sorted) entry lists, and then group by name.
        let input_entries = trees
            .iter()
            .map(|tree| tree.entries().iter())
            .kmerge_by(|a, b| a.name() < b.name());

        let mut entries: Vec<Entry> = Vec::new();
        for (name, group) in &input_entries.chunk_by(|e| e.name()) {
            let group = group.collect::<Vec<_>>();
            if group.len() == 1 {
                entries.push(group[0].clone());
                continue;
            }

            match group[0] {
                Entry::File(f) => {
                    // Identical files coalesce; anything else at this name is a collision.
                    if group[1..].iter().all(
                        |entry| matches!(entry, Entry::File(other) if other.digest == f.digest),
                    ) {
                        entries.push(group[0].clone());
                    } else {
                        return Err(MergeError::collision(&parent_path, name, &group));
                    }
                }
                Entry::Symlink(s) => {
                    if group[1..].iter().all(
                        |entry| matches!(entry, Entry::Symlink(other) if other.target == s.target),
                    ) {
                        entries.push(group[0].clone());
                    } else {
                        return Err(MergeError::collision(&parent_path, name, &group));
                    }
                }
                Entry::Directory(d) => {
                    let mut dirs = Vec::new();
                    for entry in &group {
                        match entry {
                            Entry::Directory(other) => dirs.push(other),
                            _ => return Err(MergeError::collision(&parent_path, name, &group)),
                        }
                    }

                    if dirs[1..].iter().all(|other| other.digest == d.digest) {
                        // All identical: emit one copy.
                        entries.push(group[0].clone());
                    } else {
                        let merged_tree = Self::merge_helper(
                            parent_path.join(name.as_ref()),
                            dirs.into_iter().map(|d| d.tree.clone()).collect(),
                        )?;
                        entries.push(Entry::Directory(Directory::from_digest_tree(
                            name,
                            merged_tree,
                        )));
                    }
                }
            }
        }

        Ok(DigestTrie(entries.into()))
    }

    /// Compares this trie with another, partitioning paths into unique/changed groups.
    pub fn diff(&self, other: &DigestTrie) -> DigestTrieDiff {
        let mut result = DigestTrieDiff::default();
        self.diff_helper(other, PathBuf::new(), &mut result);
        result
    }

    // NB: Relies on the entries being sorted by name, irrespective of entry kind.
    fn diff_helper(&self, them: &DigestTrie, path_so_far: PathBuf, result: &mut DigestTrieDiff) {
        let mut our_iter = self.0.iter();
        let mut their_iter = them.0.iter();
        let mut ours = our_iter.next();
        let mut theirs = their_iter.next();

        let add_unique = |entry: &Entry,
                          files: &mut Vec<PathBuf>,
                          dirs: &mut Vec<PathBuf>,
                          symlinks: &mut Vec<PathBuf>| {
            let path = path_so_far.join(entry.name().as_ref());
            match entry {
                Entry::File(_) => files.push(path),
                Entry::Symlink(_) => symlinks.push(path),
                Entry::Directory(_) => dirs.push(path),
            }
        };

        let add_ours = |entry: &Entry, diff: &mut DigestTrieDiff| {
            add_unique(
                entry,
                &mut diff.our_unique_files,
                &mut diff.our_unique_dirs,
                &mut diff.our_unique_symlinks,
            );
        };
        let add_theirs = |entry: &Entry, diff: &mut DigestTrieDiff| {
            add_unique(
                entry,
                &mut diff.their_unique_files,
                &mut diff.their_unique_dirs,
                &mut diff.their_unique_symlinks,
            );
        };

        while let Some(our_entry) = ours {
            match theirs {
                Some(their_entry) => match our_entry.name().cmp(&their_entry.name()) {
                    Ordering::Less => {
                        add_ours(our_entry, result);
                        ours = our_iter.next();
                    }
                    Ordering::Greater => {
                        add_theirs(their_entry, result);
                        theirs = their_iter.next();
                    }
                    Ordering::Equal => {
                        match (our_entry, their_entry) {
                            (Entry::File(our_file), Entry::File(their_file)) => {
                                if our_file.digest != their_file.digest {
                                    result
                                        .changed_files
                                        .push(path_so_far.join(our_file.name().as_ref()));
                                }
                            }
                            (Entry::Symlink(our_link), Entry::Symlink(their_link)) => {
                                if our_link.target != their_link.target {
                                    result
                                        .changed_symlinks
                                        .push(path_so_far.join(our_link.name.as_ref()));
                                }
                            }
                            (Entry::Directory(our_dir), Entry::Directory(their_dir)) => {
                                if our_dir.digest != their_dir.digest {
                                    our_dir.tree.diff_helper(
                                        &their_dir.tree,
                                        path_so_far.join(our_dir.name().as_ref()),
                                        result,
                                    )
                                }
                            }
                            _ => {
                                // Same name, different kinds.
                                add_ours(our_entry, result);
                                add_theirs(their_entry, result);
                            }
                        }
                        ours = our_iter.next();
                        theirs = their_iter.next();
                    }
                },
                None => {
                    add_ours(our_entry, result);
                    ours = our_iter.next();
                }
            }
        }

        while let Some(their_entry) = &theirs {
            add_theirs(their_entry, result);
            theirs = their_iter.next();
        }
    }
}

impl TryFrom<remexec::Tree> for DigestTrie {
    type Error = String;

    fn try_from(tree: remexec::Tree) -> Result<Self, Self::Error> {
        let root = tree
            .root
            .as_ref()
            .ok_or_else(|| format!("Corrupt tree, no root: {tree:?}"))?;
        let children = tree
            .children
            .into_iter()
            .map(|d| (Digest::of_bytes(&d.to_bytes()), d))
            .collect::<HashMap<_, _>>();

        Self::from_remexec_directories(root, &children)
    }
}

impl From<&DigestTrie> for remexec::Tree {
    fn from(trie: &DigestTrie) -> Self {
        let mut tree = remexec::Tree::default();
        trie.walk(SymlinkBehavior::Aware, &mut |_, entry| match entry {
            Entry::File(_) | Entry::Symlink(_) => (),
            Entry::Directory(d) if d.name.is_empty() => {
                tree.root = Some(d.tree.as_remexec_directory());
            }
            Entry::Directory(d) => {
                tree.children.push(d.tree.as_remexec_directory());
            }
        });
        tree
    }
}

#[derive(Default, Debug)]
pub struct DigestTrieDiff {
    pub our_unique_files: Vec<PathBuf>,
    pub our_unique_symlinks: Vec<PathBuf>,
    pub our_unique_dirs: Vec<PathBuf>,
    pub their_unique_files: Vec<PathBuf>,
    pub their_unique_symlinks: Vec<PathBuf>,
    pub their_unique_dirs: Vec<PathBuf>,
    pub changed_files: Vec<PathBuf>,
    pub changed_symlinks: Vec<PathBuf>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum MergeError {
    Collision {
        path: PathBuf,
        entries: Vec<String>,
    },
}

impl MergeError {
    fn collision(parent_path: &Path, name: Name, entries: &[&Entry]) -> Self {
        MergeError::Collision {
            path: parent_path.join(name.as_ref()),
            entries: entries
                .iter()
                .map(|entry| match entry {
                    Entry::File(f) => format!("file with digest {:?}", f.digest),
                    Entry::Symlink(s) => format!("symlink to {:?}", s.target),
                    Entry::Directory(d) => format!("directory with digest {:?}", d.digest),
                })
                .collect(),
        }
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::Collision { path, entries } => write!(
                f,
                "Can only merge Directories with no duplicates, but found conflicting entries \
         at {path:?}: {}",
                entries.join(", ")
            ),
        }
    }
}

impl From<MergeError> for String {
    fn from(err: MergeError) -> Self {
        err.to_string()
    }
}

fn strip_prefix_error(
    prefix: &RelativePath,
    root: &DigestTrie,
    already_stripped: &Path,
    detail: &str,
) -> String {
    let location = if already_stripped.components().next().is_some() {
        format!("subdirectory {}", already_stripped.display())
    } else {
        "root directory".to_owned()
    };
    format!(
        "Cannot strip prefix {} from {location} (Digest with hash {:?}) - {detail}",
        prefix.display(),
        root.compute_root_digest().hash,
    )
}

fn paths_of_child_dir(name: Name, paths: Vec<TypedPath>) -> Vec<TypedPath> {
    paths
        .into_iter()
        .filter_map(|s| {
            if s.components().count() == 1 {
                return None;
            }
            Some(match s {
                TypedPath::File {
                    path,
                    is_executable,
                } => TypedPath::File {
                    path: path.strip_prefix(name.as_ref()).unwrap(),
                    is_executable,
                },
                TypedPath::Link { path, target } => TypedPath::Link {
                    path: path.strip_prefix(name.as_ref()).unwrap(),
                    target,
                },
                TypedPath::Dir(path) => TypedPath::Dir(path.strip_prefix(name.as_ref()).unwrap()),
            })
        })
        .collect()
}

fn first_path_component_to_name(path: &Path) -> Result<Name, String> {
    let first_path_component = path
        .components()
        .next()
        .ok_or_else(|| format!("Path `{}` was unexpectedly empty", path.display()))?;
    let name = first_path_component
        .as_os_str()
        .to_str()
        .ok_or_else(|| format!("{first_path_component:?} is not representable in UTF8"))?;
    Ok(Name(Intern::from(name)))
}
