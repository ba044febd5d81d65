// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use lazy_static::lazy_static;

use crate::Stat;

lazy_static! {
    static ref EMPTY_IGNORE: Arc<GitignoreStyleExcludes> = Arc::new(GitignoreStyleExcludes {
        patterns: vec![],
        gitignore: Gitignore::empty(),
    });
}

///
/// A chain of `.gitignore`-style exclusion patterns: ignore files rooted at the build root
/// plus caller-provided pattern lists. Matching follows the gitignore specification: last
/// match wins, `!` negates, a trailing `/` restricts a pattern to directories.
///
#[derive(Debug, Clone)]
pub struct GitignoreStyleExcludes {
    patterns: Vec<String>,
    gitignore: Gitignore,
}

impl PartialEq for GitignoreStyleExcludes {
    fn eq(&self, other: &Self) -> bool {
        self.patterns == other.patterns
    }
}

impl Eq for GitignoreStyleExcludes {}

impl Hash for GitignoreStyleExcludes {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.patterns.hash(state);
    }
}

impl GitignoreStyleExcludes {
    pub fn create(patterns: Vec<String>) -> Result<Arc<Self>, String> {
        Self::create_with_gitignore_files(patterns, vec![])
    }

    pub fn empty() -> Arc<Self> {
        EMPTY_IGNORE.clone()
    }

    ///
    /// Creates excludes from pattern lines plus zero or more ignore files.
    ///
    /// Later paths in `gitignore_paths` take precedence over earlier ones, and `patterns`
    /// takes precedence over all of them.
    ///
    pub fn create_with_gitignore_files(
        patterns: Vec<String>,
        gitignore_paths: Vec<PathBuf>,
    ) -> Result<Arc<Self>, String> {
        if patterns.is_empty() && gitignore_paths.is_empty() {
            return Ok(EMPTY_IGNORE.clone());
        }

        let mut ignore_builder = GitignoreBuilder::new("");
        for path in &gitignore_paths {
            if let Some(err) = ignore_builder.add(path) {
                return Err(format!("Error adding the path {}: {err:?}", path.display()));
            }
        }
        for pattern in &patterns {
            ignore_builder
                .add_line(None, pattern)
                .map_err(|e| format!("Could not parse glob exclude pattern `{pattern:?}`: {e:?}"))?;
        }

        let gitignore = ignore_builder
            .build()
            .map_err(|e| format!("Could not build ignore patterns: {e:?}"))?;

        Ok(Arc::new(Self {
            patterns,
            gitignore,
        }))
    }

    ///
    /// The absolute paths of the conventional ignore files under the given build root (the
    /// global git excludes file, `<root>/.gitignore`, and `<root>/.git/info/exclude`, in
    /// that order), filtered to the ones which exist.
    ///
    pub fn gitignore_file_paths(build_root: &Path) -> Vec<PathBuf> {
        let mut result = vec![];
        if let Some(global_ignore_path) =
            ignore::gitignore::gitconfig_excludes_path().filter(|fp| fp.is_file())
        {
            result.push(global_ignore_path);
        }
        let gitignore_path = build_root.join(".gitignore");
        if Path::is_file(&gitignore_path) {
            result.push(gitignore_path);
        }
        // Unlike git itself, we hardcode `.git` rather than respecting `$GIT_DIR`.
        let exclude_path = build_root.join(".git/info/exclude");
        if Path::is_file(&exclude_path) {
            result.push(exclude_path);
        }
        result
    }

    pub fn exclude_patterns(&self) -> &[String] {
        self.patterns.as_slice()
    }

    pub fn is_ignored(&self, stat: &Stat) -> bool {
        let is_dir = matches!(stat, &Stat::Dir(_));
        self.is_ignored_path(stat.path(), is_dir)
    }

    pub fn is_ignored_path(&self, path: &Path, is_dir: bool) -> bool {
        match self.gitignore.matched(path, is_dir) {
            ignore::Match::None | ignore::Match::Whitelist(_) => false,
            ignore::Match::Ignore(_) => true,
        }
    }

    pub fn is_ignored_or_child_of_ignored_path(&self, path: &Path, is_dir: bool) -> bool {
        match self.gitignore.matched_path_or_any_parents(path, is_dir) {
            ignore::Match::None | ignore::Match::Whitelist(_) => false,
            ignore::Match::Ignore(_) => true,
        }
    }
}
