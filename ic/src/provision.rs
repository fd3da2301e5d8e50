//! Instance provisioning
//!
//! New instances get a filtered copy of the server's base tree. The filter is
//! written as an allow-list of globs, but the copy only understands exclusions,
//! so the allow-list is compiled into a per-directory exclude set first.

use glob::{MatchOptions, Pattern};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

struct AllowPattern {
    whole: Pattern,
    components: Vec<Pattern>,
}

/// Compiled allow-list of root-relative glob patterns
pub struct AllowList {
    patterns: Vec<AllowPattern>,
}

impl AllowList {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let invalid = |pattern: &str, e: glob::PatternError| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        };

        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let raw = raw.as_ref().trim_matches('/');
            let whole = Pattern::new(raw).map_err(|e| invalid(raw, e))?;
            let components = raw
                .split('/')
                .filter(|c| !c.is_empty())
                .map(|c| Pattern::new(c).map_err(|e| invalid(raw, e)))
                .collect::<Result<Vec<_>>>()?;
            compiled.push(AllowPattern { whole, components });
        }
        Ok(Self { patterns: compiled })
    }

    fn matches(&self, rel: &Path) -> bool {
        self.patterns.iter().any(|p| p.whole.matches_path_with(rel, MATCH_OPTIONS))
    }

    /// Directory `rel` must be traversed because a pattern reaches below it
    fn leads_to_match(&self, rel: &Path) -> bool {
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        self.patterns.iter().any(|p| {
            p.components.len() > parts.len()
                && p.components
                    .iter()
                    .zip(&parts)
                    .all(|(pattern, part)| pattern.matches_with(part, MATCH_OPTIONS))
        })
    }

    /// Whether the root-relative entry `rel` is part of the copy
    ///
    /// Kept when it matches a pattern, when an ancestor matches (whole
    /// subtree), or when it is a directory a pattern descends through.
    pub fn keeps(&self, rel: &Path, is_dir: bool) -> bool {
        if self.matches(rel) {
            return true;
        }
        if rel.ancestors().skip(1).any(|a| !a.as_os_str().is_empty() && self.matches(a)) {
            return true;
        }
        is_dir && self.leads_to_match(rel)
    }

    /// Entries directly inside `dir` that the copy must skip
    pub fn excluded_entries(&self, root: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut excluded = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
            let entry = entry.map_err(|e| Error::io(dir, e))?;
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let is_dir = entry.file_type().map_err(|e| Error::io(&path, e))?.is_dir();
            if !self.keeps(rel, is_dir) {
                excluded.push(rel.to_path_buf());
            }
        }
        excluded.sort();
        Ok(excluded)
    }

    /// Exclude set for the whole tree under `root`, as root-relative paths
    pub fn exclude_set(&self, root: &Path) -> Result<HashSet<PathBuf>> {
        debug!(root = %root.display(), "AllowList::exclude_set: called");
        let mut excluded = HashSet::new();
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let skipped = self.excluded_entries(root, &dir)?;
            for entry in fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
                let entry = entry.map_err(|e| Error::io(&dir, e))?;
                let path = entry.path();
                let rel = path.strip_prefix(root).unwrap_or(&path);
                if entry.file_type().map_err(|e| Error::io(&path, e))?.is_dir() && !skipped.iter().any(|s| s == rel) {
                    pending.push(path.clone());
                }
            }
            excluded.extend(skipped);
        }

        debug!(excluded = excluded.len(), "AllowList::exclude_set: returning");
        Ok(excluded)
    }
}

/// Summary of a provisioning copy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub files: usize,
    pub directories: usize,
}

/// Copy `source` into `dest`, skipping every root-relative path in `excluded`
/// and everything beneath it
pub fn copy_excluding(source: &Path, dest: &Path, excluded: &HashSet<PathBuf>) -> Result<CopySummary> {
    debug!(source = %source.display(), dest = %dest.display(), "copy_excluding: called");
    let mut summary = CopySummary::default();

    let walker = WalkDir::new(source).follow_links(false).into_iter().filter_entry(|entry| {
        entry
            .path()
            .strip_prefix(source)
            .map(|rel| !excluded.contains(rel))
            .unwrap_or(true)
    });

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            Error::io(path, e.into())
        })?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
            summary.directories += 1;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            fs::copy(entry.path(), &target).map_err(|e| Error::io(&target, e))?;
            summary.files += 1;
        }
    }

    Ok(summary)
}

/// Provision `dest` from `source` keeping only what `patterns` allow
pub fn provision<S: AsRef<str>>(source: &Path, dest: &Path, patterns: &[S]) -> Result<CopySummary> {
    if !source.is_dir() {
        return Err(Error::io(
            source,
            std::io::Error::new(std::io::ErrorKind::NotFound, "provisioning source is not a directory"),
        ));
    }

    let allow = AllowList::compile(patterns)?;
    let excluded = allow.exclude_set(source)?;
    let summary = copy_excluding(source, dest, &excluded)?;

    info!(
        dest = %dest.display(),
        files = summary.files,
        directories = summary.directories,
        "Provisioned instance directory"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, rel).unwrap();
    }

    fn base_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(root, "configuration/standalone.xml");
        touch(root, "configuration/app.properties");
        touch(root, "configuration/nested/deep.properties");
        touch(root, "deployments/app.war");
        touch(root, "deployments/sub/lib.jar");
        touch(root, "data/timer.dat");
        touch(root, "log/server.log");
        touch(root, "README.txt");
        temp_dir
    }

    #[test]
    fn test_pattern_is_relative_not_basename() {
        let allow = AllowList::compile(&["configuration/*.properties"]).unwrap();

        assert!(allow.keeps(Path::new("configuration/app.properties"), false));
        assert!(!allow.keeps(Path::new("configuration/nested/deep.properties"), false));
        assert!(!allow.keeps(Path::new("app.properties"), false));
        assert!(!allow.keeps(Path::new("configuration/standalone.xml"), false));
    }

    #[test]
    fn test_directory_on_the_way_is_kept() {
        let allow = AllowList::compile(&["configuration/*.properties"]).unwrap();

        assert!(allow.keeps(Path::new("configuration"), true));
        assert!(!allow.keeps(Path::new("configuration"), false));
        assert!(!allow.keeps(Path::new("data"), true));
    }

    #[test]
    fn test_matched_directory_keeps_subtree() {
        let allow = AllowList::compile(&["deployments"]).unwrap();

        assert!(allow.keeps(Path::new("deployments/sub/lib.jar"), false));
    }

    #[test]
    fn test_character_class_and_question_mark() {
        let allow = AllowList::compile(&["log/server.lo?", "data/[a-m]*"]).unwrap();

        assert!(allow.keeps(Path::new("log/server.log"), false));
        assert!(allow.keeps(Path::new("data/cache"), false));
        assert!(!allow.keeps(Path::new("data/timer.dat"), false));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            AllowList::compile(&["configuration/[unclosed"]),
            Err(Error::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_excluded_entries_per_directory() {
        let tree = base_tree();
        let root = tree.path();
        let allow = AllowList::compile(&["configuration/*.properties", "deployments"]).unwrap();

        let top = allow.excluded_entries(root, root).unwrap();
        assert_eq!(
            top,
            vec![PathBuf::from("README.txt"), PathBuf::from("data"), PathBuf::from("log")]
        );

        let config = allow.excluded_entries(root, &root.join("configuration")).unwrap();
        assert_eq!(
            config,
            vec![
                PathBuf::from("configuration/nested"),
                PathBuf::from("configuration/standalone.xml")
            ]
        );
    }

    #[test]
    fn test_provision_copies_only_allowed() {
        let tree = base_tree();
        let dest_dir = TempDir::new().unwrap();
        let dest = dest_dir.path().join("web1");

        let summary = provision(tree.path(), &dest, &["configuration/*", "deployments"]).unwrap();

        assert!(dest.join("configuration/standalone.xml").is_file());
        assert!(dest.join("configuration/app.properties").is_file());
        assert!(dest.join("configuration/nested").is_dir());
        assert!(dest.join("deployments/sub/lib.jar").is_file());
        assert!(!dest.join("data").exists());
        assert!(!dest.join("log").exists());
        assert!(!dest.join("README.txt").exists());
        assert_eq!(summary.files, 5);
    }

    #[test]
    fn test_provision_missing_source() {
        let dest_dir = TempDir::new().unwrap();
        let err = provision(&dest_dir.path().join("absent"), &dest_dir.path().join("web1"), &["*"]).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
