//! Multi-root path sandbox.
//!
//! Every filesystem access in the engine starts here. A request names a
//! source (a key from the `[sources]` config table) and a path relative to it;
//! the resolver turns that pair into a canonical absolute path that is
//! guaranteed to live inside the source's base directory, or rejects it.
//!
//! Resolution happens in two passes:
//!
//! 1. **Logical normalization** ([`normalize_relative`]): backslashes become
//!    `/`, NUL bytes are dropped, empty and `.` segments disappear, and every
//!    `..` collapses against the segment before it (`a/../b` → `b`,
//!    `../../etc` → `etc`). Leading separators are stripped, so absolute-looking
//!    inputs are treated as relative to the source.
//! 2. **Physical check**: the normalized path is joined onto the canonical base
//!    and canonicalized by the OS. Symlinks are followed, and the result must
//!    still start with the canonical base. This is what catches a symlink inside
//!    a source that points somewhere else.
//!
//! Errors never contain absolute paths, only the source key and the
//! normalized relative path the caller already knows.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Unknown source '{0}'")]
    UnknownSource(String),
    #[error("A path was given without a source: {0}")]
    MissingSource(String),
    #[error("Path escapes source '{source_key}': {relative_path}")]
    OutsideRoot {
        source_key: String,
        relative_path: String,
    },
    #[error("Not found in source '{source_key}': {relative_path}")]
    NotFound {
        source_key: String,
        relative_path: String,
    },
    #[error("Not a file in source '{source_key}': {relative_path}")]
    NotAFile {
        source_key: String,
        relative_path: String,
    },
    #[error("Not a directory in source '{source_key}': {relative_path}")]
    NotADirectory {
        source_key: String,
        relative_path: String,
    },
}

impl PathError {
    /// True for rejections caused by the request itself (bad key, escape
    /// attempt) rather than by the current state of the filesystem.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PathError::UnknownSource(_) | PathError::MissingSource(_) | PathError::OutsideRoot { .. }
        )
    }
}

/// What a resolved path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// A path proven to be inside its source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub source_key: String,
    /// Normalized, `/`-separated, no leading or trailing separator.
    pub relative_path: String,
    /// Canonical absolute path; always a descendant of (or equal to) the
    /// canonical source base.
    pub absolute_path: PathBuf,
    pub kind: EntryKind,
}

impl ResolvedPath {
    /// True when this is the source's own base directory.
    pub fn is_root(&self) -> bool {
        self.relative_path.is_empty()
    }
}

/// Result of [`PathResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// The listing of all sources: no source key and no path. Not backed by
    /// any directory on disk.
    Sources,
    Path(ResolvedPath),
}

/// Normalize a caller-supplied relative path. Pure; never touches the disk.
pub fn normalize_relative(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .filter(|&c| c != '\0')
        .map(|c| if c == '\\' { '/' } else { c })
        .collect();

    let mut segments: Vec<&str> = Vec::new();
    for segment in cleaned.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

fn is_hidden(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Join a normalized relative path onto a base. Empty input yields the base.
fn join_relative(base: &Path, relative: &str) -> PathBuf {
    if relative.is_empty() {
        base.to_path_buf()
    } else {
        base.join(relative)
    }
}

/// Validates `(source, relative path)` pairs against the configured roots.
#[derive(Debug, Clone)]
pub struct PathResolver {
    /// Source key → canonical base directory.
    roots: BTreeMap<String, PathBuf>,
}

impl PathResolver {
    /// Build a resolver, canonicalizing every base directory up front.
    ///
    /// Fails if any base does not exist, since a root that cannot be
    /// canonicalized cannot be used for descendant checks.
    pub fn new<I, K, P>(roots: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: AsRef<Path>,
    {
        let roots = roots
            .into_iter()
            .map(|(key, base)| Ok((key.into(), base.as_ref().canonicalize()?)))
            .collect::<io::Result<BTreeMap<_, _>>>()?;
        Ok(Self { roots })
    }

    pub fn source_keys(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }

    /// Canonical base of a source, if configured.
    pub fn base(&self, source_key: &str) -> Option<&Path> {
        self.roots.get(source_key).map(PathBuf::as_path)
    }

    /// Resolve a directory (or the all-sources listing when both the key
    /// and the path are empty).
    pub fn resolve(&self, source_key: &str, relative_path: &str) -> Result<Resolved, PathError> {
        if source_key.is_empty() {
            let normalized = normalize_relative(relative_path);
            return if normalized.is_empty() {
                Ok(Resolved::Sources)
            } else {
                Err(PathError::MissingSource(normalized))
            };
        }
        self.resolve_dir(source_key, relative_path)
            .map(Resolved::Path)
    }

    /// Resolve a path that must be an existing directory.
    pub fn resolve_dir(
        &self,
        source_key: &str,
        relative_path: &str,
    ) -> Result<ResolvedPath, PathError> {
        let resolved = self.resolve_entry(source_key, relative_path)?;
        match resolved.kind {
            EntryKind::Directory => Ok(resolved),
            EntryKind::File => Err(PathError::NotADirectory {
                source_key: resolved.source_key,
                relative_path: resolved.relative_path,
            }),
        }
    }

    /// Resolve a path that must be an existing regular file.
    pub fn resolve_file(
        &self,
        source_key: &str,
        relative_path: &str,
    ) -> Result<ResolvedPath, PathError> {
        let resolved = self.resolve_entry(source_key, relative_path)?;
        match resolved.kind {
            EntryKind::File => Ok(resolved),
            EntryKind::Directory => Err(PathError::NotAFile {
                source_key: resolved.source_key,
                relative_path: resolved.relative_path,
            }),
        }
    }

    /// Resolve a path that must exist, whatever it is.
    pub fn resolve_entry(
        &self,
        source_key: &str,
        relative_path: &str,
    ) -> Result<ResolvedPath, PathError> {
        let base = self
            .roots
            .get(source_key)
            .ok_or_else(|| PathError::UnknownSource(source_key.to_string()))?;
        let normalized = normalize_relative(relative_path);

        let not_found = || PathError::NotFound {
            source_key: source_key.to_string(),
            relative_path: normalized.clone(),
        };

        // canonicalize fails for missing entries and for permission problems
        // alike; both surface as "not found" so nothing about the layout leaks
        let canonical = join_relative(base, &normalized)
            .canonicalize()
            .map_err(|_| not_found())?;

        if !canonical.starts_with(base) {
            return Err(PathError::OutsideRoot {
                source_key: source_key.to_string(),
                relative_path: normalized,
            });
        }

        let metadata = std::fs::metadata(&canonical).map_err(|_| not_found())?;
        let kind = if metadata.is_dir() {
            EntryKind::Directory
        } else if metadata.is_file() {
            EntryKind::File
        } else {
            return Err(not_found());
        };

        Ok(ResolvedPath {
            source_key: source_key.to_string(),
            relative_path: normalized,
            absolute_path: canonical,
            kind,
        })
    }

    /// Snapshot every regular, non-hidden file under a resolved directory,
    /// sorted by relative path.
    ///
    /// Symlinks are not followed and hidden entries (leading `.`) are pruned
    /// together with everything below them. Entries that vanish or become
    /// unreadable during the walk are skipped; a concurrent delete never fails
    /// the listing.
    pub fn list_files(&self, dir: &ResolvedPath) -> Vec<ResolvedPath> {
        if dir.kind == EntryKind::File {
            return vec![dir.clone()];
        }
        let mut files: Vec<ResolvedPath> = WalkDir::new(&dir.absolute_path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()))
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let relative_path = self.relative_of(&dir.source_key, entry.path())?;
                Some(ResolvedPath {
                    source_key: dir.source_key.clone(),
                    relative_path,
                    absolute_path: entry.into_path(),
                    kind: EntryKind::File,
                })
            })
            .collect();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        files
    }

    /// Express an absolute path found while walking a source (e.g. by
    /// `walkdir`) as a normalized relative path of that source.
    pub fn relative_of(&self, source_key: &str, absolute: &Path) -> Option<String> {
        let base = self.roots.get(source_key)?;
        let rel = absolute.strip_prefix(base).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn resolver_with_tree() -> (TempDir, PathResolver) {
        let tmp = TempDir::new().unwrap();
        let main = tmp.path().join("main");
        fs::create_dir_all(main.join("albumA/nested")).unwrap();
        fs::write(main.join("albumA/one.jpg"), b"x").unwrap();
        fs::write(main.join("top.jpg"), b"x").unwrap();
        fs::write(tmp.path().join("secret.txt"), b"outside").unwrap();
        let resolver = PathResolver::new([("main", &main)]).unwrap();
        (tmp, resolver)
    }

    // =========================================================================
    // Normalization
    // =========================================================================

    #[test]
    fn normalize_collapses_parent_segments() {
        assert_eq!(normalize_relative("a/../b"), "b");
        assert_eq!(normalize_relative("a/b/../../c"), "c");
        assert_eq!(normalize_relative("../../etc/passwd"), "etc/passwd");
        assert_eq!(normalize_relative(".."), "");
    }

    #[test]
    fn normalize_unifies_separators_and_strips_edges() {
        assert_eq!(normalize_relative("\\albums\\\\2024\\"), "albums/2024");
        assert_eq!(normalize_relative("//a///b//"), "a/b");
        assert_eq!(normalize_relative("./a/./b"), "a/b");
        assert_eq!(normalize_relative("/etc/passwd"), "etc/passwd");
    }

    #[test]
    fn normalize_drops_nul_bytes() {
        assert_eq!(normalize_relative("a\0b/c.jpg\0"), "ab/c.jpg");
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    #[test]
    fn resolves_file_inside_root() {
        let (_tmp, resolver) = resolver_with_tree();
        let resolved = resolver.resolve_file("main", "albumA/one.jpg").unwrap();
        assert_eq!(resolved.relative_path, "albumA/one.jpg");
        assert_eq!(resolved.kind, EntryKind::File);
        assert!(resolved.absolute_path.starts_with(resolver.base("main").unwrap()));
        assert!(!resolved.is_root());
    }

    #[test]
    fn traversal_is_collapsed_then_rejected_when_missing() {
        let (_tmp, resolver) = resolver_with_tree();
        let err = resolver.resolve_file("main", "../../etc/passwd").unwrap_err();
        assert_eq!(
            err,
            PathError::NotFound {
                source_key: "main".into(),
                relative_path: "etc/passwd".into()
            }
        );
    }

    #[test]
    fn traversal_to_sibling_of_root_never_escapes() {
        let (_tmp, resolver) = resolver_with_tree();
        // secret.txt sits next to the root, but ".." collapses away
        let err = resolver.resolve_file("main", "../secret.txt").unwrap_err();
        assert!(matches!(err, PathError::NotFound { .. }));
    }

    #[test]
    fn traversal_that_lands_inside_root_is_allowed() {
        let (_tmp, resolver) = resolver_with_tree();
        let resolved = resolver
            .resolve_file("main", "albumA/nested/../../top.jpg")
            .unwrap();
        assert_eq!(resolved.relative_path, "top.jpg");
    }

    #[test]
    fn unknown_source_is_rejected() {
        let (_tmp, resolver) = resolver_with_tree();
        let err = resolver.resolve_file("other", "top.jpg").unwrap_err();
        assert_eq!(err, PathError::UnknownSource("other".into()));
        assert!(err.is_validation());
    }

    #[test]
    fn file_and_directory_entry_points_check_kind() {
        let (_tmp, resolver) = resolver_with_tree();
        assert!(matches!(
            resolver.resolve_file("main", "albumA"),
            Err(PathError::NotAFile { .. })
        ));
        assert!(matches!(
            resolver.resolve_dir("main", "top.jpg"),
            Err(PathError::NotADirectory { .. })
        ));
        let root = resolver.resolve_dir("main", "").unwrap();
        assert!(root.is_root());
    }

    #[test]
    fn empty_key_and_path_is_the_source_listing() {
        let (_tmp, resolver) = resolver_with_tree();
        assert_eq!(resolver.resolve("", "").unwrap(), Resolved::Sources);
        assert_eq!(resolver.resolve("", "/./").unwrap(), Resolved::Sources);
        assert!(matches!(
            resolver.resolve("", "albumA"),
            Err(PathError::MissingSource(_))
        ));
    }

    #[test]
    fn errors_do_not_leak_absolute_paths() {
        let (tmp, resolver) = resolver_with_tree();
        let err = resolver.resolve_file("main", "missing.jpg").unwrap_err();
        let message = err.to_string();
        assert!(!message.contains(&*tmp.path().to_string_lossy()));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let (tmp, resolver) = resolver_with_tree();
        let base = resolver.base("main").unwrap().to_path_buf();
        std::os::unix::fs::symlink(tmp.path().join("secret.txt"), base.join("link.txt")).unwrap();
        let err = resolver.resolve_file("main", "link.txt").unwrap_err();
        assert!(matches!(err, PathError::OutsideRoot { .. }));
    }

    // =========================================================================
    // Listing
    // =========================================================================

    #[test]
    fn list_files_is_recursive_sorted_and_skips_hidden() {
        let (_tmp, resolver) = resolver_with_tree();
        let base = resolver.base("main").unwrap().to_path_buf();
        fs::write(base.join("albumA/nested/deep.jpg"), b"x").unwrap();
        fs::write(base.join("albumA/.DS_Store"), b"x").unwrap();
        fs::create_dir_all(base.join("albumA/.thumbs")).unwrap();
        fs::write(base.join("albumA/.thumbs/hidden.jpg"), b"x").unwrap();

        let dir = resolver.resolve_dir("main", "albumA").unwrap();
        let names: Vec<String> = resolver
            .list_files(&dir)
            .into_iter()
            .map(|f| f.relative_path)
            .collect();
        assert_eq!(names, vec!["albumA/nested/deep.jpg", "albumA/one.jpg"]);
    }

    #[test]
    fn list_files_of_a_file_is_itself() {
        let (_tmp, resolver) = resolver_with_tree();
        let file = resolver.resolve_file("main", "top.jpg").unwrap();
        assert_eq!(resolver.list_files(&file), vec![file]);
    }

    #[test]
    fn list_files_of_root_covers_whole_source() {
        let (_tmp, resolver) = resolver_with_tree();
        let root = resolver.resolve_dir("main", "").unwrap();
        assert_eq!(resolver.list_files(&root).len(), 2);
    }

    #[test]
    fn relative_of_walked_path() {
        let (_tmp, resolver) = resolver_with_tree();
        let abs = resolver.base("main").unwrap().join("albumA").join("one.jpg");
        assert_eq!(
            resolver.relative_of("main", &abs).as_deref(),
            Some("albumA/one.jpg")
        );
        assert_eq!(resolver.relative_of("nope", &abs), None);
    }
}
