//! Task-facing storage.
//!
//! Task logic reads and writes resources through [`Storage`] (blocking
//! tasks) or [`AsyncStorage`] (cooperative tasks). Locations are URI-like
//! strings: absolute paths and `file://` URIs are used as-is, anything else
//! is resolved against the work path. Only the local filesystem backend
//! ships with the engine.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Underlying I/O failure.
    #[error("I/O error on '{location}': {source}")]
    Io {
        location: String,
        #[source]
        source: io::Error,
    },

    /// A blocking storage job could not be joined.
    #[error("Storage job failed: {0}")]
    Join(String),
}

impl StorageError {
    fn io(location: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound(location.to_string())
        } else {
            Self::Io {
                location: location.to_string(),
                source,
            }
        }
    }
}

/// Blocking storage operations.
pub trait Storage: Send + Sync {
    /// Whether the resource exists.
    fn exists(&self, location: &str) -> Result<bool, StorageError>;

    /// Size of the resource in bytes.
    fn size(&self, location: &str) -> Result<u64, StorageError>;

    /// Last modification time of the resource.
    fn modified(&self, location: &str) -> Result<DateTime<Utc>, StorageError>;

    /// Read the whole resource.
    fn read(&self, location: &str) -> Result<Vec<u8>, StorageError>;

    /// Write the whole resource, creating parent directories.
    fn write(&self, location: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Copy one resource to another, returning the bytes copied.
    fn copy(&self, source: &str, destination: &str) -> Result<u64, StorageError>;

    /// Locations under `prefix` whose relative path matches `pattern`.
    fn list(&self, prefix: &str, pattern: &str) -> Result<Vec<String>, StorageError>;
}

/// Cooperative storage operations, for tasks running on the worker's event loop.
#[async_trait]
pub trait AsyncStorage: Send + Sync {
    /// Whether the resource exists.
    async fn exists(&self, location: &str) -> Result<bool, StorageError>;

    /// Size of the resource in bytes.
    async fn size(&self, location: &str) -> Result<u64, StorageError>;

    /// Last modification time of the resource.
    async fn modified(&self, location: &str) -> Result<DateTime<Utc>, StorageError>;

    /// Read the whole resource.
    async fn read(&self, location: &str) -> Result<Vec<u8>, StorageError>;

    /// Write the whole resource, creating parent directories.
    async fn write(&self, location: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Copy one resource to another, returning the bytes copied.
    async fn copy(&self, source: &str, destination: &str) -> Result<u64, StorageError>;

    /// Locations under `prefix` whose relative path matches `pattern`.
    async fn list(&self, prefix: &str, pattern: &str) -> Result<Vec<String>, StorageError>;
}

/// Local filesystem storage rooted at the work path.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a storage rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory relative locations resolve against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for a location.
    pub fn resolve(&self, location: &str) -> PathBuf {
        let location = location.strip_prefix("file://").unwrap_or(location);
        let path = Path::new(location);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn ensure_parent(&self, path: &Path, location: &str) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(location, e))?;
        }
        Ok(())
    }
}

impl Storage for LocalStorage {
    fn exists(&self, location: &str) -> Result<bool, StorageError> {
        Ok(self.resolve(location).exists())
    }

    fn size(&self, location: &str) -> Result<u64, StorageError> {
        let meta =
            std::fs::metadata(self.resolve(location)).map_err(|e| StorageError::io(location, e))?;
        Ok(meta.len())
    }

    fn modified(&self, location: &str) -> Result<DateTime<Utc>, StorageError> {
        let meta =
            std::fs::metadata(self.resolve(location)).map_err(|e| StorageError::io(location, e))?;
        let modified = meta.modified().map_err(|e| StorageError::io(location, e))?;
        Ok(modified.into())
    }

    fn read(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        std::fs::read(self.resolve(location)).map_err(|e| StorageError::io(location, e))
    }

    fn write(&self, location: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(location);
        self.ensure_parent(&path, location)?;
        std::fs::write(&path, data).map_err(|e| StorageError::io(location, e))
    }

    fn copy(&self, source: &str, destination: &str) -> Result<u64, StorageError> {
        let dst = self.resolve(destination);
        self.ensure_parent(&dst, destination)?;
        debug!(source = %source, destination = %dst.display(), "Copying file");
        std::fs::copy(self.resolve(source), &dst).map_err(|e| StorageError::io(source, e))
    }

    fn list(&self, prefix: &str, pattern: &str) -> Result<Vec<String>, StorageError> {
        let base = self.resolve(prefix);
        if !base.is_dir() {
            return Err(StorageError::NotFound(prefix.to_string()));
        }

        let mut matches = Vec::new();
        for entry in WalkDir::new(&base).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&base) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if glob_match(pattern, &relative) {
                trace!(path = %relative, pattern = %pattern, "Glob match");
                matches.push(join_location(prefix, &relative));
            }
        }
        Ok(matches)
    }
}

#[async_trait]
impl AsyncStorage for LocalStorage {
    async fn exists(&self, location: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::try_exists(self.resolve(location))
            .await
            .unwrap_or(false))
    }

    async fn size(&self, location: &str) -> Result<u64, StorageError> {
        let meta = tokio::fs::metadata(self.resolve(location))
            .await
            .map_err(|e| StorageError::io(location, e))?;
        Ok(meta.len())
    }

    async fn modified(&self, location: &str) -> Result<DateTime<Utc>, StorageError> {
        let meta = tokio::fs::metadata(self.resolve(location))
            .await
            .map_err(|e| StorageError::io(location, e))?;
        let modified = meta.modified().map_err(|e| StorageError::io(location, e))?;
        Ok(modified.into())
    }

    async fn read(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        tokio::fs::read(self.resolve(location))
            .await
            .map_err(|e| StorageError::io(location, e))
    }

    async fn write(&self, location: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(location);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(location, e))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| StorageError::io(location, e))
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<u64, StorageError> {
        let dst = self.resolve(destination);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(destination, e))?;
        }
        debug!(source = %source, destination = %dst.display(), "Copying file");
        tokio::fs::copy(self.resolve(source), &dst)
            .await
            .map_err(|e| StorageError::io(source, e))
    }

    async fn list(&self, prefix: &str, pattern: &str) -> Result<Vec<String>, StorageError> {
        let storage = self.clone();
        let prefix = prefix.to_string();
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || Storage::list(&storage, &prefix, &pattern))
            .await
            .map_err(|e| StorageError::Join(e.to_string()))?
    }
}

/// Split a glob expression into its literal prefix and the pattern after it.
///
/// The prefix ends right before the first unescaped `*`, `[`, `{` or `?`;
/// leading slashes are trimmed from the pattern. An expression with no
/// metacharacter is all prefix.
pub fn split_glob(expr: &str) -> (&str, &str) {
    let bytes = expr.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if matches!(b, b'*' | b'[' | b'{' | b'?') && (i == 0 || bytes[i - 1] != b'\\') {
            return (&expr[..i], expr[i..].trim_start_matches('/'));
        }
    }
    (expr, "")
}

/// Match a `/`-separated relative path against a glob pattern.
///
/// `**` matches any number of whole segments, `*` any run of characters
/// inside a segment, `?` a single character, `[abc]`, `[a-z]` and `[!a]`
/// one character from (or outside) a class, and `{json,csv}` any of its
/// alternatives. A backslash makes the next character literal.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let path: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    expand_braces(pattern).iter().any(|pattern| {
        let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        match_segments(&pattern, &path)
    })
}

/// Expand every `{a,b}` group into the patterns it stands for. An
/// unbalanced `{` is kept literally.
fn expand_braces(pattern: &str) -> Vec<String> {
    let bytes = pattern.as_bytes();
    let mut depth = 0usize;
    let mut open = 0usize;
    let mut commas = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'{' => {
                if depth == 0 {
                    open = i;
                    commas.clear();
                }
                depth += 1;
            }
            b',' if depth == 1 => commas.push(i),
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let (head, tail) = (&pattern[..open], &pattern[i + 1..]);
                    let mut bounds = vec![open];
                    bounds.extend(&commas);
                    bounds.push(i);
                    return bounds
                        .windows(2)
                        .flat_map(|w| {
                            expand_braces(&format!("{head}{}{tail}", &pattern[w[0] + 1..w[1]]))
                        })
                        .collect();
                }
            }
            _ => {}
        }
        i += 1;
    }
    vec![pattern.to_string()]
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((segment, rest)) => match path.split_first() {
            Some((name, remaining)) => {
                let seg: Vec<char> = segment.chars().collect();
                let name: Vec<char> = name.chars().collect();
                match_segment(&seg, &name) && match_segments(rest, remaining)
            }
            None => false,
        },
    }
}

fn match_segment(pattern: &[char], name: &[char]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some(('*', rest)) => (0..=name.len()).any(|skip| match_segment(rest, &name[skip..])),
        Some(('?', rest)) => !name.is_empty() && match_segment(rest, &name[1..]),
        Some(('[', rest)) => match (name.split_first(), CharClass::parse(rest)) {
            (None, _) => false,
            (Some((c, name_rest)), Some((class, after))) => {
                class.matches(*c) && match_segment(after, name_rest)
            }
            // No closing bracket: a literal '['.
            (Some((c, name_rest)), None) => *c == '[' && match_segment(rest, name_rest),
        },
        Some(('\\', rest)) if !rest.is_empty() => {
            name.first() == Some(&rest[0]) && match_segment(&rest[1..], &name[1..])
        }
        Some((c, rest)) => name.first() == Some(c) && match_segment(rest, &name[1..]),
    }
}

/// A bracket expression such as `[a-z_]` or `[!0-9]`.
struct CharClass {
    negated: bool,
    ranges: Vec<(char, char)>,
}

impl CharClass {
    /// Parse the body after `[`, returning the class and the pattern after `]`.
    fn parse(pattern: &[char]) -> Option<(Self, &[char])> {
        let negated = matches!(pattern.first(), Some('!' | '^'));
        let start = usize::from(negated);
        let mut ranges = Vec::new();
        let mut i = start;
        while i < pattern.len() {
            let c = pattern[i];
            if c == ']' && i > start {
                return Some((Self { negated, ranges }, &pattern[i + 1..]));
            }
            if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
                ranges.push((c, pattern[i + 2]));
                i += 3;
            } else {
                ranges.push((c, c));
                i += 1;
            }
        }
        None
    }

    fn matches(&self, c: char) -> bool {
        self.ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi) != self.negated
    }
}

fn join_location(prefix: &str, relative: &str) -> String {
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_glob() {
        assert_eq!(
            split_glob("input/items/**/*.json"),
            ("input/items/", "**/*.json")
        );
        assert_eq!(split_glob("a/b/c.txt"), ("a/b/c.txt", ""));
        assert_eq!(split_glob("a/\\*b/*.txt"), ("a/\\*b/", "*.txt"));
        assert_eq!(split_glob("*.csv"), ("", "*.csv"));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.json", "chair.json"));
        assert!(!glob_match("*.json", "furniture/chair.json"));
        assert!(glob_match("**/*.json", "furniture/chair.json"));
        assert!(glob_match("**/*.json", "chair.json"));
        assert!(glob_match("f?rniture/*", "furniture/table.json"));
        assert!(!glob_match("**/*.json", "furniture/chair.parquet"));
    }

    #[test]
    fn test_glob_match_braces() {
        assert!(glob_match("*.{json,csv}", "a.json"));
        assert!(glob_match("*.{json,csv}", "a.csv"));
        assert!(!glob_match("*.{json,csv}", "a.txt"));
        assert!(glob_match("{in,out}/**/*.txt", "out/x/y.txt"));
        assert!(glob_match("{a,b/c}.txt", "b/c.txt"));
        assert!(glob_match("{x,{y,z}}.log", "z.log"));
        assert!(glob_match("odd{.txt", "odd{.txt"));
    }

    #[test]
    fn test_glob_match_classes() {
        assert!(glob_match("[ab].txt", "a.txt"));
        assert!(!glob_match("[ab].txt", "c.txt"));
        assert!(glob_match("[!ab].txt", "c.txt"));
        assert!(!glob_match("[!ab].txt", "a.txt"));
        assert!(glob_match("file[0-9].log", "file7.log"));
        assert!(!glob_match("file[0-9].log", "filex.log"));
        assert!(glob_match("[]].txt", "].txt"));
        assert!(glob_match("open[.txt", "open[.txt"));
        assert!(glob_match("star\\*.txt", "star*.txt"));
        assert!(!glob_match("star\\*.txt", "stars.txt"));
    }

    #[test]
    fn test_resolve() {
        let storage = LocalStorage::new("/work");
        assert_eq!(storage.resolve("a/b.txt"), PathBuf::from("/work/a/b.txt"));
        assert_eq!(storage.resolve("/abs/b.txt"), PathBuf::from("/abs/b.txt"));
        assert_eq!(storage.resolve("file:///abs/c"), PathBuf::from("/abs/c"));
    }

    #[test]
    fn test_blocking_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        Storage::write(&storage, "in/items/furniture/chair.json", b"{}").unwrap();
        Storage::write(&storage, "in/items/table.json", b"[1]").unwrap();
        Storage::write(&storage, "in/items/notes.txt", b"x").unwrap();

        assert!(Storage::exists(&storage, "in/items/table.json").unwrap());
        assert_eq!(Storage::size(&storage, "in/items/table.json").unwrap(), 3);

        let found = Storage::list(&storage, "in/items", "**/*.json").unwrap();
        assert_eq!(
            found,
            vec![
                "in/items/furniture/chair.json".to_string(),
                "in/items/table.json".to_string()
            ]
        );

        let copied = Storage::copy(&storage, "in/items/table.json", "out/t.json").unwrap();
        assert_eq!(copied, 3);
        assert_eq!(Storage::read(&storage, "out/t.json").unwrap(), b"[1]");
    }

    #[test]
    fn test_list_with_alternatives() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        for name in ["in/a.json", "in/b.csv", "in/c.txt"] {
            Storage::write(&storage, name, b"x").unwrap();
        }

        let (prefix, pattern) = split_glob("in/*.{json,csv}");
        let found = Storage::list(&storage, prefix, pattern).unwrap();
        assert_eq!(found, vec!["in/a.json".to_string(), "in/b.csv".to_string()]);
    }

    #[tokio::test]
    async fn test_modified() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let before = Utc::now() - chrono::Duration::seconds(5);
        AsyncStorage::write(&storage, "a.txt", b"x").await.unwrap();
        assert!(AsyncStorage::modified(&storage, "a.txt").await.unwrap() >= before);
        assert!(matches!(
            Storage::modified(&storage, "nope.txt"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let err = Storage::size(&storage, "nope").unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_async_copy() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        AsyncStorage::write(&storage, "a.txt", b"hello").await.unwrap();
        AsyncStorage::copy(&storage, "a.txt", "nested/b.txt")
            .await
            .unwrap();
        assert_eq!(AsyncStorage::size(&storage, "nested/b.txt").await.unwrap(), 5);
        assert!(!AsyncStorage::exists(&storage, "c.txt").await.unwrap());
    }
}
