//! Lock-protected string tables for the whitelist and per-domain limits.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, trace, warn};

use crate::error::{Result, SendgateError};

/// A mutex-protected string-to-string map.
///
/// Tables are loaded whole and swapped into the limiter as a unit; the
/// mutating operations exist for building tables programmatically.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl KeyValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().insert(key.into(), value.into());
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    /// Whether `key` is present, regardless of its value.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Load a `key value` table from a file.
    ///
    /// Lines starting with `#` are comments. Lines that do not split into
    /// exactly two whitespace-separated fields are skipped with a warning.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| SendgateError::MapFile {
            path: path.to_path_buf(),
            source,
        })?;

        let store = Self::parse(&contents, &path.display().to_string());
        debug!(path = %path.display(), entries = store.len(), "Loaded map file");
        Ok(store)
    }

    /// Parse table contents; `origin` only labels log lines.
    pub fn parse(contents: &str, origin: &str) -> Self {
        let mut entries = HashMap::new();

        for (index, line) in contents.lines().enumerate() {
            let line_no = index + 1;
            if line.starts_with('#') {
                trace!(origin, line = line_no, "Ignoring comment");
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [key, value] => {
                    entries.insert(key.to_string(), value.to_string());
                }
                _ => {
                    warn!(origin, line = line_no, content = %line, "Skipping malformed map entry");
                }
            }
        }

        Self {
            entries: Mutex::new(entries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove_clear() {
        let store = KeyValueStore::new();
        assert!(store.is_empty());

        store.set("example.com", "1");
        store.set("other.org", "2");
        assert_eq!(store.get("example.com"), Some("1".to_string()));
        assert!(store.contains("other.org"));
        assert_eq!(store.get("missing"), None);

        store.set("example.com", "5");
        assert_eq!(store.get("example.com"), Some("5".to_string()));

        store.remove("example.com");
        assert!(!store.contains("example.com"));
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_parse_skips_comments_and_malformed_lines() {
        let contents = "\
# whitelisted senders
postmaster@example.com ok
example.org ok
too many fields here
lonely

trusted.net 1
";
        let store = KeyValueStore::parse(contents, "test");
        assert_eq!(store.len(), 3);
        assert!(store.contains("postmaster@example.com"));
        assert!(store.contains("example.org"));
        assert!(store.contains("trusted.net"));
        assert!(!store.contains("lonely"));
        assert!(!store.contains("#"));
    }

    #[test]
    fn test_parse_tabs_and_last_duplicate_wins() {
        let store = KeyValueStore::parse("big.com\t500\nbig.com   700\n", "test");
        assert_eq!(store.get("big.com"), Some("700".to_string()));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("sendgate-missing-map-file");
        let result = KeyValueStore::load(&path);
        assert!(matches!(result, Err(SendgateError::MapFile { .. })));
    }

    #[test]
    fn test_concurrent_access() {
        let store = std::sync::Arc::new(KeyValueStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        store.set(format!("k{}-{}", i, j), "v");
                        let _ = store.get("k0-0");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 800);
    }
}
