//! Resource Stores
//!
//! Named lookup of audio data. A store resolves a name to a fresh byte
//! stream; lookups that fail return `None` so callers can fall through to
//! another store.

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::PlatformResult;
use crate::stream::ByteStream;

/// Extensions tried, in order, when a name has none of its own
pub const DEFAULT_AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "ogg", "flac"];

/// Source of named audio data
pub trait ResourceStore: Send + Sync {
    /// Open a fresh stream for `name`
    fn get_stream(&self, name: &str) -> Option<Box<dyn ByteStream>>;

    /// Names this store can resolve
    fn available_resources(&self) -> Vec<String>;
}

/// Store rooted at a directory on disk
pub struct DirectoryStore {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DirectoryStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            extensions: DEFAULT_AUDIO_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }

    /// Replace the list of extensions tried for bare names
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `name` to an existing file
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let direct = self.root.join(name);
        if direct.is_file() {
            return Some(direct);
        }

        self.extensions
            .iter()
            .map(|ext| self.root.join(format!("{name}.{ext}")))
            .find(|candidate| candidate.is_file())
    }

    fn open(&self, path: &Path) -> PlatformResult<Box<dyn ByteStream>> {
        let file = File::open(path)?;
        Ok(Box::new(BufReader::new(file)))
    }
}

impl ResourceStore for DirectoryStore {
    fn get_stream(&self, name: &str) -> Option<Box<dyn ByteStream>> {
        let path = self.resolve(name)?;
        match self.open(&path) {
            Ok(stream) => Some(stream),
            Err(e) => {
                log::warn!("Failed to open resource {}: {}", path.display(), e);
                None
            }
        }
    }

    fn available_resources(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }
}

/// In-memory store, mostly for tests and embedded assets
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<AHashMap<String, Arc<[u8]>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a resource
    pub fn insert(&self, name: impl Into<String>, data: impl Into<Arc<[u8]>>) {
        self.entries.write().insert(name.into(), data.into());
    }

    /// Remove a resource
    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    /// Number of stored resources
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ResourceStore for MemoryStore {
    fn get_stream(&self, name: &str) -> Option<Box<dyn ByteStream>> {
        let data = self.entries.read().get(name).cloned()?;
        Some(Box::new(Cursor::new(data)))
    }

    fn available_resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_directory_store_resolves_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hit.wav"), b"wave").unwrap();
        std::fs::write(dir.path().join("theme.ogg"), b"vorbis").unwrap();

        let store = DirectoryStore::new(dir.path());

        let mut data = Vec::new();
        store.get_stream("hit").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"wave");

        assert!(store.get_stream("theme.ogg").is_some());
        assert!(store.get_stream("theme").is_some());
        assert!(store.get_stream("missing").is_none());
        assert_eq!(store.available_resources(), vec!["hit.wav", "theme.ogg"]);
    }

    #[test]
    fn test_directory_store_custom_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.raw"), b"raw").unwrap();

        let store = DirectoryStore::new(dir.path());
        assert!(store.get_stream("clip").is_none());

        let store = store.with_extensions(["raw"]);
        assert!(store.get_stream("clip").is_some());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.insert("click", vec![1u8, 2, 3]);
        assert_eq!(store.len(), 1);

        let mut data = Vec::new();
        store.get_stream("click").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![1, 2, 3]);

        assert!(store.remove("click"));
        assert!(store.get_stream("click").is_none());
    }
}
