//! File Cache
//!
//! Cache of intermediate files (preprocessed translation units). Entries
//! are pinned while in use; a temporary entry is removed from disk once
//! the last pin is released, unless it has been promoted to persistent
//! (the modules path keeps preprocessed output around for the BMI
//! side-build).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct Entry {
    pins: usize,
    temporary: bool,
}

#[derive(Debug, Default)]
pub struct FileCache {
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl FileCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enter (or re-pin) a cache entry.
    pub fn pin(self: &Arc<Self>, path: impl Into<PathBuf>, temporary: bool) -> FilePin {
        let path = path.into();
        let mut es = self.entries.lock().unwrap();
        let e = es.entry(path.clone()).or_insert(Entry {
            pins: 0,
            temporary,
        });
        e.pins += 1;
        FilePin {
            cache: self.clone(),
            path,
        }
    }

    /// Keep the file when the last pin drops.
    pub fn promote(&self, path: &Path) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(path) {
            e.temporary = false;
        }
    }

    pub fn is_temporary(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(path)
            .map(|e| e.temporary)
            .unwrap_or(false)
    }

    fn unpin(&self, path: &Path) {
        let mut es = self.entries.lock().unwrap();
        if let Some(e) = es.get_mut(path) {
            e.pins -= 1;
            if e.pins == 0 {
                let temporary = e.temporary;
                es.remove(path);
                if temporary {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
    }
}

/// A pinned cache entry; unpins on drop.
#[derive(Debug)]
pub struct FilePin {
    cache: Arc<FileCache>,
    path: PathBuf,
}

impl FilePin {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Promote this entry to persistent.
    pub fn promote(&self) {
        self.cache.promote(&self.path);
    }
}

impl Drop for FilePin {
    fn drop(&mut self) {
        self.cache.unpin(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_removed_on_last_unpin() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("main.i");
        std::fs::write(&p, "int x;").unwrap();

        let cache = FileCache::new();
        let pin1 = cache.pin(&p, true);
        let pin2 = cache.pin(&p, true);

        drop(pin1);
        assert!(p.exists());
        drop(pin2);
        assert!(!p.exists());
    }

    #[test]
    fn test_promoted_entry_survives() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("foo.ii");
        std::fs::write(&p, "module foo;").unwrap();

        let cache = FileCache::new();
        let pin = cache.pin(&p, true);
        pin.promote();
        drop(pin);
        assert!(p.exists());
    }
}
