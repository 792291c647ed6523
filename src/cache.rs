use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
};

pub const DEFAULT_LOCATION_CACHE_SIZE: usize = 100;

/// Bounded map from annex key to the relative path its content lives at.
///
/// Eviction is strictly insertion-order (oldest inserted goes first once
/// capacity is exceeded); lookups do not refresh an entry's position. A
/// cached path that no longer exists on disk is evicted on read and treated
/// as a miss, so stale entries heal themselves.
#[derive(Debug)]
pub struct LocationCache {
    capacity: usize,
    entries: HashMap<String, PathBuf>,
    insertion_order: VecDeque<String>,
}

impl LocationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a resolved location. Empty paths are never stored.
    pub fn put(&mut self, key: &str, path: PathBuf) {
        if path.as_os_str().is_empty() {
            return;
        }
        if self.entries.insert(key.to_string(), path).is_none() {
            self.insertion_order.push_back(key.to_string());
            while self.entries.len() > self.capacity {
                if let Some(oldest) = self.insertion_order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    /// Look up a key, verifying the cached path still exists under `root`.
    /// A vanished path is evicted and reported as a miss.
    pub fn get(&mut self, key: &str, root: &Path) -> Option<PathBuf> {
        let path = self.entries.get(key)?.clone();
        if root.join(&path).exists() {
            Some(path)
        } else {
            log::debug!("evicting stale location for {}: {}", key, path.display());
            self.remove(key);
            None
        }
    }

    pub fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.insertion_order.retain(|k| k != key);
        }
    }
}

impl Default for LocationCache {
    fn default() -> Self {
        Self::new(DEFAULT_LOCATION_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        fs::write(root.join(rel), b"x").unwrap();
    }

    #[test]
    fn test_hit_when_path_exists() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "content");

        let mut cache = LocationCache::new(10);
        cache.put("KEY1", PathBuf::from("content"));
        assert_eq!(
            cache.get("KEY1", temp_dir.path()),
            Some(PathBuf::from("content"))
        );
    }

    #[test]
    fn test_stale_path_self_heals() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "content");

        let mut cache = LocationCache::new(10);
        cache.put("KEY1", PathBuf::from("content"));
        fs::remove_file(temp_dir.path().join("content")).unwrap();

        assert_eq!(cache.get("KEY1", temp_dir.path()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insertion_order_eviction() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["a", "b", "c", "d"] {
            touch(temp_dir.path(), name);
        }

        let mut cache = LocationCache::new(3);
        cache.put("KA", PathBuf::from("a"));
        cache.put("KB", PathBuf::from("b"));
        cache.put("KC", PathBuf::from("c"));

        // Reading KA must not protect it from eviction
        assert!(cache.get("KA", temp_dir.path()).is_some());
        cache.put("KD", PathBuf::from("d"));

        assert_eq!(cache.get("KA", temp_dir.path()), None);
        assert!(cache.get("KB", temp_dir.path()).is_some());
        assert!(cache.get("KD", temp_dir.path()).is_some());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_empty_path_never_stored() {
        let mut cache = LocationCache::new(3);
        cache.put("KEY1", PathBuf::new());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reinsert_does_not_duplicate_order_entry() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "a");
        touch(temp_dir.path(), "b");

        let mut cache = LocationCache::new(2);
        cache.put("KA", PathBuf::from("a"));
        cache.put("KA", PathBuf::from("b"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("KA", temp_dir.path()), Some(PathBuf::from("b")));
    }
}
