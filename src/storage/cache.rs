//! 目录列表缓存

use super::{parent_path, Obj};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// 默认缓存有效期
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct CacheEntry {
    objs: Arc<Vec<Obj>>,
    expires_at: Instant,
}

/// 带 TTL 的目录列表缓存，任何修改都要使路径本身及其父目录失效
#[derive(Debug)]
pub struct ObjCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ObjCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, path: &str) -> Option<Arc<Vec<Obj>>> {
        let hit = self
            .entries
            .get(path)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| Arc::clone(&e.objs));
        if hit.is_none() {
            self.entries.remove_if(path, |_, e| e.expires_at <= Instant::now());
        }
        hit
    }

    pub fn put(&self, path: &str, objs: Vec<Obj>) -> Arc<Vec<Obj>> {
        let objs = Arc::new(objs);
        if !self.ttl.is_zero() {
            self.entries.insert(
                path.to_string(),
                CacheEntry {
                    objs: Arc::clone(&objs),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
        objs
    }

    /// 使路径本身（作为目录）和其父目录的列表失效
    pub fn invalidate(&self, path: &str) {
        let parent = parent_path(path);
        self.entries.remove(path);
        self.entries.remove(&parent);
        debug!("缓存失效: {} 与 {}", path, parent);
    }

    /// 使路径及其所有子孙失效
    pub fn invalidate_tree(&self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.entries.retain(|k, _| k != path && !k.starts_with(&prefix));
        self.entries.remove(&parent_path(path));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ObjCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_invalidate() {
        let cache = ObjCache::default();
        cache.put("/a", vec![Obj::dir("/a/b")]);
        cache.put("/", vec![Obj::dir("/a")]);
        assert_eq!(cache.get("/a").map(|v| v.len()), Some(1));

        // 修改 /a/b 使 /a/b 与 /a 失效，根目录不受影响
        cache.invalidate("/a/b");
        assert!(cache.get("/a").is_none());
        assert!(cache.get("/").is_some());
    }

    #[test]
    fn test_expiry() {
        let cache = ObjCache::new(Duration::from_millis(10));
        cache.put("/a", Vec::new());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("/a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_tree() {
        let cache = ObjCache::default();
        for p in ["/", "/a", "/a/b", "/a/b/c", "/ab"] {
            cache.put(p, Vec::new());
        }
        cache.invalidate_tree("/a");
        assert!(cache.get("/").is_none());
        assert!(cache.get("/a/b/c").is_none());
        assert!(cache.get("/ab").is_some());
    }
}
