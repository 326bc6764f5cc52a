use std::collections::HashMap;
use std::sync::Mutex;

use tracing::info;

/// Reference stored in the cache for one excerpt digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExcerptRef {
    /// The excerpt was uploaded; records can point at this URL.
    Uploaded(String),
    /// The upload failed; the excerpt stays inline in its record and the
    /// upload is not re-attempted for the same content.
    Inline(String),
}

/// Content-addressed cache of log-excerpt upload results, shared by every
/// worker and keyed by the SHA-256 hex digest of the excerpt text.
///
/// The eviction policy is deliberately blunt: once the entry count exceeds
/// the limit, the next `maintain` call clears the whole map. Re-uploading is
/// cheap enough that a best-effort cache beats tracking recency. No I/O is
/// ever performed under the lock; uploads happen outside and the result is
/// recorded after the fact, tolerating a narrow duplicate-upload window.
pub struct LogCache {
    max_entries: usize,
    entries: Mutex<HashMap<String, ExcerptRef>>,
}

impl LogCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, digest: &str) -> Option<ExcerptRef> {
        self.entries
            .lock()
            .expect("poisoned LogCache mutex")
            .get(digest)
            .cloned()
    }

    pub fn put(&self, digest: String, reference: ExcerptRef) {
        self.entries
            .lock()
            .expect("poisoned LogCache mutex")
            .insert(digest, reference);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("poisoned LogCache mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the cache wholesale if it has outgrown its limit.
    pub fn maintain(&self) {
        let mut entries = self.entries.lock().expect("poisoned LogCache mutex");
        if entries.len() > self.max_entries {
            info!(
                "log excerpt cache exceeded {} entries, clearing {}",
                self.max_entries,
                entries.len()
            );
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_roundtrip() {
        let cache = LogCache::new(10);
        assert_eq!(cache.get("abc"), None);

        cache.put("abc".to_string(), ExcerptRef::Uploaded("url".to_string()));
        assert_eq!(
            cache.get("abc"),
            Some(ExcerptRef::Uploaded("url".to_string()))
        );

        cache.put("abc".to_string(), ExcerptRef::Inline("text".to_string()));
        assert_eq!(cache.get("abc"), Some(ExcerptRef::Inline("text".to_string())));
    }

    #[test]
    fn maintain_clears_once_over_limit() {
        let cache = LogCache::new(2);
        for i in 0..3 {
            cache.put(format!("{i}"), ExcerptRef::Uploaded(format!("url{i}")));
        }
        assert_eq!(cache.len(), 3);

        cache.maintain();
        assert!(cache.is_empty());
    }

    #[test]
    fn maintain_keeps_cache_at_or_under_limit() {
        let cache = LogCache::new(2);
        cache.put("a".to_string(), ExcerptRef::Uploaded("u".to_string()));
        cache.put("b".to_string(), ExcerptRef::Uploaded("v".to_string()));

        cache.maintain();
        assert_eq!(cache.len(), 2);
    }
}
