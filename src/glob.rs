//! Glob matching with a process-wide bounded memoization cache.
//!
//! Glob patterns (`*`, `?`) are compiled to anchored regexes. Evaluation
//! results are memoized per `(pattern, input)` pair under least-recently-
//! used eviction. The cache is shared across routing-table snapshots and
//! holds no references to table state.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Translates a glob pattern into an anchored regex source string.
fn glob_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' | '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' => {
                re.push('\\');
                re.push(c);
            }
            _ => re.push(c),
        }
    }
    re.push('$');
    re
}

/// Evaluates a glob pattern without the cache.
///
/// Patterns that fail to compile never match.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    match Regex::new(&glob_to_regex(pattern)) {
        Ok(re) => re.is_match(input),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid glob pattern");
            false
        }
    }
}

struct Entry {
    value: bool,
    tick: u64,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<(String, String), Entry>,
    // (key, tick) pairs in access order; stale ticks are skipped on evict.
    order: std::collections::VecDeque<((String, String), u64)>,
    // Compiled patterns, keyed by pattern text. Bounded by the number of
    // distinct patterns in the route config, which is small.
    patterns: HashMap<String, Option<Arc<Regex>>>,
    tick: u64,
}

/// Bounded LRU cache of glob evaluations.
///
/// Concurrent readers share a single short-held lock; entries are pure
/// functions of their key. Capacity zero disables memoization entirely.
pub struct GlobCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl GlobCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity,
        }
    }

    /// Evaluates `pattern` against `input`, memoizing the result.
    pub fn matches(&self, pattern: &str, input: &str) -> bool {
        if self.capacity == 0 {
            return glob_match(pattern, input);
        }

        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let key = (pattern.to_string(), input.to_string());
        if let Some(entry) = inner.map.get_mut(&key) {
            entry.tick = tick;
            let value = entry.value;
            inner.order.push_back((key, tick));
            return value;
        }

        let regex = inner
            .patterns
            .entry(pattern.to_string())
            .or_insert_with(|| match Regex::new(&glob_to_regex(pattern)) {
                Ok(re) => Some(Arc::new(re)),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "invalid glob pattern");
                    None
                }
            })
            .clone();

        let value = regex.map(|re| re.is_match(input)).unwrap_or(false);

        if inner.map.len() >= self.capacity {
            Self::evict_one(&mut inner);
        }
        inner.map.insert(key.clone(), Entry { value, tick });
        inner.order.push_back((key, tick));
        value
    }

    /// Removes the least-recently-used live entry. Queue entries whose
    /// tick no longer matches the map were superseded by a later access.
    fn evict_one(inner: &mut CacheInner) {
        while let Some((key, tick)) = inner.order.pop_front() {
            match inner.map.get(&key) {
                Some(entry) if entry.tick == tick => {
                    inner.map.remove(&key);
                    return;
                }
                _ => continue,
            }
        }
    }

    /// Number of memoized evaluations currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_basic() {
        assert!(glob_match("*.example.com", "foo.example.com"));
        assert!(glob_match("/api/*", "/api/users"));
        assert!(glob_match("/api/?", "/api/x"));
        assert!(!glob_match("/api/?", "/api/xy"));
        assert!(!glob_match("*.example.com", "example.org"));
    }

    #[test]
    fn test_glob_literal_dots_not_wildcards() {
        assert!(!glob_match("a.b", "axb"));
        assert!(glob_match("a.b", "a.b"));
    }

    #[test]
    fn test_cache_agrees_with_recomputation() {
        let cache = GlobCache::new(16);
        for (p, i) in [
            ("*.example.com", "a.example.com"),
            ("*.example.com", "example.com"),
            ("/v1/*", "/v1/users"),
            ("/v1/*", "/v2/users"),
        ] {
            assert_eq!(cache.matches(p, i), glob_match(p, i));
            // Second call hits the memo and must agree too.
            assert_eq!(cache.matches(p, i), glob_match(p, i));
        }
    }

    #[test]
    fn test_cache_bounded() {
        let cache = GlobCache::new(4);
        for i in 0..50 {
            cache.matches("*.example.com", &format!("host{}.example.com", i));
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_lru_keeps_hot_entry() {
        let cache = GlobCache::new(2);
        cache.matches("p", "hot");
        cache.matches("p", "cold");
        // Touch the hot entry so "cold" is the LRU victim.
        cache.matches("p", "hot");
        cache.matches("p", "new");
        let inner = cache.inner.lock();
        assert!(inner.map.contains_key(&("p".to_string(), "hot".to_string())));
        assert!(!inner.map.contains_key(&("p".to_string(), "cold".to_string())));
    }

    #[test]
    fn test_zero_capacity_recomputes() {
        let cache = GlobCache::new(0);
        assert!(cache.matches("*.a", "b.a"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_plain_literal_pattern() {
        let cache = GlobCache::new(4);
        assert!(cache.matches("a", "a"));
        assert!(!cache.matches("a", "b"));
    }
}
