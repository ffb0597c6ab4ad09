//! Deduplication of `$feature_flag_called` events.
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Remembers which `(distinct_id, flag, response)` combinations were already reported.
///
/// Entries expire after `sliding_expiration` without use. When `size_limit` is reached, expired
/// entries are removed first and then the `compaction` fraction of least recently used ones.
#[derive(Debug)]
pub(crate) struct FeatureFlagSentCache {
    size_limit: usize,
    sliding_expiration: Duration,
    compaction: f64,
    entries: Mutex<HashMap<String, Instant>>,
}

impl FeatureFlagSentCache {
    pub fn new(size_limit: usize, sliding_expiration: Duration, compaction: f64) -> Self {
        FeatureFlagSentCache {
            size_limit: size_limit.max(1),
            sliding_expiration,
            compaction,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a report. Returns `true` if it was not reported recently and should be sent.
    pub fn should_report(&self, distinct_id: &str, flag_key: &str, response: &str) -> bool {
        self.should_report_at(distinct_id, flag_key, response, Instant::now())
    }

    fn should_report_at(
        &self,
        distinct_id: &str,
        flag_key: &str,
        response: &str,
        now: Instant,
    ) -> bool {
        let key = format!("{distinct_id}\u{0}{flag_key}\u{0}{response}");
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(last_seen) = entries.get_mut(&key) {
            if now.saturating_duration_since(*last_seen) < self.sliding_expiration {
                *last_seen = now;
                return false;
            }
        }

        if entries.len() >= self.size_limit && !entries.contains_key(&key) {
            self.compact(&mut entries, now);
        }
        entries.insert(key, now);
        true
    }

    fn compact(&self, entries: &mut HashMap<String, Instant>, now: Instant) {
        entries.retain(|_, last_seen| now.saturating_duration_since(*last_seen) < self.sliding_expiration);
        if entries.len() < self.size_limit {
            return;
        }

        let to_remove = ((self.size_limit as f64 * self.compaction).ceil() as usize).max(1);
        let mut by_age: Vec<(Instant, String)> = entries
            .iter()
            .map(|(key, last_seen)| (*last_seen, key.clone()))
            .collect();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(to_remove) {
            entries.remove(&key);
        }
        log::debug!(target: "posthog", removed = to_remove; "compacted feature flag sent cache");
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::FeatureFlagSentCache;

    #[test]
    fn reports_once_per_response() {
        let cache = FeatureFlagSentCache::new(100, Duration::from_secs(60), 0.2);

        assert!(cache.should_report("user", "flag", "true"));
        assert!(!cache.should_report("user", "flag", "true"));
        assert!(cache.should_report("user", "flag", "false"));
        assert!(cache.should_report("other-user", "flag", "true"));
    }

    #[test]
    fn entries_expire() {
        let cache = FeatureFlagSentCache::new(100, Duration::from_secs(60), 0.2);
        let start = Instant::now();

        assert!(cache.should_report_at("user", "flag", "true", start));
        assert!(!cache.should_report_at("user", "flag", "true", start + Duration::from_secs(59)));
        // Sliding: the previous hit refreshed the entry.
        assert!(!cache.should_report_at("user", "flag", "true", start + Duration::from_secs(100)));
        assert!(cache.should_report_at("user", "flag", "true", start + Duration::from_secs(200)));
    }

    #[test]
    fn compacts_when_full() {
        let cache = FeatureFlagSentCache::new(10, Duration::from_secs(60), 0.2);
        let start = Instant::now();

        for i in 0..10 {
            assert!(cache.should_report_at(
                &format!("user-{i}"),
                "flag",
                "true",
                start + Duration::from_millis(i)
            ));
        }
        assert_eq!(cache.len(), 10);

        assert!(cache.should_report_at("user-new", "flag", "true", start + Duration::from_secs(1)));
        // Two oldest removed, one added.
        assert_eq!(cache.len(), 9);
        assert!(cache.should_report_at("user-0", "flag", "true", start + Duration::from_secs(2)));
        assert!(!cache.should_report_at("user-9", "flag", "true", start + Duration::from_secs(2)));
    }
}
