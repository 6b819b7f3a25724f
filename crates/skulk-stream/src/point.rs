//! Datapoint model shared by the codec, the window transforms and subscriptions.

use std::collections::BTreeMap;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Tags attached to a datapoint, ordered by tag key.
pub type Tags = BTreeMap<String, String>;

/// A single typed measurement of a metric.
///
/// A `DataPoint` is immutable once parsed from the store; the subscription
/// path only ever clones it into outbound responses.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Metric name, e.g. `sys.cpu.user`.
    pub metric: String,
    /// Timestamp in milliseconds since the epoch.
    pub timestamp: Timestamp,
    /// Measured value.
    pub value: f64,
    /// Tags identifying the series.
    pub tags: Tags,
}

impl DataPoint {
    /// Creates a new datapoint.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let point = DataPoint::new("sys.cpu.user", [("host", "r01n01")], 1000, 0.5);
    /// assert_eq!(point.tags["host"], "r01n01");
    /// ```
    pub fn new<K, V>(
        metric: impl Into<String>,
        tags: impl IntoIterator<Item = (K, V)>,
        timestamp: Timestamp,
        value: f64,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            metric: metric.into(),
            timestamp,
            value,
            tags: tags
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns true if every tag in `filter` is present on this point with
    /// an equal value. An empty filter matches everything.
    pub fn matches_tags(&self, filter: &Tags) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.tags.get(k).is_some_and(|own| own == v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_collects_tags_in_key_order() {
        let point = DataPoint::new("m", [("rack", "r01"), ("host", "h1")], 5, 1.5);
        let keys: Vec<_> = point.tags.keys().cloned().collect();
        assert_eq!(keys, vec!["host".to_string(), "rack".to_string()]);
    }

    #[test]
    fn test_matches_tags() {
        let point = DataPoint::new("m", [("host", "h1"), ("rack", "r01")], 5, 1.5);

        let mut filter = Tags::new();
        assert!(point.matches_tags(&filter));

        filter.insert("host".to_string(), "h1".to_string());
        assert!(point.matches_tags(&filter));

        filter.insert("rack".to_string(), "r02".to_string());
        assert!(!point.matches_tags(&filter));

        let mut missing = Tags::new();
        missing.insert("dc".to_string(), "east".to_string());
        assert!(!point.matches_tags(&missing));
    }
}
