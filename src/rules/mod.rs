//! Rule engine: store, condition evaluation, expression language, workers.

pub mod condition;
pub mod engine;
pub mod expr;
pub mod history;
pub mod store;

pub use condition::{evaluate_condition, ConditionError};
pub use engine::{EngineConfig, RuleEngine};
pub use history::SeriesHistory;
pub use store::{LoadReport, RuleIndex, RuleStore, StoreError};

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;

/// Shared compiled-regex cache, keyed by pattern text. Used by the `regex`
/// condition operator and the `regex()` expression function.
#[derive(Default)]
pub struct RegexCache {
    patterns: DashMap<String, Arc<Regex>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the compiled pattern, compiling on first sight.
    pub fn get_or_compile(&self, pattern: &str) -> Result<Arc<Regex>, regex::Error> {
        if let Some(re) = self.patterns.get(pattern) {
            return Ok(Arc::clone(&re));
        }
        let compiled = Arc::new(Regex::new(pattern)?);
        self.patterns
            .insert(pattern.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_once_per_pattern() {
        let cache = RegexCache::new();
        let a = cache.get_or_compile("^iot\\.").unwrap();
        let b = cache.get_or_compile("^iot\\.").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalid_pattern_is_error() {
        let cache = RegexCache::new();
        assert!(cache.get_or_compile("(unclosed").is_err());
        assert!(cache.is_empty());
    }
}
