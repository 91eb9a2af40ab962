//! Concurrent tag container for data points.
//!
//! Tags are appended by adapters, derived-value materialisation, transform
//! and filter actions - sometimes from different tasks holding clones of the
//! same point. The map is sharded (dashmap) so hot-path reads never contend
//! with writers. Serialises as a sorted JSON object for deterministic wire
//! output.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Sharded string -> string tag map shared between clones of a point.
///
/// Cloning a `TagMap` is cheap (Arc bump); a tag appended through one clone
/// is visible through all of them.
#[derive(Debug, Clone, Default)]
pub struct TagMap {
    inner: Arc<DashMap<String, String>>,
}

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).map(|v| v.value().clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Detached deep copy. Actions that must not leak tags back into the
    /// original point (e.g. transform in `emit_new_subject` mode) use this.
    pub fn deep_clone(&self) -> Self {
        let copy = TagMap::new();
        for entry in self.inner.iter() {
            copy.insert(entry.key().clone(), entry.value().clone());
        }
        copy
    }

    /// Sorted snapshot, used for serialisation and template rendering.
    pub fn to_sorted(&self) -> BTreeMap<String, String> {
        self.inner
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

impl From<BTreeMap<String, String>> for TagMap {
    fn from(map: BTreeMap<String, String>) -> Self {
        let tags = TagMap::new();
        for (k, v) in map {
            tags.insert(k, v);
        }
        tags
    }
}

impl PartialEq for TagMap {
    fn eq(&self, other: &Self) -> bool {
        self.to_sorted() == other.to_sorted()
    }
}

impl Serialize for TagMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let sorted = self.to_sorted();
        let mut map = serializer.serialize_map(Some(sorted.len()))?;
        for (k, v) in sorted {
            map.serialize_entry(&k, &v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TagMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, String>::deserialize(deserializer)?;
        Ok(TagMap::from(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_visible_through_clones() {
        let tags = TagMap::new();
        let alias = tags.clone();
        alias.insert("site", "plant-7");
        assert_eq!(tags.get("site").unwrap(), "plant-7");
    }

    #[test]
    fn deep_clone_detaches() {
        let tags = TagMap::new();
        tags.insert("a", "1");
        let copy = tags.deep_clone();
        copy.insert("b", "2");
        assert!(tags.get("b").is_none());
        assert_eq!(copy.get("a").unwrap(), "1");
    }

    #[test]
    fn serializes_sorted() {
        let tags = TagMap::new();
        tags.insert("zone", "b");
        tags.insert("area", "a");
        let json = serde_json::to_string(&tags).unwrap();
        assert_eq!(json, r#"{"area":"a","zone":"b"}"#);
    }

    #[test]
    fn concurrent_append_and_read() {
        let tags = TagMap::new();
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let t = tags.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        t.insert(format!("k{}-{}", i, j), "v");
                        let _ = t.get("k0-0");
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(tags.len(), 800);
    }
}
