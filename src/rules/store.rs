//! Rule persistence and the priority-ordered snapshot index.
//!
//! Rules load from JSON files in the configured directory (one rule object
//! or an array per file) plus the inline config list. Mutations validate,
//! bump the version optimistically, write the file, then atomically swap a
//! fresh priority-ordered index (arc-swap) - readers never see a partial
//! rule set.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::types::{Rule, RuleValidationError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rule file {file}: {message}")]
    Parse { file: String, message: String },

    #[error(transparent)]
    Validation(#[from] RuleValidationError),

    #[error("Rule '{0}' not found")]
    NotFound(String),

    #[error("Version conflict on rule '{id}': store has v{current}, save carried v{proposed}")]
    VersionConflict {
        id: String,
        current: u64,
        proposed: u64,
    },
}

/// Immutable, priority-ordered view of the rule set. Swapped wholesale on
/// every mutation; workers evaluate against the snapshot they grabbed.
#[derive(Debug, Default)]
pub struct RuleIndex {
    /// Priority descending, insertion order as tie-break
    pub ordered: Vec<Arc<Rule>>,
}

/// Outcome of a directory scan.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    /// (file name, reason) for every rejected rule; the rest still load
    pub rejected: Vec<(String, String)>,
}

struct Stored {
    rule: Arc<Rule>,
    seq: u64,
}

pub struct RuleStore {
    rules_dir: Option<PathBuf>,
    rules: DashMap<String, Stored>,
    next_seq: AtomicU64,
    index: ArcSwap<RuleIndex>,
}

impl RuleStore {
    pub fn new(rules_dir: Option<PathBuf>) -> Self {
        Self {
            rules_dir,
            rules: DashMap::new(),
            next_seq: AtomicU64::new(0),
            index: ArcSwap::from_pointee(RuleIndex::default()),
        }
    }

    /// Scan the rules directory. A file may hold one rule object or an
    /// array. Each failing rule is rejected alone; the rest of the set
    /// loads.
    pub fn load_dir(&self) -> Result<LoadReport, StoreError> {
        let mut report = LoadReport::default();
        let Some(dir) = self.rules_dir.clone() else {
            return Ok(report);
        };
        if !dir.exists() {
            info!(dir = %dir.display(), "Rules directory missing, starting empty");
            return Ok(report);
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort(); // deterministic insertion order

        for path in entries {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let text = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    report.rejected.push((file, e.to_string()));
                    continue;
                }
            };
            match parse_rule_file(&text) {
                Ok(rules) => {
                    for rule in rules {
                        match rule.validate() {
                            Ok(()) => {
                                self.insert(rule);
                                report.loaded += 1;
                            }
                            Err(e) => {
                                warn!(file = %file, error = %e, "Rejecting invalid rule");
                                report.rejected.push((file.clone(), e.to_string()));
                            }
                        }
                    }
                }
                Err(message) => {
                    warn!(file = %file, error = %message, "Rejecting unparseable rule file");
                    report.rejected.push((file, message));
                }
            }
        }

        self.rebuild_index();
        info!(
            loaded = report.loaded,
            rejected = report.rejected.len(),
            "Rule directory scan complete"
        );
        Ok(report)
    }

    /// Add config-inline rules (validated, no file write).
    pub fn load_inline(&self, rules: Vec<Rule>) -> LoadReport {
        let mut report = LoadReport::default();
        for rule in rules {
            match rule.validate() {
                Ok(()) => {
                    self.insert(rule);
                    report.loaded += 1;
                }
                Err(e) => report.rejected.push(("<inline>".to_string(), e.to_string())),
            }
        }
        self.rebuild_index();
        report
    }

    pub fn list(&self) -> Vec<Arc<Rule>> {
        self.snapshot().ordered.clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Rule>> {
        self.rules.get(id).map(|s| Arc::clone(&s.rule))
    }

    /// Persist a rule. New rules start at version 1; existing rules must
    /// carry the current version (optimistic concurrency) and get bumped.
    /// Storage write happens before the in-memory swap.
    pub fn save(&self, mut rule: Rule) -> Result<Arc<Rule>, StoreError> {
        rule.validate()?;
        if let Some(existing) = self.rules.get(&rule.id) {
            let current = existing.rule.version;
            if rule.version != current {
                return Err(StoreError::VersionConflict {
                    id: rule.id,
                    current,
                    proposed: rule.version,
                });
            }
            rule.version = current + 1;
        } else {
            rule.version = rule.version.max(1);
        }
        rule.updated_at = chrono::Utc::now();

        self.write_file(&rule)?;
        let saved = self.insert(rule);
        self.rebuild_index();
        Ok(saved)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let (_, stored) = self
            .rules
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(dir) = &self.rules_dir {
            let path = dir.join(format!("{}.json", stored.rule.id));
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        self.rebuild_index();
        debug!(rule = id, "Rule deleted");
        Ok(())
    }

    pub fn enable(&self, id: &str) -> Result<(), StoreError> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> Result<(), StoreError> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        let current = self
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if current.enabled == enabled {
            return Ok(());
        }
        let mut rule = (*current).clone();
        rule.enabled = enabled;
        self.save(rule)?;
        Ok(())
    }

    /// Current priority-ordered snapshot (lock-free read).
    pub fn snapshot(&self) -> Arc<RuleIndex> {
        self.index.load_full()
    }

    fn insert(&self, rule: Rule) -> Arc<Rule> {
        let rule = Arc::new(rule);
        let seq = match self.rules.get(&rule.id) {
            Some(existing) => existing.seq, // keep original insertion order
            None => self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.rules.insert(
            rule.id.clone(),
            Stored {
                rule: Arc::clone(&rule),
                seq,
            },
        );
        rule
    }

    fn write_file(&self, rule: &Rule) -> Result<(), StoreError> {
        let Some(dir) = &self.rules_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", rule.id));
        let json = serde_json::to_string_pretty(rule).map_err(|e| StoreError::Parse {
            file: path.display().to_string(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, json)?;
        Ok(())
    }

    fn rebuild_index(&self) {
        let mut with_seq: Vec<(u64, Arc<Rule>)> = self
            .rules
            .iter()
            .map(|s| (s.seq, Arc::clone(&s.rule)))
            .collect();
        with_seq.sort_by(|(seq_a, a), (seq_b, b)| {
            b.priority.cmp(&a.priority).then(seq_a.cmp(seq_b))
        });
        let ordered = with_seq.into_iter().map(|(_, r)| r).collect();
        self.index.store(Arc::new(RuleIndex { ordered }));
    }
}

/// Parse one rule file: a single object or an array of objects.
fn parse_rule_file(text: &str) -> Result<Vec<Rule>, String> {
    match serde_json::from_str::<Rule>(text) {
        Ok(rule) => Ok(vec![rule]),
        Err(single_err) => serde_json::from_str::<Vec<Rule>>(text)
            .map_err(|_| single_err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionSpec, Condition, Operator, RetryPolicy};
    use serde_json::json;

    fn rule(id: &str, priority: u8) -> Rule {
        Rule {
            id: id.to_string(),
            name: format!("rule {id}"),
            description: String::new(),
            enabled: true,
            priority,
            version: 0,
            data_type: None,
            conditions: Condition::Simple {
                field: "value".to_string(),
                operator: Operator::Gt,
                value: json!(0),
            },
            actions: vec![ActionSpec {
                action_type: "forward".to_string(),
                config: json!({"subjects": ["iot.out"]}),
                run_async: false,
                timeout_ms: 1_000,
                retry: RetryPolicy::default(),
            }],
            tags: Default::default(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn priority_then_insertion_order() {
        let store = RuleStore::new(None);
        store.load_inline(vec![rule("low", 10), rule("high", 90), rule("mid-a", 50), rule("mid-b", 50)]);
        let ids: Vec<String> = store.list().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, ["high", "mid-a", "mid-b", "low"]);
    }

    #[test]
    fn save_bumps_version_and_rejects_stale() {
        let store = RuleStore::new(None);
        let saved = store.save(rule("r1", 50)).unwrap();
        assert_eq!(saved.version, 1);

        let mut update = (*saved).clone();
        update.name = "renamed".to_string();
        let saved2 = store.save(update).unwrap();
        assert_eq!(saved2.version, 2);

        // A writer holding the old version loses.
        let mut stale = (*saved).clone();
        stale.name = "stale".to_string();
        assert!(matches!(
            store.save(stale),
            Err(StoreError::VersionConflict { .. })
        ));
    }

    #[test]
    fn enable_disable_round_trip() {
        let store = RuleStore::new(None);
        store.save(rule("r1", 50)).unwrap();
        store.disable("r1").unwrap();
        assert!(!store.get("r1").unwrap().enabled);
        store.enable("r1").unwrap();
        assert!(store.get("r1").unwrap().enabled);
    }

    #[test]
    fn dir_load_rejects_bad_rules_individually() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.json"),
            serde_json::to_string(&rule("good", 40)).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        // Array file with two rules
        std::fs::write(
            dir.path().join("pair.json"),
            serde_json::to_string(&vec![rule("a", 60), rule("b", 20)]).unwrap(),
        )
        .unwrap();

        let store = RuleStore::new(Some(dir.path().to_path_buf()));
        let report = store.load_dir().unwrap();
        assert_eq!(report.loaded, 3);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(store.list().len(), 3);
    }

    #[test]
    fn save_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::new(Some(dir.path().to_path_buf()));
        store.save(rule("persisted", 50)).unwrap();
        let text = std::fs::read_to_string(dir.path().join("persisted.json")).unwrap();
        let back: Rule = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, "persisted");
        assert_eq!(back.version, 1);

        store.delete("persisted").unwrap();
        assert!(!dir.path().join("persisted.json").exists());
    }

    #[test]
    fn delete_missing_is_not_found() {
        let store = RuleStore::new(None);
        assert!(matches!(
            store.delete("ghost"),
            Err(StoreError::NotFound(_))
        ));
    }
}
