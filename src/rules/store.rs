//! Rule storage (§4.F): load/save/validate rule files, directory walking,
//! single-vs-array-vs-`{rules:[...]}` parsing fallback chain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::model::{ChangeKind, Rule, RuleChangeEvent, RuleError};

/// Recursively collects every regular file under `root`, mirroring the
/// manual `read_dir` recursion the rest of this codebase uses instead of
/// pulling in a directory-walking crate.
fn walk_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

/// In-memory rule table backed by a directory of JSON/YAML files.
pub struct RuleStore {
    dir: PathBuf,
    rules: RwLock<HashMap<String, Rule>>,
    /// Which rule ids were last read from which on-disk file, so the
    /// watcher can tell creates/updates/deletes apart per-file.
    sources: RwLock<HashMap<PathBuf, Vec<String>>>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
enum RuleFile {
    Single(Rule),
    Array(Vec<Rule>),
    Wrapped { rules: Vec<Rule> },
}

impl RuleFile {
    fn into_rules(self) -> Vec<Rule> {
        match self {
            RuleFile::Single(r) => vec![r],
            RuleFile::Array(rs) => rs,
            RuleFile::Wrapped { rules } => rules,
        }
    }
}

fn is_rule_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("yaml") | Some("yml")
    )
}

fn parse_rule_file(path: &Path, contents: &str) -> Result<Vec<Rule>, RuleError> {
    let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
    let parsed: RuleFile = if is_yaml {
        serde_yaml::from_str(contents).map_err(|e| RuleError::Parse {
            path: path.display().to_string(),
            source: e.into(),
        })?
    } else {
        serde_json::from_str(contents).map_err(|e| RuleError::Parse {
            path: path.display().to_string(),
            source: e.into(),
        })?
    };
    Ok(parsed.into_rules())
}

impl RuleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            rules: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Walks `rules_dir` recursively, parsing every `*.json|*.yaml|*.yml`
    /// file via the single/array/wrapped fallback chain. Duplicates inside
    /// the same load overwrite with a warning. Files that fail to parse are
    /// skipped (logged) rather than aborting the whole load.
    pub fn load_all(&self) -> Result<usize, RuleError> {
        let mut loaded = 0;
        let mut table = HashMap::new();
        let mut sources = HashMap::new();
        let mut files = Vec::new();
        walk_files(&self.dir, &mut files);
        for path in &files {
            let path = path.as_path();
            if !is_rule_file(path) {
                continue;
            }
            let ids = self.load_file_into(path, &mut table);
            if !ids.is_empty() {
                sources.insert(path.to_path_buf(), ids.clone());
                loaded += ids.len();
            }
        }
        *self.rules.write() = table;
        *self.sources.write() = sources;
        Ok(loaded)
    }

    fn load_file_into(&self, path: &Path, table: &mut HashMap<String, Rule>) -> Vec<String> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read rule file");
                return Vec::new();
            }
        };
        let rules = match parse_rule_file(path, &contents) {
            Ok(rs) => rs,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse rule file, skipping");
                return Vec::new();
            }
        };
        let mut ids = Vec::new();
        for rule in rules {
            if let Err(e) = rule.validate() {
                tracing::warn!(rule_id = %rule.id, error = %e, "invalid rule, skipping");
                continue;
            }
            if table.contains_key(&rule.id) {
                tracing::warn!(rule_id = %rule.id, "duplicate rule id within load, overwriting");
            }
            ids.push(rule.id.clone());
            table.insert(rule.id.clone(), rule);
        }
        ids
    }

    /// Reloads a single file that the hot-reload watcher observed changing,
    /// diffing against the ids previously sourced from that path and
    /// returning the resulting create/update/delete events.
    pub fn reload_file(&self, path: &Path) -> Vec<RuleChangeEvent> {
        let previous_ids: Vec<String> = self
            .sources
            .read()
            .get(path)
            .cloned()
            .unwrap_or_default();

        if !path.exists() {
            let mut rules = self.rules.write();
            let mut events = Vec::new();
            for id in &previous_ids {
                if rules.remove(id).is_some() {
                    events.push(RuleChangeEvent {
                        kind: ChangeKind::Delete,
                        id: id.clone(),
                        rule: None,
                    });
                }
            }
            self.sources.write().remove(path);
            return events;
        }

        let mut staged = HashMap::new();
        let new_ids = self.load_file_into(path, &mut staged);

        let mut events = Vec::new();
        let mut rules = self.rules.write();
        for id in &previous_ids {
            if !new_ids.contains(id) {
                rules.remove(id);
                events.push(RuleChangeEvent {
                    kind: ChangeKind::Delete,
                    id: id.clone(),
                    rule: None,
                });
            }
        }
        for (id, rule) in staged {
            let kind = if rules.contains_key(&id) {
                ChangeKind::Update
            } else {
                ChangeKind::Create
            };
            rules.insert(id.clone(), rule.clone());
            events.push(RuleChangeEvent {
                kind,
                id,
                rule: Some(rule),
            });
        }
        drop(rules);
        self.sources.write().insert(path.to_path_buf(), new_ids);
        events
    }

    pub fn get(&self, id: &str) -> Option<Rule> {
        self.rules.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Rule> {
        self.rules.read().values().cloned().collect()
    }

    /// Persists `rule` to `<dir>/<id>.json`, bumping `version` and keeping
    /// `created_at` if the rule already existed. Also scans other JSON files
    /// for stray array-embedded copies of the same id and rewrites/removes
    /// them so there is exactly one on-disk representative per id.
    pub fn save(&self, mut rule: Rule) -> Result<(), RuleError> {
        let existing = self.rules.read().get(&rule.id).cloned();
        if let Some(prev) = &existing {
            rule.version = prev.version + 1;
            rule.created_at = prev.created_at;
        } else {
            rule.version = rule.version.max(1);
        }
        rule.updated_at = chrono::Utc::now();
        rule.validate()?;

        let path = self.dir.join(format!("{}.json", rule.id));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&rule).map_err(|e| RuleError::Parse {
            path: path.display().to_string(),
            source: e.into(),
        })?)?;

        self.remove_stray_array_copies(&rule.id, &path)?;
        self.sources.write().insert(path, vec![rule.id.clone()]);
        self.rules.write().insert(rule.id.clone(), rule);
        Ok(())
    }

    fn remove_stray_array_copies(&self, id: &str, own_path: &Path) -> Result<(), RuleError> {
        let mut files = Vec::new();
        walk_files(&self.dir, &mut files);
        for path in &files {
            let path = path.as_path();
            if path == own_path || !is_rule_file(path) {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(path) else {
                continue;
            };
            let Ok(rules) = parse_rule_file(path, &contents) else {
                continue;
            };
            if !rules.iter().any(|r| r.id == id) {
                continue;
            }
            let remaining: Vec<Rule> = rules.into_iter().filter(|r| r.id != id).collect();
            if remaining.is_empty() {
                std::fs::remove_file(path)?;
            } else {
                std::fs::write(path, serde_json::to_string_pretty(&remaining).map_err(|e| RuleError::Parse {
                    path: path.display().to_string(),
                    source: e.into(),
                })?)?;
            }
        }
        Ok(())
    }

    /// Removes memory state and the individual `<id>.json` file, if present.
    pub fn delete(&self, id: &str) -> Result<(), RuleError> {
        if self.rules.write().remove(id).is_none() {
            return Err(RuleError::NotFound(id.to_string()));
        }
        let path = self.dir.join(format!("{id}.json"));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.sources.write().remove(&path);
        Ok(())
    }

    /// Toggles `enabled`, bumps `version`, persists.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), RuleError> {
        let mut rule = self.get(id).ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        rule.enabled = enabled;
        self.save(rule)
    }
}

pub type SharedRuleStore = Arc<RuleStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{Action, Condition, Operator};

    fn rule(id: &str) -> Rule {
        Rule {
            id: id.into(),
            name: format!("rule {id}"),
            description: String::new(),
            enabled: true,
            priority: 0,
            version: 0,
            data_type: None,
            conditions: Condition::Simple {
                field: "value".into(),
                operator: Operator::Gt,
                value: serde_json::json!(1),
            },
            actions: vec![Action {
                action_type: "forward".into(),
                config: serde_json::json!({}),
                async_exec: false,
                timeout: None,
                retry: None,
            }],
            tags: HashMap::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::new(dir.path());
        store.save(rule("a")).unwrap();
        assert_eq!(store.get("a").unwrap().version, 1);

        let store2 = RuleStore::new(dir.path());
        store2.load_all().unwrap();
        assert_eq!(store2.get("a").unwrap().id, "a");
    }

    #[test]
    fn save_again_bumps_version_and_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::new(dir.path());
        store.save(rule("a")).unwrap();
        let created_at = store.get("a").unwrap().created_at;
        store.save(rule("a")).unwrap();
        let second = store.get("a").unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.created_at, created_at);
    }

    #[test]
    fn delete_removes_memory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::new(dir.path());
        store.save(rule("a")).unwrap();
        store.delete("a").unwrap();
        assert!(store.get("a").is_none());
        assert!(!dir.path().join("a.json").exists());
    }

    #[test]
    fn array_file_parses_all_rules() {
        let dir = tempfile::tempdir().unwrap();
        let contents = serde_json::to_string(&vec![rule("a"), rule("b")]).unwrap();
        std::fs::write(dir.path().join("bundle.json"), contents).unwrap();
        let store = RuleStore::new(dir.path());
        assert_eq!(store.load_all().unwrap(), 2);
    }

    #[test]
    fn wrapped_rules_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let contents = serde_json::json!({ "rules": [rule("a")] });
        std::fs::write(dir.path().join("bundle.json"), contents.to_string()).unwrap();
        let store = RuleStore::new(dir.path());
        assert_eq!(store.load_all().unwrap(), 1);
    }
}
