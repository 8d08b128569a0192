//! Rule index (§4.H): O(1) candidate lookup by (device, key, type) plus a
//! priority-sorted fallback list.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::point::Point;
use crate::rules::model::{Condition, Operator, Rule};

const WILDCARD: &str = "*";

struct Inner {
    device_index: HashMap<String, Vec<Arc<Rule>>>,
    key_index: HashMap<String, Vec<Arc<Rule>>>,
    type_index: HashMap<String, Vec<Arc<Rule>>>,
    priority_sorted: Vec<Arc<Rule>>,
}

impl Inner {
    fn empty() -> Self {
        Self {
            device_index: HashMap::new(),
            key_index: HashMap::new(),
            type_index: HashMap::new(),
            priority_sorted: Vec::new(),
        }
    }
}

/// Extracted equality constraints an index can serve directly; anything
/// else falls through to per-rule evaluation by the caller.
#[derive(Default)]
struct Constraints {
    device_id: Option<String>,
    key: Option<String>,
    data_type: Option<String>,
}

fn extract_constraints(cond: &Condition, out: &mut Constraints) {
    match cond {
        Condition::Simple { field, operator, value } if *operator == Operator::Eq => {
            if let Some(s) = value.as_str() {
                match field.as_str() {
                    "device_id" => out.device_id = Some(s.to_string()),
                    "key" => out.key = Some(s.to_string()),
                    "type" => out.data_type = Some(s.to_string()),
                    _ => {}
                }
            }
        }
        Condition::And { children } => {
            for c in children {
                extract_constraints(c, out);
            }
        }
        _ => {}
    }
}

/// RW-lock guarded rule index, rebuilt on every mutation (§5).
pub struct RuleIndex {
    inner: RwLock<Inner>,
}

impl Default for RuleIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::empty()),
        }
    }

    /// Rebuilds the whole index from a fresh rule set (used after a full
    /// reload). Disabled rules are excluded.
    pub fn rebuild(&self, rules: Vec<Rule>) {
        let mut inner = Inner::empty();
        for rule in rules.into_iter().filter(|r| r.enabled) {
            insert_rule(&mut inner, Arc::new(rule));
        }
        sort_priority(&mut inner.priority_sorted);
        *self.inner.write() = inner;
    }

    /// Adds or replaces a single rule (hot-reload create/update path).
    pub fn upsert(&self, rule: Rule) {
        let mut inner = self.inner.write();
        remove_by_id(&mut inner, &rule.id);
        if rule.enabled {
            insert_rule(&mut inner, Arc::new(rule));
        }
        sort_priority(&mut inner.priority_sorted);
    }

    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.write();
        remove_by_id(&mut inner, id);
        sort_priority(&mut inner.priority_sorted);
    }

    /// Candidate set for `point`: union of the three bucket lookups plus
    /// wildcard buckets, deduplicated by id, sorted by priority descending
    /// (ties broken by rule name for determinism).
    pub fn candidates(&self, point: &Point) -> Vec<Arc<Rule>> {
        let inner = self.inner.read();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        let buckets = [
            inner.device_index.get(point.device_id.as_str()),
            inner.device_index.get(WILDCARD),
            inner.key_index.get(point.key.as_str()),
            inner.key_index.get(WILDCARD),
            inner.type_index.get(point.point_type().to_string().as_str()),
            inner.type_index.get(WILDCARD),
        ];
        for bucket in buckets.into_iter().flatten() {
            for rule in bucket {
                if seen.insert(rule.id.clone()) {
                    out.push(rule.clone());
                }
            }
        }
        if out.is_empty() {
            out = inner.priority_sorted.clone();
        } else {
            sort_priority(&mut out);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().priority_sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn insert_rule(inner: &mut Inner, rule: Arc<Rule>) {
    let mut constraints = Constraints::default();
    extract_constraints(&rule.conditions, &mut constraints);

    inner
        .device_index
        .entry(constraints.device_id.unwrap_or_else(|| WILDCARD.to_string()))
        .or_default()
        .push(rule.clone());
    inner
        .key_index
        .entry(constraints.key.unwrap_or_else(|| WILDCARD.to_string()))
        .or_default()
        .push(rule.clone());
    inner
        .type_index
        .entry(constraints.data_type.unwrap_or_else(|| WILDCARD.to_string()))
        .or_default()
        .push(rule.clone());
    inner.priority_sorted.push(rule);
}

fn remove_by_id(inner: &mut Inner, id: &str) {
    for bucket in inner.device_index.values_mut() {
        bucket.retain(|r| r.id != id);
    }
    for bucket in inner.key_index.values_mut() {
        bucket.retain(|r| r.id != id);
    }
    for bucket in inner.type_index.values_mut() {
        bucket.retain(|r| r.id != id);
    }
    inner.priority_sorted.retain(|r| r.id != id);
}

fn sort_priority(rules: &mut [Arc<Rule>]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Value;
    use crate::rules::model::Action;
    use std::collections::HashMap as Map;

    fn rule(id: &str, device_id: Option<&str>, priority: i32) -> Rule {
        let conditions = match device_id {
            Some(d) => Condition::Simple {
                field: "device_id".into(),
                operator: Operator::Eq,
                value: serde_json::json!(d),
            },
            None => Condition::Expression {
                expression: "true".into(),
            },
        };
        Rule {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            enabled: true,
            priority,
            version: 1,
            data_type: None,
            conditions,
            actions: vec![Action {
                action_type: "forward".into(),
                config: serde_json::json!({}),
                async_exec: false,
                timeout: None,
                retry: None,
            }],
            tags: Map::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn candidates_prefer_device_bucket_over_wildcard_fallback() {
        let index = RuleIndex::new();
        index.rebuild(vec![rule("a", Some("d1"), 5), rule("b", Some("d2"), 10)]);
        let point = Point::new("d1", "k", Value::Int(1));
        let candidates = index.candidates(&point);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "a");
    }

    #[test]
    fn wildcard_rule_matches_any_device() {
        let index = RuleIndex::new();
        index.rebuild(vec![rule("a", None, 1)]);
        let point = Point::new("anything", "k", Value::Int(1));
        assert_eq!(index.candidates(&point).len(), 1);
    }

    #[test]
    fn priority_ties_broken_by_name() {
        let index = RuleIndex::new();
        index.rebuild(vec![rule("b", None, 5), rule("a", None, 5)]);
        let point = Point::new("d", "k", Value::Int(1));
        let candidates = index.candidates(&point);
        assert_eq!(candidates[0].id, "a");
        assert_eq!(candidates[1].id, "b");
    }

    #[test]
    fn upsert_then_remove_updates_candidates() {
        let index = RuleIndex::new();
        index.upsert(rule("a", Some("d1"), 1));
        assert_eq!(index.len(), 1);
        index.remove("a");
        assert_eq!(index.len(), 0);
    }
}
