//! Rule data model (§3, §4.F): `Rule`, `Condition`, `Action`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("rule validation failed: {0}")]
    Invalid(String),
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub data_type: Option<String>,
    pub conditions: Condition,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Rule {
    /// Structural validation per §3/§4.F. Does not evaluate conditions,
    /// only checks shape.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.id.trim().is_empty() {
            return Err(RuleError::Invalid("rule id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(RuleError::Invalid("rule name must not be empty".into()));
        }
        if self.actions.is_empty() {
            return Err(RuleError::Invalid(format!(
                "rule {} must declare at least one action",
                self.id
            )));
        }
        self.conditions.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Startswith,
    Endswith,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Simple {
        field: String,
        operator: Operator,
        value: serde_json::Value,
    },
    Expression {
        expression: String,
    },
    /// Reserved in the descriptor schema; evaluating one is always a
    /// validation/runtime error — no embedded scripting runtime ships here.
    Lua {
        script: String,
    },
    And {
        children: Vec<Condition>,
    },
    Or {
        children: Vec<Condition>,
    },
    Not {
        child: Box<Condition>,
    },
}

impl Condition {
    pub fn validate(&self) -> Result<(), RuleError> {
        match self {
            Condition::Simple { field, .. } => {
                if field.trim().is_empty() {
                    return Err(RuleError::Invalid("simple condition field must not be empty".into()));
                }
                Ok(())
            }
            Condition::Expression { expression } => {
                if expression.trim().is_empty() {
                    return Err(RuleError::Invalid("expression condition must not be empty".into()));
                }
                Ok(())
            }
            Condition::Lua { script } => {
                if script.trim().is_empty() {
                    return Err(RuleError::Invalid("lua condition must not be empty".into()));
                }
                Ok(())
            }
            Condition::And { children } | Condition::Or { children } => {
                if children.len() < 2 {
                    return Err(RuleError::Invalid("and/or condition needs at least 2 children".into()));
                }
                children.iter().try_for_each(Condition::validate)
            }
            Condition::Not { child } => child.validate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub async_exec: bool,
    #[serde(default, with = "humantime_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "humantime_serde_field")]
    pub retry_delay: Duration,
    pub retry_count: u32,
}

/// Minimal humantime-style (de)serialisation for an optional duration field,
/// accepting either a number of milliseconds or a `"500ms"`/`"10s"` string.
mod humantime_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_u64(d.as_millis() as u64),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<DurationLike>::deserialize(d)?;
        Ok(raw.map(Into::into))
    }

    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum DurationLike {
        Millis(u64),
        Text(String),
    }

    impl From<DurationLike> for Duration {
        fn from(v: DurationLike) -> Self {
            match v {
                DurationLike::Millis(ms) => Duration::from_millis(ms),
                DurationLike::Text(s) => parse_duration_text(&s),
            }
        }
    }

    fn parse_duration_text(s: &str) -> Duration {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            return Duration::from_millis(ms.trim().parse().unwrap_or(0));
        }
        if let Some(secs) = s.strip_suffix('s') {
            return Duration::from_secs_f64(secs.trim().parse().unwrap_or(0.0));
        }
        Duration::from_millis(s.parse().unwrap_or(0))
    }
}

mod humantime_serde_field {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(v.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Emitted by the hot-reload watcher (§4.F) whenever a rule file's on-disk
/// state changes.
#[derive(Debug, Clone)]
pub struct RuleChangeEvent {
    pub kind: ChangeKind,
    pub id: String,
    pub rule: Option<Rule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_rule() -> Rule {
        Rule {
            id: "r1".into(),
            name: "high temp".into(),
            description: String::new(),
            enabled: true,
            priority: 10,
            version: 1,
            data_type: None,
            conditions: Condition::Simple {
                field: "value".into(),
                operator: Operator::Gt,
                value: serde_json::json!(30.0),
            },
            actions: vec![Action {
                action_type: "forward".into(),
                config: serde_json::json!({}),
                async_exec: false,
                timeout: None,
                retry: None,
            }],
            tags: HashMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn validates_well_formed_rule() {
        assert!(simple_rule().validate().is_ok());
    }

    #[test]
    fn rejects_rule_with_no_actions() {
        let mut r = simple_rule();
        r.actions.clear();
        assert!(r.validate().is_err());
    }

    #[test]
    fn rejects_and_condition_with_one_child() {
        let mut r = simple_rule();
        r.conditions = Condition::And {
            children: vec![Condition::Expression {
                expression: "true".into(),
            }],
        };
        assert!(r.validate().is_err());
    }

    #[test]
    fn rule_json_roundtrip() {
        let r = simple_rule();
        let s = serde_json::to_string(&r).unwrap();
        let back: Rule = serde_json::from_str(&s).unwrap();
        assert_eq!(back.id, r.id);
    }
}
