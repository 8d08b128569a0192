//! Rule model & storage (§4.F): load/validate/persist rule files and the
//! hot-reload directory watcher.

pub mod model;
pub mod store;
pub mod watcher;

pub use model::{Action, ChangeKind, Condition, Operator, Rule, RuleChangeEvent, RuleError};
pub use store::{RuleStore, SharedRuleStore};
pub use watcher::{spawn as spawn_watcher, WatcherConfig};
