use serde_json::{Value, json};
use std::borrow::Cow;

pub const BALANCES: &str = "balances";
pub const ACTIVITY: &str = "activity";
pub const COOLDOWNS: &str = "cooldowns";
pub const DUELS: &str = "duels";
pub const GAMES: &str = "games";
pub const BANK: &str = "bank";
pub const LOANS: &str = "loans";
pub const DAILY_STREAKS: &str = "daily_streaks";
pub const CLUB_INVESTMENTS: &str = "club_investments";
pub const WAGERS: &str = "wagers";
pub const POLLS: &str = "polls";

/// A logical dataset: the in-memory map name and the payload name on the feed.
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub name: Cow<'static, str>,
    /// Value a principal's record starts from when nothing is stored.
    pub default_record: fn() -> Value,
    /// Whether records are keyed by principal (and so subject to identity migration).
    pub principal_keyed: bool,
}

impl DatasetSpec {
    const fn builtin(name: &'static str, default_record: fn() -> Value, principal_keyed: bool) -> Self {
        Self {
            name: Cow::Borrowed(name),
            default_record,
            principal_keyed,
        }
    }

    /// A principal-keyed dataset outside the built-in table.
    pub fn custom(name: impl Into<String>, default_record: fn() -> Value) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            default_record,
            principal_keyed: true,
        }
    }

    pub fn keyed_by_id(mut self, principal_keyed: bool) -> Self {
        self.principal_keyed = principal_keyed;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> Value {
        (self.default_record)()
    }
}

fn zero() -> Value {
    json!(0)
}

fn empty_object() -> Value {
    json!({})
}

fn duel_record() -> Value {
    json!({ "wins": 0, "losses": 0 })
}

fn bank_record() -> Value {
    json!({ "deposit": 0, "deposited_at": null })
}

fn loan_record() -> Value {
    json!({ "outstanding": 0, "due_at": null })
}

fn streak_record() -> Value {
    json!({ "streak": 0, "last_claim": null })
}

fn investment_record() -> Value {
    json!({ "invested": 0 })
}

/// Every dataset the community bot persists.
pub const DEFAULT_DATASETS: &[DatasetSpec] = &[
    DatasetSpec::builtin(BALANCES, zero, true),
    DatasetSpec::builtin(ACTIVITY, zero, true),
    DatasetSpec::builtin(COOLDOWNS, empty_object, true),
    DatasetSpec::builtin(DUELS, duel_record, true),
    DatasetSpec::builtin(GAMES, empty_object, true),
    DatasetSpec::builtin(BANK, bank_record, true),
    DatasetSpec::builtin(LOANS, loan_record, true),
    DatasetSpec::builtin(DAILY_STREAKS, streak_record, true),
    DatasetSpec::builtin(CLUB_INVESTMENTS, investment_record, true),
    DatasetSpec::builtin(WAGERS, empty_object, false),
    DatasetSpec::builtin(POLLS, empty_object, false),
];

pub fn default_datasets() -> Vec<DatasetSpec> {
    DEFAULT_DATASETS.to_vec()
}

pub fn lookup(name: &str) -> Option<&'static DatasetSpec> {
    DEFAULT_DATASETS.iter().find(|spec| spec.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_names_are_unique() {
        let names: HashSet<&str> = DEFAULT_DATASETS.iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), DEFAULT_DATASETS.len());
    }

    #[test]
    fn test_lookup_and_defaults() {
        let bank = lookup(BANK).unwrap();
        assert_eq!(bank.default_value()["deposit"], json!(0));
        assert!(!lookup(POLLS).unwrap().principal_keyed);
        assert!(lookup("nope").is_none());
    }
}
