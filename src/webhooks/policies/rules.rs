//! Regex rule tables for annotations and labels.
//!
//! Two matching modes share one rule representation:
//! - Allow-list: every present key carrying a recognized vendor prefix must
//!   appear in the table, and its value must match the configured pattern.
//! - Required: every key in the table must be present on the subject, and its
//!   value must match the configured pattern.
//!
//! Patterns are compiled once when the table is built. A pattern that does not
//! compile is kept as a pass-through rule so that an operator mistake in the
//! rule table never rejects workloads.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::{debug, warn};

/// Annotation prefixes owned by the NGINX ingress controller
pub const VENDOR_ANNOTATION_PREFIXES: [&str; 3] = ["nginx.org/", "nginx.com/", "custom.nginx.org/"];

/// A single key's value constraint
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: String,
    regex: Option<Regex>,
}

impl Rule {
    /// Compile a rule for `key`. Invalid patterns are logged and kept uncompiled.
    pub fn compile(key: &str, pattern: &str) -> Self {
        let regex = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(
                    key = %key,
                    pattern = %pattern,
                    error = %e,
                    "Rule pattern is invalid, values for this key will not be checked"
                );
                None
            }
        };
        Self {
            pattern: pattern.to_string(),
            regex,
        }
    }

    /// The pattern as configured
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the configured pattern compiled
    pub fn is_valid(&self) -> bool {
        self.regex.is_some()
    }

    /// Test a value. Uncompiled rules always pass.
    pub fn matches(&self, key: &str, value: &str) -> bool {
        match &self.regex {
            Some(re) => {
                let matched = re.is_match(value);
                if !matched {
                    debug!(
                        key = %key,
                        value = %value,
                        pattern = %self.pattern,
                        "Value did not match rule pattern"
                    );
                }
                matched
            }
            None => {
                warn!(
                    key = %key,
                    pattern = %self.pattern,
                    "Skipping value check, rule pattern is invalid"
                );
                true
            }
        }
    }
}

/// Key to pattern table, iterated in key order
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: BTreeMap<String, Rule>,
}

impl RuleTable {
    /// Build a table from key/pattern pairs
    pub fn from_patterns<K, P>(patterns: impl IntoIterator<Item = (K, P)>) -> Self
    where
        K: Into<String>,
        P: AsRef<str>,
    {
        let mut table = Self::default();
        for (key, pattern) in patterns {
            table.insert(key, pattern.as_ref());
        }
        table
    }

    /// Add or replace the rule for `key`
    pub fn insert(&mut self, key: impl Into<String>, pattern: &str) {
        let key = key.into();
        let rule = Rule::compile(&key, pattern);
        self.rules.insert(key, rule);
    }

    pub fn get(&self, key: &str) -> Option<&Rule> {
        self.rules.get(key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Rule)> {
        self.rules.iter()
    }

    /// Keys whose pattern failed to compile
    pub fn invalid_keys(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .filter(|(_, rule)| !rule.is_valid())
            .map(|(key, _)| key.as_str())
    }
}

/// First key that failed a rule check, with the observed value
/// (empty when the key is missing)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolation {
    pub key: String,
    pub value: String,
}

/// Whether `key` belongs to one of the recognized vendor prefixes
pub fn has_vendor_prefix(key: &str) -> bool {
    VENDOR_ANNOTATION_PREFIXES
        .iter()
        .any(|prefix| key.starts_with(prefix))
}

/// Allow-list mode: keys with a recognized prefix must be listed in `table`
/// and match its pattern. Keys without a recognized prefix are ignored.
pub fn check_allowed(
    subject: &BTreeMap<String, String>,
    prefixes: &[&str],
    table: &RuleTable,
) -> Result<(), RuleViolation> {
    for (key, value) in subject {
        if !prefixes.iter().any(|prefix| key.starts_with(prefix)) {
            continue;
        }

        let Some(rule) = table.get(key) else {
            debug!(key = %key, "Key is not in the allow list");
            return Err(RuleViolation {
                key: key.clone(),
                value: value.clone(),
            });
        };

        if !rule.matches(key, value) {
            return Err(RuleViolation {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    Ok(())
}

/// Required mode: every key in `table` must be present on `subject` and match
pub fn check_required(
    subject: Option<&BTreeMap<String, String>>,
    table: &RuleTable,
) -> Result<(), RuleViolation> {
    for (key, rule) in table.iter() {
        let Some(value) = subject.and_then(|s| s.get(key)) else {
            debug!(key = %key, "Required key is missing");
            return Err(RuleViolation {
                key: key.clone(),
                value: String::new(),
            });
        };

        if !rule.matches(key, value) {
            return Err(RuleViolation {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    Ok(())
}
