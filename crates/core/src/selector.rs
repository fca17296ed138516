//! Equality label selectors (`env=prod,tier=web`).
//!
//! Only exact matches are supported: every requirement's key must be present
//! with a literally equal value. An empty selector matches everything.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static LABEL_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]{0,61}[A-Za-z0-9])?$")
        .unwrap_or_else(|e| panic!("label key regex: {e}"))
});

static LABEL_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9]([-A-Za-z0-9_.]{0,61}[A-Za-z0-9])?)?$")
        .unwrap_or_else(|e| panic!("label value regex: {e}"))
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("selector term '{0}' is not of the form key=value")]
    Malformed(String),
    #[error("invalid label key '{0}'")]
    InvalidKey(String),
    #[error("invalid label value '{0}'")]
    InvalidValue(String),
    #[error("conflicting values for label key '{0}'")]
    Conflict(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Parse `k=v[,k2=v2...]`; `==` is accepted as a synonym for `=`.
    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        let mut requirements = BTreeMap::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (k, v) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
                .ok_or_else(|| SelectorError::Malformed(term.to_string()))?;
            let (k, v) = (k.trim(), v.trim());
            if k.ends_with('!') {
                return Err(SelectorError::Malformed(term.to_string()));
            }
            if !LABEL_KEY.is_match(k) {
                return Err(SelectorError::InvalidKey(k.to_string()));
            }
            if !LABEL_VALUE.is_match(v) {
                return Err(SelectorError::InvalidValue(v.to_string()));
            }
            if let Some(prev) = requirements.insert(k.to_string(), v.to_string()) {
                if prev != v {
                    return Err(SelectorError::Conflict(k.to_string()));
                }
            }
        }
        Ok(Self { requirements })
    }

    pub fn from_map(requirements: BTreeMap<String, String>) -> Self {
        Self { requirements }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.requirements
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)).is_some_and(|have| have == v))
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.requirements {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn exact_match_only() {
        let sel = LabelSelector::parse("env=prod").unwrap();
        assert!(sel.matches(Some(&labels(&[("env", "prod"), ("tier", "web")]))));
        assert!(!sel.matches(Some(&labels(&[("env", "production")]))));
        assert!(!sel.matches(Some(&labels(&[("tier", "web")]))));
        assert!(!sel.matches(None));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel = LabelSelector::parse("").unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(None));
    }

    #[test]
    fn parses_multiple_terms_and_double_equals() {
        let sel: LabelSelector = "fleet.cattle.io/cluster==c1, env=prod".parse().unwrap();
        assert_eq!(sel.to_string(), "env=prod,fleet.cattle.io/cluster=c1");
    }

    #[test]
    fn rejects_unsupported_operators() {
        assert!(matches!(LabelSelector::parse("env!=prod"), Err(SelectorError::Malformed(_))));
        assert!(matches!(LabelSelector::parse("env"), Err(SelectorError::Malformed(_))));
        assert!(matches!(LabelSelector::parse("env=a,env=b"), Err(SelectorError::Conflict(_))));
        assert!(matches!(LabelSelector::parse("-bad=x"), Err(SelectorError::InvalidKey(_))));
    }
}
