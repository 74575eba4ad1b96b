//! Equality-based label selectors
//!
//! Matching for selector expressions of the form `k=v,k2!=v2,k3,!k4` against
//! a node's label map. This covers the equality subset of Kubernetes label
//! selectors, which is what the ignore policy consumes.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// A parsed label selector: every requirement must hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    /// `key=value` or `key==value`
    Eq(String, String),
    /// `key!=value`
    Ne(String, String),
    /// bare `key`
    Exists(String),
    /// `!key`
    NotExists(String),
}

impl Selector {
    /// Parse a comma-separated selector expression
    pub fn parse(expr: &str) -> Result<Selector> {
        let mut requirements = Vec::new();
        for term in expr.split(',') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_term(term)?);
        }
        if requirements.is_empty() {
            return Err(Error::config(
                "selector",
                format!("empty selector expression '{}'", expr),
            ));
        }
        Ok(Selector { requirements })
    }

    /// Whether every requirement holds against the given label map
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Eq(k, v) => labels.get(k) == Some(v),
            Requirement::Ne(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        })
    }
}

fn parse_term(term: &str) -> Result<Requirement> {
    if let Some((key, value)) = term.split_once("!=") {
        return requirement(key, |k| Requirement::Ne(k, value.trim().to_string()));
    }
    if let Some((key, value)) = term.split_once("==") {
        return requirement(key, |k| Requirement::Eq(k, value.trim().to_string()));
    }
    if let Some((key, value)) = term.split_once('=') {
        return requirement(key, |k| Requirement::Eq(k, value.trim().to_string()));
    }
    if let Some(key) = term.strip_prefix('!') {
        return requirement(key, Requirement::NotExists);
    }
    requirement(term, Requirement::Exists)
}

fn requirement(key: &str, build: impl FnOnce(String) -> Requirement) -> Result<Requirement> {
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::config("selector", "requirement with empty key"));
    }
    Ok(build(key.to_string()))
}
