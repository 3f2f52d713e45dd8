//! Registry of built-in metrics reachable by identifier.
//!
//! Identifiers are normalized once, when a metric is registered, so that
//! `LevenshteinRatio`, `levenshtein_ratio` and `levenshtein-ratio` all land on
//! the same entry. Lookups apply the same normalization to the requested id.

use crate::runner::heuristics;
use crate::runner::normalize::ScoreOutput;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while constructing or invoking a catalog metric
#[derive(Error, Debug, PartialEq)]
pub enum MetricError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing required argument '{0}'")]
    MissingArgument(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("metric '{0}' does not support thread-level scoring")]
    ThreadLevelUnsupported(String),
}

/// Arguments handed to a metric's scoring call
#[derive(Clone, Copy, Debug)]
pub enum ScoreArgs<'a> {
    /// Keyword-expanded fields
    Keywords(&'a Map<String, Value>),
    /// The whole payload as one positional structure
    Thread(&'a Map<String, Value>),
}

impl<'a> ScoreArgs<'a> {
    fn keywords(&self, metric: &str) -> Result<&'a Map<String, Value>, MetricError> {
        match self {
            ScoreArgs::Keywords(map) => Ok(map),
            ScoreArgs::Thread(_) => Err(MetricError::ThreadLevelUnsupported(metric.to_string())),
        }
    }

    pub fn required_str(&self, metric: &str, key: &str) -> Result<&'a str, MetricError> {
        match self.optional_str(metric, key)? {
            Some(text) => Ok(text),
            None => Err(MetricError::MissingArgument(key.to_string())),
        }
    }

    pub fn optional_str(&self, metric: &str, key: &str) -> Result<Option<&'a str>, MetricError> {
        match self.keywords(metric)?.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.as_str())),
            Some(_) => Err(MetricError::InvalidArgument(format!("'{}' must be a string", key))),
        }
    }
}

/// A trusted, pre-registered scoring implementation
pub trait ScoringMetric: Send + Sync {
    fn name(&self) -> &str;
    fn score(&self, args: &ScoreArgs<'_>) -> Result<ScoreOutput, MetricError>;
}

/// Builds a metric from its `init_config`
pub type MetricFactory = fn(&Map<String, Value>) -> Result<Box<dyn ScoringMetric>, MetricError>;

static BUILTIN: Lazy<Catalog> = Lazy::new(|| {
    let mut catalog = Catalog::new();
    heuristics::register_builtins(&mut catalog);
    catalog
});

#[derive(Default)]
pub struct Catalog {
    entries: HashMap<String, MetricFactory>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide catalog of heuristic metrics
    pub fn builtin() -> &'static Catalog {
        &BUILTIN
    }

    pub fn register(&mut self, metric_id: &str, factory: MetricFactory) {
        let key = normalize_metric_id(metric_id);
        if self.entries.insert(key.clone(), factory).is_some() {
            log::warn!("Catalog entry '{}' registered twice; keeping the later one", key);
        }
    }

    pub fn resolve(&self, metric_id: &str) -> Option<MetricFactory> {
        self.entries.get(&normalize_metric_id(metric_id)).copied()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Canonical catalog key: snake_case, word boundaries taken from CamelCase,
/// `-`, `_` and whitespace.
pub fn normalize_metric_id(metric_id: &str) -> String {
    let chars: Vec<char> = metric_id.trim().chars().collect();
    let mut key = String::with_capacity(chars.len() + 4);

    for (index, &c) in chars.iter().enumerate() {
        if c == '-' || c == '_' || c.is_whitespace() {
            if !key.is_empty() && !key.ends_with('_') {
                key.push('_');
            }
            continue;
        }

        if c.is_uppercase() {
            let prev = index.checked_sub(1).map(|i| chars[i]);
            let next = chars.get(index + 1);
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary && !key.is_empty() && !key.ends_with('_') {
                key.push('_');
            }
            key.extend(c.to_lowercase());
        } else {
            key.push(c);
        }
    }

    while key.ends_with('_') {
        key.pop();
    }
    key
}
