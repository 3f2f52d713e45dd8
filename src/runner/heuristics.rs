//! Built-in heuristic metrics.

use crate::protocol::ScoreRecord;
use crate::runner::catalog::{Catalog, MetricError, ScoreArgs, ScoringMetric};
use crate::runner::normalize::ScoreOutput;
use regex::Regex;
use serde_json::{Map, Value};

pub fn register_builtins(catalog: &mut Catalog) {
    catalog.register("Equals", Equals::build);
    catalog.register("Contains", Contains::build);
    catalog.register("RegexMatch", RegexMatch::build);
    catalog.register("IsJson", IsJson::build);
    catalog.register("LevenshteinRatio", LevenshteinRatio::build);
}

fn config_name(init: &Map<String, Value>, default: &str) -> Result<String, MetricError> {
    match init.get("name") {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(Value::String(name)) => Ok(name.clone()),
        Some(_) => Err(MetricError::InvalidConfig("'name' must be a string".to_string())),
    }
}

fn config_bool(init: &Map<String, Value>, key: &str, default: bool) -> Result<bool, MetricError> {
    match init.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(_) => Err(MetricError::InvalidConfig(format!("'{}' must be a boolean", key))),
    }
}

fn config_str<'a>(init: &'a Map<String, Value>, key: &str) -> Result<Option<&'a str>, MetricError> {
    match init.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.as_str())),
        Some(_) => Err(MetricError::InvalidConfig(format!("'{}' must be a string", key))),
    }
}

fn fold_case(text: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        text.to_string()
    } else {
        text.to_lowercase()
    }
}

fn verdict(name: &str, hit: bool, yes: &str, no: &str) -> ScoreOutput {
    let (value, reason) = if hit { (1.0, yes) } else { (0.0, no) };
    ScoreOutput::Single(ScoreRecord::new(name, value).with_reason(reason))
}

/// Exact match between output and reference
pub struct Equals {
    name: String,
    case_sensitive: bool,
}

impl Equals {
    fn build(init: &Map<String, Value>) -> Result<Box<dyn ScoringMetric>, MetricError> {
        Ok(Box::new(Self {
            name: config_name(init, "equals_metric")?,
            case_sensitive: config_bool(init, "case_sensitive", false)?,
        }))
    }
}

impl ScoringMetric for Equals {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, args: &ScoreArgs<'_>) -> Result<ScoreOutput, MetricError> {
        let output = args.required_str(&self.name, "output")?;
        let reference = args.required_str(&self.name, "reference")?;
        let hit = fold_case(output, self.case_sensitive) == fold_case(reference, self.case_sensitive);
        Ok(verdict(&self.name, hit, "Exact match", "No exact match"))
    }
}

/// Reference substring appears in the output
pub struct Contains {
    name: String,
    case_sensitive: bool,
    reference: Option<String>,
}

impl Contains {
    fn build(init: &Map<String, Value>) -> Result<Box<dyn ScoringMetric>, MetricError> {
        Ok(Box::new(Self {
            name: config_name(init, "contains_metric")?,
            case_sensitive: config_bool(init, "case_sensitive", false)?,
            reference: config_str(init, "reference")?.map(str::to_string),
        }))
    }
}

impl ScoringMetric for Contains {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, args: &ScoreArgs<'_>) -> Result<ScoreOutput, MetricError> {
        let output = args.required_str(&self.name, "output")?;
        let reference = match args.optional_str(&self.name, "reference")? {
            Some(reference) => reference,
            None => self
                .reference
                .as_deref()
                .ok_or_else(|| MetricError::MissingArgument("reference".to_string()))?,
        };
        if reference.is_empty() {
            return Err(MetricError::InvalidArgument("'reference' must not be empty".to_string()));
        }
        let hit = fold_case(output, self.case_sensitive).contains(&fold_case(reference, self.case_sensitive));
        Ok(verdict(&self.name, hit, "Reference found in output", "Reference not found in output"))
    }
}

/// Output matches a regular expression
pub struct RegexMatch {
    name: String,
    pattern: Regex,
}

impl RegexMatch {
    fn build(init: &Map<String, Value>) -> Result<Box<dyn ScoringMetric>, MetricError> {
        let source = config_str(init, "regex")?
            .ok_or_else(|| MetricError::InvalidConfig("'regex' is required".to_string()))?;
        let pattern = Regex::new(source)
            .map_err(|e| MetricError::InvalidConfig(format!("invalid regex: {}", e)))?;
        Ok(Box::new(Self {
            name: config_name(init, "regex_match_metric")?,
            pattern,
        }))
    }
}

impl ScoringMetric for RegexMatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, args: &ScoreArgs<'_>) -> Result<ScoreOutput, MetricError> {
        let output = args.required_str(&self.name, "output")?;
        let hit = self.pattern.is_match(output);
        Ok(verdict(&self.name, hit, "Regex matched", "Regex did not match"))
    }
}

/// Output parses as JSON
pub struct IsJson {
    name: String,
}

impl IsJson {
    fn build(init: &Map<String, Value>) -> Result<Box<dyn ScoringMetric>, MetricError> {
        Ok(Box::new(Self {
            name: config_name(init, "is_json_metric")?,
        }))
    }
}

impl ScoringMetric for IsJson {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, args: &ScoreArgs<'_>) -> Result<ScoreOutput, MetricError> {
        let output = args.required_str(&self.name, "output")?;
        let hit = serde_json::from_str::<Value>(output).is_ok();
        Ok(verdict(&self.name, hit, "Output is valid JSON", "Output is not valid JSON"))
    }
}

/// Indel similarity between output and reference
pub struct LevenshteinRatio {
    name: String,
    case_sensitive: bool,
}

impl LevenshteinRatio {
    fn build(init: &Map<String, Value>) -> Result<Box<dyn ScoringMetric>, MetricError> {
        Ok(Box::new(Self {
            name: config_name(init, "levenshtein_ratio_metric")?,
            case_sensitive: config_bool(init, "case_sensitive", false)?,
        }))
    }
}

impl ScoringMetric for LevenshteinRatio {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, args: &ScoreArgs<'_>) -> Result<ScoreOutput, MetricError> {
        let output = fold_case(args.required_str(&self.name, "output")?, self.case_sensitive);
        let reference = fold_case(args.required_str(&self.name, "reference")?, self.case_sensitive);
        Ok(ScoreOutput::Single(ScoreRecord::new(
            self.name.as_str(),
            indel_ratio(&output, &reference),
        )))
    }
}

/// 1 - indel_distance / (len_a + len_b), where indel distance counts only
/// insertions and deletions.
fn indel_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            row[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                row[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    let lcs = prev[b.len()];
    (2 * lcs) as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(metric_id: &str, init: Value, kwargs: Value) -> Result<Vec<ScoreRecord>, MetricError> {
        let factory = Catalog::builtin().resolve(metric_id).expect("registered");
        let init = init.as_object().cloned().unwrap_or_default();
        let kwargs = kwargs.as_object().cloned().unwrap_or_default();
        let metric = factory(&init)?;
        metric.score(&ScoreArgs::Keywords(&kwargs)).map(ScoreOutput::into_records)
    }

    #[test]
    fn equals_ignores_case_by_default() {
        let records = run("equals", json!({}), json!({"output": "Paris", "reference": "paris"})).unwrap();
        assert_eq!(records[0].value, 1.0);
        assert_eq!(records[0].name, "equals_metric");

        let records = run(
            "equals",
            json!({"case_sensitive": true, "name": "strict_eq"}),
            json!({"output": "Paris", "reference": "paris", "input": "ignored"}),
        )
        .unwrap();
        assert_eq!(records[0].value, 0.0);
        assert_eq!(records[0].name, "strict_eq");
    }

    #[test]
    fn contains_falls_back_to_configured_reference() {
        let records = run("contains", json!({"reference": "cat"}), json!({"output": "a Cat sat"})).unwrap();
        assert_eq!(records[0].value, 1.0);
        assert_eq!(
            run("contains", json!({}), json!({"output": "x"})),
            Err(MetricError::MissingArgument("reference".to_string()))
        );
    }

    #[test]
    fn regex_match_requires_a_valid_pattern() {
        let records = run("regex_match", json!({"regex": r"^\d{3}$"}), json!({"output": "123"})).unwrap();
        assert_eq!(records[0].value, 1.0);
        assert!(matches!(
            run("regex_match", json!({"regex": "("}), json!({"output": "x"})),
            Err(MetricError::InvalidConfig(_))
        ));
        assert!(matches!(
            run("regex_match", json!({}), json!({"output": "x"})),
            Err(MetricError::InvalidConfig(_))
        ));
    }

    #[test]
    fn is_json_checks_parseability() {
        assert_eq!(run("IsJson", json!({}), json!({"output": "{\"a\": 1}"})).unwrap()[0].value, 1.0);
        assert_eq!(run("IsJson", json!({}), json!({"output": "{a: 1}"})).unwrap()[0].value, 0.0);
    }

    #[test]
    fn indel_ratio_matches_known_values() {
        assert_eq!(indel_ratio("", ""), 1.0);
        assert_eq!(indel_ratio("abc", "abc"), 1.0);
        assert_eq!(indel_ratio("abc", ""), 0.0);
        let ratio = indel_ratio("kitten", "sitting");
        assert!((ratio - 8.0 / 13.0).abs() < 1e-9, "got {}", ratio);
    }
}
