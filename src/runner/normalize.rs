//! Score output normalization.
//!
//! Implementations may return one record, an ordered sequence of records, or
//! nothing at all. Everything downstream sees an ordered `Vec<ScoreRecord>`.

use crate::protocol::ScoreRecord;
use serde_json::Value;

/// Raw output of a scoring implementation
#[derive(Clone, Debug, PartialEq)]
pub enum ScoreOutput {
    Single(ScoreRecord),
    Many(Vec<ScoreRecord>),
    Empty,
}

impl ScoreOutput {
    pub fn into_records(self) -> Vec<ScoreRecord> {
        match self {
            ScoreOutput::Single(record) => vec![record],
            ScoreOutput::Many(records) => records,
            ScoreOutput::Empty => Vec::new(),
        }
    }

    /// Interpret a JSON value produced by a guest interpreter
    pub fn from_json(value: Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(ScoreOutput::Empty),
            Value::Array(items) => {
                let records = items
                    .into_iter()
                    .enumerate()
                    .map(|(index, item)| {
                        record_from_json(item).map_err(|e| format!("score at index {}: {}", index, e))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if records.is_empty() {
                    Ok(ScoreOutput::Empty)
                } else {
                    Ok(ScoreOutput::Many(records))
                }
            }
            other => record_from_json(other).map(ScoreOutput::Single),
        }
    }
}

fn record_from_json(value: Value) -> Result<ScoreRecord, String> {
    let Value::Object(fields) = value else {
        return Err(format!("expected a score result object, got {}", type_name(&value)));
    };

    let name = match fields.get("name") {
        Some(Value::String(name)) => name.clone(),
        Some(other) => return Err(format!("score name must be a string, got {}", type_name(other))),
        None => return Err("score result has no name".to_string()),
    };
    let value = match fields.get("value") {
        Some(Value::Number(number)) => number
            .as_f64()
            .ok_or_else(|| format!("score value {} is not representable", number))?,
        // Pass/fail metrics return booleans
        Some(Value::Bool(hit)) => {
            if *hit {
                1.0
            } else {
                0.0
            }
        }
        Some(other) => {
            return Err(format!(
                "score value for '{}' must be a number, got {}",
                name,
                type_name(other)
            ))
        }
        None => return Err(format!("score result '{}' has no value", name)),
    };

    Ok(ScoreRecord {
        name,
        value,
        reason: optional_text(fields.get("reason")),
        category_name: optional_text(fields.get("category_name")),
    })
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_object_becomes_one_record() {
        let output = ScoreOutput::from_json(json!({"name": "m", "value": 1, "reason": "ok"})).unwrap();
        let records = output.into_records();
        assert_eq!(records, vec![ScoreRecord::new("m", 1.0).with_reason("ok")]);
    }

    #[test]
    fn list_order_is_preserved() {
        let output = ScoreOutput::from_json(json!([
            {"name": "first", "value": 0.1},
            {"name": "second", "value": 0.2, "category_name": "tone"}
        ]))
        .unwrap();
        let records = output.into_records();
        assert_eq!(records[0].name, "first");
        assert_eq!(records[1].name, "second");
        assert_eq!(records[1].category_name.as_deref(), Some("tone"));
    }

    #[test]
    fn null_and_empty_list_are_empty() {
        assert_eq!(ScoreOutput::from_json(Value::Null).unwrap(), ScoreOutput::Empty);
        assert_eq!(ScoreOutput::from_json(json!([])).unwrap(), ScoreOutput::Empty);
        assert!(ScoreOutput::Empty.into_records().is_empty());
    }

    #[test]
    fn boolean_values_score_as_one_or_zero() {
        let records = ScoreOutput::from_json(json!([
            {"name": "passed", "value": true},
            {"name": "failed", "value": false}
        ]))
        .unwrap()
        .into_records();
        assert_eq!(records[0].value, 1.0);
        assert_eq!(records[1].value, 0.0);
    }

    #[test]
    fn malformed_records_are_described() {
        let err = ScoreOutput::from_json(json!({"name": "m", "value": "high"})).unwrap_err();
        assert!(err.contains("must be a number"));
        let err = ScoreOutput::from_json(json!([{"name": "a", "value": 1}, 3])).unwrap_err();
        assert!(err.contains("index 1"));
        let err = ScoreOutput::from_json(json!({"value": 1})).unwrap_err();
        assert!(err.contains("no name"));
    }
}
