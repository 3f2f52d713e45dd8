/// Configuration loading: optional JSON file, then environment overrides
use crate::config::types::{EngineConfig, Result, ScoreboxError};
use std::path::Path;

pub const ENV_POOL_MIN_WARM: &str = "SCOREBOX_POOL_MIN_WARM";
pub const ENV_POOL_MAX_SIZE: &str = "SCOREBOX_POOL_MAX_SIZE";
pub const ENV_WARMUP: &str = "SCOREBOX_WARMUP";
pub const ENV_TIMEOUT_SECS: &str = "SCOREBOX_TIMEOUT_SECS";

impl EngineConfig {
    /// Load configuration from a JSON file. Missing fields keep their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScoreboxError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_json::from_str(&content).map_err(|e| {
            ScoreboxError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Defaults plus process environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the recognized environment knobs using `lookup` as the source
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_POOL_MIN_WARM) {
            self.pool.min_warm = parse_number(ENV_POOL_MIN_WARM, &raw)?;
        }
        if let Some(raw) = lookup(ENV_POOL_MAX_SIZE) {
            self.pool.max_size = parse_number(ENV_POOL_MAX_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_WARMUP) {
            self.pool.warmup = parse_flag(ENV_WARMUP, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            let secs: f64 = raw.trim().parse().map_err(|_| {
                ScoreboxError::Config(format!("{} must be a number of seconds, got {:?}", ENV_TIMEOUT_SECS, raw))
            })?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ScoreboxError::Config(format!(
                    "{} must be positive, got {}",
                    ENV_TIMEOUT_SECS, raw
                )));
            }
            self.default_timeout_ms = (secs * 1000.0).round() as u64;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(ScoreboxError::Config("pool max_size must be at least 1".to_string()));
        }
        if self.pool.min_warm > self.pool.max_size {
            return Err(ScoreboxError::Config(format!(
                "pool min_warm ({}) exceeds max_size ({})",
                self.pool.min_warm, self.pool.max_size
            )));
        }
        if self.default_timeout_ms == 0 {
            return Err(ScoreboxError::Config("default timeout must be non-zero".to_string()));
        }
        if !self.isolation.interpreter.is_absolute() {
            return Err(ScoreboxError::Config(format!(
                "interpreter path must be absolute: {}",
                self.isolation.interpreter.display()
            )));
        }
        Ok(())
    }
}

fn parse_number(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|_| ScoreboxError::Config(format!("{} must be a non-negative integer, got {:?}", key, raw)))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Ok(true),
        "0" | "false" | "no" | "off" | "disabled" => Ok(false),
        _ => Err(ScoreboxError::Config(format!(
            "{} must be a boolean flag, got {:?}",
            key, raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_apply_all_four_knobs() {
        let mut cfg = EngineConfig::default();
        cfg.apply_env_overrides(lookup(&[
            (ENV_POOL_MIN_WARM, "0"),
            (ENV_POOL_MAX_SIZE, "16"),
            (ENV_WARMUP, "off"),
            (ENV_TIMEOUT_SECS, "2.5"),
        ]))
        .unwrap();
        assert_eq!(cfg.pool.min_warm, 0);
        assert_eq!(cfg.pool.max_size, 16);
        assert!(!cfg.pool.warmup);
        assert_eq!(cfg.default_timeout_ms, 2500);
        cfg.validate().unwrap();
    }

    #[test]
    fn garbage_env_values_are_config_errors() {
        let mut cfg = EngineConfig::default();
        assert!(cfg.apply_env_overrides(lookup(&[(ENV_POOL_MAX_SIZE, "lots")])).is_err());
        assert!(cfg.apply_env_overrides(lookup(&[(ENV_WARMUP, "maybe")])).is_err());
        assert!(cfg.apply_env_overrides(lookup(&[(ENV_TIMEOUT_SECS, "-1")])).is_err());
    }

    #[test]
    fn min_warm_above_max_size_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.pool.min_warm = 9;
        cfg.pool.max_size = 4;
        assert!(matches!(cfg.validate(), Err(ScoreboxError::Config(_))));
    }

    #[test]
    fn load_from_file_reads_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"default_timeout_ms": 1500, "pool": {{"reuse": "recycle"}}}}"#).unwrap();
        let cfg = EngineConfig::load_from_file(file.path()).unwrap();
        assert_eq!(cfg.default_timeout_ms, 1500);
        assert_eq!(cfg.pool.reuse, crate::config::types::ReusePolicy::Recycle);
    }

    #[test]
    fn load_from_missing_file_fails() {
        let result = EngineConfig::load_from_file("/nonexistent/scorebox.json");
        assert!(matches!(result, Err(ScoreboxError::Config(_))));
    }
}
