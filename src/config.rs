use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;

use crate::normalizer::client::ScoreChangePolicy;
use crate::normalizer::updater::UpdateLimits;

#[derive(Debug, Clone)]
pub struct RenormalizerConfig {
    pub scoring_binary: PathBuf,
    pub tmp_dir: Option<PathBuf>,

    pub default_window_days: u64,
    pub default_min_buckets: u64,
    pub max_units_per_chunk: usize,
    pub page_size: usize,

    pub min_score_delta: f64,
    pub min_score_ratio: f64,

    pub length_encoded_input: bool,
    pub coalesce_queued: bool,
}

impl Default for RenormalizerConfig {
    fn default() -> Self {
        Self {
            scoring_binary: PathBuf::from("normalize"),
            tmp_dir: None,
            default_window_days: 30,
            default_min_buckets: 100,
            max_units_per_chunk: 100_000,
            page_size: 10_000,
            min_score_delta: 1.0,
            min_score_ratio: 0.5,
            length_encoded_input: false,
            coalesce_queued: false,
        }
    }
}

impl RenormalizerConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let scoring_binary = PathBuf::from(env_string(
            "RENORM_SCORING_BINARY",
            Some(defaults.scoring_binary.display().to_string()),
        )?);
        let tmp_dir = env_optional("RENORM_TMP_DIR").map(PathBuf::from);

        let default_window_days =
            env_u64("RENORM_DEFAULT_WINDOW_DAYS", Some(defaults.default_window_days))?;
        let default_min_buckets =
            env_u64("RENORM_DEFAULT_MIN_BUCKETS", Some(defaults.default_min_buckets))?;
        let max_units_per_chunk = env_u64(
            "RENORM_MAX_UNITS_PER_CHUNK",
            Some(defaults.max_units_per_chunk as u64),
        )? as usize;
        let page_size = env_u64("RENORM_PAGE_SIZE", Some(defaults.page_size as u64))? as usize;
        if max_units_per_chunk == 0 || page_size == 0 {
            return Err(anyhow!(
                "RENORM_MAX_UNITS_PER_CHUNK and RENORM_PAGE_SIZE must be positive"
            ));
        }

        let min_score_delta = env_f64("RENORM_MIN_SCORE_DELTA", Some(defaults.min_score_delta))?;
        let min_score_ratio = env_f64("RENORM_MIN_SCORE_RATIO", Some(defaults.min_score_ratio))?;

        let length_encoded_input = env_bool("RENORM_LENGTH_ENCODED_INPUT", false)?;
        let coalesce_queued = env_bool("RENORM_COALESCE_QUEUED", false)?;

        Ok(Self {
            scoring_binary,
            tmp_dir,
            default_window_days,
            default_min_buckets,
            max_units_per_chunk,
            page_size,
            min_score_delta,
            min_score_ratio,
            length_encoded_input,
            coalesce_queued,
        })
    }

    pub fn score_change_policy(&self) -> ScoreChangePolicy {
        ScoreChangePolicy {
            min_absolute_delta: self.min_score_delta,
            min_relative_ratio: self.min_score_ratio,
        }
    }

    pub fn update_limits(&self) -> UpdateLimits {
        UpdateLimits {
            default_window_days: self.default_window_days,
            default_min_buckets: self.default_min_buckets,
            max_units_per_chunk: self.max_units_per_chunk,
            page_size: self.page_size,
        }
    }
}

/// Per-job values that come from the job's own configuration rather than the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRenormalizationSettings {
    pub job_id: String,
    pub bucket_span_seconds: u64,
    pub renormalization_window_days: Option<u64>,
    pub per_partition: bool,
}

impl JobRenormalizationSettings {
    pub fn new(job_id: impl Into<String>, bucket_span_seconds: u64) -> Self {
        Self {
            job_id: job_id.into(),
            bucket_span_seconds,
            renormalization_window_days: None,
            per_partition: false,
        }
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env_optional(key) {
        Some(raw) => raw.parse::<u64>().with_context(|| format!("invalid {key}")),
        None => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: Option<f64>) -> Result<f64> {
    match env_optional(key) {
        Some(raw) => {
            let value = raw.parse::<f64>().with_context(|| format!("invalid {key}"))?;
            if !value.is_finite() || value < 0.0 {
                return Err(anyhow!("invalid {key}: must be a non-negative number"));
            }
            Ok(value)
        }
        None => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env_optional(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("invalid {key}: expected a boolean")),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns its variable names so parallel tests never race on the environment.

    #[test]
    fn env_u64_parses_and_falls_back() {
        env::set_var("RENORM_TEST_U64_SET", " 42 ");
        assert_eq!(env_u64("RENORM_TEST_U64_SET", Some(1)).unwrap(), 42);
        assert_eq!(env_u64("RENORM_TEST_U64_UNSET", Some(7)).unwrap(), 7);
        assert!(env_u64("RENORM_TEST_U64_UNSET", None).is_err());

        env::set_var("RENORM_TEST_U64_BAD", "many");
        let err = env_u64("RENORM_TEST_U64_BAD", Some(1)).unwrap_err();
        assert!(err.to_string().contains("RENORM_TEST_U64_BAD"));
    }

    #[test]
    fn env_f64_rejects_negative_values() {
        env::set_var("RENORM_TEST_F64_OK", "0.25");
        assert_eq!(env_f64("RENORM_TEST_F64_OK", None).unwrap(), 0.25);
        env::set_var("RENORM_TEST_F64_NEG", "-1");
        assert!(env_f64("RENORM_TEST_F64_NEG", Some(1.0)).is_err());
    }

    #[test]
    fn env_bool_accepts_common_spellings() {
        env::set_var("RENORM_TEST_BOOL_YES", "Yes");
        env::set_var("RENORM_TEST_BOOL_ZERO", "0");
        env::set_var("RENORM_TEST_BOOL_BAD", "maybe");
        assert!(env_bool("RENORM_TEST_BOOL_YES", false).unwrap());
        assert!(!env_bool("RENORM_TEST_BOOL_ZERO", true).unwrap());
        assert!(env_bool("RENORM_TEST_BOOL_UNSET", true).unwrap());
        assert!(env_bool("RENORM_TEST_BOOL_BAD", false).is_err());
    }

    #[test]
    fn blank_values_count_as_unset() {
        env::set_var("RENORM_TEST_BLANK", "   ");
        assert_eq!(env_optional("RENORM_TEST_BLANK"), None);
        assert_eq!(env_u64("RENORM_TEST_BLANK", Some(3)).unwrap(), 3);
    }

    #[test]
    fn defaults_map_to_policy_and_limits() {
        let config = RenormalizerConfig::default();
        let policy = config.score_change_policy();
        assert_eq!(policy.min_absolute_delta, 1.0);
        assert_eq!(policy.min_relative_ratio, 0.5);

        let limits = config.update_limits();
        assert_eq!(limits.default_window_days, 30);
        assert_eq!(limits.default_min_buckets, 100);
        assert_eq!(limits.max_units_per_chunk, 100_000);
        assert_eq!(limits.page_size, 10_000);
    }
}
