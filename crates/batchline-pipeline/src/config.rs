use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use batchline_core::error::{EngineError, Result};
use batchline_core::stage_traits::ProcessorParams;
use batchline_core::worker::WorkerPoolConfig;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Per-item and per-batch tasks a full pipeline keeps in flight for one
/// batch: a preparation, an extraction and a skipped-item delivery per item,
/// plus three device stages and the batch's deliver node.
const TASKS_PER_ITEM: usize = 3;
const TASKS_PER_BATCH: usize = 4;

/// Largest accepted `batch_size`. The default executor count grows with it.
pub const MAX_BATCH_SIZE: usize = 256;
/// Largest accepted explicit `worker_threads`.
pub const MAX_WORKER_THREADS: usize = 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub config_schema_version: u32,
    /// Target batch size.
    pub batch_size: usize,
    /// Idle window before a partial batch is sealed. `0` disables forced
    /// sealing.
    pub batching_timeout_ms: u64,
    /// Device ordinal recorded in every worker context.
    pub device_id: u32,
    /// Executor count. Defaults to `3 * batch_size + 4`.
    pub worker_threads: Option<usize>,
    /// Bounded task queue length. Defaults to
    /// `worker_threads * (3 * batch_size + 4)`.
    pub queue_capacity: Option<usize>,
    /// When > 1, only every Nth non-EOS frame is inferred.
    pub infer_interval: u32,
    /// Infer per detected object instead of per frame.
    pub object_infer: bool,
    pub threshold: f32,
    pub custom_preproc_params: BTreeMap<String, String>,
    pub custom_postproc_params: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_schema_version: CONFIG_SCHEMA_VERSION,
            batch_size: 1,
            batching_timeout_ms: 3_000,
            device_id: 0,
            worker_threads: None,
            queue_capacity: None,
            infer_interval: 0,
            object_infer: false,
            threshold: 0.0,
            custom_preproc_params: BTreeMap::new(),
            custom_postproc_params: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|err| EngineError::Config(format!("Invalid engine config JSON: {err}")))?;

        let Some(version_value) = value.get("config_schema_version") else {
            return Err(EngineError::Config(format!(
                "Config schema mismatch: expected {}, got missing",
                CONFIG_SCHEMA_VERSION
            )));
        };
        let Some(version) = version_value.as_u64() else {
            return Err(EngineError::Config(format!(
                "Config schema mismatch: expected {}, got non-integer",
                CONFIG_SCHEMA_VERSION
            )));
        };
        if version != CONFIG_SCHEMA_VERSION as u64 {
            return Err(EngineError::Config(format!(
                "Config schema mismatch: expected {}, got {}",
                CONFIG_SCHEMA_VERSION, version
            )));
        }

        serde_json::from_value(value)
            .map_err(|err| EngineError::Config(format!("Invalid engine config JSON: {err}")))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Config(format!(
                "Failed to read engine config from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| EngineError::Config(format!("Failed to serialize engine config: {err}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.config_schema_version != CONFIG_SCHEMA_VERSION {
            return Err(EngineError::Config(format!(
                "Config schema mismatch: expected {}, got {}",
                CONFIG_SCHEMA_VERSION, self.config_schema_version
            )));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Config(
                "EngineConfig validation failed: batch_size must be >= 1".into(),
            ));
        }
        if self.batch_size > MAX_BATCH_SIZE {
            return Err(EngineError::Config(format!(
                "EngineConfig validation failed: batch_size must be <= {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.worker_threads == Some(0) {
            return Err(EngineError::Config(
                "EngineConfig validation failed: worker_threads must be >= 1".into(),
            ));
        }
        if let Some(threads) = self.worker_threads
            && threads > MAX_WORKER_THREADS
        {
            return Err(EngineError::Config(format!(
                "EngineConfig validation failed: worker_threads must be <= {MAX_WORKER_THREADS}, got {threads}"
            )));
        }
        if self.queue_capacity == Some(0) {
            return Err(EngineError::Config(
                "EngineConfig validation failed: queue_capacity must be >= 1".into(),
            ));
        }
        if !self.threshold.is_finite() {
            return Err(EngineError::Config(format!(
                "EngineConfig validation failed: threshold must be finite, got {}",
                self.threshold
            )));
        }
        Ok(())
    }

    /// `None` when forced sealing is disabled.
    pub fn batching_timeout(&self) -> Option<Duration> {
        (self.batching_timeout_ms > 0).then(|| Duration::from_millis(self.batching_timeout_ms))
    }

    /// Saturates instead of overflowing; `validate` bounds `batch_size` well
    /// below that point.
    fn tasks_per_batch(&self) -> usize {
        TASKS_PER_ITEM
            .saturating_mul(self.batch_size)
            .saturating_add(TASKS_PER_BATCH)
    }

    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| self.tasks_per_batch())
    }

    pub fn resolved_queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or_else(|| {
            self.resolved_worker_threads()
                .saturating_mul(self.tasks_per_batch())
        })
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            device_id: self.device_id,
            threads: self.resolved_worker_threads(),
            capacity: self.resolved_queue_capacity(),
        }
    }

    pub fn preproc_params(&self) -> ProcessorParams {
        ProcessorParams {
            threshold: self.threshold,
            custom: self.custom_preproc_params.clone(),
        }
    }

    pub fn postproc_params(&self) -> ProcessorParams {
        ProcessorParams {
            threshold: self.threshold,
            custom: self.custom_postproc_params.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().expect("default config should be valid");
        assert_eq!(config.batching_timeout(), Some(Duration::from_millis(3_000)));
    }

    #[test]
    fn sizing_follows_batch_size() {
        let config = EngineConfig {
            batch_size: 4,
            ..EngineConfig::default()
        };
        assert_eq!(config.resolved_worker_threads(), 16);
        assert_eq!(config.resolved_queue_capacity(), 16 * 16);

        let pinned = EngineConfig {
            batch_size: 4,
            worker_threads: Some(2),
            ..EngineConfig::default()
        };
        assert_eq!(pinned.resolved_queue_capacity(), 32);
        assert_eq!(pinned.worker_pool_config().threads, 2);
    }

    #[test]
    fn zero_timeout_disables_forced_sealing() {
        let config = EngineConfig {
            batching_timeout_ms: 0,
            ..EngineConfig::default()
        };
        assert!(config.batching_timeout().is_none());
    }

    #[test]
    fn validation_rejects_zero_batch() {
        let config = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().expect_err("batch_size 0 must fail");
        assert!(err.to_string().contains("batch_size must be >= 1"));
    }

    #[test]
    fn validation_bounds_batch_size_and_workers() {
        let config = EngineConfig {
            batch_size: MAX_BATCH_SIZE,
            ..EngineConfig::default()
        };
        config.validate().expect("largest batch is accepted");

        let config = EngineConfig {
            batch_size: MAX_BATCH_SIZE + 1,
            ..EngineConfig::default()
        };
        let err = config.validate().expect_err("oversized batch must fail");
        assert_eq!(err.error_code(), 100);
        assert!(err.to_string().contains("batch_size must be <="));

        let config = EngineConfig {
            worker_threads: Some(MAX_WORKER_THREADS + 1),
            ..EngineConfig::default()
        };
        let err = config.validate().expect_err("too many workers must fail");
        assert!(err.to_string().contains("worker_threads must be <="));
    }

    #[test]
    fn sizing_saturates_for_huge_batches() {
        let config = EngineConfig {
            batch_size: usize::MAX,
            ..EngineConfig::default()
        };
        assert_eq!(config.resolved_worker_threads(), usize::MAX);
        assert_eq!(config.resolved_queue_capacity(), usize::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_workers_and_capacity() {
        let config = EngineConfig {
            worker_threads: Some(0),
            ..EngineConfig::default()
        };
        let err = config.validate().expect_err("zero workers must fail");
        assert!(err.to_string().contains("worker_threads"));

        let config = EngineConfig {
            queue_capacity: Some(0),
            ..EngineConfig::default()
        };
        let err = config.validate().expect_err("zero capacity must fail");
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn validation_rejects_nan_threshold() {
        let config = EngineConfig {
            threshold: f32::NAN,
            ..EngineConfig::default()
        };
        let err = config.validate().expect_err("NaN threshold must fail");
        match err {
            EngineError::Config(message) => assert!(message.contains("threshold")),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn from_json_fills_defaults() {
        let raw = r#"{"config_schema_version":1,"batch_size":8,"object_infer":true}"#;
        let config = EngineConfig::from_json_str(raw).expect("config should parse");
        assert_eq!(config.batch_size, 8);
        assert!(config.object_infer);
        assert_eq!(config.batching_timeout_ms, 3_000);
    }

    #[test]
    fn from_json_rejects_missing_schema_version() {
        let raw = r#"{"batch_size":4}"#;
        let err = EngineConfig::from_json_str(raw).expect_err("missing schema must fail");
        assert!(err.to_string().contains("got missing"));
    }

    #[test]
    fn from_json_rejects_schema_version_mismatch() {
        let raw = format!(
            "{{\"config_schema_version\":{},\"batch_size\":4}}",
            CONFIG_SCHEMA_VERSION + 1
        );
        let err = EngineConfig::from_json_str(&raw).expect_err("mismatch schema must fail");
        assert!(err.to_string().contains("Config schema mismatch"));
    }

    #[test]
    fn from_json_rejects_non_integer_schema_version() {
        let raw = r#"{"config_schema_version":"one"}"#;
        let err = EngineConfig::from_json_str(raw).expect_err("string schema must fail");
        assert!(err.to_string().contains("non-integer"));
    }

    #[test]
    fn json_roundtrip_preserves_custom_params() {
        let mut config = EngineConfig::default();
        config
            .custom_postproc_params
            .insert("labels".into(), "coco.names".into());
        let json = config.to_json_pretty().expect("serialize");
        let parsed = EngineConfig::from_json_str(&json).expect("parse");
        assert_eq!(parsed, config);
        assert_eq!(
            parsed.postproc_params().custom.get("labels").map(String::as_str),
            Some("coco.names")
        );
    }
}
