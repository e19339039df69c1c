// src/options.rs
// Pipeline options: time zone handling and group limits

use crate::error::{PipestatError, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

/// Options applied to every stage of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineOptions {
    /// Fixed offset from UTC, in seconds, used to read wall-clock times in
    /// `$timestamp` and to compute date parts (`$year`, `$hour`, ...)
    pub utc_offset_seconds: i32,

    /// Maximum number of distinct `$group` buckets; `None` means unbounded
    pub max_group_buckets: Option<usize>,
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_utc_offset_seconds(mut self, seconds: i32) -> Self {
        self.utc_offset_seconds = seconds;
        self
    }

    pub fn with_max_group_buckets(mut self, max: usize) -> Self {
        self.max_group_buckets = Some(max);
        self
    }

    /// Options from a JSON object; unknown keys are rejected
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let options: PipelineOptions = serde_json::from_value(json.clone())?;
        options.validate()?;
        Ok(options)
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_seconds).ok_or_else(|| {
            PipestatError::InvalidPipeline(format!(
                "utc offset out of range: {} seconds",
                self.utc_offset_seconds
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.utc_offset()?;
        if self.max_group_buckets == Some(0) {
            return Err(PipestatError::InvalidPipeline(
                "max_group_buckets must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
