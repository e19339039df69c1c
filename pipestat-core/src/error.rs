// src/error.rs
// Error taxonomy: construction errors, runtime evaluation errors, misuse

use thiserror::Error;

/// Errors raised while building or running a pipeline
///
/// Construction errors (`InvalidPipeline`, `InvalidStage`, `InvalidOperator`) are
/// raised before any document is processed. `Evaluation` and `Callback` are raised
/// per document from `feed`/`result`. Reaching a `$limit` is not an error at all,
/// see [`crate::stage::Flow`].
#[derive(Error, Debug)]
pub enum PipestatError {
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Invalid stage {stage}: {message}")]
    InvalidStage { stage: String, message: String },

    #[error("Invalid operator {stage}:{operator} key={key}: {message}")]
    InvalidOperator {
        stage: &'static str,
        operator: String,
        key: String,
        message: String,
    },

    #[error("Evaluation failed in {stage}:{operator} key={key}: {message}")]
    Evaluation {
        stage: &'static str,
        operator: String,
        key: String,
        message: String,
    },

    #[error("Callback failed in {stage}:{operator} key={key}: {source}")]
    Callback {
        stage: &'static str,
        operator: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Pipeline already produced its result")]
    Finished,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipestatError {
    /// True for errors raised while parsing a pipeline specification
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            PipestatError::InvalidPipeline(_)
                | PipestatError::InvalidStage { .. }
                | PipestatError::InvalidOperator { .. }
        )
    }

    /// True for per-document evaluation failures
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            PipestatError::Evaluation { .. } | PipestatError::Callback { .. }
        )
    }

    pub(crate) fn invalid_stage(stage: &str, message: impl Into<String>) -> Self {
        PipestatError::InvalidStage {
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

/// Sources that cannot be cloned are carried over as their rendered message
impl Clone for PipestatError {
    fn clone(&self) -> Self {
        match self {
            PipestatError::InvalidPipeline(message) => PipestatError::InvalidPipeline(message.clone()),
            PipestatError::InvalidStage { stage, message } => PipestatError::InvalidStage {
                stage: stage.clone(),
                message: message.clone(),
            },
            PipestatError::InvalidOperator {
                stage,
                operator,
                key,
                message,
            } => PipestatError::InvalidOperator {
                stage,
                operator: operator.clone(),
                key: key.clone(),
                message: message.clone(),
            },
            PipestatError::Evaluation {
                stage,
                operator,
                key,
                message,
            } => PipestatError::Evaluation {
                stage,
                operator: operator.clone(),
                key: key.clone(),
                message: message.clone(),
            },
            PipestatError::Callback {
                stage,
                operator,
                key,
                source,
            } => PipestatError::Callback {
                stage,
                operator: operator.clone(),
                key: key.clone(),
                source: anyhow::anyhow!("{:#}", source),
            },
            PipestatError::Finished => PipestatError::Finished,
            PipestatError::Serialization(e) => {
                PipestatError::Serialization(serde::de::Error::custom(e.to_string()))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PipestatError>;
