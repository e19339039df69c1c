// pipestat-core/src/lib.rs
// Streaming aggregation pipelines over in-memory documents

pub mod callbacks;
pub mod document;
pub mod error;
pub mod logging;
pub mod operators;
pub mod options;
pub mod pipeline;
pub mod stage;
pub mod value;

// Public exports
pub use callbacks::{Callbacks, GroupFn, MatchFn, ProjectFn};
pub use document::Document;
pub use error::{PipestatError, Result};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use options::PipelineOptions;
pub use pipeline::{pipestat, Pipeline, PipelineBuilder};
pub use stage::Flow;
pub use value::{Map, Value, ValueKind};
