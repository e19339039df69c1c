// src/pipeline.rs
// Pipeline orchestrator: builds the stage chain and exposes feed/result

use crate::callbacks::Callbacks;
use crate::document::Document;
use crate::error::{PipestatError, Result};
use crate::operators::BuildContext;
use crate::options::PipelineOptions;
use crate::stage::{Flow, Stage};
use crate::{log_debug, log_info, log_warn};
use serde_json::Value as JsonValue;

/// A built pipeline with its per-stream state
///
/// ```rust
/// use pipestat_core::{Flow, Pipeline};
/// use serde_json::json;
///
/// let spec = json!([
///     {"$match": {"elapse": {"$gte": 1}}},
///     {"$limit": 1}
/// ]);
/// let mut pipeline = Pipeline::from_json(&spec).unwrap();
/// assert_eq!(pipeline.feed_json(&json!({"elapse": 0})).unwrap(), Flow::Continue);
/// assert_eq!(pipeline.feed_json(&json!({"elapse": 2})).unwrap(), Flow::Continue);
/// assert_eq!(pipeline.feed_json(&json!({"elapse": 3})).unwrap(), Flow::LimitReached);
/// assert_eq!(pipeline.result().unwrap().len(), 1);
/// ```
#[derive(Debug)]
pub struct Pipeline {
    head: Box<Stage>,
    limit_reached: bool,
    output: Option<Result<Vec<Document>>>,
}

/// Combines a specification with options and host callbacks
#[derive(Debug)]
pub struct PipelineBuilder<'a> {
    spec: &'a JsonValue,
    options: PipelineOptions,
    callbacks: Callbacks,
}

impl<'a> PipelineBuilder<'a> {
    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Validate the whole specification and build the stage chain
    pub fn build(self) -> Result<Pipeline> {
        self.options.validate()?;
        let stages_array = match self.spec {
            JsonValue::Array(stages) if stages.is_empty() => {
                return Err(PipestatError::InvalidPipeline(
                    "Pipeline cannot be empty".to_string(),
                ))
            }
            JsonValue::Array(stages) => stages,
            _ => {
                return Err(PipestatError::InvalidPipeline(
                    "Pipeline must be an array".to_string(),
                ))
            }
        };

        let ctx = BuildContext {
            callbacks: &self.callbacks,
            utc_offset: self.options.utc_offset()?,
        };
        let mut stages = Vec::with_capacity(stages_array.len());
        for stage_json in stages_array {
            stages.push(Stage::from_json(stage_json, &ctx, &self.options)?);
        }
        let names: Vec<&str> = stages.iter().map(Stage::name).collect();
        log_debug!("built pipeline with {} stages: {}", names.len(), names.join(" -> "));

        let head = Stage::chain(stages)
            .ok_or_else(|| PipestatError::InvalidPipeline("Pipeline cannot be empty".to_string()))?;
        Ok(Pipeline {
            head,
            limit_reached: false,
            output: None,
        })
    }
}

impl Pipeline {
    pub fn builder(spec: &JsonValue) -> PipelineBuilder<'_> {
        PipelineBuilder {
            spec,
            options: PipelineOptions::default(),
            callbacks: Callbacks::default(),
        }
    }

    /// Build with default options and no callbacks
    pub fn from_json(spec: &JsonValue) -> Result<Self> {
        Self::builder(spec).build()
    }

    /// Stage names from head to tail
    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut stage = Some(self.head.as_ref());
        while let Some(s) = stage {
            names.push(s.name());
            stage = s.next();
        }
        names
    }

    /// Whether a `$limit` has asked the caller to stop feeding
    pub fn is_limit_reached(&self) -> bool {
        self.limit_reached
    }

    /// Push one document into the head of the chain
    ///
    /// Once a `$limit` is reached, further documents are ignored and
    /// `LimitReached` is returned again. Feeding after [`Pipeline::result`]
    /// fails with [`PipestatError::Finished`].
    pub fn feed(&mut self, doc: Document) -> Result<Flow> {
        if self.output.is_some() {
            return Err(PipestatError::Finished);
        }
        if self.limit_reached {
            return Ok(Flow::LimitReached);
        }
        let flow = self.head.feed(doc).map_err(|e| {
            log_warn!("{}", e);
            e
        })?;
        if flow == Flow::LimitReached {
            self.limit_reached = true;
        }
        Ok(flow)
    }

    /// Push a JSON object; non-objects are rejected
    pub fn feed_json(&mut self, json: &JsonValue) -> Result<Flow> {
        self.feed(Document::from_json(json)?)
    }

    /// Drain the chain and return the final documents
    ///
    /// The first call drains buffering stages; later calls return the same
    /// documents, or the same error if draining failed.
    pub fn result(&mut self) -> Result<Vec<Document>> {
        if let Some(cached) = &self.output {
            return cached.clone();
        }
        let output = self.head.result();
        match &output {
            Ok(docs) => log_info!("pipeline produced {} documents", docs.len()),
            Err(e) => log_warn!("{}", e),
        }
        self.output = Some(output.clone());
        output
    }

    /// Feed every document until exhaustion or a reached limit, then drain
    pub fn run<I>(&mut self, documents: I) -> Result<Vec<Document>>
    where
        I: IntoIterator<Item = Document>,
    {
        for doc in documents {
            if self.feed(doc)? == Flow::LimitReached {
                break;
            }
        }
        self.result()
    }
}

/// One-shot evaluation of `spec` over JSON documents
pub fn pipestat<I>(documents: I, spec: &JsonValue) -> Result<Vec<Document>>
where
    I: IntoIterator<Item = JsonValue>,
{
    let mut pipeline = Pipeline::from_json(spec)?;
    for json in documents {
        if pipeline.feed(Document::try_from(json)?)? == Flow::LimitReached {
            break;
        }
    }
    pipeline.result()
}
