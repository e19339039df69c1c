// src/stage.rs
//! Pipeline stages
//!
//! Stages form a singly linked chain. `feed` pushes one document into a stage,
//! which forwards zero or more documents to its successor (or to its own
//! output buffer when it is the tail). `$sort` and `$group` hold documents
//! back until `result` drains them.
//!
//! A `$limit` that has passed its quota answers [`Flow::LimitReached`]; the
//! signal travels back through every upstream `feed` as a return value.

use crate::document::Document;
use crate::error::{PipestatError, Result};
use crate::operators::group_ops::{AccState, GroupSpec};
use crate::operators::match_ops::MatchExpr;
use crate::operators::project_ops::{is_exclude_flag, ProjectExpr};
use crate::operators::{ref_path, BuildContext, Scope};
use crate::options::PipelineOptions;
use crate::value::Value;
use crate::{log_debug, log_trace};
use ahash::AHashMap;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

/// Outcome of feeding one document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep feeding
    Continue,
    /// A `$limit` quota is met; stop feeding and call `result`
    LimitReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// `$project` in one of its two modes
#[derive(Debug, Clone)]
pub enum Projection {
    Include(Vec<(String, ProjectExpr)>),
    Exclude(Vec<String>),
}

/// Stage kind and its per-stream state
#[derive(Debug)]
pub enum StageOp {
    Match(MatchExpr),
    Project(Projection),
    Group {
        spec: GroupSpec,
        buckets: AHashMap<String, (Value, Vec<AccState>)>,
        max_buckets: Option<usize>,
    },
    Sort {
        keys: Vec<(String, SortDirection)>,
        buffer: Vec<Document>,
    },
    Skip { count: usize, seen: usize },
    Limit { count: usize, passed: usize },
    Unwind { path: String },
}

/// One link of the stage chain
#[derive(Debug)]
pub struct Stage {
    op: StageOp,
    next: Option<Box<Stage>>,
    /// Documents reaching the end of the chain
    output: Vec<Document>,
    flushed: bool,
}

impl Stage {
    /// Parse a single-key stage object such as `{"$limit": 10}`
    pub fn from_json(stage_json: &JsonValue, ctx: &BuildContext<'_>, options: &PipelineOptions) -> Result<Self> {
        let obj = stage_json
            .as_object()
            .ok_or_else(|| PipestatError::InvalidPipeline("Stage must be an object".to_string()))?;
        let mut entries = obj.iter();
        let (stage_name, stage_spec) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(PipestatError::InvalidPipeline(
                    "Each stage must have exactly one operator".to_string(),
                ))
            }
        };

        let op = match stage_name.as_str() {
            "$match" => StageOp::Match(MatchExpr::parse(stage_spec, ctx)?),
            "$project" => StageOp::Project(parse_projection(stage_spec, ctx)?),
            "$group" => StageOp::Group {
                spec: GroupSpec::parse(stage_spec, ctx)?,
                buckets: AHashMap::new(),
                max_buckets: options.max_group_buckets,
            },
            "$sort" => StageOp::Sort {
                keys: parse_sort_keys(stage_spec)?,
                buffer: Vec::new(),
            },
            "$skip" => StageOp::Skip {
                count: parse_count("$skip", stage_spec)?,
                seen: 0,
            },
            "$limit" => StageOp::Limit {
                count: parse_count("$limit", stage_spec)?,
                passed: 0,
            },
            "$unwind" => StageOp::Unwind {
                path: parse_unwind_path(stage_spec)?,
            },
            other => return Err(PipestatError::invalid_stage(other, "Unknown pipeline stage")),
        };
        log_trace!("built {} stage from {}", stage_name, stage_spec);

        Ok(Stage {
            op,
            next: None,
            output: Vec::new(),
            flushed: false,
        })
    }

    /// Link stages in order and return the head
    pub fn chain(stages: Vec<Stage>) -> Option<Box<Stage>> {
        let mut head: Option<Box<Stage>> = None;
        for mut stage in stages.into_iter().rev() {
            stage.next = head;
            head = Some(Box::new(stage));
        }
        head
    }

    pub fn name(&self) -> &'static str {
        match self.op {
            StageOp::Match(_) => "$match",
            StageOp::Project(_) => "$project",
            StageOp::Group { .. } => "$group",
            StageOp::Sort { .. } => "$sort",
            StageOp::Skip { .. } => "$skip",
            StageOp::Limit { .. } => "$limit",
            StageOp::Unwind { .. } => "$unwind",
        }
    }

    pub fn next(&self) -> Option<&Stage> {
        self.next.as_deref()
    }

    /// Push one document through this stage
    pub fn feed(&mut self, doc: Document) -> Result<Flow> {
        let Stage { op, next, output, .. } = self;
        match op {
            StageOp::Match(expr) => {
                if expr.matches(&doc)? {
                    return emit(next, output, doc);
                }
                Ok(Flow::Continue)
            }

            StageOp::Project(projection) => {
                let projected = project(projection, doc)?;
                emit(next, output, projected)
            }

            StageOp::Group {
                spec,
                buckets,
                max_buckets,
            } => {
                let (key, id) = spec.key(&doc)?;
                if !buckets.contains_key(&key) {
                    if let Some(cap) = *max_buckets {
                        if buckets.len() >= cap {
                            return Err(Scope::new("$group", "_id")
                                .evaluation("$group", format!("more than {} distinct groups", cap)));
                        }
                    }
                    buckets.insert(key.clone(), (id, spec.init()));
                }
                if let Some((_, states)) = buckets.get_mut(&key) {
                    spec.accumulate(states, &doc)?;
                }
                Ok(Flow::Continue)
            }

            StageOp::Sort { keys, buffer } => {
                // Upper bound keeps equal keys in feed order
                let pos = buffer.partition_point(|d| compare_docs(keys, d, &doc) != Ordering::Greater);
                buffer.insert(pos, doc);
                Ok(Flow::Continue)
            }

            StageOp::Skip { count, seen } => {
                if *seen < *count {
                    *seen += 1;
                    return Ok(Flow::Continue);
                }
                emit(next, output, doc)
            }

            StageOp::Limit { count, passed } => {
                if *passed < *count {
                    *passed += 1;
                    return emit(next, output, doc);
                }
                log_debug!("$limit reached after {} documents", count);
                Ok(Flow::LimitReached)
            }

            StageOp::Unwind { path } => match doc.get(path) {
                Value::Missing => Ok(Flow::Continue),
                Value::Array(items) => {
                    for item in items {
                        let mut copy = doc.clone();
                        copy.set(path, item);
                        if emit(next, output, copy)? == Flow::LimitReached {
                            return Ok(Flow::LimitReached);
                        }
                    }
                    Ok(Flow::Continue)
                }
                other => Err(Scope::new("$unwind", path).evaluation(
                    "$unwind",
                    format!("value is not an array, got {}", other.kind().name()),
                )),
            },
        }
    }

    /// Drain buffering stages and return the documents at the end of the chain
    ///
    /// Draining happens once. A failure part way leaves the chain half drained,
    /// so [`crate::Pipeline::result`] caches the error for later calls.
    pub fn result(&mut self) -> Result<Vec<Document>> {
        if !self.flushed {
            self.flushed = true;
            let Stage { op, next, output, .. } = self;
            let pending = match op {
                StageOp::Group { spec, buckets, .. } => {
                    log_debug!("$group finalizing {} buckets", buckets.len());
                    std::mem::take(buckets)
                        .into_iter()
                        .map(|(_, (id, states))| spec.finalize(id, states))
                        .collect()
                }
                StageOp::Sort { buffer, .. } => std::mem::take(buffer),
                _ => Vec::new(),
            };
            for doc in pending {
                if emit(next, output, doc)? == Flow::LimitReached {
                    break;
                }
            }
        }
        match self.next.as_mut() {
            Some(next) => next.result(),
            None => Ok(self.output.clone()),
        }
    }
}

fn emit(next: &mut Option<Box<Stage>>, output: &mut Vec<Document>, doc: Document) -> Result<Flow> {
    match next {
        Some(stage) => stage.feed(doc),
        None => {
            output.push(doc);
            Ok(Flow::Continue)
        }
    }
}

fn project(projection: &Projection, doc: Document) -> Result<Document> {
    match projection {
        Projection::Include(fields) => {
            let mut out = Document::new();
            for (key, expr) in fields {
                let value = expr.eval(&doc, Scope::new("$project", key))?;
                if !value.is_missing() {
                    out.insert(key.clone(), value);
                }
            }
            Ok(out)
        }
        Projection::Exclude(paths) => {
            let mut out = doc;
            for path in paths {
                out.delete(path);
            }
            Ok(out)
        }
    }
}

fn compare_docs(keys: &[(String, SortDirection)], a: &Document, b: &Document) -> Ordering {
    for (path, direction) in keys {
        let ord = a.get(path).compare(&b.get(path));
        let ord = match direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

// ============================================================================
// STAGE PARAMETER PARSING
// ============================================================================

fn parse_projection(spec: &JsonValue, ctx: &BuildContext<'_>) -> Result<Projection> {
    let obj = spec
        .as_object()
        .filter(|obj| !obj.is_empty())
        .ok_or_else(|| PipestatError::invalid_stage("$project", "$project must be a non-empty object"))?;

    let excluded: Vec<String> = obj
        .iter()
        .filter(|(_, value)| is_exclude_flag(value))
        .map(|(key, _)| key.clone())
        .collect();
    if !excluded.is_empty() {
        if excluded.len() != obj.len() {
            return Err(PipestatError::invalid_stage(
                "$project",
                "cannot mix inclusion and exclusion in one projection",
            ));
        }
        return Ok(Projection::Exclude(excluded));
    }

    let mut fields = Vec::with_capacity(obj.len());
    for (key, value) in obj {
        if key.starts_with('$') {
            return Err(PipestatError::invalid_stage(
                "$project",
                format!("output key '{}' must not start with '$'", key),
            ));
        }
        let expr = ProjectExpr::parse_field(value, Scope::new("$project", key), ctx)?;
        fields.push((key.clone(), expr));
    }
    Ok(Projection::Include(fields))
}

fn parse_direction(value: &JsonValue) -> Result<SortDirection> {
    match value.as_i64() {
        Some(1) => Ok(SortDirection::Ascending),
        Some(-1) => Ok(SortDirection::Descending),
        _ => Err(PipestatError::invalid_stage(
            "$sort",
            format!("Sort direction must be 1 or -1, got {}", value),
        )),
    }
}

/// `[[path, dir], ...]` or `{path: dir, ...}`
fn parse_sort_keys(spec: &JsonValue) -> Result<Vec<(String, SortDirection)>> {
    let keys = match spec {
        JsonValue::Array(pairs) => {
            let mut keys = Vec::with_capacity(pairs.len());
            for pair in pairs {
                let (path, dir) = match pair.as_array().map(Vec::as_slice) {
                    Some([JsonValue::String(path), dir]) => (path, dir),
                    _ => {
                        return Err(PipestatError::invalid_stage(
                            "$sort",
                            format!("invalid sort key {}, expected [path, direction]", pair),
                        ))
                    }
                };
                keys.push((path.clone(), parse_direction(dir)?));
            }
            keys
        }
        JsonValue::Object(obj) => {
            let mut keys = Vec::with_capacity(obj.len());
            for (path, dir) in obj {
                keys.push((path.clone(), parse_direction(dir)?));
            }
            keys
        }
        _ => {
            return Err(PipestatError::invalid_stage(
                "$sort",
                "$sort must be an array of [path, direction] pairs or an object",
            ))
        }
    };
    if keys.is_empty() {
        return Err(PipestatError::invalid_stage("$sort", "$sort requires at least one key"));
    }
    Ok(keys)
}

fn parse_count(stage: &str, spec: &JsonValue) -> Result<usize> {
    spec.as_u64().map(|n| n as usize).ok_or_else(|| {
        PipestatError::invalid_stage(stage, format!("{} must be a non-negative integer", stage))
    })
}

/// `"$path"` or `{"path": "$path"}`
fn parse_unwind_path(spec: &JsonValue) -> Result<String> {
    let target = match spec {
        JsonValue::Object(obj) => obj.get("path"),
        other => Some(other),
    };
    target
        .and_then(ref_path)
        .map(str::to_string)
        .ok_or_else(|| PipestatError::invalid_stage("$unwind", "path must be a field reference starting with '$'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::Callbacks;
    use chrono::FixedOffset;
    use serde_json::json;

    fn build(specs: &[JsonValue], options: &PipelineOptions) -> Result<Box<Stage>> {
        let callbacks = Callbacks::new();
        let ctx = BuildContext {
            callbacks: &callbacks,
            utc_offset: FixedOffset::east_opt(0).unwrap(),
        };
        let mut stages = Vec::new();
        for spec in specs {
            stages.push(Stage::from_json(spec, &ctx, options)?);
        }
        Ok(Stage::chain(stages).unwrap())
    }

    fn chain(specs: &[JsonValue]) -> Box<Stage> {
        build(specs, &PipelineOptions::default()).unwrap()
    }

    fn doc(json: JsonValue) -> Document {
        Document::from_json(&json).unwrap()
    }

    fn to_json(docs: Vec<Document>) -> Vec<JsonValue> {
        docs.iter().map(Document::to_json).collect()
    }

    #[test]
    fn test_stage_shape_errors() {
        let options = PipelineOptions::default();
        assert!(build(&[json!("x")], &options).is_err());
        assert!(build(&[json!({"$match": {}, "$limit": 1})], &options).is_err());
        let err = build(&[json!({"$bogus": 1})], &options).unwrap_err();
        assert!(err.to_string().contains("Unknown pipeline stage"));
        assert!(build(&[json!({"$limit": -1})], &options).unwrap_err().is_construction());
        assert!(build(&[json!({"$sort": [["a", 2]]})], &options).unwrap_err().is_construction());
        assert!(build(&[json!({"$sort": []})], &options).unwrap_err().is_construction());
        assert!(build(&[json!({"$unwind": "tags"})], &options).unwrap_err().is_construction());
        assert!(build(&[json!({"$project": {"a": 1, "b": 0}})], &options).unwrap_err().is_construction());
        assert!(build(&[json!({"$project": {}})], &options).unwrap_err().is_construction());
    }

    #[test]
    fn test_chain_names() {
        let head = chain(&[json!({"$match": {}}), json!({"$skip": 1}), json!({"$limit": 1})]);
        assert_eq!(head.name(), "$match");
        let second = head.next().unwrap();
        assert_eq!(second.name(), "$skip");
        assert_eq!(second.next().unwrap().name(), "$limit");
    }

    #[test]
    fn test_match_then_project() {
        let mut head = chain(&[
            json!({"$match": {"elapse": {"$gte": 1, "$lt": 4}}}),
            json!({"$project": {"app": 1, "fast": {"$subtract": [4, "$elapse"]}}}),
        ]);
        for d in [json!({"app": "a", "elapse": 3}), json!({"app": "b", "elapse": 9})] {
            assert_eq!(head.feed(doc(d)).unwrap(), Flow::Continue);
        }
        assert_eq!(to_json(head.result().unwrap()), vec![json!({"app": "a", "fast": 1})]);
    }

    #[test]
    fn test_exclusion_projection() {
        let mut head = chain(&[json!({"$project": {"secret": 0, "meta.internal": false}})]);
        head.feed(doc(json!({"a": 1, "secret": 2, "meta": {"internal": 3, "keep": 4}}))).unwrap();
        assert_eq!(to_json(head.result().unwrap()), vec![json!({"a": 1, "meta": {"keep": 4}})]);
    }

    #[test]
    fn test_sort_is_stable() {
        let mut head = chain(&[json!({"$sort": [["k", 1]]})]);
        for (k, tag) in [(2, "a"), (1, "b"), (2, "c"), (1, "d")] {
            head.feed(doc(json!({"k": k, "tag": tag}))).unwrap();
        }
        let tags: Vec<JsonValue> = head.result().unwrap().iter().map(|d| d.get("tag").to_json()).collect();
        assert_eq!(tags, vec![json!("b"), json!("d"), json!("a"), json!("c")]);
    }

    #[test]
    fn test_sort_multi_key_descending() {
        let mut head = chain(&[json!({"$sort": {"a": -1, "b": 1}})]);
        for (a, b) in [(1, 2), (2, 9), (1, 1), (2, 3)] {
            head.feed(doc(json!({"a": a, "b": b}))).unwrap();
        }
        assert_eq!(
            to_json(head.result().unwrap()),
            vec![
                json!({"a": 2, "b": 3}),
                json!({"a": 2, "b": 9}),
                json!({"a": 1, "b": 1}),
                json!({"a": 1, "b": 2}),
            ]
        );
    }

    #[test]
    fn test_skip_and_limit() {
        let mut head = chain(&[json!({"$skip": 1}), json!({"$limit": 2})]);
        let flows: Vec<Flow> = (0..4).map(|i| head.feed(doc(json!({"i": i}))).unwrap()).collect();
        assert_eq!(flows, vec![Flow::Continue, Flow::Continue, Flow::Continue, Flow::LimitReached]);
        assert_eq!(to_json(head.result().unwrap()), vec![json!({"i": 1}), json!({"i": 2})]);
    }

    #[test]
    fn test_limit_below_sort_drains_buffer_on_result() {
        let mut head = chain(&[json!({"$sort": [["i", -1]]}), json!({"$limit": 2})]);
        for i in 0..5 {
            assert_eq!(head.feed(doc(json!({"i": i}))).unwrap(), Flow::Continue);
        }
        assert_eq!(to_json(head.result().unwrap()), vec![json!({"i": 4}), json!({"i": 3})]);
        // Drained once
        assert_eq!(head.result().unwrap().len(), 2);
    }

    #[test]
    fn test_unwind() {
        let mut head = chain(&[json!({"$unwind": "$tags"})]);
        head.feed(doc(json!({"app": "x", "tags": ["t1", "t2"]}))).unwrap();
        head.feed(doc(json!({"app": "y"}))).unwrap();
        head.feed(doc(json!({"app": "z", "tags": []}))).unwrap();
        assert_eq!(
            to_json(head.result().unwrap()),
            vec![json!({"app": "x", "tags": "t1"}), json!({"app": "x", "tags": "t2"})]
        );

        let mut head = chain(&[json!({"$unwind": {"path": "$tags"}})]);
        let err = head.feed(doc(json!({"tags": "t1"}))).unwrap_err();
        assert!(err.is_runtime());
    }

    #[test]
    fn test_unwind_feeds_limit() {
        let mut head = chain(&[json!({"$unwind": "$n"}), json!({"$limit": 2})]);
        assert_eq!(head.feed(doc(json!({"n": [1, 2, 3]}))).unwrap(), Flow::LimitReached);
        assert_eq!(head.result().unwrap().len(), 2);
    }

    #[test]
    fn test_group_then_sort() {
        let mut head = chain(&[
            json!({"$group": {"_id": "$app", "total": {"$sum": "$elapse"}}}),
            json!({"$sort": [["_id", 1]]}),
        ]);
        for d in [
            json!({"app": "a", "elapse": 3}),
            json!({"app": "a", "elapse": 1}),
            json!({"app": "b", "elapse": 4}),
        ] {
            head.feed(doc(d)).unwrap();
        }
        assert_eq!(
            to_json(head.result().unwrap()),
            vec![json!({"_id": "a", "total": 4}), json!({"_id": "b", "total": 4})]
        );
    }

    #[test]
    fn test_group_bucket_cap() {
        let options = PipelineOptions::default().with_max_group_buckets(2);
        let mut head = build(&[json!({"$group": {"_id": "$k", "n": {"$sum": 1}}})], &options).unwrap();
        head.feed(doc(json!({"k": 1}))).unwrap();
        head.feed(doc(json!({"k": 2}))).unwrap();
        head.feed(doc(json!({"k": 1}))).unwrap();
        let err = head.feed(doc(json!({"k": 3}))).unwrap_err();
        assert!(err.is_runtime());
        assert!(err.to_string().contains("more than 2"));
    }
}
