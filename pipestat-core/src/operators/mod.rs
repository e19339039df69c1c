// src/operators/mod.rs
//! Operator expression trees
//!
//! Stage parameters are parsed once, when the pipeline is built, into three
//! disjoint trees:
//!
//! ```text
//! ┌────────────────┬──────────────────────┬─────────────────────┐
//! │ match_ops      │ project_ops          │ group_ops           │
//! │ ($eq, $in...)  │ ($extract, $add...)  │ ($sum, $push...)    │
//! │ -> bool        │ -> Value             │ init/accumulate/    │
//! │                │                      │ finalize            │
//! └────────────────┴──────────────────────┴─────────────────────┘
//! ```
//!
//! Operands are resolved into a [`ValueSource`] at construction, so the `$`
//! prefix of a field reference is never re-inspected per document.

pub mod group_ops;
pub mod match_ops;
pub mod project_ops;

use crate::callbacks::Callbacks;
use crate::document::Document;
use crate::error::{PipestatError, Result};
use crate::value::{KindSet, Value};
use chrono::FixedOffset;
use lazy_static::lazy_static;
use project_ops::ProjectExpr;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Operator families; each stage parses its parameters with one of them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Match,
    Project,
    Group,
}

lazy_static! {
    /// Every operator name the engine knows, per family
    static ref OPERATOR_TABLE: HashMap<Family, Vec<&'static str>> = {
        let mut table = HashMap::new();
        table.insert(
            Family::Match,
            vec![
                "$eq", "$ne", "$lt", "$lte", "$gt", "$gte", "$in", "$nin", "$regexp", "$regex",
                "$options", "$exists", "$mod", "$all", "$size", "$elemMatch", "$not", "$call",
                "$and", "$or", "$nor",
            ],
        );
        table.insert(
            Family::Project,
            vec![
                "$value", "$extract", "$timestamp", "$add", "$subtract", "$multiply", "$divide",
                "$mod", "$toLower", "$toUpper", "$toNumber", "$concat", "$substr", "$substring",
                "$dayOfYear", "$dayOfMonth", "$dayOfWeek", "$year", "$month", "$hour", "$minute",
                "$second", "$millisecond", "$call",
            ],
        );
        table.insert(
            Family::Group,
            vec![
                "$sum", "$avg", "$min", "$max", "$first", "$last", "$addToSet", "$push",
                "$concatToSet", "$concatToList", "$call",
            ],
        );
        table
    };
}

/// Whether `name` is an operator of `family`
pub fn is_operator(family: Family, name: &str) -> bool {
    OPERATOR_TABLE
        .get(&family)
        .map_or(false, |names| names.contains(&name))
}

/// Field reference path of a `$`-prefixed string
pub(crate) fn ref_path(json: &JsonValue) -> Option<&str> {
    json.as_str()
        .and_then(|s| s.strip_prefix('$'))
        .filter(|path| !path.is_empty())
}

/// Single `$`-prefixed key of an operator object like `{"$toLower": "$name"}`
pub(crate) fn single_operator(json: &JsonValue) -> Option<(&str, &JsonValue)> {
    let obj = json.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let (name, arg) = obj.iter().next()?;
    name.starts_with('$').then_some((name.as_str(), arg))
}

/// Everything parsing needs besides the specification itself
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub callbacks: &'a Callbacks,
    pub utc_offset: FixedOffset,
}

/// Stage name and output key an operator works for, used to tag errors
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub stage: &'static str,
    pub key: &'a str,
}

impl<'a> Scope<'a> {
    pub fn new(stage: &'static str, key: &'a str) -> Self {
        Scope { stage, key }
    }

    pub fn invalid(&self, operator: &str, message: impl Into<String>) -> PipestatError {
        PipestatError::InvalidOperator {
            stage: self.stage,
            operator: operator.to_string(),
            key: self.key.to_string(),
            message: message.into(),
        }
    }

    pub fn evaluation(&self, operator: &str, message: impl Into<String>) -> PipestatError {
        PipestatError::Evaluation {
            stage: self.stage,
            operator: operator.to_string(),
            key: self.key.to_string(),
            message: message.into(),
        }
    }

    pub fn callback(&self, operator: &str, source: anyhow::Error) -> PipestatError {
        PipestatError::Callback {
            stage: self.stage,
            operator: operator.to_string(),
            key: self.key.to_string(),
            source,
        }
    }
}

/// Where an operand's value comes from
#[derive(Debug, Clone)]
pub enum ValueSource {
    Literal(Value),
    RefKey(String),
    Operator(Box<ProjectExpr>),
}

impl ValueSource {
    /// Literal or field reference; objects are literals
    pub fn literal_or_ref(json: &JsonValue) -> ValueSource {
        match ref_path(json) {
            Some(path) => ValueSource::RefKey(path.to_string()),
            None => ValueSource::Literal(Value::from(json)),
        }
    }

    /// Literal, field reference or nested `$project` operator
    pub fn parse(json: &JsonValue, scope: Scope<'_>, ctx: &BuildContext<'_>) -> Result<ValueSource> {
        if let Some((name, _)) = single_operator(json) {
            if !is_operator(Family::Project, name) {
                return Err(scope.invalid(name, "unknown expression operator"));
            }
            let expr = ProjectExpr::parse_operator(json, scope, ctx)?;
            return Ok(ValueSource::Operator(Box::new(expr)));
        }
        Ok(ValueSource::literal_or_ref(json))
    }

    /// Kinds this operand may resolve to
    pub fn kinds(&self) -> KindSet {
        match self {
            ValueSource::Literal(v) => KindSet::of(&[v.kind()]),
            ValueSource::RefKey(_) => KindSet::ANY,
            ValueSource::Operator(expr) => expr.returns(),
        }
    }

    /// Construction-time check that this operand can produce an accepted kind
    pub fn expect_kinds(
        &self,
        accepted: KindSet,
        operator: &str,
        scope: Scope<'_>,
    ) -> Result<()> {
        let produced = self.kinds();
        // Missing/Null operands are handled at runtime by every operator
        let concrete = produced.difference(KindSet::NULLISH);
        if concrete.is_empty() || concrete.intersects(accepted) {
            return Ok(());
        }
        let what = match self {
            ValueSource::Operator(expr) => format!("operator {} returns", expr.name()),
            _ => "operand is".to_string(),
        };
        Err(scope.invalid(
            operator,
            format!("{} {}, expected {}", what, produced, accepted),
        ))
    }

    pub fn resolve(&self, doc: &Document, scope: Scope<'_>) -> Result<Value> {
        match self {
            ValueSource::Literal(v) => Ok(v.clone()),
            ValueSource::RefKey(path) => Ok(doc.get(path)),
            ValueSource::Operator(expr) => expr.eval(doc, scope),
        }
    }
}
