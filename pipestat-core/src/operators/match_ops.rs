// src/operators/match_ops.rs
//! `$match` predicates
//!
//! A `$match` specification is an implicit AND over its entries. Each entry
//! is either a logical combinator (`$and`, `$or`, `$nor`), a document-level
//! `$call`, or a field path mapped to a literal (implicit `$eq`) or to an
//! object of operators.
//!
//! Element-wise predicates are existential over arrays: `{tags: "a"}` matches
//! `{tags: ["a", "b"]}`.

use super::{is_operator, BuildContext, Family, Scope, ValueSource};
use crate::callbacks::{HostFn, MatchFn};
use crate::document::Document;
use crate::error::Result;
use crate::value::{Value, ValueKind};
use regex::{Regex, RegexBuilder};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::cmp::Ordering;

const STAGE: &str = "$match";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CmpOp {
    fn from_name(name: &str) -> Option<CmpOp> {
        match name {
            "$lt" => Some(CmpOp::Lt),
            "$lte" => Some(CmpOp::Lte),
            "$gt" => Some(CmpOp::Gt),
            "$gte" => Some(CmpOp::Gte),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CmpOp::Lt => "$lt",
            CmpOp::Lte => "$lte",
            CmpOp::Gt => "$gt",
            CmpOp::Gte => "$gte",
        }
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Lte => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Gte => ord != Ordering::Less,
        }
    }
}

/// A whole-document predicate
#[derive(Debug, Clone)]
pub enum MatchExpr {
    And(Vec<MatchExpr>),
    Or(Vec<MatchExpr>),
    Nor(Vec<MatchExpr>),
    /// Document-level host predicate; receives `Missing` as the field value
    Call(HostFn<MatchFn>),
    Field {
        path: String,
        predicates: Vec<FieldPredicate>,
    },
}

/// A predicate over the value found at one field path
#[derive(Debug, Clone)]
pub enum FieldPredicate {
    Eq(ValueSource),
    Ne(ValueSource),
    Cmp(CmpOp, ValueSource),
    In(ValueSource),
    Nin(ValueSource),
    Regexp(Regex),
    Exists(bool),
    Mod { divisor: f64, remainder: f64 },
    All(Vec<Value>),
    Size(usize),
    ElemMatch(ElemMatch),
    Not(Vec<FieldPredicate>),
    Call(HostFn<MatchFn>),
}

/// `$elemMatch` body: a document query or operators applied to each element
#[derive(Debug, Clone)]
pub enum ElemMatch {
    Document(Box<MatchExpr>),
    Value(Vec<FieldPredicate>),
}

impl MatchExpr {
    /// Parse a `$match` specification object
    pub fn parse(spec: &JsonValue, ctx: &BuildContext<'_>) -> Result<MatchExpr> {
        let obj = spec
            .as_object()
            .ok_or_else(|| Scope::new(STAGE, "").invalid(STAGE, "specification must be an object"))?;
        let mut exprs = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            exprs.push(Self::parse_entry(key, value, ctx)?);
        }
        Ok(if exprs.len() == 1 {
            exprs.remove(0)
        } else {
            MatchExpr::And(exprs)
        })
    }

    fn parse_entry(key: &str, value: &JsonValue, ctx: &BuildContext<'_>) -> Result<MatchExpr> {
        let scope = Scope::new(STAGE, key);
        match key {
            "$and" | "$or" | "$nor" => {
                let items = value
                    .as_array()
                    .filter(|items| !items.is_empty())
                    .ok_or_else(|| scope.invalid(key, "expects a non-empty array of match specifications"))?;
                let mut subs = Vec::with_capacity(items.len());
                for item in items {
                    if !item.is_object() {
                        return Err(scope.invalid(key, format!("sub-specification {} is not an object", item)));
                    }
                    subs.push(Self::parse(item, ctx)?);
                }
                Ok(match key {
                    "$and" => MatchExpr::And(subs),
                    "$or" => MatchExpr::Or(subs),
                    _ => MatchExpr::Nor(subs),
                })
            }
            "$call" => Ok(MatchExpr::Call(resolve_call(value, scope, ctx)?)),
            op if op.starts_with('$') => Err(scope.invalid(op, "unknown top-level match operator")),
            path => Ok(MatchExpr::Field {
                path: path.to_string(),
                predicates: parse_condition(value, scope, ctx)?,
            }),
        }
    }

    pub fn matches(&self, doc: &Document) -> Result<bool> {
        match self {
            MatchExpr::And(exprs) => {
                for expr in exprs {
                    if !expr.matches(doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            MatchExpr::Or(exprs) => {
                for expr in exprs {
                    if expr.matches(doc)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            MatchExpr::Nor(exprs) => {
                for expr in exprs {
                    if expr.matches(doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            MatchExpr::Call(host) => (host.func)(&Value::Missing, doc)
                .map_err(|e| Scope::new(STAGE, &host.name).callback("$call", e)),
            MatchExpr::Field { path, predicates } => {
                let value = doc.get(path);
                test_all(predicates, &value, doc, Scope::new(STAGE, path))
            }
        }
    }
}

fn test_all(predicates: &[FieldPredicate], value: &Value, doc: &Document, scope: Scope<'_>) -> Result<bool> {
    for predicate in predicates {
        if !predicate.test(value, doc, scope)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn resolve_call(value: &JsonValue, scope: Scope<'_>, ctx: &BuildContext<'_>) -> Result<HostFn<MatchFn>> {
    let name = value
        .as_str()
        .ok_or_else(|| scope.invalid("$call", "expects the name of a registered predicate"))?;
    let func = ctx
        .callbacks
        .match_fn(name)
        .ok_or_else(|| scope.invalid("$call", format!("no match predicate registered as '{}'", name)))?;
    Ok(HostFn {
        name: name.to_string(),
        func,
    })
}

/// Condition for one field: a literal/reference (implicit `$eq`) or an operator object
fn parse_condition(value: &JsonValue, scope: Scope<'_>, ctx: &BuildContext<'_>) -> Result<Vec<FieldPredicate>> {
    match value {
        JsonValue::Object(obj) if !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')) => {
            parse_operators(obj, scope, ctx)
        }
        JsonValue::Object(obj) if obj.keys().any(|k| k.starts_with('$')) => Err(scope.invalid(
            STAGE,
            "cannot mix operators and plain keys in one condition",
        )),
        _ => Ok(vec![FieldPredicate::Eq(ValueSource::literal_or_ref(value))]),
    }
}

fn parse_operators(
    obj: &JsonMap<String, JsonValue>,
    scope: Scope<'_>,
    ctx: &BuildContext<'_>,
) -> Result<Vec<FieldPredicate>> {
    let mut predicates = Vec::with_capacity(obj.len());
    for (name, arg) in obj {
        if !is_operator(Family::Match, name) {
            return Err(scope.invalid(name, "unknown match operator"));
        }
        let predicate = match name.as_str() {
            "$options" => {
                if !obj.contains_key("$regexp") && !obj.contains_key("$regex") {
                    return Err(scope.invalid(name, "$options requires $regexp"));
                }
                continue;
            }
            "$eq" => FieldPredicate::Eq(ValueSource::literal_or_ref(arg)),
            "$ne" => FieldPredicate::Ne(ValueSource::literal_or_ref(arg)),
            "$lt" | "$lte" | "$gt" | "$gte" => {
                let op = CmpOp::from_name(name).ok_or_else(|| scope.invalid(name, "unknown comparison"))?;
                let operand = ValueSource::literal_or_ref(arg);
                if let ValueSource::Literal(v) = &operand {
                    if !matches!(
                        v.kind(),
                        ValueKind::Number | ValueKind::String | ValueKind::Bool | ValueKind::Timestamp
                    ) {
                        return Err(scope.invalid(name, format!("cannot compare against {}", v.kind().name())));
                    }
                }
                FieldPredicate::Cmp(op, operand)
            }
            "$in" | "$nin" => {
                let operand = ValueSource::literal_or_ref(arg);
                if let ValueSource::Literal(v) = &operand {
                    if v.as_array().is_none() {
                        return Err(scope.invalid(name, "expects an array or a field reference"));
                    }
                }
                if name == "$in" {
                    FieldPredicate::In(operand)
                } else {
                    FieldPredicate::Nin(operand)
                }
            }
            "$regexp" | "$regex" => {
                let pattern = arg
                    .as_str()
                    .ok_or_else(|| scope.invalid(name, "pattern must be a string"))?;
                let options = match obj.get("$options") {
                    Some(opts) => opts
                        .as_str()
                        .ok_or_else(|| scope.invalid("$options", "options must be a string"))?,
                    None => "",
                };
                FieldPredicate::Regexp(build_regex(pattern, options, name, scope)?)
            }
            "$exists" => match arg {
                JsonValue::Bool(b) => FieldPredicate::Exists(*b),
                JsonValue::Number(n) => FieldPredicate::Exists(n.as_f64() != Some(0.0)),
                _ => return Err(scope.invalid(name, "expects a boolean")),
            },
            "$mod" => {
                let pair = arg
                    .as_array()
                    .filter(|items| items.len() == 2)
                    .and_then(|items| Some((items[0].as_f64()?, items[1].as_f64()?)))
                    .ok_or_else(|| scope.invalid(name, "expects [divisor, remainder]"))?;
                if pair.0 == 0.0 {
                    return Err(scope.invalid(name, "divisor must not be zero"));
                }
                FieldPredicate::Mod {
                    divisor: pair.0,
                    remainder: pair.1,
                }
            }
            "$all" => {
                let items = arg
                    .as_array()
                    .ok_or_else(|| scope.invalid(name, "expects an array"))?;
                FieldPredicate::All(items.iter().map(Value::from).collect())
            }
            "$size" => {
                let size = arg
                    .as_u64()
                    .ok_or_else(|| scope.invalid(name, "expects a non-negative integer"))?;
                FieldPredicate::Size(size as usize)
            }
            "$elemMatch" => {
                let body = arg
                    .as_object()
                    .filter(|o| !o.is_empty())
                    .ok_or_else(|| scope.invalid(name, "expects a non-empty object"))?;
                if body.keys().all(|k| k.starts_with('$') && is_operator(Family::Match, k))
                    && !body.contains_key("$and")
                    && !body.contains_key("$or")
                    && !body.contains_key("$nor")
                {
                    FieldPredicate::ElemMatch(ElemMatch::Value(parse_operators(body, scope, ctx)?))
                } else {
                    FieldPredicate::ElemMatch(ElemMatch::Document(Box::new(MatchExpr::parse(arg, ctx)?)))
                }
            }
            "$not" => {
                let body = arg
                    .as_object()
                    .filter(|o| !o.is_empty() && o.keys().all(|k| k.starts_with('$')))
                    .ok_or_else(|| scope.invalid(name, "expects an object of operators"))?;
                FieldPredicate::Not(parse_operators(body, scope, ctx)?)
            }
            "$call" => FieldPredicate::Call(resolve_call(arg, scope, ctx)?),
            other => return Err(scope.invalid(other, "operator is not valid on a field")),
        };
        predicates.push(predicate);
    }
    Ok(predicates)
}

/// Compile a pattern with `i`, `m`, `s`, `x` flags
fn build_regex(pattern: &str, options: &str, name: &str, scope: Scope<'_>) -> Result<Regex> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => return Err(scope.invalid("$options", format!("unsupported regex option '{}'", other))),
        };
    }
    builder
        .build()
        .map_err(|e| scope.invalid(name, format!("invalid regex: {}", e)))
}

/// Equality with null/missing folding and existential array membership
fn values_equal(found: &Value, expected: &Value) -> bool {
    if expected.is_nullish() {
        return found.is_nullish();
    }
    if found == expected {
        return true;
    }
    match found {
        Value::Array(items) => items.iter().any(|item| item == expected),
        _ => false,
    }
}

/// Apply `test` to the value, or to any of its elements when it is an array
fn any_element<F>(value: &Value, test: F) -> bool
where
    F: Fn(&Value) -> bool,
{
    match value {
        Value::Array(items) => items.iter().any(&test),
        other => test(other),
    }
}

/// Same-kind comparison, except that a numeric string compares as a number
/// against a number
fn compare_coerced(found: &Value, target: &Value) -> Option<Ordering> {
    match (found, target) {
        (Value::Number(a), Value::String(b)) => a.partial_cmp(&b.trim().parse::<f64>().ok()?),
        (Value::String(a), Value::Number(b)) => a.trim().parse::<f64>().ok()?.partial_cmp(b),
        _ => found.partial_compare(target),
    }
}

impl FieldPredicate {
    fn test(&self, value: &Value, doc: &Document, scope: Scope<'_>) -> Result<bool> {
        match self {
            FieldPredicate::Eq(operand) => Ok(values_equal(value, &operand.resolve(doc, scope)?)),
            FieldPredicate::Ne(operand) => Ok(!values_equal(value, &operand.resolve(doc, scope)?)),
            FieldPredicate::Cmp(op, operand) => {
                let target = operand.resolve(doc, scope)?;
                Ok(any_element(value, |v| {
                    compare_coerced(v, &target).map_or(false, |ord| op.accepts(ord))
                }))
            }
            FieldPredicate::In(operand) | FieldPredicate::Nin(operand) => {
                let name = if matches!(self, FieldPredicate::In(_)) { "$in" } else { "$nin" };
                let candidates = match operand.resolve(doc, scope)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(scope.evaluation(
                            name,
                            format!("operand must be an array, got {}", other.kind().name()),
                        ))
                    }
                };
                let found = candidates.iter().any(|c| values_equal(value, c));
                Ok(found == matches!(self, FieldPredicate::In(_)))
            }
            FieldPredicate::Regexp(pattern) => Ok(any_element(value, |v| {
                v.as_str().map_or(false, |s| pattern.is_match(s))
            })),
            FieldPredicate::Exists(expected) => Ok(!value.is_missing() == *expected),
            FieldPredicate::Mod { divisor, remainder } => Ok(any_element(value, |v| {
                v.as_f64()
                    .map_or(false, |n| n - divisor * (n / divisor).floor() == *remainder)
            })),
            FieldPredicate::All(required) => Ok(!required.is_empty()
                && required.iter().all(|r| values_equal(value, r))),
            FieldPredicate::Size(size) => Ok(value.as_array().map_or(false, |items| items.len() == *size)),
            FieldPredicate::ElemMatch(body) => {
                let Value::Array(items) = value else {
                    return Ok(false);
                };
                for item in items {
                    let hit = match body {
                        ElemMatch::Value(predicates) => test_all(predicates, item, doc, scope)?,
                        ElemMatch::Document(expr) => match item {
                            Value::Document(map) => expr.matches(&Document::from(map.clone()))?,
                            _ => false,
                        },
                    };
                    if hit {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            FieldPredicate::Not(predicates) => Ok(!test_all(predicates, value, doc, scope)?),
            FieldPredicate::Call(host) => (host.func)(value, doc).map_err(|e| scope.callback("$call", e)),
        }
    }
}
