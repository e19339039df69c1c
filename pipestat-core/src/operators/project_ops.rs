// src/operators/project_ops.rs
// $project expressions: operators that compute one output value per document

use super::{single_operator, BuildContext, Scope, ValueSource};
use crate::callbacks::{HostFn, ProjectFn};
use crate::document::Document;
use crate::error::Result;
use crate::value::{KindSet, Map, Value, ValueKind};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use regex::Regex;
use serde_json::Value as JsonValue;

const NUMBER: KindSet = KindSet::of(&[ValueKind::Number]);
const STRING: KindSet = KindSet::of(&[ValueKind::String]);
const NUMERIC_IN: KindSet = NUMBER.union(KindSet::NULLISH);
const STRING_IN: KindSet = STRING.union(KindSet::NULLISH);
const DATE_IN: KindSet = KindSet::of(&[ValueKind::Timestamp, ValueKind::Number]).union(KindSet::NULLISH);

// ============================================================================
// OPERATOR ARGUMENTS
// ============================================================================

/// Binary arithmetic operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Mod,
}

impl ArithOp {
    fn from_name(name: &str) -> Option<ArithOp> {
        match name {
            "$add" => Some(ArithOp::Add),
            "$subtract" => Some(ArithOp::Subtract),
            "$multiply" => Some(ArithOp::Multiply),
            "$divide" => Some(ArithOp::Divide),
            "$mod" => Some(ArithOp::Mod),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "$add",
            ArithOp::Subtract => "$subtract",
            ArithOp::Multiply => "$multiply",
            ArithOp::Divide => "$divide",
            ArithOp::Mod => "$mod",
        }
    }

    fn apply(self, a: f64, b: f64) -> Option<f64> {
        match self {
            ArithOp::Add => Some(a + b),
            ArithOp::Subtract => Some(a - b),
            ArithOp::Multiply => Some(a * b),
            ArithOp::Divide if b == 0.0 => None,
            ArithOp::Divide => Some(a / b),
            ArithOp::Mod if b == 0.0 => None,
            // Result takes the sign of the divisor
            ArithOp::Mod => Some(a - b * (a / b).floor()),
        }
    }
}

/// Calendar field extracted by the date-part operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePart {
    DayOfYear,
    DayOfMonth,
    DayOfWeek,
    Year,
    Month,
    Hour,
    Minute,
    Second,
    Millisecond,
}

impl DatePart {
    fn from_name(name: &str) -> Option<DatePart> {
        match name {
            "$dayOfYear" => Some(DatePart::DayOfYear),
            "$dayOfMonth" => Some(DatePart::DayOfMonth),
            "$dayOfWeek" => Some(DatePart::DayOfWeek),
            "$year" => Some(DatePart::Year),
            "$month" => Some(DatePart::Month),
            "$hour" => Some(DatePart::Hour),
            "$minute" => Some(DatePart::Minute),
            "$second" => Some(DatePart::Second),
            "$millisecond" => Some(DatePart::Millisecond),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DatePart::DayOfYear => "$dayOfYear",
            DatePart::DayOfMonth => "$dayOfMonth",
            DatePart::DayOfWeek => "$dayOfWeek",
            DatePart::Year => "$year",
            DatePart::Month => "$month",
            DatePart::Hour => "$hour",
            DatePart::Minute => "$minute",
            DatePart::Second => "$second",
            DatePart::Millisecond => "$millisecond",
        }
    }

    fn extract(self, ts: &DateTime<FixedOffset>) -> f64 {
        let n = match self {
            DatePart::DayOfYear => ts.ordinal(),
            DatePart::DayOfMonth => ts.day(),
            // 1 = Sunday
            DatePart::DayOfWeek => ts.weekday().number_from_sunday(),
            DatePart::Year => return ts.year() as f64,
            DatePart::Month => ts.month(),
            DatePart::Hour => ts.hour(),
            DatePart::Minute => ts.minute(),
            DatePart::Second => ts.second(),
            DatePart::Millisecond => ts.timestamp_subsec_millis(),
        };
        n as f64
    }
}

// ============================================================================
// EXPRESSION TREE
// ============================================================================

/// Which part of a `$extract` match becomes the output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    /// The named group equal to the output key
    Named(String),
    /// Group 1
    First,
    /// The whole match, when the pattern has no groups
    Whole,
}

/// A `$project` expression node
#[derive(Debug, Clone)]
pub enum ProjectExpr {
    /// `$value`, a bare `"$path"`, `1`/`true` or a literal
    Value(ValueSource),
    Extract {
        source: ValueSource,
        pattern: Regex,
        capture: Capture,
    },
    Timestamp {
        source: ValueSource,
        format: String,
        offset: FixedOffset,
    },
    Arithmetic {
        op: ArithOp,
        lhs: ValueSource,
        rhs: ValueSource,
    },
    Case {
        upper: bool,
        source: ValueSource,
    },
    ToNumber(ValueSource),
    Concat(Vec<ValueSource>),
    Substr {
        source: ValueSource,
        start: i64,
        length: i64,
    },
    Substring {
        source: ValueSource,
        start: i64,
        end: Option<i64>,
    },
    DatePart {
        part: DatePart,
        source: ValueSource,
        offset: FixedOffset,
    },
    /// Nested object of sub-projections
    Object(Vec<(String, ProjectExpr)>),
    Call(HostFn<ProjectFn>),
}

/// Whether a projection value means "include the same key"
pub(crate) fn is_include_flag(json: &JsonValue) -> bool {
    match json {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64() == Some(1.0),
        _ => false,
    }
}

/// Whether a projection value means "exclude this key"
pub(crate) fn is_exclude_flag(json: &JsonValue) -> bool {
    match json {
        JsonValue::Bool(b) => !*b,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

fn include(scope: Scope<'_>) -> ProjectExpr {
    ProjectExpr::Value(ValueSource::RefKey(scope.key.to_string()))
}

/// Split an operator argument that must be an array of `min..=max` items
fn array_args<'j>(
    name: &str,
    arg: &'j JsonValue,
    min: usize,
    max: usize,
    scope: Scope<'_>,
) -> Result<&'j [JsonValue]> {
    match arg.as_array() {
        Some(items) if (min..=max).contains(&items.len()) => Ok(items),
        _ if min == max => Err(scope.invalid(name, format!("expects an array of {} arguments", min))),
        _ => Err(scope.invalid(
            name,
            format!("expects an array of {} to {} arguments", min, max),
        )),
    }
}

fn integer_arg(name: &str, arg: &JsonValue, what: &str, scope: Scope<'_>) -> Result<i64> {
    arg.as_i64()
        .ok_or_else(|| scope.invalid(name, format!("{} must be an integer", what)))
}

/// Parse a strftime-style format, rejecting unknown specifiers
fn check_format(name: &str, format: &str, scope: Scope<'_>) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(scope.invalid(name, format!("invalid format string '{}'", format)));
    }
    Ok(())
}

impl ProjectExpr {
    /// Parse the value of one projected key
    ///
    /// `scope.key` is the dotted input path read by the `1`/`true` shorthand.
    pub fn parse_field(json: &JsonValue, scope: Scope<'_>, ctx: &BuildContext<'_>) -> Result<ProjectExpr> {
        if is_include_flag(json) {
            return Ok(include(scope));
        }
        match json {
            JsonValue::Object(obj) => {
                if single_operator(json).is_some() {
                    return Self::parse_operator(json, scope, ctx);
                }
                if let Some(op) = obj.keys().find(|k| k.starts_with('$')) {
                    return Err(scope.invalid(op, "an operator object must have exactly one key"));
                }
                Self::parse_object(obj, scope, ctx)
            }
            _ => Ok(ProjectExpr::Value(ValueSource::literal_or_ref(json))),
        }
    }

    fn parse_object(
        obj: &serde_json::Map<String, JsonValue>,
        scope: Scope<'_>,
        ctx: &BuildContext<'_>,
    ) -> Result<ProjectExpr> {
        if obj.is_empty() {
            return Err(scope.invalid("$project", "nested projection must not be empty"));
        }
        let mut fields = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            let path = format!("{}.{}", scope.key, key);
            let child = Scope::new(scope.stage, &path);
            if is_exclude_flag(value) {
                return Err(child.invalid("$project", "exclusion is not allowed in a nested projection"));
            }
            fields.push((key.clone(), Self::parse_field(value, child, ctx)?));
        }
        Ok(ProjectExpr::Object(fields))
    }

    /// Parse a single-operator object such as `{"$add": ["$a", 1]}`
    pub fn parse_operator(json: &JsonValue, scope: Scope<'_>, ctx: &BuildContext<'_>) -> Result<ProjectExpr> {
        let (name, arg) = single_operator(json)
            .ok_or_else(|| scope.invalid("$project", "expected a single operator object"))?;

        if let Some(op) = ArithOp::from_name(name) {
            let args = array_args(name, arg, 2, 2, scope)?;
            let lhs = ValueSource::parse(&args[0], scope, ctx)?;
            let rhs = ValueSource::parse(&args[1], scope, ctx)?;
            lhs.expect_kinds(NUMERIC_IN, name, scope)?;
            rhs.expect_kinds(NUMERIC_IN, name, scope)?;
            return Ok(ProjectExpr::Arithmetic { op, lhs, rhs });
        }

        if let Some(part) = DatePart::from_name(name) {
            let source = ValueSource::parse(arg, scope, ctx)?;
            source.expect_kinds(DATE_IN, name, scope)?;
            return Ok(ProjectExpr::DatePart {
                part,
                source,
                offset: ctx.utc_offset,
            });
        }

        match name {
            "$value" => {
                if is_include_flag(arg) {
                    return Ok(include(scope));
                }
                Ok(ProjectExpr::Value(ValueSource::parse(arg, scope, ctx)?))
            }
            "$extract" => {
                let args = array_args(name, arg, 2, 2, scope)?;
                let source = ValueSource::parse(&args[0], scope, ctx)?;
                source.expect_kinds(STRING_IN, name, scope)?;
                let pattern = args[1]
                    .as_str()
                    .ok_or_else(|| scope.invalid(name, "pattern must be a string"))?;
                let pattern = Regex::new(pattern)
                    .map_err(|e| scope.invalid(name, format!("invalid regex: {}", e)))?;
                let key = scope.key.rsplit('.').next().unwrap_or(scope.key);
                let capture = if pattern.capture_names().any(|n| n == Some(key)) {
                    Capture::Named(key.to_string())
                } else if pattern.captures_len() > 1 {
                    Capture::First
                } else {
                    Capture::Whole
                };
                Ok(ProjectExpr::Extract { source, pattern, capture })
            }
            "$timestamp" => {
                let args = array_args(name, arg, 2, 2, scope)?;
                let source = ValueSource::parse(&args[0], scope, ctx)?;
                source.expect_kinds(STRING_IN, name, scope)?;
                let format = args[1]
                    .as_str()
                    .ok_or_else(|| scope.invalid(name, "format must be a string"))?;
                check_format(name, format, scope)?;
                Ok(ProjectExpr::Timestamp {
                    source,
                    format: format.to_string(),
                    offset: ctx.utc_offset,
                })
            }
            "$toLower" | "$toUpper" => {
                let source = ValueSource::parse(arg, scope, ctx)?;
                source.expect_kinds(STRING_IN, name, scope)?;
                Ok(ProjectExpr::Case {
                    upper: name == "$toUpper",
                    source,
                })
            }
            "$toNumber" => {
                let source = ValueSource::parse(arg, scope, ctx)?;
                source.expect_kinds(NUMBER.union(STRING_IN), name, scope)?;
                Ok(ProjectExpr::ToNumber(source))
            }
            "$concat" => {
                let items = arg
                    .as_array()
                    .filter(|items| !items.is_empty())
                    .ok_or_else(|| scope.invalid(name, "expects a non-empty array"))?;
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    let part = ValueSource::parse(item, scope, ctx)?;
                    part.expect_kinds(STRING_IN, name, scope)?;
                    parts.push(part);
                }
                Ok(ProjectExpr::Concat(parts))
            }
            "$substr" => {
                let args = array_args(name, arg, 3, 3, scope)?;
                let source = ValueSource::parse(&args[0], scope, ctx)?;
                source.expect_kinds(STRING_IN, name, scope)?;
                Ok(ProjectExpr::Substr {
                    source,
                    start: integer_arg(name, &args[1], "start", scope)?,
                    length: integer_arg(name, &args[2], "length", scope)?,
                })
            }
            "$substring" => {
                let args = array_args(name, arg, 2, 3, scope)?;
                let source = ValueSource::parse(&args[0], scope, ctx)?;
                source.expect_kinds(STRING_IN, name, scope)?;
                let end = match args.get(2) {
                    Some(end) => Some(integer_arg(name, end, "end", scope)?),
                    None => None,
                };
                Ok(ProjectExpr::Substring {
                    source,
                    start: integer_arg(name, &args[1], "start", scope)?,
                    end,
                })
            }
            "$call" => {
                let fname = arg
                    .as_str()
                    .ok_or_else(|| scope.invalid(name, "expects the name of a registered function"))?;
                let func = ctx.callbacks.project_fn(fname).ok_or_else(|| {
                    scope.invalid(name, format!("no project function registered as '{}'", fname))
                })?;
                Ok(ProjectExpr::Call(HostFn {
                    name: fname.to_string(),
                    func,
                }))
            }
            other => Err(scope.invalid(other, "unknown expression operator")),
        }
    }

    /// Operator name used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            ProjectExpr::Value(_) => "$value",
            ProjectExpr::Extract { .. } => "$extract",
            ProjectExpr::Timestamp { .. } => "$timestamp",
            ProjectExpr::Arithmetic { op, .. } => op.name(),
            ProjectExpr::Case { upper: true, .. } => "$toUpper",
            ProjectExpr::Case { upper: false, .. } => "$toLower",
            ProjectExpr::ToNumber(_) => "$toNumber",
            ProjectExpr::Concat(_) => "$concat",
            ProjectExpr::Substr { .. } => "$substr",
            ProjectExpr::Substring { .. } => "$substring",
            ProjectExpr::DatePart { part, .. } => part.name(),
            ProjectExpr::Object(_) => "$project",
            ProjectExpr::Call(_) => "$call",
        }
    }

    /// Kinds this node may evaluate to
    pub fn returns(&self) -> KindSet {
        match self {
            ProjectExpr::Value(source) => source.kinds(),
            ProjectExpr::Extract { .. } => KindSet::of(&[ValueKind::String, ValueKind::Missing]),
            ProjectExpr::Timestamp { .. } => KindSet::of(&[ValueKind::Timestamp]).union(KindSet::NULLISH),
            ProjectExpr::Arithmetic { .. } => KindSet::of(&[ValueKind::Number, ValueKind::Null]),
            ProjectExpr::Case { .. }
            | ProjectExpr::Substr { .. }
            | ProjectExpr::Substring { .. } => STRING_IN,
            ProjectExpr::ToNumber(_) | ProjectExpr::DatePart { .. } => NUMERIC_IN,
            ProjectExpr::Concat(_) => KindSet::of(&[ValueKind::String, ValueKind::Null]),
            ProjectExpr::Object(_) => KindSet::of(&[ValueKind::Document]),
            ProjectExpr::Call(_) => KindSet::ANY,
        }
    }

    /// Evaluate against one document
    pub fn eval(&self, doc: &Document, scope: Scope<'_>) -> Result<Value> {
        match self {
            ProjectExpr::Value(source) => source.resolve(doc, scope),

            ProjectExpr::Extract { source, pattern, capture } => {
                let text = match source.resolve(doc, scope)? {
                    Value::String(s) => s,
                    Value::Missing => return Ok(Value::Missing),
                    other => {
                        return Err(scope.evaluation(
                            self.name(),
                            format!("source must be a string, got {}", other.kind().name()),
                        ))
                    }
                };
                let Some(caps) = pattern.captures(&text) else {
                    return Ok(Value::Missing);
                };
                // A group that did not take part in the match is Missing
                let found = match capture {
                    Capture::Named(name) => caps.name(name),
                    Capture::First => caps.get(1),
                    Capture::Whole => caps.get(0),
                };
                Ok(found.map_or(Value::Missing, |m| Value::from(m.as_str())))
            }

            ProjectExpr::Timestamp { source, format, offset } => {
                let text = match source.resolve(doc, scope)? {
                    Value::String(s) => s,
                    v if v.is_nullish() => return Ok(v),
                    other => {
                        return Err(scope.evaluation(
                            self.name(),
                            format!("source must be a string, got {}", other.kind().name()),
                        ))
                    }
                };
                let naive = parse_naive(&text, format).ok_or_else(|| {
                    scope.evaluation(
                        self.name(),
                        format!("'{}' does not match format '{}'", text, format),
                    )
                })?;
                let local = offset.from_local_datetime(&naive).single().ok_or_else(|| {
                    scope.evaluation(self.name(), format!("'{}' is not a valid local time", text))
                })?;
                Ok(Value::Timestamp(local.with_timezone(&Utc)))
            }

            ProjectExpr::Arithmetic { op, lhs, rhs } => {
                let a = lhs.resolve(doc, scope)?;
                let b = rhs.resolve(doc, scope)?;
                if a.is_nullish() || b.is_nullish() {
                    return Ok(Value::Null);
                }
                let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                    return Err(scope.evaluation(
                        op.name(),
                        format!(
                            "operands must be numeric, got {} and {}",
                            a.kind().name(),
                            b.kind().name()
                        ),
                    ));
                };
                op.apply(x, y)
                    .map(Value::Number)
                    .ok_or_else(|| scope.evaluation(op.name(), "division by zero"))
            }

            ProjectExpr::Case { upper, source } => {
                self.with_string(source.resolve(doc, scope)?, scope, |s| {
                    if *upper {
                        s.to_uppercase()
                    } else {
                        s.to_lowercase()
                    }
                })
            }

            ProjectExpr::ToNumber(source) => match source.resolve(doc, scope)? {
                v @ Value::Number(_) => Ok(v),
                Value::String(s) => s.trim().parse::<f64>().map(Value::Number).map_err(|_| {
                    scope.evaluation(self.name(), format!("cannot convert '{}' to a number", s))
                }),
                v if v.is_nullish() => Ok(v),
                other => Err(scope.evaluation(
                    self.name(),
                    format!("cannot convert {} to a number", other.kind().name()),
                )),
            },

            ProjectExpr::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part.resolve(doc, scope)? {
                        Value::String(s) => out.push_str(&s),
                        v if v.is_nullish() => return Ok(Value::Null),
                        other => {
                            return Err(scope.evaluation(
                                self.name(),
                                format!("operands must be strings, got {}", other.kind().name()),
                            ))
                        }
                    }
                }
                Ok(Value::String(out))
            }

            ProjectExpr::Substr { source, start, length } => {
                self.with_string(source.resolve(doc, scope)?, scope, |s| substr(s, *start, *length))
            }

            ProjectExpr::Substring { source, start, end } => {
                self.with_string(source.resolve(doc, scope)?, scope, |s| substring(s, *start, *end))
            }

            ProjectExpr::DatePart { part, source, offset } => {
                let ts = match source.resolve(doc, scope)? {
                    Value::Timestamp(ts) => ts,
                    Value::Number(secs) => DateTime::<Utc>::from_timestamp_millis((secs * 1000.0).round() as i64)
                        .ok_or_else(|| scope.evaluation(part.name(), "timestamp out of range"))?,
                    v if v.is_nullish() => return Ok(v),
                    other => {
                        return Err(scope.evaluation(
                            part.name(),
                            format!("source must be a date or a number, got {}", other.kind().name()),
                        ))
                    }
                };
                Ok(Value::Number(part.extract(&ts.with_timezone(offset))))
            }

            ProjectExpr::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, expr) in fields {
                    let value = expr.eval(doc, scope)?;
                    if !value.is_missing() {
                        out.insert(key.clone(), value);
                    }
                }
                Ok(Value::Document(out))
            }

            ProjectExpr::Call(host) => (host.func)(doc).map_err(|e| scope.callback(self.name(), e)),
        }
    }

    /// Apply a string transform; Missing and Null pass through
    fn with_string<F>(&self, value: Value, scope: Scope<'_>, f: F) -> Result<Value>
    where
        F: FnOnce(&str) -> String,
    {
        match value {
            Value::String(s) => Ok(Value::String(f(&s))),
            v if v.is_nullish() => Ok(v),
            other => Err(scope.evaluation(
                self.name(),
                format!("source must be a string, got {}", other.kind().name()),
            )),
        }
    }
}

/// Date-time first, then a bare date at midnight
fn parse_naive(text: &str, format: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, format).ok().or_else(|| {
        NaiveDate::parse_from_str(text, format)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    })
}

/// `length` characters from `start`; a negative length takes the rest
fn substr(s: &str, start: i64, length: i64) -> String {
    if start < 0 {
        return String::new();
    }
    let chars = s.chars().skip(start as usize);
    if length < 0 {
        chars.collect()
    } else {
        chars.take(length as usize).collect()
    }
}

/// Characters in `start..end`; negative indices count from the end
fn substring(s: &str, start: i64, end: Option<i64>) -> String {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let clamp = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
    let (from, to) = (clamp(start), end.map_or(len, clamp));
    if from >= to {
        return String::new();
    }
    chars[from as usize..to as usize].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::Callbacks;
    use serde_json::json;

    fn ctx_with(callbacks: &Callbacks, offset_secs: i32) -> BuildContext<'_> {
        BuildContext {
            callbacks,
            utc_offset: FixedOffset::east_opt(offset_secs).unwrap(),
        }
    }

    fn eval(spec: JsonValue, doc: JsonValue) -> Result<Value> {
        let callbacks = Callbacks::new();
        let ctx = ctx_with(&callbacks, 0);
        let scope = Scope::new("$project", "out");
        let expr = ProjectExpr::parse_field(&spec, scope, &ctx)?;
        expr.eval(&Document::from_json(&doc).unwrap(), scope)
    }

    fn parse_err(spec: JsonValue) -> crate::error::PipestatError {
        let callbacks = Callbacks::new();
        let ctx = ctx_with(&callbacks, 0);
        ProjectExpr::parse_field(&spec, Scope::new("$project", "out"), &ctx).unwrap_err()
    }

    #[test]
    fn test_value_shorthands() {
        let doc = json!({"out": 7, "a": {"b": "x"}});
        assert_eq!(eval(json!(1), doc.clone()).unwrap(), Value::from(7));
        assert_eq!(eval(json!(true), doc.clone()).unwrap(), Value::from(7));
        assert_eq!(eval(json!("$a.b"), doc.clone()).unwrap(), Value::from("x"));
        assert_eq!(eval(json!({"$value": 1}), doc.clone()).unwrap(), Value::from(7));
        assert_eq!(eval(json!({"$value": "$a.b"}), doc.clone()).unwrap(), Value::from("x"));
        assert_eq!(eval(json!("plain"), doc).unwrap(), Value::from("plain"));
    }

    #[test]
    fn test_extract() {
        let spec = json!({"$extract": ["$app", "app(\\d+)"]});
        assert_eq!(eval(spec.clone(), json!({"app": "app12"})).unwrap(), Value::from("12"));
        assert_eq!(eval(spec.clone(), json!({"app": "nomatch"})).unwrap(), Value::Missing);
        assert_eq!(eval(spec.clone(), json!({})).unwrap(), Value::Missing);

        let err = eval(spec, json!({"app": 5})).unwrap_err();
        assert!(err.is_runtime());
        assert!(err.to_string().contains("$extract"));
    }

    #[test]
    fn test_extract_group_preference() {
        // Named group matching the output key wins over group 1
        let spec = json!({"$extract": ["$s", "(?P<pre>\\w)-(?P<out>\\d+)"]});
        assert_eq!(eval(spec, json!({"s": "a-42"})).unwrap(), Value::from("42"));

        let spec = json!({"$extract": ["$s", "\\d+"]});
        assert_eq!(eval(spec, json!({"s": "ab123"})).unwrap(), Value::from("123"));
    }

    #[test]
    fn test_extract_unmatched_group_is_missing() {
        let spec = json!({"$extract": ["$s", "x(\\d)?y"]});
        assert_eq!(eval(spec.clone(), json!({"s": "xy"})).unwrap(), Value::Missing);
        assert_eq!(eval(spec, json!({"s": "x7y"})).unwrap(), Value::from("7"));

        // The named group for the output key is used even when it did not match
        let spec = json!({"$extract": ["$s", "(\\w)-(?P<out>\\d+)?"]});
        assert_eq!(eval(spec, json!({"s": "a-"})).unwrap(), Value::Missing);
    }

    #[test]
    fn test_extract_invalid_regex() {
        let err = parse_err(json!({"$extract": ["$s", "("]}));
        assert!(err.is_construction());
        assert!(err.to_string().contains("invalid regex"));
    }

    #[test]
    fn test_arithmetic() {
        let doc = json!({"a": 7, "b": 2, "s": "x", "n": null});
        assert_eq!(eval(json!({"$add": ["$a", "$b"]}), doc.clone()).unwrap(), Value::from(9));
        assert_eq!(eval(json!({"$subtract": ["$a", 10]}), doc.clone()).unwrap(), Value::from(-3));
        assert_eq!(eval(json!({"$multiply": ["$a", "$b"]}), doc.clone()).unwrap(), Value::from(14));
        assert_eq!(eval(json!({"$divide": ["$a", "$b"]}), doc.clone()).unwrap(), Value::from(3.5));
        assert_eq!(eval(json!({"$mod": ["$a", "$b"]}), doc.clone()).unwrap(), Value::from(1));
        assert_eq!(eval(json!({"$mod": [-7, 2]}), doc.clone()).unwrap(), Value::from(1));

        assert_eq!(eval(json!({"$add": ["$a", "$n"]}), doc.clone()).unwrap(), Value::Null);
        assert_eq!(eval(json!({"$add": ["$a", "$zz"]}), doc.clone()).unwrap(), Value::Null);

        assert!(eval(json!({"$add": ["$a", "$s"]}), doc.clone()).unwrap_err().is_runtime());
        assert!(eval(json!({"$divide": ["$a", 0]}), doc).unwrap_err().is_runtime());
    }

    #[test]
    fn test_arithmetic_nested_and_static_kinds() {
        let doc = json!({"a": 2, "b": 3});
        let spec = json!({"$multiply": [{"$add": ["$a", "$b"]}, 10]});
        assert_eq!(eval(spec, doc).unwrap(), Value::from(50));

        let err = parse_err(json!({"$add": [{"$toUpper": "$a"}, 1]}));
        assert!(err.is_construction());
        assert!(err.to_string().contains("$toUpper"));

        assert!(parse_err(json!({"$add": ["x", 1]})).is_construction());
        assert!(parse_err(json!({"$add": [1]})).is_construction());
    }

    #[test]
    fn test_case_and_concat() {
        let doc = json!({"name": "Alice", "n": null, "num": 1});
        assert_eq!(eval(json!({"$toUpper": "$name"}), doc.clone()).unwrap(), Value::from("ALICE"));
        assert_eq!(eval(json!({"$toLower": "$name"}), doc.clone()).unwrap(), Value::from("alice"));
        assert_eq!(eval(json!({"$toLower": "$n"}), doc.clone()).unwrap(), Value::Null);
        assert_eq!(eval(json!({"$toLower": "$zz"}), doc.clone()).unwrap(), Value::Missing);
        assert!(eval(json!({"$toLower": "$num"}), doc.clone()).unwrap_err().is_runtime());

        let spec = json!({"$concat": ["$name", "-", {"$toUpper": "$name"}]});
        assert_eq!(eval(spec, doc.clone()).unwrap(), Value::from("Alice-ALICE"));
        assert_eq!(eval(json!({"$concat": ["$name", "$n"]}), doc).unwrap(), Value::Null);
    }

    #[test]
    fn test_to_number() {
        let doc = json!({"s": " 4.5 ", "bad": "x", "n": 3});
        assert_eq!(eval(json!({"$toNumber": "$s"}), doc.clone()).unwrap(), Value::from(4.5));
        assert_eq!(eval(json!({"$toNumber": "$n"}), doc.clone()).unwrap(), Value::from(3));
        assert!(eval(json!({"$toNumber": "$bad"}), doc).unwrap_err().is_runtime());
    }

    #[test]
    fn test_substr_and_substring() {
        let doc = json!({"s": "héllo world"});
        assert_eq!(eval(json!({"$substr": ["$s", 1, 4]}), doc.clone()).unwrap(), Value::from("éllo"));
        assert_eq!(eval(json!({"$substr": ["$s", 6, -1]}), doc.clone()).unwrap(), Value::from("world"));
        assert_eq!(eval(json!({"$substr": ["$s", 50, 2]}), doc.clone()).unwrap(), Value::from(""));
        assert_eq!(eval(json!({"$substring": ["$s", 0, 5]}), doc.clone()).unwrap(), Value::from("héllo"));
        assert_eq!(eval(json!({"$substring": ["$s", -5]}), doc.clone()).unwrap(), Value::from("world"));
        assert_eq!(eval(json!({"$substring": ["$s", 3, 1]}), doc).unwrap(), Value::from(""));
        assert!(parse_err(json!({"$substr": ["$s", "a", 1]})).is_construction());
    }

    #[test]
    fn test_timestamp_and_date_parts() {
        let doc = json!({"t": "2024-03-05 14:30:15"});
        let ts = eval(json!({"$timestamp": ["$t", "%Y-%m-%d %H:%M:%S"]}), doc.clone()).unwrap();
        assert_eq!(ts.to_json(), json!("2024-03-05T14:30:15Z"));

        let parsed = json!({"$timestamp": ["$t", "%Y-%m-%d %H:%M:%S"]});
        let year = json!({"$year": parsed.clone()});
        assert_eq!(eval(year, doc.clone()).unwrap(), Value::from(2024));
        // 2024-03-05 was a Tuesday
        assert_eq!(eval(json!({"$dayOfWeek": parsed.clone()}), doc.clone()).unwrap(), Value::from(3));
        assert_eq!(eval(json!({"$dayOfYear": parsed.clone()}), doc.clone()).unwrap(), Value::from(65));
        assert_eq!(eval(json!({"$minute": parsed}), doc).unwrap(), Value::from(30));

        let date_only = json!({"$timestamp": ["$d", "%Y-%m-%d"]});
        let ts = eval(date_only, json!({"d": "2024-01-02"})).unwrap();
        assert_eq!(ts.to_json(), json!("2024-01-02T00:00:00Z"));

        let bad = eval(json!({"$timestamp": ["$t", "%Y"]}), json!({"t": "abc"})).unwrap_err();
        assert!(bad.is_runtime());
        assert!(parse_err(json!({"$timestamp": ["$t", "%Q"]})).is_construction());
    }

    #[test]
    fn test_date_parts_from_epoch_seconds_with_offset() {
        let callbacks = Callbacks::new();
        let ctx = ctx_with(&callbacks, 3600);
        let scope = Scope::new("$project", "h");
        let expr = ProjectExpr::parse_field(&json!({"$hour": "$t"}), scope, &ctx).unwrap();
        // 1970-01-01T23:00:00.250Z is 00:00 on Jan 2 at +01:00
        let doc = Document::from_json(&json!({"t": 82800.25})).unwrap();
        assert_eq!(expr.eval(&doc, scope).unwrap(), Value::from(0));

        let expr = ProjectExpr::parse_field(&json!({"$millisecond": "$t"}), scope, &ctx).unwrap();
        assert_eq!(expr.eval(&doc, scope).unwrap(), Value::from(250));

        let err = ProjectExpr::parse_field(&json!({"$year": {"$toLower": "$t"}}), scope, &ctx).unwrap_err();
        assert!(err.is_construction());
    }

    #[test]
    fn test_nested_object_omits_missing() {
        let spec = json!({"inner": 1, "app": "$app", "gone": "$nothing"});
        let doc = json!({"app": "x", "out": {"inner": 5}});
        assert_eq!(eval(spec, doc).unwrap().to_json(), json!({"inner": 5, "app": "x"}));

        assert!(parse_err(json!({"a": 0})).is_construction());
        assert!(parse_err(json!({"$add": [1, 2], "b": 1})).is_construction());
        assert!(parse_err(json!({"$nope": 1})).is_construction());
    }

    #[test]
    fn test_call() {
        let callbacks = Callbacks::new().with_project("twice", |doc: &Document| {
            let n = doc.get("n").as_f64().ok_or_else(|| anyhow::anyhow!("n is not a number"))?;
            Ok(Value::from(n * 2.0))
        });
        let ctx = ctx_with(&callbacks, 0);
        let scope = Scope::new("$project", "out");
        let expr = ProjectExpr::parse_field(&json!({"$call": "twice"}), scope, &ctx).unwrap();
        let doc = Document::from_json(&json!({"n": 4})).unwrap();
        assert_eq!(expr.eval(&doc, scope).unwrap(), Value::from(8));

        let err = expr.eval(&Document::new(), scope).unwrap_err();
        assert!(matches!(err, crate::error::PipestatError::Callback { .. }));

        let err = ProjectExpr::parse_field(&json!({"$call": "nope"}), scope, &ctx).unwrap_err();
        assert!(err.is_construction());
    }
}
