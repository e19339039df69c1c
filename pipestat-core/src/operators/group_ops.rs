// src/operators/group_ops.rs
// $group keys and accumulators

use super::{single_operator, BuildContext, Scope, ValueSource};
use crate::callbacks::{GroupFn, HostFn};
use crate::document::Document;
use crate::error::{PipestatError, Result};
use crate::value::{Map, Value, ValueKind};
use ahash::AHashSet;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

const STAGE: &str = "$group";

// ============================================================================
// GROUP KEY
// ============================================================================

/// The `_id` expression of a `$group` stage
#[derive(Debug, Clone)]
pub enum GroupId {
    Source(ValueSource),
    Document(Vec<(String, GroupId)>),
    Array(Vec<GroupId>),
}

impl GroupId {
    pub fn parse(json: &JsonValue, scope: Scope<'_>, ctx: &BuildContext<'_>) -> Result<GroupId> {
        match json {
            JsonValue::Object(_) if single_operator(json).is_some() => {
                Ok(GroupId::Source(ValueSource::parse(json, scope, ctx)?))
            }
            JsonValue::Object(obj) => {
                if let Some(op) = obj.keys().find(|k| k.starts_with('$')) {
                    return Err(scope.invalid(op, "an operator object must have exactly one key"));
                }
                let mut parts = Vec::with_capacity(obj.len());
                for (key, value) in obj {
                    parts.push((key.clone(), GroupId::parse(value, scope, ctx)?));
                }
                Ok(GroupId::Document(parts))
            }
            JsonValue::Array(items) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    parts.push(GroupId::parse(item, scope, ctx)?);
                }
                Ok(GroupId::Array(parts))
            }
            _ => Ok(GroupId::Source(ValueSource::literal_or_ref(json))),
        }
    }

    /// Evaluate the key; Missing parts become Null
    pub fn eval(&self, doc: &Document, scope: Scope<'_>) -> Result<Value> {
        match self {
            GroupId::Source(source) => match source.resolve(doc, scope)? {
                Value::Missing => Ok(Value::Null),
                value => Ok(value),
            },
            GroupId::Document(parts) => {
                let mut map = Map::with_capacity(parts.len());
                for (key, part) in parts {
                    map.insert(key.clone(), part.eval(doc, scope)?);
                }
                Ok(Value::Document(map))
            }
            GroupId::Array(parts) => {
                let mut items = Vec::with_capacity(parts.len());
                for part in parts {
                    items.push(part.eval(doc, scope)?);
                }
                Ok(Value::Array(items))
            }
        }
    }
}

// ============================================================================
// ACCUMULATORS
// ============================================================================

/// Per-field accumulator of a `$group` stage
#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(ValueSource),
    Avg(ValueSource),
    Min(ValueSource),
    Max(ValueSource),
    First(ValueSource),
    Last(ValueSource),
    AddToSet(ValueSource),
    Push(ValueSource),
    ConcatToSet(ValueSource),
    ConcatToList(ValueSource),
    Call(HostFn<GroupFn>),
    /// Nested object of accumulators
    Object(Vec<(String, Accumulator)>),
}

/// In-progress accumulation for one bucket and one field
#[derive(Debug, Clone)]
pub enum AccState {
    Sum(f64),
    Avg { sum: f64, count: u64 },
    Extremum(Value),
    First(Value),
    Last(Value),
    Set { items: Vec<Value>, seen: AHashSet<String> },
    List(Vec<Value>),
    Call(Value),
    Object(Vec<AccState>),
}

impl Accumulator {
    pub fn parse(json: &JsonValue, scope: Scope<'_>, ctx: &BuildContext<'_>) -> Result<Accumulator> {
        if let Some((name, arg)) = single_operator(json) {
            return Self::parse_operator(name, arg, scope, ctx);
        }
        match json {
            JsonValue::Object(obj) if !obj.is_empty() && !obj.keys().any(|k| k.starts_with('$')) => {
                let mut fields = Vec::with_capacity(obj.len());
                for (key, value) in obj {
                    fields.push((key.clone(), Accumulator::parse(value, scope, ctx)?));
                }
                Ok(Accumulator::Object(fields))
            }
            _ => Err(scope.invalid(
                STAGE,
                format!("expected an accumulator object such as {{\"$sum\": 1}}, got {}", json),
            )),
        }
    }

    fn parse_operator(
        name: &str,
        arg: &JsonValue,
        scope: Scope<'_>,
        ctx: &BuildContext<'_>,
    ) -> Result<Accumulator> {
        if name == "$call" {
            let fname = arg
                .as_str()
                .ok_or_else(|| scope.invalid(name, "expects the name of a registered reducer"))?;
            let func = ctx.callbacks.group_fn(fname).ok_or_else(|| {
                scope.invalid(name, format!("no group reducer registered as '{}'", fname))
            })?;
            return Ok(Accumulator::Call(HostFn {
                name: fname.to_string(),
                func,
            }));
        }

        let source = ValueSource::parse(arg, scope, ctx)?;
        let acc = match name {
            "$sum" | "$avg" => {
                if let ValueSource::Literal(v) = &source {
                    if v.kind() != ValueKind::Number {
                        return Err(scope.invalid(name, format!("literal must be a number, got {}", v)));
                    }
                }
                if name == "$sum" {
                    Accumulator::Sum(source)
                } else {
                    Accumulator::Avg(source)
                }
            }
            "$min" => Accumulator::Min(source),
            "$max" => Accumulator::Max(source),
            "$first" => Accumulator::First(source),
            "$last" => Accumulator::Last(source),
            "$addToSet" => Accumulator::AddToSet(source),
            "$push" => Accumulator::Push(source),
            "$concatToSet" | "$concatToList" => {
                if let ValueSource::Literal(v) = &source {
                    if v.kind() != ValueKind::Array {
                        return Err(scope.invalid(name, format!("literal must be an array, got {}", v)));
                    }
                }
                if name == "$concatToSet" {
                    Accumulator::ConcatToSet(source)
                } else {
                    Accumulator::ConcatToList(source)
                }
            }
            other => return Err(scope.invalid(other, "unknown accumulator")),
        };
        Ok(acc)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Accumulator::Sum(_) => "$sum",
            Accumulator::Avg(_) => "$avg",
            Accumulator::Min(_) => "$min",
            Accumulator::Max(_) => "$max",
            Accumulator::First(_) => "$first",
            Accumulator::Last(_) => "$last",
            Accumulator::AddToSet(_) => "$addToSet",
            Accumulator::Push(_) => "$push",
            Accumulator::ConcatToSet(_) => "$concatToSet",
            Accumulator::ConcatToList(_) => "$concatToList",
            Accumulator::Call(_) => "$call",
            Accumulator::Object(_) => STAGE,
        }
    }

    /// Initial state of a new bucket
    pub fn init(&self) -> AccState {
        match self {
            Accumulator::Sum(_) => AccState::Sum(0.0),
            Accumulator::Avg(_) => AccState::Avg { sum: 0.0, count: 0 },
            Accumulator::Min(_) | Accumulator::Max(_) => AccState::Extremum(Value::Missing),
            Accumulator::First(_) => AccState::First(Value::Missing),
            Accumulator::Last(_) => AccState::Last(Value::Missing),
            Accumulator::AddToSet(_) | Accumulator::ConcatToSet(_) => AccState::Set {
                items: Vec::new(),
                seen: AHashSet::new(),
            },
            Accumulator::Push(_) | Accumulator::ConcatToList(_) => AccState::List(Vec::new()),
            Accumulator::Call(_) => AccState::Call(Value::Missing),
            Accumulator::Object(fields) => AccState::Object(fields.iter().map(|(_, acc)| acc.init()).collect()),
        }
    }

    /// Fold one document into `state`
    pub fn accumulate(&self, state: &mut AccState, doc: &Document, scope: Scope<'_>) -> Result<()> {
        match (self, state) {
            (Accumulator::Sum(source), AccState::Sum(total)) => {
                if let Value::Number(n) = source.resolve(doc, scope)? {
                    *total += n;
                }
            }
            (Accumulator::Avg(source), AccState::Avg { sum, count }) => {
                if let Value::Number(n) = source.resolve(doc, scope)? {
                    *sum += n;
                    *count += 1;
                }
            }
            (Accumulator::Min(source), AccState::Extremum(current)) => {
                update_extremum(current, source.resolve(doc, scope)?, Ordering::Less);
            }
            (Accumulator::Max(source), AccState::Extremum(current)) => {
                update_extremum(current, source.resolve(doc, scope)?, Ordering::Greater);
            }
            (Accumulator::First(source), AccState::First(current)) => {
                if current.is_missing() {
                    *current = source.resolve(doc, scope)?;
                }
            }
            (Accumulator::Last(source), AccState::Last(current)) => {
                let value = source.resolve(doc, scope)?;
                if !value.is_missing() {
                    *current = value;
                }
            }
            (Accumulator::AddToSet(source), AccState::Set { items, seen }) => {
                let value = source.resolve(doc, scope)?;
                if !value.is_nullish() && seen.insert(value.canonical_key()) {
                    items.push(value);
                }
            }
            (Accumulator::Push(source), AccState::List(items)) => {
                let value = source.resolve(doc, scope)?;
                if !value.is_nullish() {
                    items.push(value);
                }
            }
            (Accumulator::ConcatToSet(source), AccState::Set { items, seen }) => {
                for value in array_source(self.name(), source, doc, scope)? {
                    if seen.insert(value.canonical_key()) {
                        items.push(value);
                    }
                }
            }
            (Accumulator::ConcatToList(source), AccState::List(items)) => {
                items.extend(array_source(self.name(), source, doc, scope)?);
            }
            (Accumulator::Call(host), AccState::Call(current)) => {
                *current = (host.func)(&*current, doc).map_err(|e| scope.callback(self.name(), e))?;
            }
            (Accumulator::Object(fields), AccState::Object(states)) => {
                for ((_, acc), state) in fields.iter().zip(states.iter_mut()) {
                    acc.accumulate(state, doc, scope)?;
                }
            }
            (acc, _) => {
                return Err(scope.evaluation(acc.name(), "accumulator state does not match its operator"));
            }
        }
        Ok(())
    }

    /// Output value of a finished bucket
    pub fn finalize(&self, state: AccState) -> Value {
        let value = match (self, state) {
            (_, AccState::Sum(total)) => Value::Number(total),
            (_, AccState::Avg { count: 0, .. }) => Value::Null,
            (_, AccState::Avg { sum, count }) => Value::Number(sum / count as f64),
            (_, AccState::Extremum(v) | AccState::First(v) | AccState::Last(v) | AccState::Call(v)) => v,
            (_, AccState::Set { items, .. } | AccState::List(items)) => Value::Array(items),
            (Accumulator::Object(fields), AccState::Object(states)) => Value::Document(
                fields
                    .iter()
                    .zip(states)
                    .map(|((key, acc), state)| (key.clone(), acc.finalize(state)))
                    .collect(),
            ),
            (_, AccState::Object(_)) => Value::Null,
        };
        match value {
            Value::Missing => Value::Null,
            other => other,
        }
    }
}

/// Keep the smaller (`Less`) or larger (`Greater`) value; nullish inputs are ignored
fn update_extremum(current: &mut Value, candidate: Value, keep: Ordering) {
    if candidate.is_nullish() {
        return;
    }
    if current.is_missing() || candidate.compare(current) == keep {
        *current = candidate;
    }
}

fn array_source(name: &str, source: &ValueSource, doc: &Document, scope: Scope<'_>) -> Result<Vec<Value>> {
    match source.resolve(doc, scope)? {
        Value::Array(items) => Ok(items),
        v if v.is_nullish() => Ok(Vec::new()),
        other => Err(scope.evaluation(
            name,
            format!("source must be an array, got {}", other.kind().name()),
        )),
    }
}

// ============================================================================
// GROUP SPECIFICATION
// ============================================================================

/// Parsed `$group` parameters: the key and the per-field accumulators
#[derive(Debug, Clone)]
pub struct GroupSpec {
    id: GroupId,
    fields: Vec<(String, Accumulator)>,
}

impl GroupSpec {
    pub fn parse(json: &JsonValue, ctx: &BuildContext<'_>) -> Result<GroupSpec> {
        let obj = json
            .as_object()
            .ok_or_else(|| PipestatError::invalid_stage(STAGE, "specification must be an object"))?;
        let id_spec = obj
            .get("_id")
            .ok_or_else(|| PipestatError::invalid_stage(STAGE, "specification must have an \"_id\" field"))?;
        let id = GroupId::parse(id_spec, Scope::new(STAGE, "_id"), ctx)?;

        let mut fields = Vec::with_capacity(obj.len().saturating_sub(1));
        for (key, value) in obj {
            if key == "_id" {
                continue;
            }
            let acc = Accumulator::parse(value, Scope::new(STAGE, key), ctx)?;
            fields.push((key.clone(), acc));
        }
        Ok(GroupSpec { id, fields })
    }

    /// Bucket key of a document: the evaluated `_id` and its canonical form
    pub fn key(&self, doc: &Document) -> Result<(String, Value)> {
        let id = self.id.eval(doc, Scope::new(STAGE, "_id"))?;
        Ok((id.canonical_key(), id))
    }

    pub fn init(&self) -> Vec<AccState> {
        self.fields.iter().map(|(_, acc)| acc.init()).collect()
    }

    pub fn accumulate(&self, states: &mut [AccState], doc: &Document) -> Result<()> {
        for ((key, acc), state) in self.fields.iter().zip(states.iter_mut()) {
            acc.accumulate(state, doc, Scope::new(STAGE, key))?;
        }
        Ok(())
    }

    /// Output document: `_id` first, then the fields in declaration order
    pub fn finalize(&self, id: Value, states: Vec<AccState>) -> Document {
        let mut out = Document::new();
        out.insert("_id", id);
        for ((key, acc), state) in self.fields.iter().zip(states) {
            out.insert(key.clone(), acc.finalize(state));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::Callbacks;
    use chrono::FixedOffset;
    use serde_json::json;

    fn ctx(callbacks: &Callbacks) -> BuildContext<'_> {
        BuildContext {
            callbacks,
            utc_offset: FixedOffset::east_opt(0).unwrap(),
        }
    }

    /// Run one accumulator over `docs` and finalize it
    fn fold(spec: JsonValue, docs: &[JsonValue]) -> Result<Value> {
        let callbacks = Callbacks::new();
        let scope = Scope::new(STAGE, "f");
        let acc = Accumulator::parse(&spec, scope, &ctx(&callbacks))?;
        let mut state = acc.init();
        for doc in docs {
            acc.accumulate(&mut state, &Document::from_json(doc).unwrap(), scope)?;
        }
        Ok(acc.finalize(state))
    }

    #[test]
    fn test_sum_and_count() {
        let docs = [json!({"x": 3}), json!({"x": "skip"}), json!({"x": 1.5}), json!({})];
        assert_eq!(fold(json!({"$sum": "$x"}), &docs).unwrap(), Value::from(4.5));
        assert_eq!(fold(json!({"$sum": 1}), &docs).unwrap(), Value::from(4));
        assert_eq!(fold(json!({"$sum": "$x"}), &[]).unwrap(), Value::from(0));
    }

    #[test]
    fn test_avg() {
        let docs = [json!({"x": 2}), json!({"x": 4}), json!({"x": null})];
        assert_eq!(fold(json!({"$avg": "$x"}), &docs).unwrap(), Value::from(3));
        assert_eq!(fold(json!({"$avg": "$y"}), &docs).unwrap(), Value::Null);
    }

    #[test]
    fn test_min_max_ignore_nullish() {
        let docs = [json!({"x": 5}), json!({}), json!({"x": null}), json!({"x": 2}), json!({"x": 9})];
        assert_eq!(fold(json!({"$min": "$x"}), &docs).unwrap(), Value::from(2));
        assert_eq!(fold(json!({"$max": "$x"}), &docs).unwrap(), Value::from(9));
        assert_eq!(fold(json!({"$max": "$y"}), &docs).unwrap(), Value::Null);
    }

    #[test]
    fn test_first_last() {
        let docs = [json!({}), json!({"x": "a"}), json!({"x": "b"}), json!({})];
        assert_eq!(fold(json!({"$first": "$x"}), &docs).unwrap(), Value::from("a"));
        assert_eq!(fold(json!({"$last": "$x"}), &docs).unwrap(), Value::from("b"));
    }

    #[test]
    fn test_push_and_add_to_set() {
        let docs = [
            json!({"x": {"a": 1, "b": 2}}),
            json!({"x": {"b": 2, "a": 1}}),
            json!({}),
            json!({"x": null}),
        ];
        let pushed = fold(json!({"$push": "$x"}), &docs).unwrap();
        assert_eq!(pushed.to_json(), json!([{"a": 1, "b": 2}, {"b": 2, "a": 1}]));
        let set = fold(json!({"$addToSet": "$x"}), &docs).unwrap();
        assert_eq!(set.to_json(), json!([{"a": 1, "b": 2}]));
    }

    #[test]
    fn test_push_and_add_to_set_skip_null() {
        let docs = [json!({"x": null}), json!({"x": 1}), json!({"x": null})];
        assert_eq!(fold(json!({"$push": "$x"}), &docs).unwrap().to_json(), json!([1]));
        assert_eq!(fold(json!({"$addToSet": "$x"}), &docs).unwrap().to_json(), json!([1]));
        let only_null = [json!({"x": null})];
        assert_eq!(fold(json!({"$push": "$x"}), &only_null).unwrap().to_json(), json!([]));
    }

    #[test]
    fn test_concat_accumulators() {
        let docs = [json!({"t": ["a", "b"]}), json!({"t": ["b", "c"]}), json!({})];
        assert_eq!(fold(json!({"$concatToList": "$t"}), &docs).unwrap().to_json(), json!(["a", "b", "b", "c"]));
        assert_eq!(fold(json!({"$concatToSet": "$t"}), &docs).unwrap().to_json(), json!(["a", "b", "c"]));

        let err = fold(json!({"$concatToList": "$t"}), &[json!({"t": "abc"})]).unwrap_err();
        assert!(err.is_runtime());
        assert!(err.to_string().contains("$concatToList"));
        assert!(err.to_string().contains("key=f"));
    }

    #[test]
    fn test_nested_object_and_expression_args() {
        let docs = [json!({"x": 2, "name": "A"}), json!({"x": 3, "name": "b"})];
        let spec = json!({"total": {"$sum": "$x"}, "names": {"$push": {"$toLower": "$name"}}});
        assert_eq!(fold(spec, &docs).unwrap().to_json(), json!({"total": 5, "names": ["a", "b"]}));
    }

    #[test]
    fn test_call_reducer() {
        let callbacks = Callbacks::new().with_group("concat", |prev: &Value, doc: &Document| {
            let mut s = prev.as_str().unwrap_or("").to_string();
            s.push_str(doc.get("c").as_str().unwrap_or("?"));
            Ok(Value::from(s))
        });
        let scope = Scope::new(STAGE, "f");
        let acc = Accumulator::parse(&json!({"$call": "concat"}), scope, &ctx(&callbacks)).unwrap();
        let mut state = acc.init();
        for c in ["x", "y"] {
            acc.accumulate(&mut state, &Document::from_json(&json!({"c": c})).unwrap(), scope)
                .unwrap();
        }
        assert_eq!(acc.finalize(state), Value::from("xy"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(fold(json!({"$sum": "x"}), &[]).unwrap_err().is_construction());
        assert!(fold(json!({"$median": "$x"}), &[]).unwrap_err().is_construction());
        assert!(fold(json!("$x"), &[]).unwrap_err().is_construction());
        assert!(fold(json!({"$sum": 1, "$max": "$x"}), &[]).unwrap_err().is_construction());
        assert!(fold(json!({"$call": "nope"}), &[]).unwrap_err().is_construction());
    }

    #[test]
    fn test_group_id_shapes() {
        let callbacks = Callbacks::new();
        let ctx = ctx(&callbacks);
        let scope = Scope::new(STAGE, "_id");
        let doc = Document::from_json(&json!({"app": "a", "day": 3})).unwrap();

        let id = GroupId::parse(&json!("$app"), scope, &ctx).unwrap();
        assert_eq!(id.eval(&doc, scope).unwrap(), Value::from("a"));
        let id = GroupId::parse(&json!("$nothing"), scope, &ctx).unwrap();
        assert_eq!(id.eval(&doc, scope).unwrap(), Value::Null);
        let id = GroupId::parse(&json!({"app": "$app", "d": "$day"}), scope, &ctx).unwrap();
        assert_eq!(id.eval(&doc, scope).unwrap().to_json(), json!({"app": "a", "d": 3}));
        let id = GroupId::parse(&json!(["$app", 1]), scope, &ctx).unwrap();
        assert_eq!(id.eval(&doc, scope).unwrap().to_json(), json!(["a", 1]));
        let id = GroupId::parse(&json!({"$toUpper": "$app"}), scope, &ctx).unwrap();
        assert_eq!(id.eval(&doc, scope).unwrap(), Value::from("A"));
    }

    #[test]
    fn test_group_spec() {
        let callbacks = Callbacks::new();
        let ctx = ctx(&callbacks);
        let spec = GroupSpec::parse(&json!({"_id": "$app", "n": {"$sum": 1}}), &ctx).unwrap();
        let doc = Document::from_json(&json!({"app": "a"})).unwrap();
        let (key, id) = spec.key(&doc).unwrap();
        assert_eq!(key, Value::from("a").canonical_key());
        let mut states = spec.init();
        spec.accumulate(&mut states, &doc).unwrap();
        spec.accumulate(&mut states, &doc).unwrap();
        assert_eq!(spec.finalize(id, states).to_json(), json!({"_id": "a", "n": 2}));

        assert!(GroupSpec::parse(&json!({"n": {"$sum": 1}}), &ctx).unwrap_err().is_construction());
        assert!(GroupSpec::parse(&json!([]), &ctx).unwrap_err().is_construction());
    }
}
