//! Host functions for the `$call` escape hatch
//!
//! A stage specification stays plain data: `{"$call": "is_vip"}` names a
//! function that the embedding program registered here. Names are resolved
//! once, when the pipeline is built.

use crate::document::Document;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// `$match` predicate: receives the field value (Missing for top-level use) and the document
pub type MatchFn = Arc<dyn Fn(&Value, &Document) -> anyhow::Result<bool> + Send + Sync>;

/// `$project` function: computes the output value from the whole document
pub type ProjectFn = Arc<dyn Fn(&Document) -> anyhow::Result<Value> + Send + Sync>;

/// `$group` reducer: receives the previous accumulated value (Missing on first call)
pub type GroupFn = Arc<dyn Fn(&Value, &Document) -> anyhow::Result<Value> + Send + Sync>;

/// A registered function together with the name it was resolved from
#[derive(Clone)]
pub struct HostFn<F> {
    pub name: String,
    pub func: F,
}

impl<F> fmt::Debug for HostFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFn({})", self.name)
    }
}

#[derive(Clone, Default)]
pub struct Callbacks {
    matchers: HashMap<String, MatchFn>,
    projectors: HashMap<String, ProjectFn>,
    reducers: HashMap<String, GroupFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_match<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Document) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.matchers.insert(name.into(), Arc::new(f));
        self
    }

    pub fn with_project<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Document) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.projectors.insert(name.into(), Arc::new(f));
        self
    }

    pub fn with_group<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Document) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.reducers.insert(name.into(), Arc::new(f));
        self
    }

    pub fn match_fn(&self, name: &str) -> Option<MatchFn> {
        self.matchers.get(name).cloned()
    }

    pub fn project_fn(&self, name: &str) -> Option<ProjectFn> {
        self.projectors.get(name).cloned()
    }

    pub fn group_fn(&self, name: &str) -> Option<GroupFn> {
        self.reducers.get(name).cloned()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |map: Vec<&String>| {
            let mut v: Vec<String> = map.into_iter().cloned().collect();
            v.sort();
            v
        };
        f.debug_struct("Callbacks")
            .field("matchers", &names(self.matchers.keys().collect()))
            .field("projectors", &names(self.projectors.keys().collect()))
            .field("reducers", &names(self.reducers.keys().collect()))
            .finish()
    }
}
