// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use indexmap::IndexSet;
use solver::{DependencyKey, Query, RuleId};

use crate::nodes::TaskContext;
use crate::types::{Failure, TypeId, Value};

pub type TaskFn =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync>;

///
/// A user rule: an async function of its declared parameter types, which may additionally
/// perform the Gets it declared.
///
#[derive(Clone)]
pub struct Task {
    pub id: RuleId,
    pub product: TypeId,
    /// The parameter types of the rule itself plus the Gets its body may perform, as
    /// declared dependency keys.
    pub dependency_keys: Vec<DependencyKey<TypeId>>,
    pub func: TaskFn,
    pub cacheable: bool,
    pub side_effecting: bool,
    /// A description of the rule for workunits, or None to render at trace level only.
    pub display_info: DisplayInfo,
}

#[derive(Clone, Debug)]
pub struct DisplayInfo {
    pub name: String,
    pub desc: Option<String>,
    pub level: log::Level,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("product", &self.product)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

///
/// A rule implemented by the engine in native code. Intrinsics participate in the rule
/// graph exactly like user rules: they declare product and input types, so the compiler
/// reasons about them uniformly.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Intrinsic {
    pub id: RuleId,
    pub product: TypeId,
    pub inputs: Vec<DependencyKey<TypeId>>,
}

impl Intrinsic {
    pub fn new(id: &str, product: TypeId, input: TypeId) -> Intrinsic {
        Intrinsic {
            id: RuleId::new(id),
            product,
            inputs: vec![DependencyKey::new(input)],
        }
    }
}

///
/// The rule type fed to the solver: either a user Task or a native Intrinsic.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Rule {
    Task(Arc<Task>),
    Intrinsic(Arc<Intrinsic>),
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Task(t) => write!(f, "@rule({})", t.id),
            Rule::Intrinsic(i) => write!(f, "@intrinsic({})", i.id),
        }
    }
}

impl solver::Rule for Rule {
    type TypeId = TypeId;

    fn id(&self) -> &RuleId {
        match self {
            Rule::Task(t) => &t.id,
            Rule::Intrinsic(i) => &i.id,
        }
    }

    fn product(&self) -> TypeId {
        match self {
            Rule::Task(t) => t.product,
            Rule::Intrinsic(i) => i.product,
        }
    }

    fn dependency_keys(&self) -> Vec<&DependencyKey<TypeId>> {
        match self {
            Rule::Task(t) => t.dependency_keys.iter().collect(),
            Rule::Intrinsic(i) => i.inputs.iter().collect(),
        }
    }

    fn require_reachable(&self) -> bool {
        match self {
            Rule::Task(_) => true,
            // Intrinsics are installed unconditionally, and need not all be consumed.
            Rule::Intrinsic(_) => false,
        }
    }
}

///
/// The registry of rules and queries from which a Scheduler is constructed. Registration
/// completes before the first Session: the resulting rule set is immutable.
///
#[derive(Default)]
pub struct Tasks {
    rules: IndexSet<Rule>,
    queries: IndexSet<Query<TypeId>>,
}

impl Tasks {
    pub fn new() -> Tasks {
        Tasks::default()
    }

    pub fn rules(&self) -> &IndexSet<Rule> {
        &self.rules
    }

    pub fn queries(&self) -> &IndexSet<Query<TypeId>> {
        &self.queries
    }

    pub fn add_task(&mut self, task: Task) {
        let rule = Rule::Task(Arc::new(task));
        assert!(
            !self.rules.contains(&rule),
            "{rule} was double-registered",
        );
        self.rules.insert(rule);
    }

    pub fn add_intrinsic(&mut self, intrinsic: Intrinsic) {
        let rule = Rule::Intrinsic(Arc::new(intrinsic));
        assert!(
            !self.rules.contains(&rule),
            "{rule} was double-registered",
        );
        self.rules.insert(rule);
    }

    pub fn add_query(&mut self, product: TypeId, params: Vec<TypeId>) {
        self.queries.insert(Query::new(product, params));
    }
}
