// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The engine's dynamic value model: type-tagged, hash-identified values which flow between
//! rules. Rule signatures are declared over `TypeId`s; rule bodies exchange `Value`s; the
//! memoisation layer identifies parameters by their `Key` (type plus content hash).

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use fingerprint::Digest;
use smallvec::SmallVec;

///
/// The identity of an engine-visible type: the Rust TypeId plus a stable display name.
///
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct TypeId {
    id: std::any::TypeId,
    name: &'static str,
}

impl TypeId {
    pub fn of<T: Any>() -> TypeId {
        TypeId {
            id: std::any::TypeId::of::<T>(),
            name: short_type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

fn short_type_name<T: Any>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

impl Ord for TypeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Order by name first for stable human-facing rendering, with the opaque id as the
        // tiebreak for distinct types sharing a short name.
        (self.name, self.id).cmp(&(other.name, other.id))
    }
}

impl PartialOrd for TypeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl solver::TypeId for TypeId {
    fn display<I: Iterator<Item = TypeId>>(type_ids: I) -> String {
        let mut names: Vec<_> = type_ids.map(|t| t.name.to_owned()).collect();
        names.sort();
        format!("({})", names.join(", "))
    }
}

///
/// The object-safe face of an engine value: equality is dynamic, so that `Value`s of any
/// concrete type can be compared (values of different types are never equal).
///
pub trait AnyValue: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn AnyValue) -> bool;
}

impl<T: Any + Send + Sync + fmt::Debug + Eq> AnyValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn AnyValue) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }
}

///
/// A shared, type-erased engine value.
///
#[derive(Clone)]
pub struct Value(Arc<dyn AnyValue>);

impl Value {
    pub fn new<T: AnyValue>(value: T) -> Value {
        Value(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    ///
    /// Extracts the concrete type from this Value, or errors with the expectation.
    ///
    pub fn extract<T: Any + Clone>(&self) -> Result<T, String> {
        self.downcast_ref::<T>().cloned().ok_or_else(|| {
            format!(
                "Expected a value of type {}, but got: {:?}",
                std::any::type_name::<T>(),
                self.0
            )
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}

impl Eq for Value {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

///
/// An identity for a Value usable as a map key: the value's type and its content hash.
/// Parameter values must be hashable; outputs need not be.
///
#[derive(Clone)]
pub struct Key {
    type_id: TypeId,
    hash: u64,
    value: Value,
}

impl Key {
    pub fn new<T: AnyValue + Hash + Eq>(value: T) -> Key {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        Key {
            type_id: TypeId::of::<T>(),
            hash: hasher.finish(),
            value: Value::new(value),
        }
    }

    pub fn type_id(&self) -> &TypeId {
        &self.type_id
    }

    pub fn to_value(&self) -> Value {
        self.value.clone()
    }
}

impl Eq for Key {}

impl PartialEq for Key {
    fn eq(&self, other: &Key) -> bool {
        self.type_id == other.type_id && self.hash == other.hash && self.value == other.value
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.hash.hash(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

///
/// Params represent a TypeId->Key map: stored as Keys sorted by (distinct) TypeId for
/// hashability. Node identity is therefore insensitive to parameter ordering.
///
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Params(SmallVec<[Key; 4]>);

impl Params {
    pub fn new<I: IntoIterator<Item = Key>>(param_inputs: I) -> Result<Params, String> {
        let mut params = param_inputs.into_iter().collect::<SmallVec<[Key; 4]>>();
        params.sort_by(|l, r| l.type_id().cmp(r.type_id()));

        if params.len() > 1 {
            let mut prev = &params[0];
            for param in &params[1..] {
                if param.type_id() == prev.type_id() {
                    return Err(format!(
                        "Values used as Params must have distinct types, but the following \
             values had the same type (`{}`):\n  {prev}\n  {param}",
                        prev.type_id(),
                    ));
                }
                prev = param;
            }
        }

        Ok(Params(params))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.0.iter()
    }

    ///
    /// Adds the given param Keys to these Params, replacing existing params with the same
    /// type if they exist.
    ///
    pub fn extend(&mut self, params: impl IntoIterator<Item = Key>) {
        for param in params {
            match self.binary_search(param.type_id()) {
                Ok(idx) => self.0[idx] = param,
                Err(idx) => self.0.insert(idx, param),
            }
        }
    }

    ///
    /// Filters this Params object in-place to contain only params matching the predicate.
    ///
    pub fn retain<F: FnMut(&mut Key) -> bool>(&mut self, f: F) {
        self.0.retain(f)
    }

    ///
    /// Returns the Key for the given TypeId if it is represented in this set of Params.
    ///
    pub fn find(&self, type_id: &TypeId) -> Option<&Key> {
        self.binary_search(type_id).ok().map(|idx| &self.0[idx])
    }

    fn binary_search(&self, type_id: &TypeId) -> Result<usize, usize> {
        self.0.binary_search_by(|probe| probe.type_id().cmp(type_id))
    }

    pub fn type_ids(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.0.iter().map(|k| *k.type_id())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut items: Vec<_> = self.0.iter().map(|k| format!("{}", k.type_id())).collect();
        items.sort();
        write!(f, "Params({})", items.join(", "))
    }
}

///
/// An engine-or-user failure, which propagates up the dependency chain exactly like a
/// value. `Invalidated` and `MissingDigest` are engine control flow; `Throw` carries a user
/// error payload and the frames it passed through.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Failure {
    /// A Node was invalidated while running.
    Invalidated,
    /// A Digest was missing from the stores: the engine may backtrack to re-produce it.
    MissingDigest(String, Digest),
    /// A user error propagating through the graph.
    Throw {
        val: String,
        frames: Vec<String>,
    },
}

impl Failure {
    pub fn with_pushed_frame(self, frame: &str) -> Failure {
        match self {
            Failure::Throw { val, mut frames } => {
                frames.push(frame.to_owned());
                Failure::Throw { val, frames }
            }
            // Invalidated and MissingDigest are engine control flow, and must not be
            // converted into user errors by annotation.
            failure => failure,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Invalidated => write!(f, "Giving up on retrying due to changed files."),
            Failure::MissingDigest(s, d) => write!(f, "Missing digest: {s}: {d:?}"),
            Failure::Throw { val, .. } => write!(f, "{val}"),
        }
    }
}

impl memo::NodeError for Failure {
    fn invalidated() -> Failure {
        Failure::Invalidated
    }

    fn generic(message: String) -> Failure {
        throw(message)
    }
}

impl From<cas::StoreError> for Failure {
    fn from(err: cas::StoreError) -> Self {
        match err {
            cas::StoreError::MissingDigest(s, d) => Self::MissingDigest(s, d),
            cas::StoreError::Unclassified(s) => throw(s),
        }
    }
}

impl From<exec::ProcessError> for Failure {
    fn from(err: exec::ProcessError) -> Self {
        match err {
            exec::ProcessError::MissingDigest(s, d) => Self::MissingDigest(s, d),
            exec::ProcessError::Unclassified(s) => throw(s),
        }
    }
}

impl From<String> for Failure {
    fn from(err: String) -> Self {
        throw(err)
    }
}

pub fn throw(msg: String) -> Failure {
    Failure::Throw {
        val: msg,
        frames: Vec::new(),
    }
}
