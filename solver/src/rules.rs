// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use internment::Intern;
use smallvec::SmallVec;

/// The set of parameter types in scope at some position in a rule graph.
pub type ParamTypes<T> = BTreeSet<T>;

pub trait TypeId:
    Clone + Copy + Debug + Display + Hash + Eq + Ord + Sized + Send + Sync + 'static
{
    ///
    /// Renders a string for a collection of TypeIds.
    ///
    fn display<I>(type_ids: I) -> String
    where
        I: Iterator<Item = Self>;
}

/// The stable name of a rule, unique within a rule set.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct RuleId(Intern<String>);

impl RuleId {
    pub fn new(id: &str) -> Self {
        Self(Intern::from(id))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

///
/// A statically-declared dependency of a rule: the product type it will request, plus any
/// parameter types the request itself will provide into scope for the callee.
///
#[derive(Eq, Hash, PartialEq, Clone, Debug, PartialOrd, Ord)]
pub struct DependencyKey<T: TypeId> {
    product: T,
    provided_params: SmallVec<[T; 2]>,
}

impl<T: TypeId> DependencyKey<T> {
    pub fn new(product: T) -> Self {
        DependencyKey {
            product,
            provided_params: SmallVec::default(),
        }
    }

    pub fn new_with_params<I: IntoIterator<Item = T>>(product: T, provided_params: I) -> Self {
        let mut provided_params = provided_params.into_iter().collect::<SmallVec<[T; 2]>>();
        provided_params.sort();
        provided_params.dedup();
        DependencyKey {
            product,
            provided_params,
        }
    }

    ///
    /// The product (output) type of this dependency.
    ///
    pub fn product(&self) -> T {
        self.product
    }

    ///
    /// The parameter types which this dependency introduces into scope for its callee.
    ///
    pub fn provided_params(&self) -> &[T] {
        &self.provided_params
    }
}

impl<T: TypeId> Display for DependencyKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.provided_params.is_empty() {
            write!(f, "{}", self.product)
        } else {
            write!(
                f,
                "Get({}, {})",
                self.product,
                T::display(self.provided_params.iter().cloned())
            )
        }
    }
}

pub trait Rule: Clone + Debug + Display + Hash + Eq + Sized + Send + Sync + 'static {
    type TypeId: TypeId;

    ///
    /// The stable id of this rule.
    ///
    fn id(&self) -> &RuleId;

    ///
    /// The product (output) type of this Rule.
    ///
    fn product(&self) -> Self::TypeId;

    ///
    /// The keys for the dependencies of this Rule: its positional parameters and the Gets
    /// its body may perform.
    ///
    fn dependency_keys(&self) -> Vec<&DependencyKey<Self::TypeId>>;

    ///
    /// True if this rule is required to be reachable in the RuleGraph (an unreachable such
    /// rule is dead code and an error).
    ///
    fn require_reachable(&self) -> bool;
}

///
/// An external entry point into the rule graph: an output type, and the parameter types
/// available at the root.
///
#[derive(Eq, Hash, PartialEq, Clone, Debug, PartialOrd, Ord)]
pub struct Query<T: TypeId> {
    pub product: T,
    pub params: ParamTypes<T>,
}

impl<T: TypeId> Query<T> {
    pub fn new<I: IntoIterator<Item = T>>(product: T, params: I) -> Query<T> {
        Query {
            product,
            params: params.into_iter().collect(),
        }
    }
}

impl<T: TypeId> Display for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Query({} for {})",
            self.product,
            super::params_str(&self.params)
        )
    }
}
