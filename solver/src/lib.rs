// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The static rule graph compiler: given registered rule signatures and declared queries,
//! computes a table mapping every reachable `(rule, in-scope parameters)` position to the
//! unique rule satisfying each of its dependencies. Ambiguities and gaps are compile errors.

mod builder;
mod rules;
#[cfg(test)]
mod tests;

use std::io;

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use indexmap::IndexSet;
use internment::Intern;

pub use crate::builder::Builder;
pub use crate::rules::{DependencyKey, ParamTypes, Query, Rule, RuleId, TypeId};

///
/// A rule (or root) position in the graph: a rule plus the parameter types in scope for it.
///
#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub enum EntryWithDeps<R: Rule> {
    Root(RootEntry<R::TypeId>),
    Rule(RuleEntry<R>),
}

impl<R: Rule> EntryWithDeps<R> {
    pub fn rule(&self) -> Option<&R> {
        match self {
            EntryWithDeps::Rule(RuleEntry { rule, .. }) => Some(rule),
            EntryWithDeps::Root(_) => None,
        }
    }

    pub fn params(&self) -> &ParamTypes<R::TypeId> {
        match self {
            EntryWithDeps::Rule(re) => &re.params,
            EntryWithDeps::Root(re) => &re.query.params,
        }
    }

    pub(crate) fn dependency_keys(&self) -> Vec<DependencyKey<R::TypeId>> {
        match self {
            EntryWithDeps::Rule(RuleEntry { rule, .. }) => {
                rule.dependency_keys().into_iter().cloned().collect()
            }
            EntryWithDeps::Root(RootEntry { query }) => {
                vec![DependencyKey::new(query.product)]
            }
        }
    }

    ///
    /// A copy of this entry with its parameter types replaced by the given (used) set.
    ///
    pub(crate) fn simplified(&self, simplified_params: ParamTypes<R::TypeId>) -> EntryWithDeps<R> {
        match self {
            EntryWithDeps::Rule(RuleEntry { rule, .. }) => EntryWithDeps::Rule(RuleEntry {
                params: simplified_params,
                rule: rule.clone(),
            }),
            EntryWithDeps::Root(RootEntry { query }) => EntryWithDeps::Root(RootEntry {
                query: Query {
                    product: query.product,
                    params: simplified_params,
                },
            }),
        }
    }
}

///
/// Any node in the graph: a position with dependencies, or a parameter consumed directly
/// from the in-scope set.
///
#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub enum Entry<R: Rule> {
    Param(R::TypeId),
    WithDeps(Intern<EntryWithDeps<R>>),
}

impl<R: Rule> Entry<R> {
    pub(crate) fn params(&self) -> Vec<R::TypeId> {
        match self {
            Entry::WithDeps(e) => e.params().iter().cloned().collect(),
            Entry::Param(type_id) => vec![*type_id],
        }
    }
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct RootEntry<T: TypeId> {
    pub query: Query<T>,
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct RuleEntry<R: Rule> {
    pub(crate) params: ParamTypes<R::TypeId>,
    pub(crate) rule: R,
}

impl<R: Rule> RuleEntry<R> {
    pub fn rule(&self) -> &R {
        &self.rule
    }

    pub fn params(&self) -> &ParamTypes<R::TypeId> {
        &self.params
    }
}

type RuleDependencyEdges<R> = HashMap<Intern<EntryWithDeps<R>>, RuleEdges<R>>;

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub(crate) struct Diagnostic {
    pub(crate) reason: String,
    pub(crate) details: Vec<String>,
}

///
/// A complete rule graph: for every reachable entry, the unique choice made for each of its
/// dependency keys.
///
#[derive(Debug)]
pub struct RuleGraph<R: Rule> {
    queries: Vec<Query<R::TypeId>>,
    rule_dependency_edges: RuleDependencyEdges<R>,
    unreachable_rules: Vec<R>,
}

impl<R: Rule> Default for RuleGraph<R> {
    fn default() -> Self {
        RuleGraph {
            queries: Vec::default(),
            rule_dependency_edges: RuleDependencyEdges::default(),
            unreachable_rules: Vec::default(),
        }
    }
}

pub(crate) fn params_str<T: TypeId>(params: &ParamTypes<T>) -> String {
    T::display(params.iter().cloned())
}

pub fn entry_str<R: Rule>(entry: &Entry<R>) -> String {
    match entry {
        Entry::WithDeps(e) => entry_with_deps_str(e),
        Entry::Param(type_id) => format!("Param({type_id})"),
    }
}

fn entry_with_deps_str<R: Rule>(entry: &EntryWithDeps<R>) -> String {
    match entry {
        EntryWithDeps::Rule(RuleEntry { rule, params }) => {
            format!("{rule} for {}", params_str(params))
        }
        EntryWithDeps::Root(root) => format!(
            "Query({} for {})",
            root.query.product,
            params_str(&root.query.params)
        ),
    }
}

impl<R: Rule> RuleGraph<R> {
    pub fn new(
        rules: IndexSet<R>,
        queries: IndexSet<Query<R::TypeId>>,
    ) -> Result<RuleGraph<R>, String> {
        Builder::new(rules, queries).graph()
    }

    pub fn queries(&self) -> &[Query<R::TypeId>] {
        &self.queries
    }

    ///
    /// Finds the entrypoint in this RuleGraph for the given product and parameter types.
    ///
    /// The available parameters may be a superset of a declared Query's: the unique Query
    /// whose parameters are a subset of the given set is chosen.
    ///
    pub fn find_root<I: IntoIterator<Item = R::TypeId>>(
        &self,
        param_inputs: I,
        product: R::TypeId,
    ) -> Result<(Intern<EntryWithDeps<R>>, RuleEdges<R>), String> {
        let params: ParamTypes<_> = param_inputs.into_iter().collect();

        // Attempt to find an exact match.
        let maybe_root = Intern::new(EntryWithDeps::Root(RootEntry {
            query: Query {
                product,
                params: params.clone(),
            },
        }));
        if let Some(edges) = self.rule_dependency_edges.get(&maybe_root) {
            return Ok((maybe_root, edges.clone()));
        }

        // Otherwise, scan for subset matches.
        let subset_matches = self
            .rule_dependency_edges
            .iter()
            .filter_map(|(entry, edges)| match entry.as_ref() {
                EntryWithDeps::Root(root_entry)
                    if root_entry.query.product == product
                        && root_entry.query.params.is_subset(&params) =>
                {
                    Some((entry, edges))
                }
                _ => None,
            })
            .collect::<Vec<_>>();

        match subset_matches.len() {
            1 => {
                let (root_entry, edges) = subset_matches[0];
                Ok((*root_entry, edges.clone()))
            }
            0 => {
                let mut suggestions: Vec<_> = self
                    .rule_dependency_edges
                    .keys()
                    .filter_map(|entry| match entry.as_ref() {
                        EntryWithDeps::Root(root_entry) if root_entry.query.product == product => {
                            Some(format!("Params({})", params_str(&root_entry.query.params)))
                        }
                        _ => None,
                    })
                    .collect();
                let suggestions_str = if suggestions.is_empty() {
                    format!(
                        "return the type {product}. Try registering Query({product} for {}).",
                        params_str(&params),
                    )
                } else {
                    suggestions.sort();
                    format!(
                        "can compute {product} given input Params({}), but it can be produced using:\n  {}",
                        params_str(&params),
                        suggestions.join("\n  ")
                    )
                };
                Err(format!("No installed Queries {suggestions_str}"))
            }
            _ => {
                let match_strs = subset_matches
                    .into_iter()
                    .map(|(e, _)| entry_with_deps_str(e))
                    .collect::<Vec<_>>();
                Err(format!(
                    "More than one set of rules can compute {product} for input Params({}):\n  {}",
                    params_str(&params),
                    match_strs.join("\n  "),
                ))
            }
        }
    }

    ///
    /// The pre-computed choices for the given (inner) entry, used at runtime to resolve
    /// Gets without searching.
    ///
    pub fn edges_for_inner(&self, entry: &Entry<R>) -> Option<RuleEdges<R>> {
        if let Entry::WithDeps(e) = entry {
            self.rule_dependency_edges.get(e).cloned()
        } else {
            panic!("not an inner entry! {entry:?}")
        }
    }

    ///
    /// All types consumed by rules in this graph: the types which participate in memoisation
    /// keys.
    ///
    pub fn consumed_types(&self) -> HashSet<R::TypeId> {
        self.rule_dependency_edges
            .iter()
            .flat_map(|(entry, edges)| {
                entry
                    .params()
                    .iter()
                    .cloned()
                    .chain(edges.dependencies.keys().map(|k| k.product()))
            })
            .collect()
    }

    ///
    /// Errors if any rule which is required to be reachable was not reachable from the
    /// declared queries.
    ///
    pub fn validate_reachability(&self) -> Result<(), String> {
        if self.unreachable_rules.is_empty() {
            return Ok(());
        }

        let rules = self
            .unreachable_rules
            .iter()
            .map(|r| format!("  {r}"))
            .collect::<Vec<_>>();
        Err(format!(
            "The following rules were not reachable from any Query (dead code, or missing a \
       Query):\n{}",
            rules.join("\n")
        ))
    }

    pub fn visualize(&self, f: &mut dyn io::Write) -> io::Result<()> {
        let mut queries_strs = self
            .queries
            .iter()
            .map(|q| q.to_string())
            .collect::<Vec<String>>();
        queries_strs.sort();
        writeln!(f, "digraph {{")?;
        writeln!(f, "  // queries: {}", queries_strs.join(", "))?;
        let mut rule_strs = self
            .rule_dependency_edges
            .iter()
            .map(|(k, deps)| {
                let mut dep_entries = deps
                    .all_dependencies()
                    .map(|d| format!("\"{}\"", entry_str(d)))
                    .collect::<Vec<_>>();
                dep_entries.sort();
                format!(
                    "    \"{}\" -> {{{}}}",
                    entry_with_deps_str(k),
                    dep_entries.join(" ")
                )
            })
            .collect::<Vec<String>>();
        rule_strs.sort();
        writeln!(f, "{}", rule_strs.join("\n"))?;
        writeln!(f, "}}")
    }
}

///
/// The choice made for each dependency key of a rule position.
///
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct RuleEdges<R: Rule> {
    dependencies: HashMap<DependencyKey<R::TypeId>, Intern<Entry<R>>>,
}

impl<R: Rule> RuleEdges<R> {
    pub fn entry_for(&self, dependency_key: &DependencyKey<R::TypeId>) -> Option<Intern<Entry<R>>> {
        self.dependencies.get(dependency_key).cloned()
    }

    pub fn all_dependencies(&self) -> impl Iterator<Item = &Intern<Entry<R>>> {
        self.dependencies.values()
    }

    pub(crate) fn add_edge(
        &mut self,
        dependency_key: DependencyKey<R::TypeId>,
        entry: Intern<Entry<R>>,
    ) {
        self.dependencies.insert(dependency_key, entry);
    }
}

impl<R: Rule> Default for RuleEdges<R> {
    fn default() -> Self {
        RuleEdges {
            dependencies: HashMap::default(),
        }
    }
}
