// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeSet, hash_map};

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use indexmap::IndexSet;
use internment::Intern;

use crate::rules::{DependencyKey, Query, Rule};
use crate::{
    Diagnostic, Entry, EntryWithDeps, ParamTypes, RootEntry, RuleEdges, RuleGraph, params_str,
};

type PolyRuleDependencyEdges<R> = HashMap<EntryWithDeps<R>, PolyRuleEdges<R>>;
type MonoRuleDependencyEdges<R> = HashMap<EntryWithDeps<R>, RuleEdges<R>>;
type UnfulfillableRuleMap<R> = HashMap<EntryWithDeps<R>, Vec<Diagnostic>>;
type ChosenDependency<R> = (DependencyKey<<R as Rule>::TypeId>, Vec<Entry<R>>);

enum ConstructGraphResult<R: Rule> {
    // The Entry was satisfiable without waiting for any additional entries. The result
    // contains a simplified copy of the input Entry.
    Fulfilled(EntryWithDeps<R>),
    // The Entry was not satisfiable with the installed rules.
    Unfulfillable,
    // The Entry may be satisfiable, but is currently blocked waiting for the results of the
    // given entries (which are on the call stack above it). The carried simplified entry
    // does not yet contain its full set of used parameters; a caller which is the source of
    // the cycle uses it to complete anyway, and then re-runs its own discovery.
    CycledOn {
        cyclic_deps: HashSet<EntryWithDeps<R>>,
        simplified_entry: EntryWithDeps<R>,
    },
}

enum MonomorphizeResult<R: Rule> {
    // As ConstructGraphResult::Fulfilled, but an entry may monomorphize to multiple
    // parameter-set variants.
    Fulfilled(Vec<EntryWithDeps<R>>),
    Unfulfillable,
    CycledOn {
        cyclic_deps: HashSet<EntryWithDeps<R>>,
        simplified_entries: Vec<EntryWithDeps<R>>,
    },
}

///
/// The polymorphic form of RuleEdges: each dependency key may have multiple candidate
/// implementations before monomorphization chooses among them.
///
#[derive(Eq, PartialEq, Clone, Debug)]
struct PolyRuleEdges<R: Rule> {
    dependencies: HashMap<DependencyKey<R::TypeId>, Vec<Entry<R>>>,
}

impl<R: Rule> Default for PolyRuleEdges<R> {
    fn default() -> Self {
        PolyRuleEdges {
            dependencies: HashMap::default(),
        }
    }
}

///
/// Given registered rules and declared queries, produces a RuleGraph which allows dependency
/// nodes to be found statically rather than by searching at runtime.
///
pub struct Builder<R: Rule> {
    rules_by_product: HashMap<R::TypeId, Vec<R>>,
    rules: IndexSet<R>,
    queries: IndexSet<Query<R::TypeId>>,
}

impl<R: Rule> Builder<R> {
    pub fn new(rules: IndexSet<R>, queries: IndexSet<Query<R::TypeId>>) -> Builder<R> {
        let mut rules_by_product: HashMap<_, Vec<R>> = HashMap::default();
        for rule in &rules {
            rules_by_product
                .entry(rule.product())
                .or_default()
                .push(rule.clone());
        }
        Builder {
            rules_by_product,
            rules,
            queries,
        }
    }

    pub fn graph(self) -> Result<RuleGraph<R>, String> {
        let mut dependency_edges = HashMap::default();
        let mut all_simplified_entries = HashMap::default();
        let mut unfulfillable_rules = HashMap::default();

        // First construct a polymorphic graph, where each dependency edge carries every
        // possible implementation.
        for query in &self.queries {
            self.construct_graph_helper(
                &mut dependency_edges,
                &mut all_simplified_entries,
                &mut unfulfillable_rules,
                &EntryWithDeps::Root(RootEntry {
                    query: query.clone(),
                }),
            );
        }

        // Then monomorphize it, selecting exactly one implementation per edge.
        let rule_dependency_edges =
            Self::monomorphize_graph(&dependency_edges, &mut unfulfillable_rules);

        // Every declared query must have produced exactly one usable root: zero means a
        // missing rule, and more than one means the query is ambiguous.
        let mut errors = Vec::new();
        for query in &self.queries {
            let mut roots = rule_dependency_edges
                .iter()
                .filter_map(|(entry, edges)| match entry {
                    EntryWithDeps::Root(root) if root.query.product == query.product => {
                        Some((entry, edges))
                    }
                    _ => None,
                })
                .collect::<Vec<_>>();
            match roots.len() {
                1 => (),
                0 => {
                    errors.push(format!(
                        "No rule was able to compute {query}:\n{}",
                        Self::render_diagnostics(&unfulfillable_rules)
                    ));
                }
                _ => {
                    roots.sort_by_key(|(entry, _)| format!("{entry:?}"));
                    let variants = roots
                        .iter()
                        .flat_map(|(_, edges)| edges.all_dependencies())
                        .map(|entry| crate::entry_str(entry))
                        .collect::<Vec<_>>();
                    errors.push(format!(
                        "Ambiguous rules to compute {query}:\n  {}",
                        variants.join("\n  ")
                    ));
                }
            }
        }
        if !errors.is_empty() {
            errors.sort();
            return Err(errors.join("\n\n"));
        }

        // Finally, compute which rules are dead post-monomorphization.
        let unreachable_rules = self.unreachable_rules(&rule_dependency_edges);

        Ok(RuleGraph {
            queries: self.queries.into_iter().collect(),
            rule_dependency_edges: rule_dependency_edges
                .into_iter()
                .map(|(entry, edges)| (Intern::new(entry), edges))
                .collect(),
            unreachable_rules,
        })
    }

    fn render_diagnostics(unfulfillable_rules: &UnfulfillableRuleMap<R>) -> String {
        let mut rendered = unfulfillable_rules
            .values()
            .flatten()
            .map(|diagnostic| {
                let details = if diagnostic.details.is_empty() {
                    String::new()
                } else {
                    format!(":\n      {}", diagnostic.details.join("\n      "))
                };
                format!("  {}{details}", diagnostic.reason)
            })
            .collect::<Vec<_>>();
        rendered.sort();
        rendered.dedup();
        rendered.join("\n")
    }

    ///
    /// Computes the rules which are reachability-mandatory but unreachable from any root.
    ///
    fn unreachable_rules(&self, full_dependency_edges: &MonoRuleDependencyEdges<R>) -> Vec<R> {
        let mut entry_stack: Vec<_> = full_dependency_edges
            .keys()
            .filter(|entry| matches!(entry, EntryWithDeps::Root(_)))
            .collect();
        let mut visited = HashSet::default();
        let mut reachable_rules = HashSet::default();
        while let Some(entry) = entry_stack.pop() {
            if !visited.insert(entry) {
                continue;
            }

            if let Some(rule) = entry.rule() {
                reachable_rules.insert(rule.clone());
            }

            if let Some(edges) = full_dependency_edges.get(entry) {
                entry_stack.extend(edges.all_dependencies().filter_map(|e| match e.as_ref() {
                    Entry::WithDeps(e) => Some(e.as_ref()),
                    _ => None,
                }));
            }
        }

        self.rules
            .iter()
            .filter(|r| r.require_reachable() && !reachable_rules.contains(*r))
            .cloned()
            .collect()
    }

    ///
    /// Computes whether the given Entry is satisfiable, and if so, returns a simplified copy
    /// carrying only the parameters it actually uses. Memoised in all_simplified_entries.
    ///
    /// A placeholder in rule_dependency_edges short-circuits recursion when an entry
    /// (possibly legally) depends on itself: the recursive path never contributes to
    /// satisfiability.
    ///
    fn construct_graph_helper(
        &self,
        rule_dependency_edges: &mut PolyRuleDependencyEdges<R>,
        all_simplified_entries: &mut HashMap<EntryWithDeps<R>, EntryWithDeps<R>>,
        unfulfillable_rules: &mut UnfulfillableRuleMap<R>,
        entry: &EntryWithDeps<R>,
    ) -> ConstructGraphResult<R> {
        if let Some(simplified) = all_simplified_entries.get(entry) {
            return ConstructGraphResult::Fulfilled(simplified.clone());
        } else if unfulfillable_rules.contains_key(entry) {
            return ConstructGraphResult::Unfulfillable;
        }

        match rule_dependency_edges.entry(entry.clone()) {
            hash_map::Entry::Vacant(re) => {
                // Not yet visited: store a placeholder to detect cycles.
                re.insert(PolyRuleEdges::default());
            }
            hash_map::Entry::Occupied(_) => {
                // We are currently recursively under this entry, and its simplified
                // equivalent has not been computed yet: the cyclic parent(s) will complete
                // before this node is computed again.
                let mut cyclic_deps = HashSet::default();
                cyclic_deps.insert(entry.clone());
                return ConstructGraphResult::CycledOn {
                    cyclic_deps,
                    simplified_entry: entry.simplified(BTreeSet::new()),
                };
            }
        }

        // This loop exists because an entry which is the source of a cycle on itself
        // completes partially and then re-computes its dependencies.
        loop {
            if let Ok(res) = self.construct_dependencies(
                rule_dependency_edges,
                all_simplified_entries,
                unfulfillable_rules,
                entry,
            ) {
                break res;
            }
        }
    }

    fn construct_dependencies(
        &self,
        rule_dependency_edges: &mut PolyRuleDependencyEdges<R>,
        all_simplified_entries: &mut HashMap<EntryWithDeps<R>, EntryWithDeps<R>>,
        unfulfillable_rules: &mut UnfulfillableRuleMap<R>,
        entry: &EntryWithDeps<R>,
    ) -> Result<ConstructGraphResult<R>, ()> {
        let mut fulfillable_candidates_by_key = HashMap::default();
        let mut cycled_on = HashSet::default();
        let mut unfulfillable_diagnostics = Vec::new();

        for dependency_key in entry.dependency_keys() {
            let product = dependency_key.product();
            // The dependency key's provided parameters join the in-scope set for the
            // callee: the in-scope set only ever grows along a call chain.
            let params = {
                let mut params = entry.params().clone();
                params.extend(dependency_key.provided_params().iter().cloned());
                params
            };

            let mut cycled = false;
            let fulfillable_candidates: &mut Vec<Entry<R>> = fulfillable_candidates_by_key
                .entry(dependency_key.clone())
                .or_default();
            for candidate in self.rhs(&params, product) {
                match candidate {
                    Entry::WithDeps(c) => {
                        match self.construct_graph_helper(
                            rule_dependency_edges,
                            all_simplified_entries,
                            unfulfillable_rules,
                            c.as_ref(),
                        ) {
                            ConstructGraphResult::Unfulfillable => {}
                            ConstructGraphResult::Fulfilled(simplified_entry) => {
                                fulfillable_candidates
                                    .push(Entry::WithDeps(Intern::new(simplified_entry)));
                            }
                            ConstructGraphResult::CycledOn {
                                cyclic_deps,
                                simplified_entry,
                            } => {
                                cycled = true;
                                cycled_on.extend(cyclic_deps);
                                // In the case of a cycle, the dependency is fulfillable if
                                // we are.
                                fulfillable_candidates
                                    .push(Entry::WithDeps(Intern::new(simplified_entry)));
                            }
                        }
                    }
                    p @ Entry::Param(_) => {
                        fulfillable_candidates.push(p);
                    }
                }
            }

            if cycled {
                // Finish gathering the remaining cyclic dependencies before returning.
                continue;
            }

            if fulfillable_candidates.is_empty() {
                // No rule or parameter can produce this dependency: not fulfillable.
                unfulfillable_diagnostics.push(Diagnostic {
                    reason: if params.is_empty() {
                        format!(
                            "No rule was available to compute {dependency_key}. Maybe declare it \
               as a Query?",
                        )
                    } else {
                        format!(
                            "No rule was available to compute {dependency_key} with parameter \
               type{} {}",
                            if params.len() > 1 { "s" } else { "" },
                            params_str(&params),
                        )
                    },
                    details: vec![],
                });
            }
        }

        // If any dependency was unfulfillable, cycles are irrelevant.
        if !unfulfillable_diagnostics.is_empty() {
            unfulfillable_rules
                .entry(entry.clone())
                .or_default()
                .extend(unfulfillable_diagnostics);
            rule_dependency_edges.remove(entry);
            return Ok(ConstructGraphResult::Unfulfillable);
        }

        let rule_edges = PolyRuleEdges {
            dependencies: fulfillable_candidates_by_key,
        };
        let simplified_entry = {
            // The used parameter set is further pruned by monomorphization; pruning here
            // produces more accurate diagnostics earlier.
            let mut all_used_params = BTreeSet::new();
            for (key, inputs) in &rule_edges.dependencies {
                let provided = key.provided_params();
                for input in inputs {
                    all_used_params
                        .extend(input.params().into_iter().filter(|p| !provided.contains(p)));
                }
            }
            entry.simplified(all_used_params)
        };

        rule_dependency_edges.remove(entry);
        if cycled_on.is_empty() {
            // All dependencies fulfillable and none blocked on cycles: complete.
            rule_dependency_edges.insert(simplified_entry.clone(), rule_edges);
            all_simplified_entries.insert(entry.clone(), simplified_entry.clone());
            Ok(ConstructGraphResult::Fulfilled(simplified_entry))
        } else {
            // The cycled-on set contains only call-stack parents of this entry: remove
            // ourselves, and let the top-most cyclic parent (an empty set) restart.
            cycled_on.remove(entry);
            if cycled_on.is_empty() {
                // This entry is the top-most cyclic parent: store the simplified equivalent
                // and re-run dependency discovery, during which the cyclic dependencies use
                // the simplified representation to succeed.
                all_simplified_entries.insert(entry.clone(), simplified_entry);
                Err(())
            } else {
                Ok(ConstructGraphResult::CycledOn {
                    cyclic_deps: cycled_on,
                    simplified_entry,
                })
            }
        }
    }

    ///
    /// Given the polymorphic graph, chooses exactly one implementation per dependency edge,
    /// generating a simplified entry for each legal combination of parameters.
    ///
    fn monomorphize_graph(
        poly_dependency_edges: &PolyRuleDependencyEdges<R>,
        unfulfillable_rules: &mut UnfulfillableRuleMap<R>,
    ) -> MonoRuleDependencyEdges<R> {
        let mut rule_dependency_edges = HashMap::default();
        let mut all_monomorphized_entries = HashMap::default();
        for entry in poly_dependency_edges.keys() {
            if matches!(entry, EntryWithDeps::Root(_)) {
                Self::monomorphize_helper(
                    entry,
                    poly_dependency_edges,
                    &mut rule_dependency_edges,
                    &mut all_monomorphized_entries,
                    unfulfillable_rules,
                );
            }
        }
        rule_dependency_edges
    }

    fn monomorphize_helper(
        entry: &EntryWithDeps<R>,
        poly_dependency_edges: &PolyRuleDependencyEdges<R>,
        rule_dependency_edges: &mut MonoRuleDependencyEdges<R>,
        all_monomorphized_entries: &mut HashMap<EntryWithDeps<R>, Vec<EntryWithDeps<R>>>,
        unfulfillable_rules: &mut UnfulfillableRuleMap<R>,
    ) -> MonomorphizeResult<R> {
        if let Some(simplified) = all_monomorphized_entries.get(entry) {
            return MonomorphizeResult::Fulfilled(simplified.clone());
        } else if unfulfillable_rules.contains_key(entry) {
            return MonomorphizeResult::Unfulfillable;
        }

        match rule_dependency_edges.entry(entry.clone()) {
            hash_map::Entry::Vacant(re) => {
                // Not yet visited: store a placeholder to detect cycles.
                re.insert(RuleEdges::default());
            }
            hash_map::Entry::Occupied(_) => {
                let mut cyclic_deps = HashSet::default();
                cyclic_deps.insert(entry.clone());
                return MonomorphizeResult::CycledOn {
                    cyclic_deps,
                    simplified_entries: vec![entry.simplified(BTreeSet::new())],
                };
            }
        }

        loop {
            if let Ok(res) = Self::monomorphize_dependencies(
                entry,
                poly_dependency_edges,
                rule_dependency_edges,
                all_monomorphized_entries,
                unfulfillable_rules,
            ) {
                break res;
            }
        }
    }

    fn monomorphize_dependencies(
        entry: &EntryWithDeps<R>,
        poly_dependency_edges: &PolyRuleDependencyEdges<R>,
        rule_dependency_edges: &mut MonoRuleDependencyEdges<R>,
        all_monomorphized_entries: &mut HashMap<EntryWithDeps<R>, Vec<EntryWithDeps<R>>>,
        unfulfillable_rules: &mut UnfulfillableRuleMap<R>,
    ) -> Result<MonomorphizeResult<R>, ()> {
        // Recursively monomorphize the candidates of each dependency key.
        let mut monomorphized_candidates_by_key: Vec<ChosenDependency<R>> = Vec::new();
        let mut cycled_on = HashSet::default();
        let mut unfulfillable_diagnostics = Vec::new();

        for (dependency_key, inputs) in poly_dependency_edges
            .get(entry)
            .unwrap()
            .dependencies
            .clone()
        {
            let mut cycled = false;
            let mut monomorphized_candidates = Vec::new();
            for input in inputs {
                match input {
                    Entry::WithDeps(e) => {
                        match Self::monomorphize_helper(
                            e.as_ref(),
                            poly_dependency_edges,
                            rule_dependency_edges,
                            all_monomorphized_entries,
                            unfulfillable_rules,
                        ) {
                            MonomorphizeResult::Unfulfillable => {}
                            MonomorphizeResult::Fulfilled(simplified_entries) => {
                                monomorphized_candidates.extend(
                                    simplified_entries
                                        .into_iter()
                                        .map(|e| Entry::WithDeps(Intern::new(e))),
                                );
                            }
                            MonomorphizeResult::CycledOn {
                                cyclic_deps,
                                simplified_entries,
                            } => {
                                cycled = true;
                                cycled_on.extend(cyclic_deps);
                                monomorphized_candidates.extend(
                                    simplified_entries
                                        .into_iter()
                                        .map(|e| Entry::WithDeps(Intern::new(e))),
                                );
                            }
                        }
                    }
                    p @ Entry::Param(_) => {
                        monomorphized_candidates.push(p);
                    }
                }
            }

            if cycled {
                continue;
            }

            if monomorphized_candidates.is_empty() {
                let params = entry.params();
                unfulfillable_diagnostics.push(Diagnostic {
                    reason: if params.is_empty() {
                        format!("No rule was available to compute {dependency_key}.")
                    } else {
                        format!(
                            "No rule was available to compute {dependency_key} with parameter \
               type{} {}",
                            if params.len() > 1 { "s" } else { "" },
                            params_str(params),
                        )
                    },
                    details: vec![],
                });
            }

            monomorphized_candidates_by_key.push((dependency_key, monomorphized_candidates));
        }

        if !unfulfillable_diagnostics.is_empty() {
            unfulfillable_rules
                .entry(entry.clone())
                .or_default()
                .extend(unfulfillable_diagnostics);
            rule_dependency_edges.remove(entry);
            return Ok(MonomorphizeResult::Unfulfillable);
        }

        // Collect the powerset of the union of used parameters, ordered by set size: the
        // smallest satisfiable sets win, which biases Node identities toward minimality.
        let params_powerset: Vec<Vec<R::TypeId>> = {
            let mut all_used_params = BTreeSet::new();
            for (key, inputs) in &monomorphized_candidates_by_key {
                let provided = key.provided_params();
                for input in inputs {
                    all_used_params
                        .extend(input.params().into_iter().filter(|p| !provided.contains(p)));
                }
            }
            let mut param_sets =
                Self::powerset(&all_used_params.into_iter().collect::<Vec<_>>())
                    .collect::<Vec<_>>();
            param_sets.sort_by_key(|l| l.len());
            param_sets
        };

        // For each parameter set (smallest first), determine whether one combination of
        // dependencies is satisfiable.
        let mut combinations: HashMap<EntryWithDeps<_>, _> = HashMap::default();
        let mut diagnostics = Vec::new();
        for available_params in params_powerset {
            let available_params = available_params.into_iter().collect::<ParamTypes<_>>();
            // If a subset of these parameters is already satisfied, skip: the smallest sets
            // that satisfy a rule are kept.
            if combinations
                .keys()
                .any(|satisfied: &EntryWithDeps<R>| satisfied.params().is_subset(&available_params))
            {
                continue;
            }

            match Self::choose_dependencies(&available_params, &monomorphized_candidates_by_key) {
                Ok(Some(rule_edges)) => {
                    combinations.insert(entry.simplified(available_params), rule_edges);
                }
                Ok(None) => {}
                Err(diagnostic) => diagnostics.push(diagnostic),
            }
        }

        let simplified_entries: Vec<_> = combinations.keys().cloned().collect();

        rule_dependency_edges.remove(entry);
        if cycled_on.is_empty() {
            if combinations.is_empty() {
                unfulfillable_rules
                    .entry(entry.clone())
                    .or_default()
                    .extend(diagnostics);
                Ok(MonomorphizeResult::Unfulfillable)
            } else {
                rule_dependency_edges.extend(combinations);
                all_monomorphized_entries.insert(entry.clone(), simplified_entries.clone());
                Ok(MonomorphizeResult::Fulfilled(simplified_entries))
            }
        } else {
            cycled_on.remove(entry);
            if cycled_on.is_empty() {
                all_monomorphized_entries.insert(entry.clone(), simplified_entries);
                Err(())
            } else {
                Ok(MonomorphizeResult::CycledOn {
                    cyclic_deps: cycled_on,
                    simplified_entries,
                })
            }
        }
    }

    ///
    /// Given available parameters, chooses one satisfiable combination of dependencies if
    /// one exists. If multiple rules are satisfiable for a single dependency key without a
    /// unique smallest parameter set, fails with an ambiguity Diagnostic.
    ///
    fn choose_dependencies(
        available_params: &ParamTypes<R::TypeId>,
        deps: &[ChosenDependency<R>],
    ) -> Result<Option<RuleEdges<R>>, Diagnostic> {
        let mut combination = RuleEdges::default();
        for (key, input_entries) in deps {
            let provided = key.provided_params();
            let satisfiable_entries = input_entries
                .iter()
                .filter(|input_entry| {
                    let consumes_provided_params = provided
                        .iter()
                        .all(|p| input_entry.params().contains(p));
                    consumes_provided_params
                        && input_entry
                            .params()
                            .iter()
                            .all(|p| available_params.contains(p) || provided.contains(p))
                })
                .collect::<Vec<_>>();

            let chosen_entries = Self::choose_dependency(satisfiable_entries);
            match chosen_entries.len() {
                0 => {
                    return Ok(None);
                }
                1 => {
                    combination.add_edge(key.clone(), Intern::new(chosen_entries[0].clone()));
                }
                _ => {
                    let params_clause = match available_params.len() {
                        0 => "",
                        1 => " with parameter type ",
                        _ => " with parameter types ",
                    };
                    return Err(Diagnostic {
                        reason: format!(
                            "Ambiguous rules to compute {key}{params_clause}{}",
                            params_str(available_params),
                        ),
                        details: chosen_entries
                            .into_iter()
                            .map(|e| crate::entry_str(e))
                            .collect(),
                    });
                }
            }
        }

        Ok(Some(combination))
    }

    fn choose_dependency(satisfiable_entries: Vec<&Entry<R>>) -> Vec<&Entry<R>> {
        if satisfiable_entries.len() <= 1 {
            return satisfiable_entries;
        }

        // Prefer the non-ambiguous entry with the strictly smallest set of parameters: that
        // minimises Node identities in the graph, and biases toward receiving values from
        // dependencies (which do not affect identity) rather than from dependents.
        let mut minimum_param_set_size = usize::MAX;
        let mut rules = Vec::new();
        for satisfiable_entry in satisfiable_entries {
            let param_set_size = satisfiable_entry.params().len();
            match param_set_size.cmp(&minimum_param_set_size) {
                std::cmp::Ordering::Less => {
                    rules.clear();
                    rules.push(satisfiable_entry);
                    minimum_param_set_size = param_set_size;
                }
                std::cmp::Ordering::Equal => rules.push(satisfiable_entry),
                std::cmp::Ordering::Greater => (),
            }
        }

        rules
    }

    fn powerset<'a, T: Clone>(slice: &'a [T]) -> impl Iterator<Item = Vec<T>> + 'a {
        (0..(1 << slice.len())).map(move |mask: u64| {
            let mut ss = Vec::new();
            let mut bitset = mask;
            while bitset > 0 {
                // Isolate the rightmost bit, and turn it into an index.
                let rightmost: u64 = bitset & !(bitset - 1);
                let idx = rightmost.trailing_zeros();
                ss.push(slice[idx as usize].clone());
                // Zero the trailing bit.
                bitset &= bitset - 1;
            }
            ss
        })
    }

    ///
    /// The candidate Entries able to provide the given product with the given parameters in
    /// scope: the parameter itself (if its type matches), plus any rules producing the
    /// product.
    ///
    fn rhs(&self, params: &ParamTypes<R::TypeId>, product: R::TypeId) -> Vec<Entry<R>> {
        let mut entries = Vec::new();
        if params.contains(&product) {
            entries.push(Entry::Param(product));
        }
        if let Some(matching_rules) = self.rules_by_product.get(&product) {
            entries.extend(matching_rules.iter().map(|rule| {
                Entry::WithDeps(Intern::new(EntryWithDeps::Rule(crate::RuleEntry {
                    params: params.clone(),
                    rule: rule.clone(),
                })))
            }));
        }
        entries
    }
}
