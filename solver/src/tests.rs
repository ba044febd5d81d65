// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use indexmap::IndexSet;

use crate::{DependencyKey, Query, Rule, RuleGraph, RuleId, TypeId};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct T(&'static str);

impl fmt::Display for T {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TypeId for T {
    fn display<I: Iterator<Item = T>>(type_ids: I) -> String {
        let mut names: Vec<_> = type_ids.map(|t| t.0.to_owned()).collect();
        names.sort();
        format!("({})", names.join(", "))
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct TRule {
    id: RuleId,
    product: T,
    deps: Vec<DependencyKey<T>>,
}

impl TRule {
    fn new(id: &'static str, product: T, deps: Vec<DependencyKey<T>>) -> TRule {
        TRule {
            id: RuleId::new(id),
            product,
            deps,
        }
    }
}

impl fmt::Display for TRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@rule {}", self.id)
    }
}

impl Rule for TRule {
    type TypeId = T;

    fn id(&self) -> &RuleId {
        &self.id
    }

    fn product(&self) -> T {
        self.product
    }

    fn dependency_keys(&self) -> Vec<&DependencyKey<T>> {
        self.deps.iter().collect()
    }

    fn require_reachable(&self) -> bool {
        true
    }
}

const A: T = T("A");
const B: T = T("B");
const X: T = T("X");
const Y: T = T("Y");

fn graph(
    rules: Vec<TRule>,
    queries: Vec<Query<T>>,
) -> Result<RuleGraph<TRule>, String> {
    RuleGraph::new(
        rules.into_iter().collect::<IndexSet<_>>(),
        queries.into_iter().collect::<IndexSet<_>>(),
    )
}

#[test]
fn param_is_consumed_directly() {
    let _logger = env_logger::try_init();
    let graph = graph(
        vec![TRule::new("x_from_a", X, vec![DependencyKey::new(A)])],
        vec![Query::new(X, vec![A])],
    )
    .unwrap();

    let (_root, edges) = graph.find_root(vec![A], X).unwrap();
    let entry = edges.entry_for(&DependencyKey::new(X)).unwrap();
    assert!(matches!(entry.as_ref(), crate::Entry::WithDeps(_)));
}

#[test]
fn transitive_rules_resolve() {
    let graph = graph(
        vec![
            TRule::new("x_from_b", X, vec![DependencyKey::new(B)]),
            TRule::new("b_from_a", B, vec![DependencyKey::new(A)]),
        ],
        vec![Query::new(X, vec![A])],
    )
    .unwrap();
    graph.validate_reachability().unwrap();

    assert!(graph.find_root(vec![A], X).is_ok());
}

#[test]
fn root_accepts_a_superset_of_params() {
    let graph = graph(
        vec![TRule::new("x_from_a", X, vec![DependencyKey::new(A)])],
        vec![Query::new(X, vec![A])],
    )
    .unwrap();

    // B is in scope at the root but unused: the declared Query is still found.
    assert!(graph.find_root(vec![A, B], X).is_ok());
}

#[test]
fn missing_rule_is_a_compile_error() {
    let err = graph(
        vec![TRule::new("x_from_b", X, vec![DependencyKey::new(B)])],
        vec![Query::new(X, vec![A])],
    )
    .unwrap_err();
    assert!(err.contains("No rule was able to compute"), "was: {err}");
    assert!(err.contains("B"), "was: {err}");
}

#[test]
fn ambiguous_rules_are_a_compile_error() {
    // S5: rules A -> X and B -> X, with both A and B in scope at the root, cannot be
    // disambiguated.
    let err = graph(
        vec![
            TRule::new("x_from_a", X, vec![DependencyKey::new(A)]),
            TRule::new("x_from_b", X, vec![DependencyKey::new(B)]),
        ],
        vec![Query::new(X, vec![A, B])],
    )
    .unwrap_err();
    assert!(err.contains("Ambiguous rules to compute"), "was: {err}");
    assert!(err.contains("x_from_a"), "was: {err}");
    assert!(err.contains("x_from_b"), "was: {err}");
}

#[test]
fn smaller_param_sets_win() {
    // A variant which consumes fewer params is strictly more specific, so no ambiguity.
    let graph = graph(
        vec![
            TRule::new("x_from_nothing", X, vec![]),
            TRule::new("x_from_a", X, vec![DependencyKey::new(A)]),
        ],
        vec![Query::new(X, vec![A])],
    )
    .unwrap();

    let (_root, edges) = graph.find_root(vec![A], X).unwrap();
    let entry = edges.entry_for(&DependencyKey::new(X)).unwrap();
    match entry.as_ref() {
        crate::Entry::WithDeps(e) => {
            assert_eq!(e.rule().unwrap().id(), &RuleId::new("x_from_nothing"));
        }
        entry => panic!("Unexpected entry: {entry:?}"),
    }
}

#[test]
fn provided_params_extend_the_in_scope_set() {
    // The Get provides B into scope, so `b_to_y` is usable even though no B exists at the
    // root (the union-member pattern).
    let graph = graph(
        vec![
            TRule::new(
                "x_via_get",
                X,
                vec![DependencyKey::new_with_params(Y, vec![B])],
            ),
            TRule::new("b_to_y", Y, vec![DependencyKey::new(B)]),
        ],
        vec![Query::new(X, vec![])],
    )
    .unwrap();
    graph.validate_reachability().unwrap();
}

#[test]
fn provided_params_must_be_consumed() {
    // A candidate which ignores the provided param is not eligible for the Get.
    let err = graph(
        vec![
            TRule::new(
                "x_via_get",
                X,
                vec![DependencyKey::new_with_params(Y, vec![B])],
            ),
            TRule::new("y_from_nothing", Y, vec![]),
        ],
        vec![Query::new(X, vec![])],
    )
    .unwrap_err();
    assert!(err.contains("No rule was able to compute"), "was: {err}");
}

#[test]
fn unreachable_rules_are_reported() {
    let graph = graph(
        vec![
            TRule::new("x_from_a", X, vec![DependencyKey::new(A)]),
            TRule::new("y_from_b", Y, vec![DependencyKey::new(B)]),
        ],
        vec![Query::new(X, vec![A])],
    )
    .unwrap();

    let err = graph.validate_reachability().unwrap_err();
    assert!(err.contains("y_from_b"), "was: {err}");
}

#[test]
fn recursive_rules_are_satisfiable() {
    // X depends on itself via B: the recursive path does not affect satisfiability.
    let graph = graph(
        vec![
            TRule::new(
                "x_from_a_and_x",
                X,
                vec![DependencyKey::new(A), DependencyKey::new_with_params(X, vec![B])],
            ),
            TRule::new("b_to_x", X, vec![DependencyKey::new(B)]),
        ],
        vec![Query::new(X, vec![A])],
    )
    .unwrap();
    assert!(graph.find_root(vec![A], X).is_ok());
}

#[test]
fn consumed_types_cover_params_and_products() {
    let graph = graph(
        vec![
            TRule::new("x_from_b", X, vec![DependencyKey::new(B)]),
            TRule::new("b_from_a", B, vec![DependencyKey::new(A)]),
        ],
        vec![Query::new(X, vec![A])],
    )
    .unwrap();

    let consumed = graph.consumed_types();
    for t in [A, B, X] {
        assert!(consumed.contains(&t), "missing {t}");
    }
}
