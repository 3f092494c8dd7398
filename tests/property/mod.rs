//! Property-based testing for selection
//!
//! Uses proptest to check the composition rules of node selectors and the
//! matching rules of pattern sets across generated paths.

use ::snaprestore::pattern::{
    ExcludePatternOptions, IncludePatternOptions, IncludePredicate, PatternSet, RejectPredicate,
};
use ::snaprestore::selection::{select_exclude, select_include, FilterMode};
use ::snaprestore::types::{Node, SelectionDecision};
use proptest::prelude::*;
use std::sync::Arc;

/// Generate `/`-rooted tree paths of 1-4 components
fn path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{1,6}(\\.(txt|log|md))?", 1..5).prop_map(|parts| format!("/{}", parts.join("/")))
}

fn node_strategy() -> impl Strategy<Value = Node> {
    prop_oneof![
        Just(Node::directory("d", "0".repeat(64))),
        Just(Node::file("f", 0, vec![])),
        Just(Node::symlink("l", "f")),
    ]
}

/// Glob patterns mixing anchored, unanchored and wildcard forms
fn pattern_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        path_strategy(),
        "\\*\\.(txt|log|md)",
        "[a-z]{1,6}",
        "/[a-z]{1,3}/\\*",
    ]
}

/// Selector for `mode` compiled from real pattern sets
fn compiled_mode(exclude: bool, sensitive: Vec<String>, insensitive: Vec<String>) -> FilterMode {
    if exclude {
        let options = ExcludePatternOptions {
            excludes: sensitive,
            insensitive_excludes: insensitive,
            ..Default::default()
        };
        FilterMode::from_options(&options, &IncludePatternOptions::default()).unwrap()
    } else {
        let options = IncludePatternOptions {
            includes: sensitive,
            insensitive_includes: insensitive,
            ..Default::default()
        };
        FilterMode::from_options(&ExcludePatternOptions::default(), &options).unwrap()
    }
}

fn constant_reject(result: bool) -> RejectPredicate {
    Arc::new(move |_: &str| result)
}

fn constant_include(result: (bool, bool)) -> IncludePredicate {
    Arc::new(move |_: &str| result)
}

proptest! {
    #[test]
    fn prop_exclude_depends_only_on_first(
        path in path_strategy(),
        node in node_strategy(),
        verdicts in prop::collection::vec(any::<bool>(), 1..5),
    ) {
        let rejects: Vec<RejectPredicate> = verdicts.iter().map(|v| constant_reject(*v)).collect();
        let decision = select_exclude(&rejects, &node, &path);
        let first_only = select_exclude(&rejects[..1], &node, &path);

        prop_assert_eq!(decision, first_only);
        prop_assert_eq!(decision.selected_for_restore, !verdicts[0]);
        prop_assert_eq!(decision.child_may_be_selected, !verdicts[0] && node.is_dir());
    }

    #[test]
    fn prop_include_last_predicate_wins(
        path in path_strategy(),
        node in node_strategy(),
        verdicts in prop::collection::vec((any::<bool>(), any::<bool>()), 1..5),
    ) {
        let includes: Vec<IncludePredicate> = verdicts.iter().map(|v| constant_include(*v)).collect();
        let decision = select_include(&includes, &node, &path);
        let (selected, child) = *verdicts.last().unwrap();

        prop_assert_eq!(decision.selected_for_restore, selected);
        prop_assert_eq!(decision.child_may_be_selected, child && node.is_dir());
    }

    #[test]
    fn prop_non_directories_never_descend(
        path in path_strategy(),
        verdicts in prop::collection::vec((any::<bool>(), any::<bool>()), 0..4),
    ) {
        let file = Node::file("f", 0, vec![]);
        let includes: Vec<IncludePredicate> = verdicts.iter().map(|v| constant_include(*v)).collect();
        prop_assert!(!select_include(&includes, &file, &path).child_may_be_selected);

        let rejects: Vec<RejectPredicate> = verdicts.iter().map(|v| constant_reject(v.0)).collect();
        prop_assert!(!select_exclude(&rejects, &file, &path).child_may_be_selected);
    }

    #[test]
    fn prop_selector_is_pure(
        exclude in any::<bool>(),
        sensitive in prop::collection::vec(pattern_strategy(), 1..4),
        insensitive in prop::collection::vec(pattern_strategy(), 0..3),
        path in path_strategy(),
        node in node_strategy(),
    ) {
        let selector = compiled_mode(exclude, sensitive, insensitive).selector().unwrap();

        let first = selector(&node, path.as_str());
        let second = selector(&node, path.as_str());
        prop_assert_eq!(first, second);

        let shared = selector.clone();
        let (node_copy, path_copy) = (node.clone(), path.clone());
        let from_thread = std::thread::spawn(move || shared(&node_copy, path_copy.as_str())).join().unwrap();
        prop_assert_eq!(first, from_thread);
    }

    #[test]
    fn prop_match_covers_descendants(
        dir in path_strategy(),
        child in "[a-z]{1,6}",
    ) {
        let set = PatternSet::compile(&[dir.clone()], false).unwrap();
        prop_assert!(set.matches(&dir));
        let descendant = format!("{}/{}", dir, child);
        prop_assert!(set.matches(&descendant));
    }

    #[test]
    fn prop_ancestors_of_anchored_pattern_may_contain_match(path in path_strategy()) {
        let set = PatternSet::compile(&[path.clone()], false).unwrap();
        let parts: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for depth in 0..parts.len() {
            let ancestor = format!("/{}", parts[..depth].join("/"));
            prop_assert!(set.child_may_match(&ancestor), "{} should lead to {}", ancestor, path);
        }
    }

    #[test]
    fn prop_insensitive_matches_any_case(path in path_strategy()) {
        let set = PatternSet::compile(&[path.to_uppercase()], true).unwrap();
        prop_assert!(set.matches(&path));
    }
}

#[test]
fn test_empty_modes_yield_zero_decision() {
    let node = Node::directory("d", "0".repeat(64));
    assert_eq!(select_exclude(&[], &node, "/d"), SelectionDecision::default());
    assert_eq!(select_include(&[], &node, "/d"), SelectionDecision::default());
    assert!(FilterMode::None.selector().is_none());
}
