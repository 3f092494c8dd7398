//! Per-node selection during the restore walk
//!
//! The restore engine asks a [`NodeSelector`] about every tree entry it
//! visits. The answer is a [`SelectionDecision`]: whether to materialize the
//! entry, and whether to keep descending into it when it is a directory.
//!
//! ## Composition
//!
//! A [`FilterMode`] owns the compiled predicates and fixes how they combine:
//!
//! - **Exclude** consults only the first reject predicate. A match deselects
//!   the entry and prunes its subtree.
//! - **Include** consults every include predicate in order and keeps the
//!   result of the last one. Traversal continues into directories whose
//!   descendants may still match.
//!
//! In both modes a non-directory never reports `child_may_be_selected`, and
//! an empty predicate list yields the zero decision.
//!
//! ## Examples
//!
//! ```rust
//! use snaprestore::selection::FilterMode;
//! use snaprestore::types::Node;
//! use std::sync::Arc;
//!
//! let mode = FilterMode::Exclude(vec![Arc::new(|path: &str| path.ends_with(".tmp"))]);
//! let selector = mode.selector().unwrap();
//!
//! let scratch = Node::file("a.tmp", 0, vec![]);
//! assert!(!selector(&scratch, "/a.tmp").selected_for_restore);
//! ```

use crate::error::{Result, RestoreError};
use crate::pattern::{ExcludePatternOptions, IncludePatternOptions, IncludePredicate, RejectPredicate};
use crate::types::{Node, SelectionDecision};
use std::sync::Arc;

/// Decides, per visited node and tree path, what the restore walk does
pub type NodeSelector = Arc<dyn Fn(&Node, &str) -> SelectionDecision + Send + Sync>;

/// How several predicates of one mode combine into a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionPolicy {
    /// Only the first reject predicate is evaluated
    FirstReject,
    /// Every include predicate is evaluated; the last result wins
    LastInclude,
}

/// Active filtering for one restore
#[derive(Clone, Default)]
pub enum FilterMode {
    /// Restore everything
    #[default]
    None,
    /// Restore everything except matches
    Exclude(Vec<RejectPredicate>),
    /// Restore only matches
    Include(Vec<IncludePredicate>),
}

impl std::fmt::Debug for FilterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterMode::None => write!(f, "None"),
            FilterMode::Exclude(p) => write!(f, "Exclude({} predicates)", p.len()),
            FilterMode::Include(p) => write!(f, "Include({} predicates)", p.len()),
        }
    }
}

impl FilterMode {
    /// Compile the pattern options into a filter mode
    ///
    /// Supplying both exclude and include sources is rejected with
    /// [`RestoreError::ConflictingFilters`].
    pub fn from_options(exclude: &ExcludePatternOptions, include: &IncludePatternOptions) -> Result<Self> {
        if !exclude.is_empty() && !include.is_empty() {
            return Err(RestoreError::ConflictingFilters);
        }

        let rejects = exclude.collect_patterns()?;
        if !rejects.is_empty() {
            return Ok(FilterMode::Exclude(rejects));
        }

        let includes = include.collect_patterns()?;
        if !includes.is_empty() {
            return Ok(FilterMode::Include(includes));
        }

        Ok(FilterMode::None)
    }

    /// Composition policy of this mode, if any
    pub fn policy(&self) -> Option<CompositionPolicy> {
        match self {
            FilterMode::None => None,
            FilterMode::Exclude(_) => Some(CompositionPolicy::FirstReject),
            FilterMode::Include(_) => Some(CompositionPolicy::LastInclude),
        }
    }

    /// Whether any filtering is active
    pub fn is_filtering(&self) -> bool {
        !matches!(self, FilterMode::None)
    }

    /// Build the selector for this mode
    ///
    /// Returns `None` when nothing is filtered; the restore engine then
    /// restores every node.
    pub fn selector(&self) -> Option<NodeSelector> {
        match self {
            FilterMode::None => None,
            FilterMode::Exclude(rejects) => {
                let rejects = rejects.clone();
                Some(Arc::new(move |node: &Node, path: &str| select_exclude(&rejects, node, path)))
            }
            FilterMode::Include(includes) => {
                let includes = includes.clone();
                Some(Arc::new(move |node: &Node, path: &str| select_include(&includes, node, path)))
            }
        }
    }
}

/// Exclude-mode decision for one node
pub fn select_exclude(rejects: &[RejectPredicate], node: &Node, path: &str) -> SelectionDecision {
    match rejects.first() {
        Some(reject) => {
            let selected = !reject(path);
            // Other children of a matched directory are excluded with it
            SelectionDecision::new(selected, selected && node.is_dir())
        }
        None => SelectionDecision::default(),
    }
}

/// Include-mode decision for one node
pub fn select_include(includes: &[IncludePredicate], node: &Node, path: &str) -> SelectionDecision {
    let mut decision = SelectionDecision::default();
    for include in includes {
        let (selected, child_may_match) = include(path);
        decision = SelectionDecision::new(selected, child_may_match);
    }
    decision.child_may_be_selected = decision.child_may_be_selected && node.is_dir();
    decision
}

/// Selector used when no filter is active
pub fn restore_everything() -> NodeSelector {
    Arc::new(|_: &Node, _: &str| SelectionDecision::RESTORE_ALL)
}
