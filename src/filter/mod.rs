//! Test filters
//!
//! A [`TestFilter`] is a predicate over [`Test`] nodes built from category
//! names. Filters are plain data so they can cross context and process
//! boundaries unchanged.

mod parser;

pub use parser::CategoryExpression;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::model::Test;

/// Predicate tree over test categories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TestFilter {
    /// Always passes
    #[default]
    Empty,
    /// Passes tests carrying any of the names
    Category(BTreeSet<String>),
    /// Passes when every member passes
    And(Vec<TestFilter>),
    /// Passes when any member passes
    Or(Vec<TestFilter>),
    /// Inverts the inner filter
    Not(Box<TestFilter>),
}

impl TestFilter {
    /// Category filter over one or more names
    pub fn category<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Category(names.into_iter().map(Into::into).collect())
    }

    pub fn negate(inner: TestFilter) -> Self {
        Self::Not(Box::new(inner))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Evaluate the predicate against the node's own categories
    pub fn matches(&self, test: &Test) -> bool {
        match self {
            Self::Empty => true,
            Self::Category(names) => names.iter().any(|n| test.categories.contains(n)),
            Self::And(members) => members.iter().all(|f| f.matches(test)),
            Self::Or(members) => members.iter().any(|f| f.matches(test)),
            Self::Not(inner) => !inner.matches(test),
        }
    }

    /// Whether the test should run
    ///
    /// A case passes when it matches. A suite passes when any of its
    /// descendant cases passes; an empty suite passes when it matches.
    pub fn pass(&self, test: &Test) -> bool {
        if !test.is_suite {
            return self.matches(test);
        }
        if test.children.is_empty() {
            return self.matches(test);
        }
        test.children.iter().any(|c| self.pass(c))
    }

    /// Number of leaf cases below `test` that pass
    pub fn count(&self, test: &Test) -> usize {
        if test.is_suite {
            test.children.iter().map(|c| self.count(c)).sum()
        } else {
            usize::from(self.matches(test))
        }
    }
}
