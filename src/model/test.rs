//! Static test description tree

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of a runner within one aggregation tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RunnerId(pub u64);

impl RunnerId {
    /// Id of the `index`-th child of this runner: `id * 100 + index + 1`
    pub fn child(self, index: usize) -> RunnerId {
        RunnerId(self.0 * 100 + index as u64 + 1)
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique test identifier: owning runner plus a per-runner key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestId {
    pub runner: RunnerId,
    pub key: u32,
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.runner, self.key)
    }
}

/// Short and fully qualified name of a test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestName {
    pub name: String,
    pub full_name: String,
}

impl TestName {
    pub fn new(name: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            full_name: full_name.into(),
        }
    }
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)
    }
}

/// A test case or suite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub id: TestId,
    pub name: TestName,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub categories: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Test>,
    pub is_suite: bool,
}

impl Test {
    /// Create a leaf test case
    pub fn case(id: TestId, name: TestName) -> Self {
        Self {
            id,
            name,
            categories: BTreeSet::new(),
            properties: BTreeMap::new(),
            children: Vec::new(),
            is_suite: false,
        }
    }

    /// Create an empty suite
    pub fn suite(id: TestId, name: TestName) -> Self {
        Self {
            is_suite: true,
            ..Self::case(id, name)
        }
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories.extend(categories.into_iter().map(Into::into));
        self
    }

    pub fn full_name(&self) -> &str {
        &self.name.full_name
    }

    /// Number of leaf test cases below (or at) this node
    pub fn test_case_count(&self) -> usize {
        if self.is_suite {
            self.children.iter().map(Test::test_case_count).sum()
        } else {
            1
        }
    }

    /// Find a node by full name, depth first
    pub fn find(&self, full_name: &str) -> Option<&Test> {
        if self.name.full_name == full_name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(full_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(key: u32) -> TestId {
        TestId {
            runner: RunnerId(1),
            key,
        }
    }

    #[test]
    fn test_child_runner_ids() {
        let root = RunnerId(0);
        assert_eq!(root.child(0), RunnerId(1));
        assert_eq!(root.child(2), RunnerId(3));
        assert_eq!(RunnerId(3).child(0), RunnerId(301));
        assert_eq!(RunnerId(3).child(11), RunnerId(312));
    }

    #[test]
    fn test_case_count_and_find() {
        let mut suite = Test::suite(id(0), TestName::new("math", "math"));
        suite
            .children
            .push(Test::case(id(1), TestName::new("add", "math::add")));
        suite
            .children
            .push(Test::case(id(2), TestName::new("sub", "math::sub")));

        assert_eq!(suite.test_case_count(), 2);
        assert_eq!(suite.find("math::sub").map(|t| t.id.key), Some(2));
        assert!(suite.find("math::mul").is_none());
    }
}
