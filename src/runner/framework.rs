//! Test framework seam
//!
//! A [`TestFramework`] knows how to open one kind of assembly and list and
//! execute its cases. Frameworks run entirely inside an isolated context, on
//! the context's thread, so their methods are synchronous.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::common::Result;
use crate::events::TestOutput;
use crate::model::{settings, CaseResult, RunnerId, SettingValue, Test, TestId, TestName, TestPackage};

/// Environment an assembly is loaded into
#[derive(Debug, Clone)]
pub struct AssemblyContext {
    /// Working directory for test execution
    pub application_base: PathBuf,
    /// Extra binary search directories
    pub private_bin_path: Vec<PathBuf>,
    /// Configuration file exposed to tests
    pub config_file: Option<PathBuf>,
    /// Package settings, passed through untouched
    pub settings: BTreeMap<String, SettingValue>,
}

/// Per-case execution parameters
pub struct CaseContext<'a> {
    pub timeout: Duration,
    pub cancel: &'a AtomicBool,
}

/// One discovered test case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCaseInfo {
    /// `::`-separated full name
    pub full_name: String,
    pub categories: BTreeSet<String>,
    pub properties: BTreeMap<String, String>,
}

impl TestCaseInfo {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            categories: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.insert(category.into());
        self
    }
}

/// What executing a single case produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed {
        assert_count: u32,
    },
    Failed {
        message: String,
        stack_trace: Option<String>,
    },
    NotRun {
        reason: String,
    },
}

impl CaseOutcome {
    pub fn into_result(self, test: &Test, time: Duration) -> CaseResult {
        match self {
            Self::Passed { assert_count } => CaseResult {
                assert_count,
                ..CaseResult::success(test, time)
            },
            Self::Failed {
                message,
                stack_trace,
            } => CaseResult::failure(test, message, stack_trace, time),
            Self::NotRun { reason } => CaseResult::not_run(test, Some(reason)),
        }
    }
}

/// A loaded assembly, owned by one context thread
pub trait LoadedAssembly: Send {
    fn cases(&self) -> &[TestCaseInfo];

    /// Execute one case. Output is streamed through `output` as it is produced.
    fn execute(
        &mut self,
        case: &Test,
        context: &CaseContext<'_>,
        output: &mut dyn FnMut(TestOutput),
    ) -> CaseOutcome;
}

/// Loader for one kind of assembly
pub trait TestFramework: Send + Sync {
    fn name(&self) -> &str;

    fn can_load(&self, assembly: &Path) -> bool;

    fn load(&self, assembly: &Path, context: &AssemblyContext) -> Result<Box<dyn LoadedAssembly>>;
}

/// Ordered set of frameworks; the first one that accepts an assembly wins
#[derive(Clone, Default)]
pub struct FrameworkRegistry {
    frameworks: Vec<Arc<dyn TestFramework>>,
}

impl FrameworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the frameworks shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::LibtestFramework::new()));
        registry
    }

    /// Register a framework ahead of those already present
    pub fn register(&mut self, framework: Arc<dyn TestFramework>) {
        self.frameworks.insert(0, framework);
    }

    pub fn find(&self, assembly: &Path) -> Option<Arc<dyn TestFramework>> {
        self.frameworks
            .iter()
            .find(|f| f.can_load(assembly))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.frameworks.iter().map(|f| f.name().to_string()).collect()
    }
}

/// How discovered cases are arranged into suites
#[derive(Debug, Clone, Copy)]
pub struct TreeOptions {
    pub auto_namespace_suites: bool,
    pub merge_namespaces: bool,
}

impl TreeOptions {
    pub fn from_package(package: &TestPackage) -> Self {
        Self {
            auto_namespace_suites: package.bool_setting(settings::AUTO_NAMESPACE_SUITES, true),
            merge_namespaces: package.bool_setting(settings::MERGE_NAMESPACES, false),
        }
    }
}

/// Build an assembly's test tree from its flat case list
///
/// Keys are assigned depth first in creation order, starting with the
/// assembly suite at key 0.
pub fn build_tree(runner: RunnerId, assembly: &Path, cases: &[TestCaseInfo], options: TreeOptions) -> Test {
    let mut next_key = 0u32;
    let mut id = || {
        let key = next_key;
        next_key += 1;
        TestId { runner, key }
    };

    let label = assembly
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| assembly.display().to_string());
    let mut root = Test::suite(id(), TestName::new(label, assembly.display().to_string()));
    root.properties
        .insert("assembly".to_string(), assembly.display().to_string());

    for case in cases {
        let mut segments: Vec<&str> = if options.auto_namespace_suites {
            case.full_name.split("::").collect()
        } else {
            vec![case.full_name.as_str()]
        };
        let leaf = segments.pop().unwrap_or(case.full_name.as_str());

        let namespaces: Vec<String> = if options.merge_namespaces && !segments.is_empty() {
            vec![segments.join("::")]
        } else {
            segments.iter().map(|s| s.to_string()).collect()
        };

        let mut parent = &mut root;
        let mut prefix = String::new();
        for namespace in &namespaces {
            if !prefix.is_empty() {
                prefix.push_str("::");
            }
            prefix.push_str(namespace);

            let position = parent
                .children
                .iter()
                .position(|c| c.is_suite && c.name.full_name == prefix);
            let index = match position {
                Some(index) => index,
                None => {
                    parent
                        .children
                        .push(Test::suite(id(), TestName::new(namespace.clone(), prefix.clone())));
                    parent.children.len() - 1
                }
            };
            parent = &mut parent.children[index];
        }

        let mut test = Test::case(id(), TestName::new(leaf, case.full_name.clone()));
        test.categories = case.categories.clone();
        test.properties = case.properties.clone();
        parent.children.push(test);
    }

    root
}

/// Keep only the path from `test` down to the node named `full_name`
pub fn prune_to(test: &Test, full_name: &str) -> Option<Test> {
    if test.name.full_name == full_name {
        return Some(test.clone());
    }
    if !test.is_suite {
        return None;
    }

    let children: Vec<Test> = test
        .children
        .iter()
        .filter_map(|c| prune_to(c, full_name))
        .collect();
    if children.is_empty() {
        None
    } else {
        Some(Test {
            children,
            ..test.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cases(names: &[&str]) -> Vec<TestCaseInfo> {
        names.iter().map(|n| TestCaseInfo::new(*n)).collect()
    }

    #[test]
    fn test_namespace_suites() {
        let tree = build_tree(
            RunnerId(2),
            Path::new("/bin/unit.test"),
            &cases(&["math::add", "math::sub", "io::read::small", "top"]),
            TreeOptions {
                auto_namespace_suites: true,
                merge_namespaces: false,
            },
        );

        assert_eq!(tree.name.name, "unit.test");
        assert_eq!(tree.test_case_count(), 4);
        let names: Vec<&str> = tree.children.iter().map(|c| c.full_name()).collect();
        assert_eq!(names, vec!["math", "io", "top"]);
        assert!(tree.find("io::read").map(|t| t.is_suite).unwrap_or(false));
        assert_eq!(tree.find("io::read::small").map(|t| t.name.name.as_str()), Some("small"));
        assert!(tree.children.iter().all(|c| c.id.runner == RunnerId(2)));
    }

    #[test]
    fn test_merged_namespaces() {
        let tree = build_tree(
            RunnerId(1),
            Path::new("unit.test"),
            &cases(&["io::read::small", "io::read::large", "io::write"]),
            TreeOptions {
                auto_namespace_suites: true,
                merge_namespaces: true,
            },
        );

        let names: Vec<&str> = tree.children.iter().map(|c| c.full_name()).collect();
        assert_eq!(names, vec!["io::read", "io"]);
        assert_eq!(tree.children[0].children.len(), 2);
    }

    #[test]
    fn test_flat_tree_without_namespace_suites() {
        let tree = build_tree(
            RunnerId(1),
            Path::new("unit.test"),
            &cases(&["a::b", "c::d"]),
            TreeOptions {
                auto_namespace_suites: false,
                merge_namespaces: false,
            },
        );
        assert_eq!(tree.children.len(), 2);
        assert!(tree.children.iter().all(|c| !c.is_suite));
    }

    #[test]
    fn test_keys_are_unique() {
        let tree = build_tree(
            RunnerId(1),
            Path::new("unit.test"),
            &cases(&["a::x", "a::y", "b::z"]),
            TreeOptions::from_package(&TestPackage::default()),
        );
        let mut keys = Vec::new();
        fn collect(t: &Test, keys: &mut Vec<u32>) {
            keys.push(t.id.key);
            t.children.iter().for_each(|c| collect(c, keys));
        }
        collect(&tree, &mut keys);
        let unique: BTreeSet<u32> = keys.iter().copied().collect();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn test_prune_to_target() {
        let tree = build_tree(
            RunnerId(1),
            Path::new("unit.test"),
            &cases(&["math::add", "math::sub", "io::read"]),
            TreeOptions::from_package(&TestPackage::default()),
        );

        let pruned = prune_to(&tree, "math::sub").unwrap();
        assert_eq!(pruned.test_case_count(), 1);
        assert_eq!(pruned.full_name(), tree.full_name());
        assert!(pruned.find("math::sub").is_some());
        assert!(pruned.find("io::read").is_none());

        assert!(prune_to(&tree, "math::mul").is_none());
    }
}
