//! Test package description

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Well-known setting keys. Anything else in the map is passed through.
pub mod settings {
    /// Collapse namespace suites into a single level (bool)
    pub const MERGE_NAMESPACES: &str = "merge-namespaces";
    /// Build namespace suites from `::`-separated test names (bool)
    pub const AUTO_NAMESPACE_SUITES: &str = "auto-namespace-suites";
    /// Copy assemblies to a private directory before loading (bool)
    pub const SHADOW_COPY: &str = "shadow-copy";
    /// Per-test timeout in milliseconds (int)
    pub const DEFAULT_TIMEOUT_MS: &str = "default-timeout-ms";
}

/// A single package setting value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Description of what to load and how
///
/// Runners only ever see a `&TestPackage`; anything they keep is cloned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestPackage {
    /// Test assemblies, in load order
    pub assemblies: Vec<PathBuf>,
    /// Application base for relative paths and test working directory
    pub base_directory: PathBuf,
    /// Configuration file exposed to the tests
    pub config_file: Option<PathBuf>,
    /// Extra binary search directories, as a platform path list
    pub private_bin_path: Option<String>,
    /// Load only this test (full name) or this assembly (path)
    pub test_name: Option<String>,
    /// Free-form settings
    pub settings: BTreeMap<String, SettingValue>,
    /// Add each assembly's directory to the private bin path
    pub auto_bin_path: bool,
}

impl TestPackage {
    /// Create a package for a list of assemblies rooted at the current directory
    pub fn new<I, P>(assemblies: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            assemblies: assemblies.into_iter().map(Into::into).collect(),
            base_directory: std::env::current_dir().unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn with_base_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_directory = dir.into();
        self
    }

    pub fn with_test_name(mut self, name: impl Into<String>) -> Self {
        self.test_name = Some(name.into());
        self
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn with_setting(mut self, key: &str, value: impl Into<SettingValue>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }

    /// Display name: the single assembly's file name, or a generic name
    pub fn name(&self) -> String {
        match self.assemblies.as_slice() {
            [single] => single
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| single.display().to_string()),
            _ => "Tests".to_string(),
        }
    }

    /// Resolve an assembly path against the base directory
    pub fn resolve(&self, assembly: &Path) -> PathBuf {
        if assembly.is_relative() {
            self.base_directory.join(assembly)
        } else {
            assembly.to_path_buf()
        }
    }

    pub fn bool_setting(&self, key: &str, default: bool) -> bool {
        match self.settings.get(key) {
            Some(SettingValue::Bool(v)) => *v,
            Some(SettingValue::Text(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn int_setting(&self, key: &str) -> Option<i64> {
        match self.settings.get(key) {
            Some(SettingValue::Int(v)) => Some(*v),
            Some(SettingValue::Text(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Private bin directories, including assembly directories when
    /// `auto_bin_path` is set
    pub fn private_bin_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .private_bin_path
            .as_deref()
            .map(|p| std::env::split_paths(p).collect())
            .unwrap_or_default();

        if self.auto_bin_path {
            for assembly in &self.assemblies {
                if let Some(parent) = self.resolve(assembly).parent() {
                    let parent = parent.to_path_buf();
                    if !dirs.contains(&parent) {
                        dirs.push(parent);
                    }
                }
            }
        }

        dirs
    }

    /// Package for a single assembly, carrying everything else forward
    pub fn sub_package(&self, assembly: &Path, test_name: Option<String>) -> Self {
        Self {
            assemblies: vec![assembly.to_path_buf()],
            test_name,
            ..self.clone()
        }
    }
}

/// What a runner knows about one loaded assembly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyInfo {
    /// Path as given in the package
    pub path: PathBuf,
    /// Framework that loaded it
    pub framework: String,
    /// Process hosting the assembly
    pub process_id: u32,
    /// Identifier of the isolated context hosting it
    pub context_id: u64,
    /// Number of test cases discovered
    pub test_count: usize,
}
