//! Configuration management for Weft
//!
//! Repository-level settings for the scheduler, resource categories,
//! memory store and retry policy. Loaded from `.weft/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Result, WeftError};

/// Repository-level Weft configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub resources: ResourcesConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// What happens to a step whose dependency failed or was cancelled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyFailurePolicy {
    /// Cancel every downstream step
    #[default]
    Cancel,
    /// Run downstream steps once their dependencies are terminal
    Continue,
}

/// Scheduler behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Stop after the first batch containing a failed task
    #[serde(default)]
    pub fail_fast: bool,

    /// Report success even when some tasks failed
    #[serde(default)]
    pub allow_partial_success: bool,

    #[serde(default)]
    pub on_dependency_failure: DependencyFailurePolicy,

    /// Upper bound on tasks executing at once across all categories
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How long a task waits for a resource slot
    #[serde(default = "default_assignment_timeout_secs")]
    pub assignment_timeout_secs: u64,

    /// How long an in-flight task may keep running after cancellation
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Where the task-list snapshot is written (disabled when unset)
    #[serde(default)]
    pub task_list_path: Option<PathBuf>,
}

/// Resource category declarations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Ceiling for categories registered without an explicit limit
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,

    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryConfig>,
}

/// One resource category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,

    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Built-in handler kind: "noop" or "command"
    #[serde(default = "default_handler")]
    pub handler: String,
}

/// Memory store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_root")]
    pub root: PathBuf,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

/// Retry policy for recoverable failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts allowed for transient failures (first run included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Total attempts for failures the classifier could not place
    #[serde(default = "default_unknown_max_attempts")]
    pub unknown_max_attempts: u32,

    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Extra classifier rules, checked before the built-in ones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ClassifierRuleConfig>,
}

/// `[[retry.rules]]`: failures whose message matches `pattern` get `category`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierRuleConfig {
    /// transient, resource_exhaustion, validation_error, permission_error or unknown
    pub category: String,
    /// Regular expression matched against the failure message
    pub pattern: String,
}

// Default value providers
fn default_max_workers() -> usize {
    8
}

fn default_assignment_timeout_secs() -> u64 {
    30
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_max_concurrency() -> usize {
    2
}

fn default_handler() -> String {
    "noop".to_string()
}

fn default_categories() -> Vec<CategoryConfig> {
    vec![CategoryConfig {
        name: "default".to_string(),
        max_concurrency: None,
        handler: default_handler(),
    }]
}

fn default_memory_root() -> PathBuf {
    PathBuf::from(".weft/memory")
}

fn default_cache_capacity() -> usize {
    256
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_unknown_max_attempts() -> u32 {
    2
}

fn default_base_delay_secs() -> f64 {
    1.0
}

fn default_max_delay_secs() -> f64 {
    30.0
}

fn default_multiplier() -> f64 {
    2.0
}

impl WeftConfig {
    /// Load configuration from `.weft/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".weft/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| WeftError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.weft/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        Self::default().write(repo_root)
    }

    /// Write this configuration to `.weft/config.toml`
    pub fn write(&self, repo_root: &Path) -> Result<PathBuf> {
        let config_dir = repo_root.join(".weft");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)
            .map_err(|e| WeftError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_workers == 0 {
            return Err(WeftError::Config("scheduler.max_workers must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(WeftError::Config("retry.max_attempts must be > 0".into()));
        }
        if self.retry.base_delay_secs <= 0.0 || self.retry.multiplier < 1.0 {
            return Err(WeftError::Config(
                "retry.base_delay_secs must be > 0 and retry.multiplier >= 1".into(),
            ));
        }
        for category in &self.resources.categories {
            if category.max_concurrency == Some(0) {
                return Err(WeftError::Config(format!(
                    "category {} has max_concurrency 0",
                    category.name
                )));
            }
        }
        Ok(())
    }

    /// Resolve the memory root against the repository root
    pub fn memory_root(&self, repo_root: &Path) -> PathBuf {
        if self.memory.root.is_absolute() {
            self.memory.root.clone()
        } else {
            repo_root.join(&self.memory.root)
        }
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.scheduler.fail_fast = fail_fast;
        self
    }

    pub fn with_partial_success(mut self, allow: bool) -> Self {
        self.scheduler.allow_partial_success = allow;
        self
    }

    pub fn with_category(mut self, name: impl Into<String>, max_concurrency: usize) -> Self {
        let name = name.into();
        self.resources.categories.retain(|c| c.name != name);
        self.resources.categories.push(CategoryConfig {
            name,
            max_concurrency: Some(max_concurrency),
            handler: default_handler(),
        });
        self
    }
}

impl CategoryConfig {
    pub fn effective_max(&self, default: usize) -> usize {
        self.max_concurrency.unwrap_or(default).max(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            allow_partial_success: false,
            on_dependency_failure: DependencyFailurePolicy::default(),
            max_workers: default_max_workers(),
            assignment_timeout_secs: default_assignment_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            task_list_path: None,
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: default_max_concurrency(),
            categories: default_categories(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            root: default_memory_root(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            unknown_max_attempts: default_unknown_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            multiplier: default_multiplier(),
            rules: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let config = WeftConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, WeftConfig::default());
        assert!(!config.scheduler.fail_fast);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_write_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = WeftConfig::write_default(dir.path()).unwrap();
        assert!(path.exists());

        let loaded = WeftConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, WeftConfig::default());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = WeftConfig::from_toml(
            r#"
            [scheduler]
            fail_fast = true
            on_dependency_failure = "continue"

            [[resources.categories]]
            name = "gpu"
            max_concurrency = 1
            handler = "command"
            "#,
        )
        .unwrap();

        assert!(config.scheduler.fail_fast);
        assert_eq!(
            config.scheduler.on_dependency_failure,
            DependencyFailurePolicy::Continue
        );
        assert_eq!(config.scheduler.max_workers, 8);
        assert_eq!(config.resources.categories.len(), 1);
        assert_eq!(config.resources.categories[0].effective_max(4), 1);
        assert_eq!(config.memory.cache_capacity, 256);
    }

    #[test]
    fn test_classifier_rules_parse() {
        let config = WeftConfig::from_toml(
            r#"
            [retry]
            max_attempts = 4

            [[retry.rules]]
            category = "transient"
            pattern = "(?i)lock held"
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(
            config.retry.rules,
            vec![ClassifierRuleConfig {
                category: "transient".into(),
                pattern: "(?i)lock held".into(),
            }]
        );
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = WeftConfig::from_toml(
            r#"
            [[resources.categories]]
            name = "gpu"
            max_concurrency = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, WeftError::Config(_)));
    }

    #[test]
    fn test_memory_root_resolution() {
        let config = WeftConfig::default();
        assert_eq!(
            config.memory_root(Path::new("/repo")),
            PathBuf::from("/repo/.weft/memory")
        );
    }

    #[test]
    fn test_with_category_replaces_existing() {
        let config = WeftConfig::default()
            .with_category("io", 2)
            .with_category("io", 5);
        let io: Vec<_> = config
            .resources
            .categories
            .iter()
            .filter(|c| c.name == "io")
            .collect();
        assert_eq!(io.len(), 1);
        assert_eq!(io[0].max_concurrency, Some(5));
    }
}
