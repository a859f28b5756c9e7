//! Configuration module for Graphform.
//!
//! This module handles loading and validating configuration from:
//! - YAML configuration files (`graphform.yaml`)
//! - Environment variables
//! - CLI arguments
//!
//! # Configuration File Format
//!
//! ```yaml
//! # graphform.yaml
//!
//! walk:
//!   parallelism: 10
//!
//! state:
//!   path: graphform.state.json
//!   backup: true
//!
//! plan:
//!   refresh: true
//!
//! debug:
//!   enabled: false
//!   dir: ${GRAPHFORM_DEBUG_DIR}  # Environment variable expansion
//!
//! output:
//!   colored: true
//!   verbose: false
//!   pretty: true
//! ```

use crate::error::{Result, ResultExt};
use crate::walk::DEFAULT_PARALLELISM;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "GRAPHFORM_CONFIG";

/// File names searched in the working directory, in order.
pub const CONFIG_FILE_NAMES: [&str; 3] = ["graphform.yaml", "graphform.yml", ".graphform.yaml"];

static BRACED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid regex"));

/// Walk options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkOptions {
    /// Maximum number of vertices visited at once.
    pub parallelism: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self { parallelism: DEFAULT_PARALLELISM }
    }
}

/// State persistence options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateOptions {
    /// State file.
    pub path: PathBuf,

    /// Keep a `.backup` copy of the previous snapshot.
    pub backup: bool,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self { path: PathBuf::from("graphform.state.json"), backup: true }
    }
}

/// Plan options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanOptions {
    /// Refresh instances from their providers before diffing.
    pub refresh: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self { refresh: true }
    }
}

/// Debug archive options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DebugOptions {
    /// Write hook events and graphs to a debug archive.
    pub enabled: bool,

    /// Parent directory of the archive (default: working directory).
    pub dir: Option<PathBuf>,
}

/// Output options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputOptions {
    /// Use colored output.
    pub colored: bool,

    /// Verbose output mode.
    pub verbose: bool,

    /// Pretty-print JSON output.
    pub pretty: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self { colored: true, verbose: false, pretty: true }
    }
}

/// Main configuration structure with nested sections.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Walk options
    pub walk: WalkOptions,

    /// State options
    pub state: StateOptions,

    /// Plan options
    pub plan: PlanOptions,

    /// Debug archive options
    pub debug: DebugOptions,

    /// Output options
    pub output: OutputOptions,
}

impl Config {
    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid or a value is out of range.
    pub fn from_yaml(content: &str) -> Result<Self> {
        tracing::debug!("Parsing configuration from YAML");
        let expanded = expand_env_vars(content);

        // An empty or comment-only document is the default configuration
        let config: Self = if expanded.lines().all(|l| l.trim().is_empty() || l.trim_start().starts_with('#')) {
            Self::default()
        } else {
            serde_yaml::from_str(&expanded).map_err(|e| crate::err!(ConfigParse {
                message: e.to_string(),
                source: Some(Box::new(e)),
            }))?
        };
        config.validate()?;

        tracing::debug!(
            parallelism = config.walk.parallelism,
            state = %config.state.path.display(),
            refresh = config.plan.refresh,
            "Configuration loaded successfully"
        );
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        Self::from_yaml(&content)
    }

    /// Find the configuration file to use: an explicit path, then
    /// `GRAPHFORM_CONFIG`, then the default file names.
    #[must_use]
    pub fn locate(explicit: Option<&std::path::Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(path));
        }
        CONFIG_FILE_NAMES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    fn validate(&self) -> Result<()> {
        if self.walk.parallelism == 0 {
            return Err(crate::err!(ConfigValue {
                key: "walk.parallelism".to_string(),
                message: "must be at least 1".to_string(),
            }));
        }
        Ok(())
    }

    /// Generate an example YAML configuration.
    #[must_use]
    pub fn example_yaml() -> String {
        r#"# Graphform Configuration File

# Walk options
walk:
  # Maximum number of vertices visited at once
  parallelism: 10

# State options
state:
  # State file written after every change during apply
  path: graphform.state.json

  # Keep a copy of the previous snapshot next to the state file
  backup: true

# Plan options
plan:
  # Ask providers for the current state of every instance before diffing
  refresh: true

# Debug archive
debug:
  # Write every hook event and walked graph to debug-<timestamp>/
  enabled: false

  # Parent directory of the archive (default: working directory)
  # dir: ${GRAPHFORM_DEBUG_DIR}

# Output options
output:
  # Use colored output in terminal
  colored: true

  # Enable verbose output
  verbose: false

  # Pretty-print JSON output
  pretty: true
"#
        .to_string()
    }

    /// Merge CLI arguments into the configuration.
    pub fn merge_cli_args(&mut self, args: &crate::cli::RunArgs) {
        if let Some(parallelism) = args.parallelism {
            self.walk.parallelism = parallelism.max(1);
        }
        if let Some(ref state) = args.state {
            self.state.path = state.clone();
        }
        if args.no_backup {
            self.state.backup = false;
        }
        if args.debug {
            self.debug.enabled = true;
        }
    }
}

/// Expand `${VAR}` references to environment variables. Unset variables are
/// left as written.
fn expand_env_vars(content: &str) -> String {
    BRACED_VAR
        .replace_all(content, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
