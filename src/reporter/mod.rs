//! Report generation module.
//!
//! Plans and apply results can be rendered as:
//! - Text: Human-readable CLI output
//! - JSON: Machine-readable structured output
//!
//! # Example
//!
//! ```rust,no_run
//! use graphform::reporter::Reporter;
//! use graphform::{Config, Plan, ReportFormat};
//!
//! let config = Config::default();
//! let reporter = Reporter::new(&config);
//!
//! let plan = Plan::read_from("infra.plan.json".as_ref()).unwrap();
//! println!("{}", reporter.plan_report(&plan, ReportFormat::Text).unwrap());
//! ```

mod json;
mod text;

use crate::config::Config;
use crate::engine::{ApplyResult, Plan};
use crate::error::Result;
use crate::types::ReportFormat;

pub use json::JsonReporter;
pub use text::TextReporter;

/// Report generator that supports multiple output formats.
pub struct Reporter {
    config: Config,
}

impl Reporter {
    /// Create a new reporter with the given configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self { config: config.clone() }
    }

    /// Render a plan in the specified format.
    ///
    /// # Errors
    ///
    /// Returns an error if report generation fails.
    pub fn plan_report(&self, plan: &Plan, format: ReportFormat) -> Result<String> {
        self.generator(format).plan(plan)
    }

    /// Render an apply result in the specified format.
    ///
    /// # Errors
    ///
    /// Returns an error if report generation fails.
    pub fn apply_report(&self, result: &ApplyResult, format: ReportFormat) -> Result<String> {
        self.generator(format).apply(result)
    }

    fn generator(&self, format: ReportFormat) -> Box<dyn ReportGenerator> {
        match format {
            ReportFormat::Json => Box::new(JsonReporter::new(&self.config)),
            ReportFormat::Text => Box::new(TextReporter::new(&self.config)),
        }
    }
}

/// Trait for report generators.
pub trait ReportGenerator {
    /// Render the changes a plan would make.
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails.
    fn plan(&self, plan: &Plan) -> Result<String>;

    /// Render the state and vertex outcomes of an apply.
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails.
    fn apply(&self, result: &ApplyResult) -> Result<String>;
}
