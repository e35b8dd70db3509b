//! Admission rules configuration.
//!
//! Rules describe the global quota, the per-category quotas nested inside it
//! and the concurrency bound. They can be embedded in the main configuration
//! or loaded on their own from a YAML file:
//!
//! ```yaml
//! max_concurrent: 10
//! global:
//!   requests_per_unit: 3000
//!   unit: minute
//! categories:
//!   poll-job:
//!     requests_per_unit: 2
//!     unit: second
//!     unit_multiplier: 10
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{CourierError, Result};

/// Category used by the job poller to start a job.
pub const START_JOB: &str = "start-job";
/// Category used by the job poller for status checks.
pub const POLL_JOB: &str = "poll-job";
/// Category used by the job poller to fetch the artifact.
pub const DOWNLOAD_JOB: &str = "download-job";

/// Time unit for window rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A sliding-window quota: `requests_per_unit` permits per
/// `unit_multiplier` x `unit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRule {
    /// Number of permits allowed per window
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// How many units one window spans
    #[serde(default = "default_unit_multiplier")]
    pub unit_multiplier: u32,
    /// Number of segments the window is divided into
    #[serde(default = "default_segments")]
    pub segments: u32,
    /// Callers allowed to wait for capacity before being rejected outright
    #[serde(default)]
    pub queue_limit: usize,
}

fn default_unit_multiplier() -> u32 {
    1
}

fn default_segments() -> u32 {
    6
}

impl WindowRule {
    /// Create a rule with the default segment count and no queue.
    pub fn new(requests_per_unit: u64, unit: TimeUnit) -> Self {
        Self {
            requests_per_unit,
            unit,
            unit_multiplier: default_unit_multiplier(),
            segments: default_segments(),
            queue_limit: 0,
        }
    }

    /// Set how many units one window spans.
    pub fn per(mut self, unit_multiplier: u32) -> Self {
        self.unit_multiplier = unit_multiplier;
        self
    }

    /// Set the segment count.
    pub fn with_segments(mut self, segments: u32) -> Self {
        self.segments = segments;
        self
    }

    /// Set the queue limit.
    pub fn with_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }

    /// Length of the trailing window.
    pub fn window(&self) -> Duration {
        self.unit.duration() * self.unit_multiplier
    }

    fn validate(&self, scope: &str) -> Result<()> {
        if self.requests_per_unit == 0 {
            return Err(CourierError::Config(format!("{scope}: requests_per_unit must be positive")));
        }
        if self.unit_multiplier == 0 {
            return Err(CourierError::Config(format!("{scope}: unit_multiplier must be positive")));
        }
        if self.segments == 0 {
            return Err(CourierError::Config(format!("{scope}: segments must be positive")));
        }
        Ok(())
    }
}

/// The full set of admission rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRules {
    /// Maximum simultaneously in-flight calls
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// The outer quota every call passes
    #[serde(default = "default_global_rule")]
    pub global: WindowRule,
    /// Stricter quotas per category
    #[serde(default = "default_category_rules")]
    pub categories: HashMap<String, WindowRule>,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_global_rule() -> WindowRule {
    WindowRule::new(3000, TimeUnit::Minute).with_queue_limit(100)
}

fn default_category_rules() -> HashMap<String, WindowRule> {
    [START_JOB, POLL_JOB, DOWNLOAD_JOB]
        .into_iter()
        .map(|name| {
            (
                name.to_string(),
                WindowRule::new(300, TimeUnit::Minute).with_queue_limit(20),
            )
        })
        .collect()
}

impl Default for AdmissionRules {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            global: default_global_rule(),
            categories: default_category_rules(),
        }
    }
}

impl AdmissionRules {
    /// Rules with only a global quota and no categories.
    pub fn global_only(max_concurrent: usize, global: WindowRule) -> Self {
        Self {
            max_concurrent,
            global,
            categories: HashMap::new(),
        }
    }

    /// Add or replace a category rule.
    pub fn with_category(mut self, name: impl Into<String>, rule: WindowRule) -> Self {
        self.categories.insert(name.into(), rule);
        self
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: AdmissionRules = serde_yaml::from_str(yaml)
            .map_err(|e| CourierError::Config(format!("Failed to parse admission rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Check every rule for values the limiters cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(CourierError::Config("max_concurrent must be positive".into()));
        }
        self.global.validate("global")?;
        for (name, rule) in &self.categories {
            if name.is_empty() {
                return Err(CourierError::Config("category names must not be empty".into()));
            }
            rule.validate(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
max_concurrent: 4
global:
  requests_per_unit: 100
  unit: second
categories:
  poll-job:
    requests_per_unit: 2
    unit: second
    unit_multiplier: 10
    segments: 10
    queue_limit: 3
"#;
        let rules = AdmissionRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.max_concurrent, 4);
        assert_eq!(rules.global.window(), Duration::from_secs(1));
        assert_eq!(rules.global.segments, 6);

        let poll = &rules.categories[POLL_JOB];
        assert_eq!(poll.requests_per_unit, 2);
        assert_eq!(poll.window(), Duration::from_secs(10));
        assert_eq!(poll.segments, 10);
        assert_eq!(poll.queue_limit, 3);
        assert_eq!(rules.categories.len(), 1);
    }

    #[test]
    fn test_defaults_cover_job_categories() {
        let rules = AdmissionRules::default();
        assert_eq!(rules.max_concurrent, 10);
        assert_eq!(rules.global.requests_per_unit, 3000);
        assert_eq!(rules.global.window(), Duration::from_secs(60));
        for name in [START_JOB, POLL_JOB, DOWNLOAD_JOB] {
            assert_eq!(rules.categories[name].requests_per_unit, 300);
        }
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let rules = AdmissionRules::from_yaml("max_concurrent: 2").unwrap();
        assert_eq!(rules.global, default_global_rule());
        assert_eq!(rules.categories.len(), 3);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let yaml = r#"
global:
  requests_per_unit: 0
  unit: minute
"#;
        assert!(matches!(
            AdmissionRules::from_yaml(yaml),
            Err(CourierError::Config(_))
        ));
        assert!(AdmissionRules::from_yaml("max_concurrent: 0").is_err());
        assert!(AdmissionRules::from_yaml("global: [").is_err());
    }

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
        assert_eq!(
            WindowRule::new(5, TimeUnit::Minute).per(5).window(),
            Duration::from_secs(300)
        );
    }
}
