//! Rate limit rules configuration and matching.
//!
//! Rules map route patterns to request quotas. Resolution checks exact
//! matches first, then glob patterns in declaration order, then the default
//! rule. A miss with no default means the route is unlimited.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// A quota rule for one route pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Route pattern: an exact path or a glob (`*` and `?` wildcards)
    #[serde(default)]
    pub path: String,

    /// Requests allowed per window
    pub requests_per_window: u32,

    /// Window length in seconds
    pub window_secs: u64,

    /// Do not count requests that complete successfully
    #[serde(default)]
    pub skip_successful: bool,

    /// Do not count requests that fail
    #[serde(default)]
    pub skip_failed: bool,
}

/// Rule table configuration, as loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleTableConfig {
    /// Per-route rules
    #[serde(default)]
    pub routes: Vec<RateLimitRule>,

    /// Fallback rule for routes with no specific match
    #[serde(rename = "default")]
    pub default_rule: Option<RateLimitRule>,
}

impl RuleTableConfig {
    /// Load rule configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rule configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rules: {}", e)))
    }
}

/// Compiled rule table with ordered resolution.
pub struct RuleTable {
    /// Exact-path rules
    exact: HashMap<String, Arc<RateLimitRule>>,
    /// Glob rules, checked in declaration order
    patterns: Vec<(Regex, Arc<RateLimitRule>)>,
    /// Fallback rule
    default_rule: Option<Arc<RateLimitRule>>,
}

impl RuleTable {
    /// Build a rule table from configuration, compiling glob patterns.
    pub fn new(config: RuleTableConfig) -> Result<Self> {
        let mut exact = HashMap::new();
        let mut patterns = Vec::new();

        for rule in config.routes {
            validate(&rule)?;
            let rule = Arc::new(rule);
            if rule.path.contains('*') || rule.path.contains('?') {
                patterns.push((compile_glob(&rule.path)?, rule));
            } else {
                exact.insert(rule.path.clone(), rule);
            }
        }

        let default_rule = match config.default_rule {
            Some(rule) => {
                validate(&rule)?;
                Some(Arc::new(rule))
            }
            None => None,
        };

        Ok(Self {
            exact,
            patterns,
            default_rule,
        })
    }

    /// Resolve the rule for a path.
    ///
    /// `None` means the path is unlimited: no rule matched and no default
    /// rule is configured.
    pub fn resolve(&self, path: &str) -> Option<Arc<RateLimitRule>> {
        if let Some(rule) = self.exact.get(path) {
            return Some(rule.clone());
        }

        for (pattern, rule) in &self.patterns {
            if pattern.is_match(path) {
                return Some(rule.clone());
            }
        }

        self.default_rule.clone()
    }

    /// Number of configured rules, excluding the default.
    pub fn rule_count(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }
}

fn validate(rule: &RateLimitRule) -> Result<()> {
    if rule.requests_per_window == 0 {
        return Err(FloodgateError::Config(format!(
            "Rule '{}' must allow at least one request per window",
            rule.path
        )));
    }
    if rule.window_secs == 0 {
        return Err(FloodgateError::Config(format!(
            "Rule '{}' must have a nonzero window",
            rule.path
        )));
    }
    Ok(())
}

/// Translate a glob pattern into an anchored regex.
fn compile_glob(pattern: &str) -> Result<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');
    for c in pattern.chars() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            _ => translated.push_str(&regex::escape(&c.to_string())),
        }
    }
    translated.push('$');

    Regex::new(&translated)
        .map_err(|e| FloodgateError::Config(format!("Invalid pattern '{}': {}", pattern, e)))
}
