//! Rule registry: named rules binding URL patterns to limiting configs.
//!
//! Rules are registered at startup and may be added or removed at runtime
//! through the admin surface. Lookups re-scan the registered set and pick
//! the highest-priority enabled match.

use std::time::Duration;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::algorithms::Strategy;
use crate::error::{EngineError, EngineResult};

/// Closed set of key-derivation policies (no injected closures, so rule
/// configuration stays serializable and auditable).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Credential key for Bearer-authenticated requests, IP+fingerprint
    /// otherwise.
    #[default]
    AuthOrIp,
    /// IP only, ignoring credentials and User-Agent.
    IpOnly,
}

#[derive(Debug, Clone)]
pub enum RulePattern {
    /// Literal prefix of the request path.
    Prefix(String),
    Regex(Regex),
}

impl RulePattern {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            RulePattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            RulePattern::Regex(re) => re.is_match(path),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            RulePattern::Prefix(prefix) => prefix,
            RulePattern::Regex(re) => re.as_str(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Window length; accepts humane forms like "15m" or "1s" on the wire.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub max_requests: u32,
    pub strategy: Strategy,
    #[serde(default)]
    pub key_policy: KeyPolicy,
    /// Back the count out when the downstream response succeeds.
    #[serde(default)]
    pub skip_successful: bool,
    /// Back the count out when the downstream response fails.
    #[serde(default)]
    pub skip_failed: bool,
    /// Custom denial text; a generic message is used when absent.
    #[serde(default)]
    pub message: Option<String>,
    /// Attach quota headers to successful responses.
    #[serde(default = "default_true")]
    pub headers: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub id: String,
    pub pattern: RulePattern,
    pub config: RuleConfig,
    pub priority: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    #[default]
    Prefix,
    Regex,
}

/// Wire form accepted by the admin API. Conversion into [`RateLimitRule`]
/// is the single validation point: malformed rules are rejected here, never
/// silently registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub pattern: String,
    #[serde(default)]
    pub pattern_type: PatternType,
    pub config: RuleConfig,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TryFrom<RuleSpec> for RateLimitRule {
    type Error = EngineError;

    fn try_from(spec: RuleSpec) -> EngineResult<Self> {
        if spec.id.trim().is_empty() {
            return Err(EngineError::InvalidRule("rule id must not be empty".into()));
        }
        if spec.pattern.is_empty() {
            return Err(EngineError::InvalidRule(format!(
                "rule '{}' has an empty pattern",
                spec.id
            )));
        }
        if spec.config.max_requests == 0 {
            return Err(EngineError::InvalidRule(format!(
                "rule '{}' must allow at least one request per window",
                spec.id
            )));
        }
        if spec.config.window.as_millis() == 0 {
            return Err(EngineError::InvalidRule(format!(
                "rule '{}' has a zero-length window",
                spec.id
            )));
        }
        let pattern = match spec.pattern_type {
            PatternType::Prefix => RulePattern::Prefix(spec.pattern),
            PatternType::Regex => RulePattern::Regex(Regex::new(&spec.pattern).map_err(|e| {
                EngineError::InvalidRule(format!("rule '{}' pattern does not compile: {e}", spec.id))
            })?),
        };
        Ok(RateLimitRule {
            id: spec.id,
            pattern,
            config: spec.config,
            priority: spec.priority,
            enabled: spec.enabled,
        })
    }
}

impl RateLimitRule {
    pub fn to_spec(&self) -> RuleSpec {
        RuleSpec {
            id: self.id.clone(),
            pattern: self.pattern.as_str().to_string(),
            pattern_type: match self.pattern {
                RulePattern::Prefix(_) => PatternType::Prefix,
                RulePattern::Regex(_) => PatternType::Regex,
            },
            config: self.config.clone(),
            priority: self.priority,
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<Vec<RateLimitRule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule; a rule with the same id is replaced in place.
    pub fn add_rule(&self, rule: RateLimitRule) {
        let mut rules = self.rules.write();
        if let Some(existing) = rules.iter_mut().find(|r| r.id == rule.id) {
            *existing = rule;
        } else {
            rules.push(rule);
        }
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    /// Highest-priority enabled match wins. On equal priority the first rule
    /// registered with that priority keeps the match; this is the documented
    /// tie-break policy, not an accident of iteration.
    pub fn find_applicable(&self, path: &str) -> Option<RateLimitRule> {
        let rules = self.rules.read();
        let mut best: Option<&RateLimitRule> = None;
        for rule in rules.iter().filter(|r| r.enabled && r.pattern.matches(path)) {
            match best {
                Some(current) if rule.priority <= current.priority => {}
                _ => best = Some(rule),
            }
        }
        best.cloned()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    pub fn list(&self) -> Vec<RuleSpec> {
        self.rules.read().iter().map(RateLimitRule::to_spec).collect()
    }
}

/// Illustrative startup rule set; adjustable at runtime.
pub fn default_rules() -> Vec<RateLimitRule> {
    fn prefix_rule(
        id: &str,
        pattern: &str,
        priority: i32,
        window: Duration,
        max_requests: u32,
        strategy: Strategy,
        message: Option<&str>,
    ) -> RateLimitRule {
        RateLimitRule {
            id: id.to_string(),
            pattern: RulePattern::Prefix(pattern.to_string()),
            config: RuleConfig {
                window,
                max_requests,
                strategy,
                key_policy: KeyPolicy::AuthOrIp,
                skip_successful: false,
                skip_failed: false,
                message: message.map(str::to_string),
                headers: true,
            },
            priority,
            enabled: true,
        }
    }

    vec![
        prefix_rule(
            "auth-strict",
            "/api/auth",
            20,
            Duration::from_secs(15 * 60),
            5,
            Strategy::SlidingWindow,
            Some("Too many authentication attempts, please try again later."),
        ),
        prefix_rule(
            "search",
            "/api/search",
            15,
            Duration::from_secs(60),
            30,
            Strategy::TokenBucket,
            None,
        ),
        prefix_rule(
            "uploads",
            "/api/uploads",
            15,
            Duration::from_secs(60),
            5,
            Strategy::FixedWindow,
            Some("Upload limit reached, please wait before uploading again."),
        ),
        prefix_rule(
            "api-general",
            "/api",
            10,
            Duration::from_secs(60),
            60,
            Strategy::Adaptive,
            None,
        ),
    ]
}
