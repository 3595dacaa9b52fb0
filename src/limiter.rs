//! The rate-limiting engine: owns the rule registry, metrics store,
//! throttle controller, and adaptive settings, constructed once with its
//! clock injected. State is process-local; each instance enforces its own
//! quota.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::algorithms::{
    self, adaptive, AdaptiveSettings, AdaptiveSettingsUpdate, Decision, EvalContext, LoadSignal,
    Strategy,
};
use crate::clock::SharedClock;
use crate::error::{EngineError, EngineResult};
use crate::identity;
use crate::metrics::{ClientMetrics, ClientSnapshot, MetricsStore};
use crate::rules::{default_rules, RateLimitRule, RuleRegistry, RuleSpec};
use crate::throttle::ThrottleController;

/// Client entries idle longer than this are evicted by the sweeper.
const METRICS_MAX_IDLE: Duration = Duration::from_secs(24 * 60 * 60);
/// Queue entries older than this are trimmed regardless of state.
const QUEUE_ENTRY_MAX_AGE: Duration = Duration::from_secs(60);

/// Everything the middleware needs to act on a matched rule's decision.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub key: String,
    pub rule_id: String,
    pub strategy: Strategy,
    pub decision: Decision,
    pub headers: bool,
    pub message: Option<String>,
    pub skip_successful: bool,
    pub skip_failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub total_clients: usize,
    pub total_rules: usize,
    pub queue_length: usize,
    pub system_load: f64,
    pub adaptive_settings: AdaptiveSettings,
}

pub struct RateLimitEngine {
    clock: SharedClock,
    rules: RuleRegistry,
    metrics: MetricsStore,
    throttle: ThrottleController,
    adaptive: RwLock<AdaptiveSettings>,
}

impl RateLimitEngine {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            rules: RuleRegistry::new(),
            metrics: MetricsStore::new(),
            throttle: ThrottleController::new(),
            adaptive: RwLock::new(AdaptiveSettings::default()),
        }
    }

    /// Engine with the illustrative startup rule set registered.
    pub fn with_default_rules(self) -> Self {
        for rule in default_rules() {
            self.rules.add_rule(rule);
        }
        self
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn throttle(&self) -> &ThrottleController {
        &self.throttle
    }

    /// Match the path against the registry and evaluate the matched rule's
    /// strategy. `Ok(None)` means no rule applies and the request passes
    /// through unchanged. Reputation is adjusted here for explicit allows
    /// and violations.
    pub fn check(&self, path: &str, headers: &HeaderMap) -> EngineResult<Option<CheckOutcome>> {
        let Some(rule) = self.rules.find_applicable(path) else {
            return Ok(None);
        };

        let window_ms = rule.config.window.as_millis() as u64;
        if window_ms == 0 {
            // Registration validates this; a zero here means the rule was
            // injected past the validation point.
            return Err(EngineError::Evaluation(format!(
                "rule '{}' has an empty window",
                rule.id
            )));
        }

        let key = identity::resolve(rule.config.key_policy, headers);
        let now = self.clock.now_ms();
        let ctx = EvalContext {
            window_ms,
            max_requests: rule.config.max_requests,
            now_ms: now,
        };

        // The load scan is cross-client and O(clients); only the adaptive
        // strategy pays for it.
        let (settings, load) = if rule.config.strategy == Strategy::Adaptive {
            let (active_clients, recent_volume) =
                self.metrics.load_sample(now, adaptive::LOAD_HORIZON_MS);
            (
                *self.adaptive.read(),
                LoadSignal {
                    active_clients,
                    recent_volume,
                },
            )
        } else {
            (AdaptiveSettings::default(), LoadSignal::default())
        };

        let decision = self.metrics.with_entry(&key, |m| {
            let decision = algorithms::evaluate(rule.config.strategy, m, &ctx, &settings, load);
            if decision.allowed {
                m.note_allowed();
            } else {
                m.note_violation();
            }
            decision
        });

        debug!(
            client_key = %key,
            path = %path,
            rule_id = %rule.id,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "rate limit evaluated"
        );

        Ok(Some(CheckOutcome {
            key,
            rule_id: rule.id,
            strategy: rule.config.strategy,
            decision,
            headers: rule.config.headers,
            message: rule.config.message,
            skip_successful: rule.config.skip_successful,
            skip_failed: rule.config.skip_failed,
        }))
    }

    /// Back one counted request out, for rules that skip successful or
    /// failed requests.
    pub fn uncount(&self, key: &str, strategy: Strategy, total: u32) {
        self.metrics.with_entry(key, |m| match strategy {
            Strategy::TokenBucket => {
                if let Some(level) = m.bucket.as_mut() {
                    *level = (*level + 1.0).min(total as f64);
                }
            }
            _ => m.requests = (m.requests - 1.0).max(0.0),
        });
    }

    pub fn record_outcome(&self, key: &str, server_error: bool) {
        self.metrics.record_outcome(key, server_error);
    }

    pub fn record_blocked(&self, key: &str) {
        self.metrics.record_blocked(key);
    }

    // Admin surface.

    pub fn add_rule(&self, rule: RateLimitRule) {
        self.rules.add_rule(rule);
    }

    /// Validate and register a rule from its wire form.
    pub fn add_rule_spec(&self, spec: RuleSpec) -> EngineResult<()> {
        let rule = RateLimitRule::try_from(spec)?;
        info!(rule_id = %rule.id, priority = rule.priority, "rule registered");
        self.rules.add_rule(rule);
        Ok(())
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let removed = self.rules.remove_rule(id);
        if removed {
            info!(rule_id = %id, "rule removed");
        }
        removed
    }

    pub fn list_rules(&self) -> Vec<RuleSpec> {
        self.rules.list()
    }

    pub fn get_client_metrics(&self, key: &str) -> Option<ClientMetrics> {
        self.metrics.snapshot(key)
    }

    pub fn all_client_metrics(&self) -> Vec<ClientSnapshot> {
        self.metrics.snapshot_all()
    }

    pub fn reset_client(&self, key: &str) -> bool {
        self.metrics.reset(key)
    }

    pub fn update_adaptive_settings(&self, update: &AdaptiveSettingsUpdate) -> AdaptiveSettings {
        let mut settings = self.adaptive.write();
        settings.apply(update);
        info!(settings = ?*settings, "adaptive settings updated");
        *settings
    }

    pub fn system_stats(&self) -> SystemStats {
        let now = self.clock.now_ms();
        let (active_clients, recent_volume) =
            self.metrics.load_sample(now, adaptive::LOAD_HORIZON_MS);
        SystemStats {
            total_clients: self.metrics.len(),
            total_rules: self.rules.len(),
            queue_length: self.throttle.queue_len(),
            system_load: adaptive::system_load(LoadSignal {
                active_clients,
                recent_volume,
            }),
            adaptive_settings: *self.adaptive.read(),
        }
    }

    /// One cleanup pass: evict idle client entries and trim stale queue
    /// entries. Idempotent with no intervening traffic.
    pub fn sweep(&self) -> (usize, usize) {
        let now = self.clock.now_ms();
        let evicted = self
            .metrics
            .evict_idle(now, METRICS_MAX_IDLE.as_millis() as u64);
        let trimmed = self
            .throttle
            .sweep_queue(now, QUEUE_ENTRY_MAX_AGE.as_millis() as u64);
        if evicted > 0 || trimmed > 0 {
            info!(
                evicted_clients = evicted,
                trimmed_queue_entries = trimmed,
                "cleanup sweep completed"
            );
        }
        (evicted, trimmed)
    }

    /// Background sweeper on a fixed interval.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a sweep never
            // races startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rules::{KeyPolicy, PatternType, RuleConfig};

    fn engine_with_clock(start_ms: u64) -> (Arc<ManualClock>, RateLimitEngine) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let engine = RateLimitEngine::new(clock.clone());
        (clock, engine)
    }

    fn spec(id: &str, pattern: &str, priority: i32, strategy: Strategy, max: u32) -> RuleSpec {
        RuleSpec {
            id: id.to_string(),
            pattern: pattern.to_string(),
            pattern_type: PatternType::Prefix,
            config: RuleConfig {
                window: Duration::from_secs(1),
                max_requests: max,
                strategy,
                key_policy: KeyPolicy::AuthOrIp,
                skip_successful: false,
                skip_failed: false,
                message: None,
                headers: true,
            },
            priority,
            enabled: true,
        }
    }

    fn anon_headers(ip: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", ip.parse().unwrap());
        headers.insert("user-agent", "test-agent".parse().unwrap());
        headers
    }

    #[test]
    fn no_matching_rule_passes_through() {
        let (_, engine) = engine_with_clock(1_000_000);
        assert!(engine.check("/health", &HeaderMap::new()).unwrap().is_none());
    }

    #[test]
    fn denial_adjusts_reputation_and_violations() {
        let (_, engine) = engine_with_clock(1_000_000);
        engine
            .add_rule_spec(spec("r", "/api", 1, Strategy::FixedWindow, 2))
            .unwrap();
        let headers = anon_headers("10.0.0.1");

        for _ in 0..2 {
            let outcome = engine.check("/api/x", &headers).unwrap().unwrap();
            assert!(outcome.decision.allowed);
        }
        let denied = engine.check("/api/x", &headers).unwrap().unwrap();
        assert!(!denied.decision.allowed);

        let metrics = engine.get_client_metrics(&denied.key).unwrap();
        assert_eq!(metrics.violations, 1);
        // Two allows (+0.5 each) then one violation (-2.0).
        assert!((metrics.reputation - 49.0).abs() < 1e-9);
    }

    #[test]
    fn clients_are_isolated_by_key() {
        let (_, engine) = engine_with_clock(1_000_000);
        engine
            .add_rule_spec(spec("r", "/api", 1, Strategy::FixedWindow, 1))
            .unwrap();

        let first = anon_headers("10.0.0.1");
        let second = anon_headers("10.0.0.2");
        assert!(engine.check("/api/x", &first).unwrap().unwrap().decision.allowed);
        assert!(!engine.check("/api/x", &first).unwrap().unwrap().decision.allowed);
        assert!(engine.check("/api/x", &second).unwrap().unwrap().decision.allowed);
    }

    #[test]
    fn zero_window_rule_surfaces_an_evaluation_error() {
        let (_, engine) = engine_with_clock(1_000_000);
        let mut rule = RateLimitRule::try_from(spec("r", "/api", 1, Strategy::FixedWindow, 1))
            .unwrap();
        rule.config.window = Duration::from_millis(0);
        engine.add_rule(rule);

        let result = engine.check("/api/x", &anon_headers("10.0.0.1"));
        assert!(matches!(result, Err(EngineError::Evaluation(_))));
    }

    #[test]
    fn uncount_backs_out_one_request() {
        let (_, engine) = engine_with_clock(1_000_000);
        engine
            .add_rule_spec(spec("r", "/api", 1, Strategy::FixedWindow, 2))
            .unwrap();
        let headers = anon_headers("10.0.0.1");

        let outcome = engine.check("/api/x", &headers).unwrap().unwrap();
        engine.uncount(&outcome.key, outcome.strategy, outcome.decision.total);
        let metrics = engine.get_client_metrics(&outcome.key).unwrap();
        assert_eq!(metrics.requests, 0.0);
    }

    #[test]
    fn uncount_refunds_a_bucket_token_with_clamp() {
        let (_, engine) = engine_with_clock(1_000_000);
        engine
            .add_rule_spec(spec("r", "/api", 1, Strategy::TokenBucket, 3))
            .unwrap();
        let headers = anon_headers("10.0.0.1");

        let outcome = engine.check("/api/x", &headers).unwrap().unwrap();
        engine.uncount(&outcome.key, outcome.strategy, outcome.decision.total);
        // Refund past capacity must clamp.
        engine.uncount(&outcome.key, outcome.strategy, outcome.decision.total);
        assert_eq!(engine.get_client_metrics(&outcome.key).unwrap().bucket, Some(3.0));
    }

    #[test]
    fn reset_client_clears_state() {
        let (_, engine) = engine_with_clock(1_000_000);
        engine
            .add_rule_spec(spec("r", "/api", 1, Strategy::FixedWindow, 1))
            .unwrap();
        let headers = anon_headers("10.0.0.1");

        let outcome = engine.check("/api/x", &headers).unwrap().unwrap();
        assert!(!engine.check("/api/x", &headers).unwrap().unwrap().decision.allowed);

        assert!(engine.reset_client(&outcome.key));
        assert!(!engine.reset_client(&outcome.key));
        assert!(engine.check("/api/x", &headers).unwrap().unwrap().decision.allowed);
    }

    #[test]
    fn sweep_evicts_only_stale_clients_and_is_idempotent() {
        let (clock, engine) = engine_with_clock(1_000_000);
        engine
            .add_rule_spec(spec("r", "/api", 1, Strategy::FixedWindow, 10))
            .unwrap();

        engine.check("/api/x", &anon_headers("10.0.0.1")).unwrap();
        clock.advance(23 * 60 * 60 * 1_000);
        engine.check("/api/x", &anon_headers("10.0.0.2")).unwrap();
        clock.advance(2 * 60 * 60 * 1_000);

        // First client is now 25h idle, second only 2h.
        assert_eq!(engine.sweep(), (1, 0));
        assert_eq!(engine.sweep(), (0, 0));
        assert_eq!(engine.system_stats().total_clients, 1);
    }

    #[test]
    fn system_stats_reflect_state() {
        let (_, engine) = engine_with_clock(1_000_000);
        engine
            .add_rule_spec(spec("r", "/api", 1, Strategy::FixedWindow, 10))
            .unwrap();
        engine.check("/api/x", &anon_headers("10.0.0.1")).unwrap();

        let stats = engine.system_stats();
        assert_eq!(stats.total_clients, 1);
        assert_eq!(stats.total_rules, 1);
        assert_eq!(stats.queue_length, 0);
        assert!(stats.system_load >= 0.0 && stats.system_load <= 1.0);
    }

    #[test]
    fn adaptive_update_changes_effective_behavior() {
        let (_, engine) = engine_with_clock(1_000_000);
        let updated = engine.update_adaptive_settings(&AdaptiveSettingsUpdate {
            base_limit: Some(2),
            max_limit: Some(2),
            min_limit: Some(1),
            ..AdaptiveSettingsUpdate::default()
        });
        assert_eq!(updated.base_limit, 2);

        engine
            .add_rule_spec(spec("r", "/api", 1, Strategy::Adaptive, 60))
            .unwrap();
        let headers = anon_headers("10.0.0.1");
        assert!(engine.check("/api/x", &headers).unwrap().unwrap().decision.allowed);
        assert!(engine.check("/api/x", &headers).unwrap().unwrap().decision.allowed);
        assert!(!engine.check("/api/x", &headers).unwrap().unwrap().decision.allowed);
    }
}
