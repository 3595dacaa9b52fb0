//! Adaptive strategy.
//!
//! Computes a live system-load signal from cross-client state and a per
//! client effective limit from reputation, then delegates the admit/deny
//! decision to the sliding-window evaluator with that limit substituted.
//! Under load the limit shrinks toward `min_limit`; when the system is calm
//! well-behaved clients earn room up to `max_limit`.

use serde::{Deserialize, Serialize};

use super::{sliding_window, Decision, EvalContext, LoadSignal};
use crate::metrics::ClientMetrics;

/// Normalizer for the load signal: active clients times aggregate in-window
/// volume, so either many clients or a few very busy ones push load up.
const LOAD_NORMALIZER: f64 = 10_000.0;

/// Horizon over which clients count as "active" for the load signal.
pub const LOAD_HORIZON_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveSettings {
    pub base_limit: u32,
    pub max_limit: u32,
    pub min_limit: u32,
    pub scale_factor: f64,
    pub learning_rate: f64,
    pub system_load_threshold: f64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            base_limit: 60,
            max_limit: 120,
            min_limit: 10,
            scale_factor: 2.0,
            learning_rate: 0.5,
            system_load_threshold: 0.8,
        }
    }
}

/// Partial update applied through the admin surface; absent fields keep
/// their current values.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AdaptiveSettingsUpdate {
    pub base_limit: Option<u32>,
    pub max_limit: Option<u32>,
    pub min_limit: Option<u32>,
    pub scale_factor: Option<f64>,
    pub learning_rate: Option<f64>,
    pub system_load_threshold: Option<f64>,
}

impl AdaptiveSettings {
    pub fn apply(&mut self, update: &AdaptiveSettingsUpdate) {
        if let Some(v) = update.base_limit {
            self.base_limit = v;
        }
        if let Some(v) = update.max_limit {
            self.max_limit = v;
        }
        if let Some(v) = update.min_limit {
            self.min_limit = v;
        }
        if let Some(v) = update.scale_factor {
            self.scale_factor = v;
        }
        if let Some(v) = update.learning_rate {
            self.learning_rate = v;
        }
        if let Some(v) = update.system_load_threshold {
            self.system_load_threshold = v;
        }
    }
}

/// Bounded [0, 1] load signal.
pub fn system_load(load: LoadSignal) -> f64 {
    ((load.active_clients as f64 * load.recent_volume) / LOAD_NORMALIZER).clamp(0.0, 1.0)
}

/// Effective per-client limit. Monotonic by construction: never increases
/// with load at fixed reputation, never decreases with reputation at fixed
/// load.
pub fn effective_limit(settings: &AdaptiveSettings, reputation: f64, load: f64) -> u32 {
    let base = settings.base_limit as f64;
    let raw = if load > settings.system_load_threshold {
        base * (1.0 - (load - settings.system_load_threshold) * settings.scale_factor)
    } else {
        base * (1.0 + reputation / 100.0 * settings.learning_rate)
    };
    (raw.round() as i64).clamp(settings.min_limit as i64, settings.max_limit as i64) as u32
}

pub fn evaluate(
    metrics: &mut ClientMetrics,
    ctx: &EvalContext,
    settings: &AdaptiveSettings,
    load: LoadSignal,
) -> Decision {
    let limit = effective_limit(settings, metrics.reputation, system_load(load));
    sliding_window::evaluate_with_limit(metrics, ctx, limit)
}

#[cfg(test)]
mod tests {
    use super::super::test_ctx;
    use super::*;

    #[test]
    fn limit_never_increases_with_load() {
        let settings = AdaptiveSettings::default();
        let mut previous = u32::MAX;
        for step in 0..=20 {
            let load = step as f64 / 20.0;
            let limit = effective_limit(&settings, 50.0, load);
            assert!(
                limit <= previous,
                "limit rose from {previous} to {limit} at load {load}"
            );
            previous = limit;
        }
    }

    #[test]
    fn limit_never_decreases_with_reputation() {
        let settings = AdaptiveSettings::default();
        for &load in &[0.0, 0.5, 0.79, 0.95] {
            let mut previous = 0;
            for rep in (0..=100).step_by(10) {
                let limit = effective_limit(&settings, rep as f64, load);
                assert!(
                    limit >= previous,
                    "limit fell from {previous} to {limit} at reputation {rep}, load {load}"
                );
                previous = limit;
            }
        }
    }

    #[test]
    fn limit_stays_within_configured_bounds() {
        let settings = AdaptiveSettings::default();
        assert_eq!(effective_limit(&settings, 100.0, 0.0), 90);
        assert!(effective_limit(&settings, 0.0, 1.0) >= settings.min_limit);
        assert!(effective_limit(&settings, 100.0, 0.0) <= settings.max_limit);
        // Full overload shrinks proportionally: 60 × (1 − 0.2 × 2.0).
        assert_eq!(effective_limit(&settings, 100.0, 1.0), 36);

        // A steeper scale factor drives the raw value below the floor and
        // clamps there.
        let steep = AdaptiveSettings {
            scale_factor: 5.0,
            ..AdaptiveSettings::default()
        };
        assert_eq!(effective_limit(&steep, 100.0, 1.0), steep.min_limit);
    }

    #[test]
    fn load_signal_is_clamped() {
        assert_eq!(system_load(LoadSignal::default()), 0.0);
        let heavy = LoadSignal {
            active_clients: 1_000,
            recent_volume: 1_000_000.0,
        };
        assert_eq!(system_load(heavy), 1.0);
    }

    #[test]
    fn good_reputation_earns_a_higher_personal_limit() {
        let settings = AdaptiveSettings::default();
        let ctx = test_ctx(60_000, settings.base_limit, 1_000_000);
        let calm = LoadSignal::default();

        let mut trusted = ClientMetrics {
            reputation: 100.0,
            ..ClientMetrics::default()
        };
        let mut suspect = ClientMetrics {
            reputation: 0.0,
            ..ClientMetrics::default()
        };

        let d_trusted = evaluate(&mut trusted, &ctx, &settings, calm);
        let d_suspect = evaluate(&mut suspect, &ctx, &settings, calm);
        assert!(d_trusted.total > d_suspect.total);
        assert_eq!(d_suspect.total, settings.base_limit);
    }

    #[test]
    fn settings_update_is_partial() {
        let mut settings = AdaptiveSettings::default();
        settings.apply(&AdaptiveSettingsUpdate {
            base_limit: Some(100),
            ..AdaptiveSettingsUpdate::default()
        });
        assert_eq!(settings.base_limit, 100);
        assert_eq!(settings.max_limit, 120);
        assert_eq!(settings.system_load_threshold, 0.8);
    }
}
