use std::time::Duration;

use rand::Rng;

use common::{Campaign, HourlyStat};

/// Process-wide pacing knobs. Per-campaign bounds and flags come from
/// the campaign row; these are the parts the operator rarely touches.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Messages sent before the warm-start ramp stops applying.
    pub warm_start_count: i64,
    pub warm_start_multiplier: f64,
    /// Uniform range for simulated typing, seconds.
    pub typing_min: u64,
    pub typing_max: u64,
    /// Hard cap on any computed delay, to avoid effective starvation.
    pub max_delay: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            warm_start_count: 10,
            warm_start_multiplier: 2.5,
            typing_min: 2,
            typing_max: 8,
            max_delay: Duration::from_secs(600),
        }
    }
}

/// Hour-of-day factor from the tenant's heatmap. An empty bucket means
/// "no signal": exactly 1.0, never an invented optimum.
pub fn hour_factor(stat: Option<&HourlyStat>) -> f64 {
    let Some(stat) = stat else { return 1.0 };
    if stat.sent == 0 {
        return 1.0;
    }
    let ratio = stat.flood_waits as f64 / stat.sent as f64;
    if ratio > 0.10 {
        2.0
    } else if ratio > 0.05 {
        1.5
    } else if ratio < 0.01 {
        0.8
    } else {
        1.0
    }
}

/// Inter-send delay for the campaign's next message: a uniform draw
/// from the configured bounds, scaled by warm-start, the adaptive
/// multiplier, and the hour factor, capped at `cfg.max_delay`.
pub fn next_delay(
    campaign: &Campaign,
    hour: Option<&HourlyStat>,
    cfg: &PacingConfig,
    rng: &mut impl Rng,
) -> Duration {
    let (lo, hi) = ordered_bounds(campaign.delay_min, campaign.delay_max);
    let base = rng.gen_range(lo..=hi) as f64;

    let mut factor = 1.0;
    if campaign.warm_start && campaign.sent_count < cfg.warm_start_count {
        factor *= cfg.warm_start_multiplier;
    }
    if campaign.adaptive_delays {
        factor *= campaign.adaptive_multiplier;
    }
    factor *= hour_factor(hour);

    let secs = (base * factor).max(0.0);
    Duration::from_secs_f64(secs).min(cfg.max_delay)
}

/// Simulated typing time; independent of the inter-send delay.
pub fn typing_delay(cfg: &PacingConfig, rng: &mut impl Rng) -> Duration {
    let (lo, hi) = ordered_bounds(cfg.typing_min as i64, cfg.typing_max as i64);
    Duration::from_secs(rng.gen_range(lo..=hi) as u64)
}

const MULTIPLIER_MIN: f64 = 1.0;
const MULTIPLIER_MAX: f64 = 5.0;

/// Single source of truth for every adaptive-multiplier adjustment.
pub fn bump_on_flood(multiplier: f64) -> f64 {
    (multiplier + 0.5).clamp(MULTIPLIER_MIN, MULTIPLIER_MAX)
}

pub fn bump_on_peer_flood(multiplier: f64) -> f64 {
    (multiplier + 0.2).clamp(MULTIPLIER_MIN, MULTIPLIER_MAX)
}

pub fn decay_on_success(multiplier: f64) -> f64 {
    (multiplier - 0.1).clamp(MULTIPLIER_MIN, MULTIPLIER_MAX)
}

fn ordered_bounds(a: i64, b: i64) -> (i64, i64) {
    let lo = a.max(0);
    let hi = b.max(0);
    if lo <= hi {
        (lo, hi)
    } else {
        (hi, lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::CampaignStatus;
    use rand::rngs::mock::StepRng;

    fn campaign(delay_min: i64, delay_max: i64, sent: i64) -> Campaign {
        Campaign {
            id: 1,
            tenant: 1,
            source_id: 1,
            template_id: 1,
            account_ids: vec![],
            folder: None,
            status: CampaignStatus::Running,
            sent_count: sent,
            failed_count: 0,
            total_count: 100,
            current_account: None,
            next_account_index: 0,
            warm_start: true,
            typing_sim: false,
            adaptive_delays: true,
            smart_personalization: false,
            delay_min,
            delay_max,
            adaptive_multiplier: 1.0,
            scheduled_at: None,
            pause_reason: None,
            created_at: Utc::now(),
        }
    }

    fn stat(sent: i64, flood_waits: i64) -> HourlyStat {
        HourlyStat {
            tenant: 1,
            day_of_week: 0,
            hour: 12,
            sent,
            success: sent,
            failed: 0,
            flood_waits,
        }
    }

    #[test]
    fn fixed_bounds_give_exactly_the_composed_value() {
        let cfg = PacingConfig::default();
        let mut rng = StepRng::new(0, 0);
        // Past warm start, multiplier 1.0, no heatmap: exactly 40s.
        let c = campaign(40, 40, 50);
        assert_eq!(next_delay(&c, None, &cfg, &mut rng), Duration::from_secs(40));
    }

    #[test]
    fn warm_start_applies_strictly_below_the_count() {
        let cfg = PacingConfig::default();
        let mut rng = StepRng::new(0, 0);

        let warming = campaign(40, 40, 9);
        assert_eq!(
            next_delay(&warming, None, &cfg, &mut rng),
            Duration::from_secs(100) // 40 × 2.5
        );

        // Ceases to apply at exactly sent_count == warm_start_count.
        let done = campaign(40, 40, 10);
        assert_eq!(next_delay(&done, None, &cfg, &mut rng), Duration::from_secs(40));
    }

    #[test]
    fn adaptive_multiplier_scales_delay() {
        let cfg = PacingConfig::default();
        let mut rng = StepRng::new(0, 0);
        let mut c = campaign(40, 40, 50);
        c.adaptive_multiplier = 2.0;
        assert_eq!(next_delay(&c, None, &cfg, &mut rng), Duration::from_secs(80));

        c.adaptive_delays = false;
        assert_eq!(next_delay(&c, None, &cfg, &mut rng), Duration::from_secs(40));
    }

    #[test]
    fn hour_factor_thresholds() {
        assert_eq!(hour_factor(None), 1.0);
        assert_eq!(hour_factor(Some(&stat(0, 0))), 1.0);
        assert_eq!(hour_factor(Some(&stat(100, 11))), 2.0);
        assert_eq!(hour_factor(Some(&stat(100, 6))), 1.5);
        assert_eq!(hour_factor(Some(&stat(100, 3))), 1.0);
        assert_eq!(hour_factor(Some(&stat(1000, 5))), 0.8);
    }

    #[test]
    fn delay_is_capped_at_ten_minutes() {
        let cfg = PacingConfig::default();
        let mut rng = StepRng::new(0, 0);
        let mut c = campaign(500, 500, 0);
        c.adaptive_multiplier = 5.0;
        assert_eq!(next_delay(&c, None, &cfg, &mut rng), cfg.max_delay);
    }

    #[test]
    fn multiplier_adjustments_stay_clamped() {
        assert_eq!(bump_on_flood(1.0), 1.5);
        assert_eq!(bump_on_flood(4.8), 5.0);
        assert_eq!(bump_on_peer_flood(1.0), 1.2);
        assert_eq!(decay_on_success(1.05), 1.0);
        assert_eq!(decay_on_success(1.0), 1.0);
        assert_eq!(decay_on_success(3.0), 2.9);
    }

    #[test]
    fn inverted_bounds_are_tolerated() {
        let cfg = PacingConfig::default();
        let mut rng = StepRng::new(0, 0);
        let c = campaign(90, 30, 50);
        let d = next_delay(&c, None, &cfg, &mut rng);
        assert!(d >= Duration::from_secs(30) && d <= Duration::from_secs(90));
    }
}
