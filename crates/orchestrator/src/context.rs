//! The scheduler's annealing context.

use loom_types::config::OrchestratorConfig;

/// Lower clamp for the smoothed market health.
const MARKET_HEALTH_FLOOR: f64 = 0.3;
/// Upper clamp for the smoothed market health.
const MARKET_HEALTH_CEIL: f64 = 1.0;
/// Smoothing factor toward the observed success rate.
const HEALTH_SMOOTHING: f64 = 0.2;

/// Per-tick context factors fed into choice weighting.
#[derive(Clone, Copy, Debug)]
pub struct SimContext {
    /// Softmax temperature, annealed multiplicatively each generation.
    pub temperature: f64,
    /// Smoothed submission success rate, clamped to `[0.3, 1.0]`.
    pub market_health: f64,
    /// Current generation number.
    pub generation: u64,
}

impl SimContext {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            temperature: config.initial_temperature,
            market_health: MARKET_HEALTH_CEIL,
            generation: 0,
        }
    }

    /// Advances to the next generation: decays temperature toward the floor
    /// and smooths market health toward the observed success rate, plus a
    /// small perturbation, clamped to `[0.3, 1.0]`.
    pub fn advance(
        &mut self,
        config: &OrchestratorConfig,
        observed_success_rate: f64,
        perturbation: f64,
    ) {
        self.generation += 1;
        self.temperature =
            (self.temperature * config.temperature_decay).max(config.min_temperature);
        let target = observed_success_rate.clamp(0.0, 1.0);
        self.market_health = ((1.0 - HEALTH_SMOOTHING) * self.market_health
            + HEALTH_SMOOTHING * target
            + perturbation)
            .clamp(MARKET_HEALTH_FLOOR, MARKET_HEALTH_CEIL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_decays_to_the_floor() {
        let config = OrchestratorConfig {
            initial_temperature: 1.0,
            temperature_decay: 0.5,
            min_temperature: 0.3,
            ..Default::default()
        };
        let mut ctx = SimContext::new(&config);
        for _ in 0..10 {
            ctx.advance(&config, 1.0, 0.0);
        }
        assert_eq!(ctx.temperature, 0.3);
    }

    #[test]
    fn market_health_stays_clamped() {
        let config = OrchestratorConfig::default();
        let mut ctx = SimContext::new(&config);
        for _ in 0..50 {
            ctx.advance(&config, 0.0, -0.05);
        }
        assert_eq!(ctx.market_health, 0.3);
        for _ in 0..50 {
            ctx.advance(&config, 1.0, 0.05);
        }
        assert_eq!(ctx.market_health, 1.0);
    }
}
