//! Adaptive void threshold

use eisv_core::config::VoidConfig;
use eisv_core::StateHistory;
use std::collections::VecDeque;

/// `mean(|V|) + σ·stdev(|V|)` over the last `window` samples, clamped to the
/// band. Until `min_samples` exist the threshold is the band maximum.
pub fn adaptive_threshold(v_history: &VecDeque<f64>, cfg: &VoidConfig) -> f64 {
    let samples: Vec<f64> = StateHistory::tail(v_history, cfg.window).map(f64::abs).collect();
    if samples.len() < cfg.min_samples.max(1) {
        return cfg.band_max;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean + cfg.sigma * variance.sqrt()).clamp(cfg.band_min, cfg.band_max)
}

pub fn is_void(v: f64, threshold: f64) -> bool {
    v.abs() > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_few_samples_uses_band_max() {
        let cfg = VoidConfig::default();
        let history: VecDeque<f64> = vec![0.01; 9].into();
        assert_eq!(adaptive_threshold(&history, &cfg), 0.30);
    }

    #[test]
    fn quiet_history_clamps_to_band_min() {
        let cfg = VoidConfig::default();
        let history: VecDeque<f64> = vec![0.01; 50].into();
        assert_eq!(adaptive_threshold(&history, &cfg), 0.10);
    }

    #[test]
    fn spread_history_lands_inside_band() {
        let cfg = VoidConfig::default();
        // |V| alternates 0.05 / 0.15: mean 0.1, stdev 0.05
        let history: VecDeque<f64> = (0..40).map(|i| if i % 2 == 0 { 0.05 } else { -0.15 }).collect();
        assert!((adaptive_threshold(&history, &cfg) - 0.20).abs() < 1e-9);
    }

    #[test]
    fn only_the_window_counts() {
        let cfg = VoidConfig::default();
        let mut history: VecDeque<f64> = vec![5.0; 50].into();
        history.extend(vec![0.0; 100]);
        assert_eq!(adaptive_threshold(&history, &cfg), 0.10);
    }
}
