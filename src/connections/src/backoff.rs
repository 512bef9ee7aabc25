//! Reconnect delay computation. Pure so the bounds are testable; the caller
//! supplies the random sample (js_sys::Math::random in the worker).

use crate::types::BackoffConfig;

/// Delay before reconnect attempt number `attempts` (0-based), jittered by
/// `rand` in [0, 1).
pub fn reconnect_delay_ms(cfg: &BackoffConfig, attempts: u32, rand: f64) -> f64 {
    let raw = (cfg.base_ms * cfg.multiplier.powi(attempts as i32)).min(cfg.max_ms);
    raw * (1.0 + (rand - 0.5) * 2.0 * cfg.jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_until_the_cap() {
        let cfg = BackoffConfig::default();
        let d0 = reconnect_delay_ms(&cfg, 0, 0.5);
        let d1 = reconnect_delay_ms(&cfg, 1, 0.5);
        let d2 = reconnect_delay_ms(&cfg, 2, 0.5);
        assert_eq!(d0, 300.0);
        assert!(d1 > d0 && d2 > d1);

        // Far past the cap the raw delay saturates.
        let capped = reconnect_delay_ms(&cfg, 30, 0.5);
        assert_eq!(capped, 10_000.0);
    }

    #[test]
    fn jitter_stays_within_the_band() {
        let cfg = BackoffConfig::default();
        for attempts in 0..6 {
            let raw = reconnect_delay_ms(&cfg, attempts, 0.5);
            let low = reconnect_delay_ms(&cfg, attempts, 0.0);
            let high = reconnect_delay_ms(&cfg, attempts, 1.0);
            assert!((low - raw * 0.9).abs() < 1e-9);
            assert!((high - raw * 1.1).abs() < 1e-9);
        }
    }
}
