//! Calibration, category banding, and days-to-readmission prediction.

use crate::report::SurvivalCurve;
use crate::rules::RiskCategory;
use std::collections::BTreeMap;

pub const SURVIVAL_HORIZONS: [u32; 4] = [7, 14, 21, 30];

/// Composite score → probability via the logistic calibration.
pub fn logistic(alpha: f64, beta: f64, score: i64) -> f64 {
    let z = alpha + beta * score as f64;
    1.0 / (1.0 + (-z).exp())
}

/// First band whose `[score_min, score_max]` contains the score;
/// defaults to Critical.
pub fn classify_risk(categories: &[RiskCategory], score: i64) -> (String, String) {
    for cat in categories {
        if cat.score_min <= score && score <= cat.score_max {
            return (cat.name.clone(), cat.color.clone());
        }
    }
    ("Critical".to_string(), "red".to_string())
}

/// Exponential-decay point estimate, floored at one day.
pub fn predict_days(d_max: f64, gamma: f64, score: i64) -> f64 {
    (d_max * (-gamma * score as f64).exp()).max(1.0)
}

pub fn predict_bucket(estimated_days: f64) -> &'static str {
    if estimated_days <= 7.0 {
        "0-7 days"
    } else if estimated_days <= 14.0 {
        "8-14 days"
    } else {
        "15-30 days"
    }
}

/// Scaled survival curve: the 30-day probability is distributed over the
/// horizons with rate `k = max(0.5, k_base + 0.02·(score − 30))`, normalized
/// by `1 − exp(−k)` and clamped to `[0, 1]`.
pub fn predict_survival(k_base: f64, score: i64, p_30d: f64) -> SurvivalCurve {
    let k = (k_base + 0.02 * (score as f64 - 30.0)).max(0.5);

    let mut denom = 1.0 - (-k).exp();
    if denom.abs() < 1e-9 {
        denom = 1e-9;
    }

    let mut horizons: BTreeMap<u32, f64> = BTreeMap::new();
    for t in SURVIVAL_HORIZONS {
        let f_t = (1.0 - (-(t as f64 / 30.0) * k).exp()) / denom;
        let p_t = (p_30d * f_t).clamp(0.0, 1.0);
        horizons.insert(t, (p_t * 10_000.0).round() / 10_000.0);
    }
    SurvivalCurve { horizons }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_logistic_banding_example() {
        // score 35 with the calibrated (alpha, beta) lands near 0.145.
        let p = logistic(-2.3475, 0.017, 35);
        assert!((p - 0.145).abs() < 0.005, "p = {p}");
    }

    #[test]
    fn test_classify_default_critical() {
        let cats = vec![RiskCategory {
            name: "Low".into(),
            color: "green".into(),
            score_min: 0,
            score_max: 19,
        }];
        assert_eq!(classify_risk(&cats, 10).0, "Low");
        assert_eq!(classify_risk(&cats, 99).0, "Critical");
    }

    #[test]
    fn test_days_estimate_example() {
        // D_max=30, gamma=0.03, score 50 -> ~6.7 days, bucket 0-7.
        let days = predict_days(30.0, 0.03, 50);
        assert!((days - 6.69).abs() < 0.05, "days = {days}");
        assert_eq!(predict_bucket(days), "0-7 days");
    }

    #[test]
    fn test_days_floor() {
        assert_eq!(predict_days(30.0, 0.03, 100_000), 1.0);
    }

    #[test]
    fn test_survival_reaches_p30_at_horizon() {
        let curve = predict_survival(1.0, 35, 0.145);
        assert!((curve.horizons[&30] - 0.145).abs() < 1e-6);
    }

    proptest! {
        // Probability stays in [0, 1] for any score.
        #[test]
        fn prop_probability_in_range(score in -1000i64..1000) {
            let p = logistic(-2.3475, 0.017, score);
            prop_assert!((0.0..=1.0).contains(&p));
        }

        // The survival curve is non-decreasing in t and bounded by [0, 1].
        #[test]
        fn prop_survival_monotone(score in 0i64..200, p30 in 0.0f64..1.0) {
            let curve = predict_survival(1.0, score, p30);
            let mut prev = 0.0;
            for t in SURVIVAL_HORIZONS {
                let p = curve.horizons[&t];
                prop_assert!((0.0..=1.0).contains(&p));
                prop_assert!(p + 1e-9 >= prev);
                prev = p;
            }
        }

        // Higher scores never decrease the logistic probability.
        #[test]
        fn prop_logistic_monotone(score in -500i64..500) {
            let p1 = logistic(-2.3475, 0.017, score);
            let p2 = logistic(-2.3475, 0.017, score + 1);
            prop_assert!(p2 >= p1);
        }
    }
}
