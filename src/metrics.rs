use crate::criterion::LoggingOutput;

type DerivedFn = Box<dyn Fn(&Meters) -> f64>;

/// Weighted running average.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    last: f64,
    sum: f64,
    count: f64,
    round: Option<i32>,
}

impl AverageMeter {
    #[must_use]
    pub const fn new(round: Option<i32>) -> Self {
        Self {
            last: 0.0,
            sum: 0.0,
            count: 0.0,
            round,
        }
    }

    pub fn update(&mut self, value: f64, weight: f64) {
        self.last = value;
        if weight > 0.0 {
            self.sum += value * weight;
            self.count += weight;
        }
    }

    #[must_use]
    pub fn avg(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            self.last
        }
    }

    #[must_use]
    pub fn smoothed_value(&self) -> f64 {
        let avg = self.avg();
        self.round.map_or(avg, |digits| safe_round(avg, digits))
    }
}

enum Meter {
    Average(AverageMeter),
    Derived(DerivedFn),
}

/// Named meters in insertion order.
#[derive(Default)]
pub struct Meters {
    entries: Vec<(String, Meter)>,
}

impl std::fmt::Debug for Meters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.smoothed_values()).finish()
    }
}

impl Meters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, key: &str) -> Option<&Meter> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, m)| m)
    }

    /// Add `value` to the weighted average meter `key`, creating it with the
    /// given rounding if needed.
    pub fn log_scalar(&mut self, key: &str, value: f64, weight: f64, round: i32) {
        let existing = self.entries.iter_mut().find(|(k, _)| k == key);
        match existing {
            Some((_, Meter::Average(meter))) => meter.update(value, weight),
            Some((_, Meter::Derived(_))) => {
                tracing::warn!("metric '{key}' is derived, ignoring scalar update");
            }
            None => {
                let mut meter = AverageMeter::new(Some(round));
                meter.update(value, weight);
                self.entries.push((key.to_string(), Meter::Average(meter)));
            }
        }
    }

    /// Register a metric computed from the other meters when read. An
    /// existing meter with the same name is kept.
    pub fn log_derived(&mut self, key: &str, f: impl Fn(&Self) -> f64 + 'static) {
        if self.find(key).is_none() {
            self.entries.push((key.to_string(), Meter::Derived(Box::new(f))));
        }
    }

    /// Unrounded average of a scalar meter.
    #[must_use]
    pub fn avg(&self, key: &str) -> Option<f64> {
        match self.find(key)? {
            Meter::Average(meter) => Some(meter.avg()),
            Meter::Derived(f) => Some(f(self)),
        }
    }

    #[must_use]
    pub fn get_smoothed_value(&self, key: &str) -> Option<f64> {
        match self.find(key)? {
            Meter::Average(meter) => Some(meter.smoothed_value()),
            Meter::Derived(f) => Some(f(self)),
        }
    }

    #[must_use]
    pub fn smoothed_values(&self) -> Vec<(String, f64)> {
        self.entries
            .iter()
            .map(|(key, meter)| {
                let value = match meter {
                    Meter::Average(meter) => meter.smoothed_value(),
                    Meter::Derived(f) => f(self),
                };
                (key.clone(), value)
            })
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

/// Round to `digits` decimal places, passing non-finite values through.
#[must_use]
pub fn safe_round(number: f64, digits: i32) -> f64 {
    if !number.is_finite() {
        return number;
    }
    let scale = 10f64.powi(digits);
    (number * scale).round() / scale
}

/// Perplexity of a base-2 loss, rounded to two places. Overflows to infinity.
#[must_use]
pub fn perplexity(loss: f64) -> f64 {
    safe_round(2f64.powf(loss), 2)
}

/// Area under the ROC curve of `scores` for `positive` targets, using the
/// rank-sum formulation with average ranks for ties.
///
/// Returns `None` when the inputs differ in length or only one class is
/// present.
#[must_use]
pub fn roc_auc(scores: &[f32], targets: &[usize], positive: usize) -> Option<f64> {
    if scores.len() != targets.len() || scores.iter().any(|s| s.is_nan()) {
        return None;
    }

    let n_pos = targets.iter().filter(|&&t| t == positive).count();
    let n_neg = targets.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut pos_rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // Ranks are 1-based; tied scores share the mean rank.
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if targets[idx] == positive {
                pos_rank_sum += rank;
            }
        }
        i = j + 1;
    }

    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Some(n_pos.mul_add(-(n_pos + 1.0) / 2.0, pos_rank_sum) / (n_pos * n_neg))
}

/// Pool logging outputs from every worker ahead of metric reduction.
///
/// Summable outputs collapse into a single record; otherwise each worker's
/// records are kept individually.
#[must_use]
pub fn gather_logging_outputs(
    per_worker: Vec<Vec<LoggingOutput>>,
    can_be_summed: bool,
) -> Vec<LoggingOutput> {
    if can_be_summed {
        vec![LoggingOutput::summed(per_worker.iter().flatten())]
    } else {
        per_worker.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_meter_is_weighted() {
        let mut meter = AverageMeter::new(Some(3));
        meter.update(1.0, 1.0);
        meter.update(4.0, 3.0);
        assert!((meter.avg() - 13.0 / 4.0).abs() < 1e-12);
        assert!((meter.smoothed_value() - 3.25).abs() < 1e-12);
    }

    #[test]
    fn zero_weight_keeps_last_value() {
        let mut meter = AverageMeter::new(None);
        meter.update(2.5, 0.0);
        assert!((meter.avg() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn meters_accumulate_across_calls() {
        let mut meters = Meters::new();
        meters.log_scalar("accuracy", 50.0, 2.0, 3);
        meters.log_scalar("accuracy", 100.0, 2.0, 3);
        assert_eq!(meters.get_smoothed_value("accuracy"), Some(75.0));
    }

    #[test]
    fn derived_reads_other_meters() {
        let mut meters = Meters::new();
        meters.log_scalar("loss", 3.0, 1.0, 3);
        meters.log_derived("ppl", |m| m.avg("loss").map_or(0.0, perplexity));
        meters.log_derived("ppl", |_| -1.0);
        assert_eq!(meters.get_smoothed_value("ppl"), Some(8.0));

        let keys: Vec<String> = meters.smoothed_values().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["loss".to_string(), "ppl".to_string()]);
    }

    #[test]
    fn safe_round_rounds_and_passes_infinity() {
        assert!((safe_round(1.23456, 3) - 1.235).abs() < 1e-12);
        assert!(safe_round(f64::INFINITY, 2).is_infinite());
    }

    #[test]
    fn perplexity_overflows_to_infinity() {
        assert!((perplexity(1.0) - 2.0).abs() < f64::EPSILON);
        assert!(perplexity(5000.0).is_infinite());
    }

    #[test]
    fn roc_auc_perfect_and_inverted() {
        let targets = [0, 0, 1, 1];
        let perfect = roc_auc(&[0.1, 0.2, 0.8, 0.9], &targets, 1);
        assert_eq!(perfect, Some(1.0));
        let inverted = roc_auc(&[0.9, 0.8, 0.2, 0.1], &targets, 1);
        assert_eq!(inverted, Some(0.0));
    }

    #[test]
    fn roc_auc_counts_ties_as_half() {
        let auc = roc_auc(&[0.5, 0.5], &[0, 1], 1);
        assert_eq!(auc, Some(0.5));
    }

    #[test]
    fn roc_auc_needs_both_classes() {
        assert!(roc_auc(&[0.1, 0.9], &[1, 1], 1).is_none());
        assert!(roc_auc(&[0.1], &[1, 0], 1).is_none());
    }

    #[test]
    fn gather_keeps_records_when_not_summable() {
        let log = |n: usize| LoggingOutput {
            nsentences: n,
            predicts: vec![0.5; n],
            ..LoggingOutput::default()
        };
        let gathered = gather_logging_outputs(vec![vec![log(1), log(2)], vec![log(3)]], false);
        assert_eq!(gathered.len(), 3);
        assert_eq!(gathered[2].predicts.len(), 3);

        let summed = gather_logging_outputs(vec![vec![log(1), log(2)], vec![log(3)]], true);
        assert_eq!(summed.len(), 1);
        assert_eq!(summed[0].nsentences, 6);
        assert!(summed[0].predicts.is_empty());
    }
}
