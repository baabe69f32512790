//! Rolling Shannon entropy / chi-square / mean / Monte-Carlo pi /
//! autocorrelation / min-entropy analysis, templated on sample width.
//!
//! One [`EntAnalyzer`] instance is built per width via [`EntAnalyzer::new8`]
//! / [`EntAnalyzer::new16`]; the accumulation and normalization logic is
//! shared, the width only changes the bin count, the short-window length,
//! and whether the pi estimator runs.

use bitbabbler_rpc::Value;

/// Bin/accumulator counts are halved once any of them crosses this bound,
/// standing in for "half the unsigned-word range" in the original.
const NORMALIZE_THRESHOLD: u64 = (u32::MAX as u64) / 2;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EntResult {
    pub entropy: f64,
    pub chi_sq: f64,
    pub mean: f64,
    pub pi_estimate: Option<f64>,
    pub autocorrelation: f64,
    pub min_entropy: f64,
}

impl EntResult {
    pub fn to_value(self) -> Value {
        let mut entries: Vec<(&str, Value)> = vec![
            ("Entropy", Value::from(self.entropy)),
            ("ChiSquare", Value::from(self.chi_sq)),
            ("Mean", Value::from(self.mean)),
            ("Autocorrelation", Value::from(self.autocorrelation)),
            ("MinEntropy", Value::from(self.min_entropy)),
        ];
        if let Some(pi) = self.pi_estimate {
            entries.push(("Pi", Value::from(pi)));
        }
        Value::object_from(entries)
    }
}

#[derive(Clone)]
struct Accumulators {
    bins: Vec<u64>,
    samples: u64,
    c0: f64,
    c1: f64,
    c2: f64,
    c3: f64,
    last: f64,
    has_first: bool,
    pi_in_radius: u64,
    pi_samples: u64,
}

impl Accumulators {
    fn new(num_bins: usize) -> Self {
        Self {
            bins: vec![0u64; num_bins],
            samples: 0,
            c0: 0.0,
            c1: 0.0,
            c2: 0.0,
            c3: 0.0,
            last: 0.0,
            has_first: false,
            pi_in_radius: 0,
            pi_samples: 0,
        }
    }

    fn record_sample(&mut self, sample: u32) {
        self.bins[sample as usize] += 1;
        self.samples += 1;

        let s = sample as f64;
        if !self.has_first {
            self.c0 = s;
            self.has_first = true;
        } else {
            self.c1 += self.last * s;
            self.c2 += s;
            self.c3 += s * s;
        }
        self.last = s;
    }

    fn record_pi_pair(&mut self, x: u32, y: u32) {
        const COORD_MAX: u64 = (1u64 << 24) - 1;
        let (x, y) = (x as u64, y as u64);
        if x * x + y * y <= COORD_MAX * COORD_MAX {
            self.pi_in_radius += 1;
        }
        self.pi_samples += 1;
    }

    fn needs_normalization(&self) -> bool {
        self.samples > NORMALIZE_THRESHOLD
            || self.bins.iter().any(|&b| b > NORMALIZE_THRESHOLD)
            || self.pi_samples > NORMALIZE_THRESHOLD
    }

    /// Halve the sample total, but redistribute bins around the new
    /// expected count rather than just halving each one: a raw halve of
    /// every bin (and of `samples`) also halves `chi_sq`, since scaling
    /// every deviation `(c_i - E)` by `s` while scaling `E` by `s` too
    /// scales `chi_sq` by `s`, not by `s^2` as it should be to cancel the
    /// `/E` term. Instead each bin is moved to `E' + k*(c_i - E)`, with
    /// `k = sqrt(E'/E)`, which keeps chi_sq invariant under the halving
    /// (deviations shrink by `k`, `/E` shrinks by `1/k^2`, net `k^2/k^2`
    /// = 1) to within bin-count rounding.
    fn normalize(&mut self) {
        let old_samples = self.samples as f64;
        let new_samples = self.samples / 2;
        let n = self.bins.len() as f64;

        if old_samples > 0.0 {
            let old_expected = old_samples / n;
            let new_expected = new_samples as f64 / n;
            let k = (new_expected / old_expected).sqrt();
            for b in self.bins.iter_mut() {
                let shifted = new_expected + (*b as f64 - old_expected) * k;
                *b = shifted.round().max(0.0) as u64;
            }
        }
        self.samples = new_samples;

        self.c1 /= 2.0;
        self.c2 /= 2.0;
        self.c3 /= 2.0;
        self.pi_in_radius /= 2;
        self.pi_samples /= 2;
    }

    fn compute_result(&self, want_pi: bool) -> EntResult {
        let w = self.samples as f64;
        let n = self.bins.len() as f64;

        let entropy = self
            .bins
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = c as f64 / w;
                -p * p.log2()
            })
            .sum();

        let expected = w / n;
        let chi_sq = self.bins.iter().map(|&c| (c as f64 - expected).powi(2) / expected).sum();

        let mean = self.bins.iter().enumerate().map(|(i, &c)| c as f64 * i as f64).sum::<f64>() / w;

        let pi_estimate = if want_pi && self.pi_samples > 0 {
            Some(4.0 * self.pi_in_radius as f64 / self.pi_samples as f64)
        } else {
            None
        };

        let denom = w * self.c3 - self.c2 * self.c2;
        let r1 = (w * (self.c1 + self.last * self.c0) - self.c2 * self.c2) / denom;
        let autocorrelation = if r1.is_finite() { r1 } else { 1.0 };

        let c_max = *self.bins.iter().max().unwrap_or(&0) as f64;
        let p_max = c_max / w;
        let min_entropy = -((c_max + 2.3 * (w * p_max * (1.0 - p_max)).sqrt()) / w).log2();

        EntResult { entropy, chi_sq, mean, pi_estimate, autocorrelation, min_entropy }
    }
}

#[derive(Clone, Copy, Default)]
pub struct WatermarkSet {
    pub current: EntResult,
    pub min: Option<EntResult>,
    pub max: Option<EntResult>,
    pub failed: u64,
}

impl WatermarkSet {
    /// `bound` returns the failure-bound-relative deviation for a sample;
    /// smaller is worse (closer to failing). Used to decide which of
    /// `min`/`max` a new result replaces.
    fn observe(&mut self, result: EntResult, passed: bool, worse_is_smaller: impl Fn(EntResult) -> f64) {
        self.current = result;
        if !passed {
            self.failed += 1;
        }
        let score = worse_is_smaller(result);
        match &mut self.min {
            Some(existing) if worse_is_smaller(*existing) <= score => {}
            _ => self.min = Some(result),
        }
        match &mut self.max {
            Some(existing) if worse_is_smaller(*existing) >= score => {}
            _ => self.max = Some(result),
        }
    }

    pub fn to_value(self) -> Value {
        Value::object_from([
            ("Current", self.current.to_value()),
            ("Min", self.min.unwrap_or_default().to_value()),
            ("Max", self.max.unwrap_or_default().to_value()),
            ("Failed", Value::from(self.failed)),
        ])
    }
}

pub struct Limits {
    pub min_entropy_bits: f64,
    pub chi_sq_range: (f64, f64),
    /// `(ideal mean, tolerance)`; `None` when this width has no mean check.
    pub mean: Option<(f64, f64)>,
    pub pi_error: f64,
    pub autocorrelation: f64,
    pub min_entropy_floor: f64,
}

pub struct EntAnalyzer {
    width_bits: u32,
    want_pi: bool,
    short_window: u64,
    pub long_minsamples: u64,
    pub short_limits: Limits,
    pub long_limits: Limits,
    short: Accumulators,
    long: Accumulators,
    long_total_samples: u64,
    pub short_watermarks: WatermarkSet,
    pub long_watermarks: WatermarkSet,
    // 16-bit only: odd leftover byte carried across `feed` calls.
    pending_byte: Option<u8>,
    // 8-bit only: buffer for six-byte pi coordinate groups.
    pi_buf: Vec<u8>,
}

impl EntAnalyzer {
    pub fn new8() -> Self {
        Self::new(8, true, 500_000, 250_000_000, fips_limits_8bit_short(), fips_limits_8bit_long())
    }

    pub fn new16() -> Self {
        Self::new(16, false, 100_000_000, 800_000_000, fips_limits_16bit_short(), fips_limits_16bit_long())
    }

    fn new(
        width_bits: u32,
        want_pi: bool,
        short_window: u64,
        long_minsamples: u64,
        short_limits: Limits,
        long_limits: Limits,
    ) -> Self {
        let num_bins = 1usize << width_bits;
        Self {
            width_bits,
            want_pi,
            short_window,
            long_minsamples,
            short_limits,
            long_limits,
            short: Accumulators::new(num_bins),
            long: Accumulators::new(num_bins),
            long_total_samples: 0,
            short_watermarks: WatermarkSet::default(),
            long_watermarks: WatermarkSet::default(),
            pending_byte: None,
            pi_buf: Vec::with_capacity(6),
        }
    }

    /// Feed raw bytes. For the 16-bit analyzer, an odd trailing byte is
    /// buffered and consumed as the high byte of the next call's first
    /// sample.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.width_bits == 8 {
            for &b in bytes {
                self.record_sample(b as u32);
                if self.want_pi {
                    self.pi_buf.push(b);
                    if self.pi_buf.len() == 6 {
                        let x = ((self.pi_buf[0] as u32) << 16) | ((self.pi_buf[1] as u32) << 8) | self.pi_buf[2] as u32;
                        let y =
                            ((self.pi_buf[3] as u32) << 16) | ((self.pi_buf[4] as u32) << 8) | self.pi_buf[5] as u32;
                        self.short.record_pi_pair(x, y);
                        self.long.record_pi_pair(x, y);
                        self.pi_buf.clear();
                    }
                }
            }
        } else {
            let mut iter = bytes.iter().copied();
            if let Some(hi) = self.pending_byte.take() {
                if let Some(lo) = iter.next() {
                    self.record_sample(((hi as u32) << 8) | lo as u32);
                } else {
                    self.pending_byte = Some(hi);
                    return;
                }
            }
            loop {
                match (iter.next(), iter.next()) {
                    (Some(hi), Some(lo)) => self.record_sample(((hi as u32) << 8) | lo as u32),
                    (Some(hi), None) => {
                        self.pending_byte = Some(hi);
                        break;
                    }
                    (None, _) => break,
                }
            }
        }
    }

    fn record_sample(&mut self, sample: u32) {
        self.short.record_sample(sample);
        self.long.record_sample(sample);
        self.long_total_samples += 1;

        if self.short.samples >= self.short_window {
            self.finish_short_window();
        }
    }

    fn finish_short_window(&mut self) {
        let short_result = self.short.compute_result(self.want_pi);
        let passed = within(&short_result, &self.short_limits);
        self.short_watermarks.observe(short_result, passed, |r| score(&r, &self.short_limits));
        self.short = Accumulators::new(self.short.bins.len());

        if self.long.needs_normalization() {
            self.long.normalize();
        }
        let long_result = self.long.compute_result(self.want_pi);
        let long_passed = self.long_total_samples < self.long_minsamples || within(&long_result, &self.long_limits);
        self.long_watermarks.observe(long_result, long_passed, |r| score(&r, &self.long_limits));
    }

    pub fn long_window_active(&self) -> bool {
        self.long_total_samples >= self.long_minsamples
    }

    pub fn is_ok(&self) -> bool {
        let short_ok = within(&self.short_watermarks.current, &self.short_limits);
        let long_ok = !self.long_window_active() || within(&self.long_watermarks.current, &self.long_limits);
        short_ok && long_ok
    }

    /// Tightened version of [`EntAnalyzer::is_ok`] used for the recovery
    /// condition: every metric's slack to its threshold is scaled by
    /// `tightness` (0.5 for "within half of the failure threshold").
    pub fn within_margin(&self, tightness: f64) -> bool {
        let short_ok = within_scaled(&self.short_watermarks.current, &self.short_limits, self.width_bits, tightness);
        let long_ok = !self.long_window_active()
            || within_scaled(&self.long_watermarks.current, &self.long_limits, self.width_bits, tightness);
        short_ok && long_ok
    }

    /// The live cumulative bin counts, for `GetRawData`.
    pub fn bins(&self) -> &[u64] {
        &self.long.bins
    }

    pub fn to_value(self) -> Value {
        Value::object_from([("Short", self.short_watermarks.to_value()), ("Long", self.long_watermarks.to_value())])
    }
}

fn within(r: &EntResult, limits: &Limits) -> bool {
    let mean_ok = limits.mean.map(|(ideal, tolerance)| (r.mean - ideal).abs() <= tolerance).unwrap_or(true);
    r.entropy >= limits.min_entropy_bits
        && r.chi_sq > limits.chi_sq_range.0
        && r.chi_sq < limits.chi_sq_range.1
        && mean_ok
        && r.pi_estimate.map(|p| ((p - std::f64::consts::PI) / std::f64::consts::PI).abs() < limits.pi_error).unwrap_or(true)
        && r.autocorrelation.abs() < limits.autocorrelation
        && r.min_entropy >= limits.min_entropy_floor
}

fn within_scaled(r: &EntResult, limits: &Limits, width_bits: u32, tightness: f64) -> bool {
    let ideal = width_bits as f64;
    let entropy_ok = r.entropy >= ideal - (ideal - limits.min_entropy_bits) * tightness;
    let min_entropy_ok = r.min_entropy >= ideal - (ideal - limits.min_entropy_floor) * tightness;

    let (lo, hi) = limits.chi_sq_range;
    let chi_sq_ok = if lo.is_finite() && hi.is_finite() {
        let center = (lo + hi) / 2.0;
        let half = (hi - lo) / 2.0 * tightness;
        r.chi_sq > center - half && r.chi_sq < center + half
    } else {
        true
    };

    let mean_ok = limits.mean.map(|(ideal_mean, tol)| (r.mean - ideal_mean).abs() <= tol * tightness).unwrap_or(true);
    let pi_ok = r
        .pi_estimate
        .map(|p| ((p - std::f64::consts::PI) / std::f64::consts::PI).abs() < limits.pi_error * tightness)
        .unwrap_or(true);
    let autocorr_ok = r.autocorrelation.abs() < limits.autocorrelation * tightness;

    entropy_ok && min_entropy_ok && chi_sq_ok && mean_ok && pi_ok && autocorr_ok
}

fn score(r: &EntResult, limits: &Limits) -> f64 {
    // Smaller is closer to failing; a simple composite margin is enough
    // to pick a representative watermark sample.
    (r.entropy - limits.min_entropy_bits).min(r.min_entropy - limits.min_entropy_floor)
}

fn fips_limits_8bit_short() -> Limits {
    Limits {
        min_entropy_bits: 7.999,
        chi_sq_range: (147.374, 400.965),
        mean: Some((127.5, 0.58)),
        pi_error: 0.0097,
        autocorrelation: 0.0078,
        min_entropy_floor: 7.73,
    }
}

fn fips_limits_8bit_long() -> Limits {
    Limits {
        min_entropy_bits: 7.999999,
        chi_sq_range: (161.643, 377.053),
        mean: Some((127.5, 0.019)),
        pi_error: 0.0003,
        autocorrelation: 0.00025,
        min_entropy_floor: 7.99,
    }
}

// ENT16's rolling-threshold table only names an entropy floor; the other
// metrics are still computed and reported but don't gate `is_ok`.
fn fips_limits_16bit_short() -> Limits {
    Limits {
        min_entropy_bits: 15.9995,
        chi_sq_range: (0.0, f64::INFINITY),
        mean: None,
        pi_error: f64::INFINITY,
        autocorrelation: f64::INFINITY,
        min_entropy_floor: 0.0,
    }
}

fn fips_limits_16bit_long() -> Limits {
    Limits {
        min_entropy_bits: 15.9999,
        chi_sq_range: (0.0, f64::INFINITY),
        mean: None,
        pi_error: f64::INFINITY,
        autocorrelation: f64::INFINITY,
        min_entropy_floor: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chi_sq_matches_direct_formula_over_uniform_bins() {
        let mut acc = Accumulators::new(256);
        for i in 0..256u32 {
            for _ in 0..4 {
                acc.record_sample(i);
            }
        }
        let w = acc.samples as f64;
        let expected: f64 = acc.bins.iter().map(|&c| (c as f64 - w / 256.0).powi(2) / (w / 256.0)).sum();
        let result = acc.compute_result(false);
        assert!((result.chi_sq - expected).abs() < 1e-9);
    }

    #[test]
    fn entropy_is_maximal_for_uniform_distribution() {
        let mut acc = Accumulators::new(4);
        for i in 0..4u32 {
            for _ in 0..1000 {
                acc.record_sample(i);
            }
        }
        let result = acc.compute_result(false);
        assert!((result.entropy - 2.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_halves_counts_without_changing_shape() {
        let mut acc = Accumulators::new(4);
        for i in 0..4u32 {
            for _ in 0..1000 {
                acc.record_sample(i);
            }
        }
        let before = acc.compute_result(false);
        acc.normalize();
        let after = acc.compute_result(false);
        assert!((before.entropy - after.entropy).abs() < 1e-6);
        assert!((before.chi_sq - after.chi_sq).abs() / before.chi_sq.max(1.0) < 0.05);
    }

    /// A uniform distribution has chi_sq == 0 both before and after, which
    /// can't tell a chi_sq-preserving redistribution apart from a naive
    /// halve that also divides chi_sq by two. This skews the bins so
    /// chi_sq is well away from zero and checks it survives normalization
    /// to within the 1% testable property on normalization order-preservation.
    #[test]
    fn normalize_preserves_chi_square_on_skewed_distribution() {
        let mut acc = Accumulators::new(8);
        for i in 0..8u32 {
            let count = 1000 + i * 400;
            for _ in 0..count {
                acc.record_sample(i);
            }
        }
        let before = acc.compute_result(false);
        assert!(before.chi_sq > 1.0, "fixture chi_sq too close to zero to be a useful check");

        acc.normalize();
        let after = acc.compute_result(false);

        let relative_change = (before.chi_sq - after.chi_sq).abs() / before.chi_sq;
        assert!(relative_change < 0.01, "chi_sq changed by {:.4}% across normalization ({} -> {})", relative_change * 100.0, before.chi_sq, after.chi_sq);
    }

    #[test]
    fn ent8_pi_estimate_converges_on_uniform_random_bytes() {
        let mut analyzer = EntAnalyzer::new8();
        let mut state = 0x2545F4914F6CDD1Du64;
        let mut bytes = Vec::with_capacity(600_000);
        for _ in 0..600_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            bytes.push((state & 0xFF) as u8);
        }
        analyzer.feed(&bytes);
        let pi = analyzer.short_watermarks.current.pi_estimate.unwrap();
        assert!((pi - std::f64::consts::PI).abs() < 0.05, "pi estimate {pi} too far off");
    }
}
