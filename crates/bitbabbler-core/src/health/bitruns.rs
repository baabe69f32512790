//! Streaming run-length analyzer with a geometric-distribution chi-square
//! goodness-of-fit test.

use bitbabbler_rpc::Value;

pub const MAX_RUN: usize = 64;

pub struct BitRuns {
    runlengths: [[u64; MAX_RUN]; 2],
    current_bit: Option<u8>,
    current_len: u64,
    max_run: u64,
    zeros: u64,
    ones: u64,
}

impl Default for BitRuns {
    fn default() -> Self {
        Self {
            runlengths: [[0u64; MAX_RUN]; 2],
            current_bit: None,
            current_len: 0,
            max_run: 0,
            zeros: 0,
            ones: 0,
        }
    }
}

impl BitRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            for shift in (0..8).rev() {
                let bit = (byte >> shift) & 1;
                if bit == 0 {
                    self.zeros += 1;
                } else {
                    self.ones += 1;
                }
                match self.current_bit {
                    Some(b) if b == bit => self.current_len += 1,
                    Some(b) => {
                        self.flush_run(b);
                        self.current_bit = Some(bit);
                        self.current_len = 1;
                    }
                    None => {
                        self.current_bit = Some(bit);
                        self.current_len = 1;
                    }
                }
            }
        }
    }

    fn flush_run(&mut self, bit: u8) {
        let idx = (self.current_len as usize).min(MAX_RUN) - 1;
        self.runlengths[bit as usize][idx] += 1;
        self.max_run = self.max_run.max(self.current_len);
    }

    fn total_bits(&self) -> u64 {
        self.zeros + self.ones
    }

    /// Expected count of a run of length `i` (1-based) in `n` total bits:
    /// `(n - i + 3) / 2^(i+2)`.
    fn expected(n: u64, i: u64) -> f64 {
        if i + 3 > n {
            return 0.0;
        }
        (n - i + 3) as f64 / 2f64.powi(i as i32 + 2)
    }

    /// Chi-square over the geometric run-length distribution, with degrees
    /// of freedom `2k - 1` where `k` is the largest run length whose
    /// expected count is still >= 5.
    pub fn chi_square(&self) -> (f64, u32) {
        let n = self.total_bits();
        if n == 0 {
            return (0.0, 0);
        }

        let mut k = 0u64;
        for i in 1..=(MAX_RUN as u64) {
            if Self::expected(n, i) >= 5.0 {
                k = i;
            } else {
                break;
            }
        }
        if k == 0 {
            return (0.0, 0);
        }

        let mut chi_sq = 0.0;
        for bit in 0..2 {
            for i in 1..=k {
                let observed = self.runlengths[bit][(i - 1) as usize] as f64;
                let expected = Self::expected(n, i);
                chi_sq += (observed - expected).powi(2) / expected;
            }
        }

        (chi_sq, (2 * k - 1) as u32)
    }

    pub fn to_value(&self) -> Value {
        let (chi_sq, k) = self.chi_square();
        let runs: Vec<Value> = (0..MAX_RUN)
            .map(|i| {
                Value::from(vec![
                    Value::from(self.runlengths[0][i]),
                    Value::from(self.runlengths[1][i]),
                    Value::from(Self::expected(self.total_bits(), (i + 1) as u64)),
                ])
            })
            .collect();

        Value::object_from([
            ("Zeros", Value::from(self.zeros)),
            ("Ones", Value::from(self.ones)),
            ("Max", Value::from(self.max_run)),
            ("Runs", Value::Array(runs)),
            ("Chisq", Value::from(chi_sq)),
            ("Chisq-p", Value::from(chi_square_p_value(chi_sq, k))),
            ("Chisq-k", Value::from(k)),
        ])
    }
}

/// Upper-tail p-value for a chi-square statistic via the Wilson-Hilferty
/// cube-root normal approximation; avoids pulling in a full incomplete
/// gamma implementation for a value used only for reporting.
fn chi_square_p_value(chi_sq: f64, k: u32) -> f64 {
    if k == 0 {
        return 1.0;
    }
    let k = k as f64;
    let z = ((chi_sq / k).powf(1.0 / 3.0) - (1.0 - 2.0 / (9.0 * k))) / (2.0 / (9.0 * k)).sqrt();
    1.0 - normal_cdf(z)
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Abramowitz & Stegun 7.1.26 approximation, max error ~1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternating_bits_produce_only_length_one_runs() {
        let mut br = BitRuns::new();
        br.feed(&[0xAAu8; 1000]); // 10101010...
        assert_eq!(br.runlengths[0][1], 0);
        assert_eq!(br.runlengths[1][1], 0);
        assert!(br.runlengths[0][0] > 0);
        assert!(br.runlengths[1][0] > 0);
    }

    #[test]
    fn max_run_tracks_longest_observed_run() {
        let mut br = BitRuns::new();
        br.feed(&[0x00u8; 10]); // 80 zero bits in a row
        assert_eq!(br.max_run, 80);
    }

    #[test]
    fn chi_square_zero_for_empty_stream() {
        let br = BitRuns::new();
        let (chi_sq, k) = br.chi_square();
        assert_eq!(chi_sq, 0.0);
        assert_eq!(k, 0);
    }
}
