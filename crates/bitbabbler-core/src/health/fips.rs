//! FIPS 140-2 statistical test suite, run once per exact 2500-byte block.

use bitbabbler_rpc::Value;

pub const BLOCK_LEN: usize = 2500;

const MONOBIT_LOW: u32 = 9725;
const MONOBIT_HIGH: u32 = 10275;
const POKER_LOW: u64 = 1_563_175;
const POKER_HIGH: u64 = 1_576_928;
const LONG_RUN_LEN: u32 = 26;
const REPETITION_INIT: u32 = 0x5EED_1E57;
const ADAPTIVE_PROPORTION_WINDOW: u32 = 65536;
const ADAPTIVE_PROPORTION_LIMIT: u32 = 358;

// FIPS 140-2 Table 2 run-length ranges, same bounds for both polarities,
// indexed by `min(len, 6) - 1`.
const RUN_RANGES: [(u32, u32); 6] =
    [(2315, 2685), (1114, 1386), (527, 723), (240, 384), (103, 209), (103, 209)];

const FAIL_RATE_ALPHA: f64 = 1.0 / 1000.0;
const PASS_RUN_ALPHA: f64 = 1.0 / 10.0;

pub const FAIL_RATE_LIMIT: f64 = 0.007;
pub const PASS_RUN_LIMIT: f64 = 17500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Test {
    Monobit,
    Poker,
    Runs,
    LongRun,
    Repetition,
    AdaptiveProportion,
}

impl Test {
    pub const ALL: [Test; 6] =
        [Test::Monobit, Test::Poker, Test::Runs, Test::LongRun, Test::Repetition, Test::AdaptiveProportion];

    pub fn name(self) -> &'static str {
        match self {
            Test::Monobit => "Monobit",
            Test::Poker => "Poker",
            Test::Runs => "Runs",
            Test::LongRun => "LongRun",
            Test::Repetition => "Repetition",
            Test::AdaptiveProportion => "AdaptiveProportion",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Rolling failure-rate EWMA (conceptually Q20 fixed-point, kept as `f64`
/// here since the observable thresholds are expressed in real values) and
/// a separately-smoothed pass-run length with a peak tracker.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingStat {
    pub fail_rate: f64,
    pub pass_run_len: u32,
    pub pass_run_ewma: f64,
    pub pass_run_peak: u32,
}

impl RollingStat {
    fn record(&mut self, passed: bool) {
        let fail_indicator = if passed { 0.0 } else { 1.0 };
        self.fail_rate = (1.0 - FAIL_RATE_ALPHA) * self.fail_rate + FAIL_RATE_ALPHA * fail_indicator;

        if passed {
            self.pass_run_len += 1;
            self.pass_run_peak = self.pass_run_peak.max(self.pass_run_len);
        } else {
            self.pass_run_len = 0;
        }
        self.pass_run_ewma = (1.0 - PASS_RUN_ALPHA) * self.pass_run_ewma + PASS_RUN_ALPHA * self.pass_run_len as f64;
    }

    pub fn within_limits(&self) -> bool {
        self.fail_rate <= FAIL_RATE_LIMIT && self.pass_run_ewma <= PASS_RUN_LIMIT
    }

    pub fn to_value(self) -> Value {
        Value::object_from([
            ("FailRate", Value::from(self.fail_rate)),
            (
                "PassRuns",
                Value::object_from([
                    ("Current", Value::from(self.pass_run_len)),
                    ("Peak", Value::from(self.pass_run_peak)),
                    ("Ewma", Value::from(self.pass_run_ewma)),
                ]),
            ),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockResult {
    pub monobit: bool,
    pub poker: bool,
    pub runs: bool,
    pub long_run: bool,
    pub repetition: bool,
    pub adaptive_proportion: bool,
}

impl BlockResult {
    pub fn all_passed(&self) -> bool {
        self.monobit && self.poker && self.runs && self.long_run && self.repetition && self.adaptive_proportion
    }

    fn get(&self, test: Test) -> bool {
        match test {
            Test::Monobit => self.monobit,
            Test::Poker => self.poker,
            Test::Runs => self.runs,
            Test::LongRun => self.long_run,
            Test::Repetition => self.repetition,
            Test::AdaptiveProportion => self.adaptive_proportion,
        }
    }
}

/// Streaming FIPS 140-2 analyzer. `process_block` must be called with
/// exactly [`BLOCK_LEN`] bytes at a time; callers that accumulate partial
/// blocks must not call in until a full block is buffered.
pub struct FipsAnalyzer {
    prev_word: u32,
    ap_current: u8,
    ap_count: u32,
    ap_window_pos: u32,
    stats: [RollingStat; 6],
    consecutive_block_passes: u32,
}

impl Default for FipsAnalyzer {
    fn default() -> Self {
        Self {
            prev_word: REPETITION_INIT,
            ap_current: 0,
            ap_count: 0,
            ap_window_pos: 0,
            stats: [RollingStat::default(); 6],
            consecutive_block_passes: 0,
        }
    }
}

impl FipsAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stat(&self, test: Test) -> RollingStat {
        self.stats[test.index()]
    }

    pub fn consecutive_block_passes(&self) -> u32 {
        self.consecutive_block_passes
    }

    pub fn all_within_limits(&self) -> bool {
        self.stats.iter().all(RollingStat::within_limits)
    }

    /// Recovery-condition check: every rolling metric within `tightness`
    /// of its failure threshold (0.5 for "within half").
    pub fn all_within_margin(&self, tightness: f64) -> bool {
        self.stats
            .iter()
            .all(|s| s.fail_rate <= FAIL_RATE_LIMIT * tightness && s.pass_run_ewma <= PASS_RUN_LIMIT * tightness)
    }

    pub fn process_block(&mut self, block: &[u8]) -> BlockResult {
        debug_assert_eq!(block.len(), BLOCK_LEN);

        let result = BlockResult {
            monobit: self.monobit(block),
            poker: self.poker(block),
            runs: false, // filled below, alongside long_run, from one scan
            long_run: false,
            repetition: self.repetition(block),
            adaptive_proportion: self.adaptive_proportion(block),
        };
        let (runs_ok, long_run_ok) = self.runs_and_long_run(block);
        let result = BlockResult { runs: runs_ok, long_run: long_run_ok, ..result };

        for test in Test::ALL {
            self.stats[test.index()].record(result.get(test));
        }

        if result.all_passed() {
            self.consecutive_block_passes += 1;
        } else {
            self.consecutive_block_passes = 0;
        }

        result
    }

    fn monobit(&self, block: &[u8]) -> bool {
        let ones: u32 = block.iter().map(|b| b.count_ones()).sum();
        ones > MONOBIT_LOW && ones < MONOBIT_HIGH
    }

    fn poker(&self, block: &[u8]) -> bool {
        let mut bins = [0u64; 16];
        for &b in block {
            bins[(b >> 4) as usize] += 1;
            bins[(b & 0x0F) as usize] += 1;
        }
        let sum: u64 = bins.iter().map(|&c| c * c).sum();
        sum > POKER_LOW && sum <= POKER_HIGH
    }

    fn runs_and_long_run(&self, block: &[u8]) -> (bool, bool) {
        let mut runs = [[0u32; 6]; 2];
        let mut max_run = 0u32;
        let mut current_bit: Option<u8> = None;
        let mut current_len: u32 = 0;

        let mut flush = |bit: u8, len: u32, runs: &mut [[u32; 6]; 2]| {
            let idx = (len.min(6) - 1) as usize;
            runs[bit as usize][idx] += 1;
        };

        for &byte in block {
            for shift in (0..8).rev() {
                let bit = (byte >> shift) & 1;
                match current_bit {
                    Some(b) if b == bit => current_len += 1,
                    Some(b) => {
                        flush(b, current_len, &mut runs);
                        max_run = max_run.max(current_len);
                        current_bit = Some(bit);
                        current_len = 1;
                    }
                    None => {
                        current_bit = Some(bit);
                        current_len = 1;
                    }
                }
            }
        }
        if let Some(b) = current_bit {
            flush(b, current_len, &mut runs);
            max_run = max_run.max(current_len);
        }

        let runs_ok = runs.iter().all(|polarity| {
            polarity.iter().zip(RUN_RANGES.iter()).all(|(&count, &(lo, hi))| count >= lo && count <= hi)
        });
        let long_run_ok = max_run < LONG_RUN_LEN;

        (runs_ok, long_run_ok)
    }

    fn repetition(&mut self, block: &[u8]) -> bool {
        let mut ok = true;
        for word in block.chunks_exact(4) {
            let w = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
            if w == self.prev_word {
                ok = false;
            }
            self.prev_word = w;
        }
        ok
    }

    /// One Pass/Fail verdict per call regardless of whether a 65536-byte
    /// window boundary actually falls inside this block; if no boundary
    /// closes, the block reports Pass by default.
    fn adaptive_proportion(&mut self, block: &[u8]) -> bool {
        let mut ok = true;
        for &b in block {
            if self.ap_window_pos == 0 {
                self.ap_current = b;
                self.ap_count = 1;
            } else if b == self.ap_current {
                self.ap_count += 1;
            }
            self.ap_window_pos += 1;

            if self.ap_window_pos >= ADAPTIVE_PROPORTION_WINDOW {
                if self.ap_count > ADAPTIVE_PROPORTION_LIMIT {
                    ok = false;
                }
                self.ap_window_pos = 0;
                self.ap_count = 0;
            }
        }
        ok
    }

    pub fn to_value(&self) -> Value {
        Value::object_from(Test::ALL.iter().map(|&t| (t.name(), self.stats[t.index()].to_value())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monobit_passes_on_half_ones() {
        let block = vec![0x55u8; BLOCK_LEN]; // 4 ones per byte -> 10000 ones
        let mut fips = FipsAnalyzer::new();
        let result = fips.process_block(&block);
        assert!(result.monobit);
        assert!(!result.poker);
        assert!(!result.runs);
    }

    #[test]
    fn repetition_never_flags_first_word() {
        let mut fips = FipsAnalyzer::new();
        let mut block = vec![0u8; BLOCK_LEN];
        block[0..4].copy_from_slice(&REPETITION_INIT.to_be_bytes());
        let result = fips.process_block(&block);
        assert!(result.repetition, "first word equal to the init constant must not flag");
    }

    #[test]
    fn repetition_flags_on_first_duplicate() {
        let mut fips = FipsAnalyzer::new();
        let mut block = vec![0u8; BLOCK_LEN];
        for chunk in block.chunks_exact_mut(4) {
            chunk.copy_from_slice(&[0xAA, 0xBB, 0xAA, 0xBB]);
        }
        let result = fips.process_block(&block);
        assert!(!result.repetition);
    }

    #[test]
    fn adaptive_proportion_defaults_to_pass_when_window_does_not_close() {
        let mut fips = FipsAnalyzer::new();
        let block = vec![0u8; BLOCK_LEN];
        let result = fips.process_block(&block);
        assert!(result.adaptive_proportion);
    }

    #[test]
    fn adaptive_proportion_fails_on_excessive_repeats_within_a_window() {
        let mut fips = FipsAnalyzer::new();
        let block = vec![0x42u8; ADAPTIVE_PROPORTION_WINDOW as usize];
        let mut failed = false;
        for chunk in block.chunks(BLOCK_LEN) {
            let padded;
            let chunk = if chunk.len() == BLOCK_LEN {
                chunk
            } else {
                padded = {
                    let mut v = chunk.to_vec();
                    v.resize(BLOCK_LEN, 0x42);
                    v
                };
                &padded[..]
            };
            if !fips.process_block(chunk).adaptive_proportion {
                failed = true;
            }
        }
        assert!(failed);
    }

    #[test]
    fn rolling_stat_reports_within_limits_after_clean_start() {
        let stat = RollingStat::default();
        assert!(stat.within_limits());
    }
}
