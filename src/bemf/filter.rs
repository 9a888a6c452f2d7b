//! 速度適応型ランニングフィルタ
//!
//! BEMF差分を窓長可変のボックスカーフィルタで積算する。窓長は電気角RPMを
//! 128RPM刻みのバケットに分けてテーブルから引き、`filter_length_scalar` [%] で
//! スケールする。高速になるほど1ステップのサンプル数が減るため窓は短くなる。

use crate::config::{FILTER_SPEED_CLAMP_RPM, MAX_RUNNING_FILTER};

/// RPMバケットの幅（2^7 = 128RPM）
pub const RPM_BUCKET_SHIFT: u32 = 7;

/// バケット → 窓長（スケール前）
const FILTER_LENGTHS: [u16; 141] = [
    744, 372, 248, 186, 149, 124, 106, 93, 83, 64, 58, 52,
    47, 43, 40, 37, 34, 31, 29, 27, 25, 24, 22, 21,
    20, 19, 18, 18, 17, 17, 17, 16, 16, 16, 15, 15,
    15, 14, 14, 14, 14, 14, 13, 13, 13, 13, 13, 12,
    12, 12, 12, 12, 12, 12, 11, 11, 11, 11, 11, 10,
    10, 10, 9, 9, 9, 9, 9, 9, 9, 8, 8, 8,
    8, 7, 7, 7, 7, 6, 6, 6, 6, 6, 6, 6,
    5, 5, 5, 5, 5, 5, 5, 4, 4, 4, 4, 4,
    4, 3, 3, 3, 3, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 1,
];

/// RPM → 窓長のルックアップテーブル
#[derive(Debug, Clone, Copy)]
pub struct FilterLengthTable {
    lengths: &'static [u16],
}

impl Default for FilterLengthTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterLengthTable {
    pub const fn new() -> Self {
        Self {
            lengths: &FILTER_LENGTHS,
        }
    }

    /// バケット番号（速度は `FILTER_SPEED_CLAMP_RPM` で頭打ち）
    pub fn bucket(rpm: u32) -> usize {
        (rpm.min(FILTER_SPEED_CLAMP_RPM) >> RPM_BUCKET_SHIFT) as usize
    }

    /// スケール前の窓長
    pub fn raw_length(&self, bucket: usize) -> u16 {
        match self.lengths.get(bucket) {
            Some(length) => *length,
            None => self.lengths[self.lengths.len() - 1],
        }
    }

    /// 速度とスケール [%] から窓長を求める（1..=MAX_RUNNING_FILTER）
    pub fn window_length(&self, rpm: u32, scalar_percent: u8) -> usize {
        let raw = self.raw_length(Self::bucket(rpm)) as usize;
        (raw * scalar_percent as usize / 100).clamp(1, MAX_RUNNING_FILTER)
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }
}

/// 循環バッファによるボックスカーフィルタ
pub struct RunningFilter {
    history: [i32; MAX_RUNNING_FILTER],
    pointer: usize,
    length: usize,
    sum: i32,
    samples_averaged: u32,
}

impl Default for RunningFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningFilter {
    pub const fn new() -> Self {
        Self {
            history: [0; MAX_RUNNING_FILTER],
            pointer: 0,
            length: 1,
            sum: 0,
            samples_averaged: 0,
        }
    }

    /// 積算をクリアして窓長を設定
    pub fn reset(&mut self, length: usize) {
        self.length = length.clamp(1, MAX_RUNNING_FILTER);
        self.pointer = 0;
        self.sum = 0;
        self.samples_averaged = 0;
    }

    /// 1サンプル追加（窓が満杯なら最古のサンプルを差し引く）
    pub fn push(&mut self, diff: i32) {
        self.sum += diff;
        if self.is_full() {
            self.sum -= self.history[self.pointer];
        }
        self.history[self.pointer] = diff;
        self.pointer += 1;
        if self.pointer >= self.length {
            self.pointer = 0;
        }
        self.samples_averaged = self.samples_averaged.saturating_add(1);
    }

    pub fn is_full(&self) -> bool {
        self.samples_averaged as usize >= self.length
    }

    /// 窓が満杯で積算値が正ならゼロクロス
    pub fn crossed(&self) -> bool {
        self.sum > 0 && self.is_full()
    }

    pub fn sum(&self) -> i32 {
        self.sum
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn samples_averaged(&self) -> u32 {
        self.samples_averaged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_at_5000_rpm() {
        let table = FilterLengthTable::new();
        assert_eq!(FilterLengthTable::bucket(5000), 39);
        assert_eq!(table.raw_length(39), 14);
        assert_eq!(table.window_length(5000, 25), 3);
    }

    #[test]
    fn test_lengths_non_increasing_and_bounded() {
        let table = FilterLengthTable::new();
        for bucket in 1..table.len() {
            assert!(table.raw_length(bucket) <= table.raw_length(bucket - 1));
        }
        for rpm in (0..20_000).step_by(64) {
            for scalar in [1u8, 25, 100, 255] {
                let length = table.window_length(rpm, scalar);
                assert!((1..=MAX_RUNNING_FILTER).contains(&length));
            }
        }
    }

    #[test]
    fn test_speed_clamped_before_lookup() {
        let table = FilterLengthTable::new();
        assert_eq!(FilterLengthTable::bucket(60_000), FilterLengthTable::bucket(8_500));
        assert_eq!(table.window_length(60_000, 100), 9);
        assert_eq!(table.raw_length(10_000), 1);
    }

    #[test]
    fn test_low_speed_window_clamped_to_max() {
        let table = FilterLengthTable::new();
        assert_eq!(table.window_length(0, 100), MAX_RUNNING_FILTER);
        assert_eq!(table.window_length(0, 25), 186);
    }

    #[test]
    fn test_running_sum_evicts_oldest() {
        let mut filter = RunningFilter::new();
        filter.reset(3);
        filter.push(-5);
        filter.push(-5);
        assert!(!filter.is_full());
        filter.push(-5);
        assert!(filter.is_full());
        assert_eq!(filter.sum(), -15);
        filter.push(10);
        assert_eq!(filter.sum(), 0);
        assert!(!filter.crossed());
        filter.push(10);
        assert_eq!(filter.sum(), 15);
        assert!(filter.crossed());
    }

    #[test]
    fn test_positive_sum_ignored_until_window_full() {
        let mut filter = RunningFilter::new();
        filter.reset(4);
        filter.push(100);
        filter.push(100);
        assert!(!filter.crossed());
        filter.push(100);
        filter.push(100);
        assert!(filter.crossed());
    }
}
