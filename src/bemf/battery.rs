//! PWM側相電圧からのバッテリー電圧推定
//!
//! PWM-high駆動中、PWM側の相電圧の平均はおおよそ `V_bat × duty` になる。
//! 分圧比とADCスケールはハードウェアリビジョンごとに `BatteryCalibration` で与える。

use crate::config::params::battery;
use crate::config::{BATTERY_ESTIMATE_MIN_DUTY, HW_MAX_DUTY};

/// 相電圧測定回路の校正値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryCalibration {
    /// 分圧比 = divider_num / divider_den
    pub divider_num: u32,
    pub divider_den: u32,
    /// [mV]
    pub adc_full_scale_mv: u32,
    pub adc_counts: u32,
}

impl Default for BatteryCalibration {
    fn default() -> Self {
        Self {
            // 12.7kΩ / 2.7kΩ 分圧
            divider_num: battery::DIVIDER_NUM,
            divider_den: battery::DIVIDER_DEN,
            adc_full_scale_mv: battery::ADC_FULL_SCALE_MV,
            adc_counts: battery::ADC_COUNTS,
        }
    }
}

impl BatteryCalibration {
    /// 相電圧ADC値とデューティからバッテリー電圧 [mV] を求める
    pub fn battery_mv(&self, phase_adc: i16, duty: i32) -> Option<u32> {
        if phase_adc < 0 || duty <= 0 {
            return None;
        }
        let num = phase_adc as u64
            * self.adc_full_scale_mv as u64
            * self.divider_num as u64
            * HW_MAX_DUTY as u64;
        let den = self.adc_counts as u64 * self.divider_den as u64 * duty as u64;
        if den == 0 {
            return None;
        }
        Some((num / den).min(u32::MAX as u64) as u32)
    }
}

/// 1/16384 IIRフィルタ付きバッテリー電圧推定
#[derive(Debug, Clone, Copy, Default)]
pub struct BatteryEstimator {
    calibration: BatteryCalibration,
}

impl BatteryEstimator {
    pub const FILTER_WEIGHT: u64 = 16_384;

    pub fn new(calibration: BatteryCalibration) -> Self {
        Self { calibration }
    }

    /// デューティが十分なときだけ推定値を `battery_mv` に畳み込む
    ///
    /// 初回（`battery_mv == 0`）は推定値でフィルタを初期化する。
    pub fn update(&self, battery_mv: &mut u32, phase_adc: i16, duty: i32) {
        if duty <= BATTERY_ESTIMATE_MIN_DUTY {
            return;
        }
        let Some(sample) = self.calibration.battery_mv(phase_adc, duty) else {
            return;
        };
        if *battery_mv == 0 {
            *battery_mv = sample;
            return;
        }
        let filtered = ((Self::FILTER_WEIGHT - 1) * *battery_mv as u64 + sample as u64)
            / Self::FILTER_WEIGHT;
        *battery_mv = filtered as u32;
    }

    pub fn calibration(&self) -> &BatteryCalibration {
        &self.calibration
    }
}
