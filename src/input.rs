//! 速度指令の入力（RCパルス / シリアル）
//!
//! RCパルスはパルス幅 [μs] を目標速度に線形変換する。
//! 有効範囲外のパルスは無視し、一定時間有効なパルスがなければ指令なしとする。

use crate::config::input::{PULSE_MAX_VALID_US, PULSE_MIN_VALID_US, TIMEOUT_US};
use crate::config::Settings;
use crate::hardware::elapsed_us;

/// 指令値の入力元
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlSource {
    #[default]
    Pwm,
    Serial,
}

/// パルス幅 [μs] → 指令値
///
/// `PwmMin` 未満は0、それ以上は `RpmMin..=RpmMax` に線形変換。
pub fn pulse_to_command(width_us: u32, settings: &Settings) -> u16 {
    let pwm_min = settings.pwm_min as u32;
    let pwm_max = settings.pwm_max as u32;
    if width_us < pwm_min {
        return 0;
    }
    let rpm_min = settings.rpm_min as u32;
    let rpm_max = settings.rpm_max as u32;
    let span = pwm_max.saturating_sub(pwm_min).max(1);
    let command = rpm_min + (width_us - pwm_min) * rpm_max.saturating_sub(rpm_min) / span;
    command.min(rpm_max) as u16
}

/// RCパルス入力
#[derive(Debug, Default)]
pub struct PulseInput {
    rise_us: Option<u32>,
    last_valid_us: Option<u32>,
    command: u16,
}

impl PulseInput {
    pub const fn new() -> Self {
        Self {
            rise_us: None,
            last_valid_us: None,
            command: 0,
        }
    }

    /// 入力ピンのエッジ（立ち上がりで計測開始、立ち下がりで確定）
    pub fn on_edge(&mut self, rising: bool, now_us: u32, settings: &Settings) {
        if rising {
            self.rise_us = Some(now_us);
        } else if let Some(rise) = self.rise_us.take() {
            self.on_pulse(elapsed_us(now_us, rise), now_us, settings);
        }
    }

    /// 計測済みのパルス幅を反映（範囲外は無視）
    pub fn on_pulse(&mut self, width_us: u32, now_us: u32, settings: &Settings) {
        if !(PULSE_MIN_VALID_US..=PULSE_MAX_VALID_US).contains(&width_us) {
            trace!("Ignoring pulse width {}us", width_us);
            return;
        }
        self.last_valid_us = Some(now_us);
        self.command = pulse_to_command(width_us, settings);
    }

    /// 現在の指令値（タイムアウト時は `None`）
    pub fn command(&mut self, now_us: u32) -> Option<u16> {
        let last = self.last_valid_us?;
        if elapsed_us(now_us, last) > TIMEOUT_US {
            debug!("Pulse input timed out");
            self.last_valid_us = None;
            return None;
        }
        Some(self.command)
    }
}

/// 入力元の選択と保持
#[derive(Debug, Default)]
pub struct ControlInput {
    source: ControlSource,
    pulse: PulseInput,
    serial: Option<u16>,
}

impl ControlInput {
    pub const fn new() -> Self {
        Self {
            source: ControlSource::Pwm,
            pulse: PulseInput::new(),
            serial: None,
        }
    }

    pub fn source(&self) -> ControlSource {
        self.source
    }

    /// 入力元の切替（シリアル指令は切替時に破棄）
    pub fn set_source(&mut self, source: ControlSource) {
        if self.source != source {
            info!("Control source: {:?}", source);
            self.serial = None;
        }
        self.source = source;
    }

    pub fn set_serial(&mut self, command: u16) {
        self.serial = Some(command);
    }

    pub fn pulse_mut(&mut self) -> &mut PulseInput {
        &mut self.pulse
    }

    /// 選択中の入力元の指令値
    pub fn command(&mut self, now_us: u32) -> Option<u16> {
        match self.source {
            ControlSource::Pwm => self.pulse.command(now_us),
            ControlSource::Serial => self.serial,
        }
    }
}
