//! デューティ制御則（PI + フィードフォワード）
//!
//! ZCDごとに1回評価する。優先順位:
//! 1. フィルタ後の電流がソフト電流制限を超えていれば `MaxDcChange` だけデューティを下げる
//! 2. 閉ループが有効化（連続検出 `LOCK_DETECTIONS` 回）されるまでは何もしない
//! 3. Open: 指令値をそのままデューティにする
//! 4. Closed: 速度誤差のPI + Kv/バッテリー電圧由来のフィードフォワード、変化量を制限してクランプ
//!
//! 演算はすべて整数（PID_SCALE = デューティ100%）。

use crate::commutation::DriveMode;
use crate::config::{Settings, HW_MAX_DUTY, PID_SCALE};
use crate::telemetry::MotorTelemetry;

/// 制御モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ControlMode {
    /// 指令値 = デューティ（HW_MAX_DUTY単位）
    Open = 0,
    /// 指令値 = 目標速度 [RPM]
    Closed = 1,
}

impl ControlMode {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Open),
            1 => Some(Self::Closed),
            _ => None,
        }
    }
}

/// 制御則のエラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlError {
    /// 未定義の制御モード番号
    InvalidMode(u8),
}

/// 制御則の出力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlOutput {
    /// HW_MAX_DUTY単位
    pub duty_cycle: i32,
    /// ブレーキ切替が必要な場合の駆動モード
    pub drive_mode: Option<DriveMode>,
}

/// フィードフォワード項（PID_SCALE単位）
///
/// `Kff2 + speed × PID_SCALE × 1000 / (Kv × battery_mV)`。Kvかバッテリー電圧が
/// 未知（0）の間は速度項を省く。
pub fn feedforward(settings: &Settings, speed_rpm: u32, battery_mv: u32) -> i32 {
    let gain_den = settings.kv as i64 * battery_mv as i64;
    let speed_term = if gain_den > 0 {
        let term = speed_rpm as i64 * PID_SCALE as i64 * 1000 / gain_den;
        i32::try_from(term).unwrap_or(i32::MAX)
    } else {
        0
    };
    (settings.kff2 as i32).saturating_add(speed_term)
}

/// ブレーキ用駆動モードのヒステリシス判定
fn braking_mode(settings: &Settings, error: i32, current: DriveMode) -> DriveMode {
    if !settings.braking {
        return DriveMode::LowOnPwmHigh;
    }
    if error < settings.brake_engage_error as i32 {
        DriveMode::LowOnPwmBoth
    } else if error > settings.brake_release_error as i32 {
        DriveMode::LowOnPwmHigh
    } else {
        current
    }
}

/// ZCD 1回分のデューティ更新
///
/// `telemetry.duty_cycle` と `telemetry.error_accum` を更新する。
pub fn update_duty(
    settings: &Settings,
    telemetry: &mut MotorTelemetry,
    drive_mode: DriveMode,
) -> Result<ControlOutput, ControlError> {
    let unchanged = ControlOutput {
        duty_cycle: telemetry.duty_cycle,
        drive_mode: None,
    };

    // 電流制限は通常制御より優先
    if telemetry.current_ma > settings.soft_current_limit as i32 {
        telemetry.duty_cycle =
            settings.clamp_duty(telemetry.duty_cycle - settings.max_dc_change as i32);
        return Ok(ControlOutput {
            duty_cycle: telemetry.duty_cycle,
            drive_mode: None,
        });
    }

    if !telemetry.locked {
        return Ok(unchanged);
    }

    match settings.control_mode() {
        Some(ControlMode::Open) => {
            telemetry.duty_cycle = settings.clamp_duty(telemetry.speed_setpoint as i32);
            Ok(ControlOutput {
                duty_cycle: telemetry.duty_cycle,
                drive_mode: None,
            })
        }
        Some(ControlMode::Closed) => {
            let max_error = (settings.max_error as i32).max(0);
            let error = (telemetry.speed_setpoint as i32 - telemetry.current_speed as i32)
                .clamp(-max_error, max_error);

            let ki = settings.ki as i32;
            telemetry.error_accum = if ki > 0 {
                let limit = (settings.ilim as i32).abs() / ki;
                (telemetry.error_accum + error).clamp(-limit, limit)
            } else {
                0
            };

            let kp = if error >= 0 {
                settings.rising_kp
            } else {
                settings.falling_kp
            } as i32;

            let mode = braking_mode(settings, error, drive_mode);

            let ff = feedforward(settings, telemetry.current_speed, telemetry.battery_mv);
            let fb = kp as i64 * error as i64 + ki as i64 * telemetry.error_accum as i64;
            let target = (ff as i64 + fb) * HW_MAX_DUTY as i64 / PID_SCALE as i64;

            let max_change = (settings.max_dc_change as i64).max(0);
            let change = (target - telemetry.duty_cycle as i64).clamp(-max_change, max_change);
            telemetry.duty_cycle = settings.clamp_duty(telemetry.duty_cycle + change as i32);

            Ok(ControlOutput {
                duty_cycle: telemetry.duty_cycle,
                drive_mode: (mode != drive_mode).then_some(mode),
            })
        }
        None => Err(ControlError::InvalidMode(settings.mode)),
    }
}
