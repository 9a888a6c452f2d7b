//! テレメトリ・診断・ステータス
//!
//! `MotorTelemetry` は初期化時と STOPPED 再入場時にゼロクリアされる。
//! 故障回数などは `Diagnostics` に分けて保持し、クリアしない。

use crate::config::{HW_MAX_DUTY, NUM_STORED_SWAP_INTERVALS, SPEED_SCALE};
use crate::scheduler::ScheduledEvent;
use crate::state_machine::{Event, State};

/// モーター状態
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorTelemetry {
    /// HW_MAX_DUTY単位
    pub duty_cycle: i32,
    /// [RPM]
    pub current_speed: u32,
    /// [RPM]
    pub speed_setpoint: u16,
    /// [mA]（フィルタ済み）
    pub current_ma: i32,
    /// [mV]（フィルタ済み）
    pub battery_mv: u32,
    /// ステップ間隔のリングバッファ [μs]
    pub swap_intervals: [u32; NUM_STORED_SWAP_INTERVALS],
    pub swap_interval_pointer: usize,
    pub swap_interval_sum: u32,
    pub swap_interval_smoothed: u32,
    /// ZCD位置（ステップ間隔に対する割合、平滑化）
    pub zcd_fraction: f32,
    pub consecutive_detected: u32,
    pub consecutive_missed: u32,
    /// 積分項の積算値
    pub error_accum: i32,
    /// 閉ループ制御が有効化済み
    pub locked: bool,
    /// 現ステップでZCDを検出済み
    pub detected: bool,
    /// [μs]
    pub last_swap_time: u32,
    /// [μs]
    pub last_zcd_time: u32,
    /// 推定Kv [RPM/V]
    pub kv_estimate: f32,
    /// アクティブ始動の強制転流速度 [RPM]
    pub startup_speed: u16,
    pub scheduled: ScheduledEvent,
}

impl Default for MotorTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl MotorTelemetry {
    pub const fn new() -> Self {
        Self {
            duty_cycle: 0,
            current_speed: 0,
            speed_setpoint: 0,
            current_ma: 0,
            battery_mv: 0,
            swap_intervals: [0; NUM_STORED_SWAP_INTERVALS],
            swap_interval_pointer: 0,
            swap_interval_sum: 0,
            swap_interval_smoothed: 0,
            zcd_fraction: 0.0,
            consecutive_detected: 0,
            consecutive_missed: 0,
            error_accum: 0,
            locked: false,
            detected: false,
            last_swap_time: 0,
            last_zcd_time: 0,
            kv_estimate: 0.0,
            startup_speed: 0,
            scheduled: ScheduledEvent::new(),
        }
    }

    /// ステップ間隔を記録し、平滑値と速度を更新
    pub fn record_swap_interval(&mut self, interval_us: u32) {
        let slot = &mut self.swap_intervals[self.swap_interval_pointer];
        self.swap_interval_sum = self
            .swap_interval_sum
            .wrapping_sub(*slot)
            .wrapping_add(interval_us);
        *slot = interval_us;
        self.swap_interval_pointer = (self.swap_interval_pointer + 1) % NUM_STORED_SWAP_INTERVALS;
        self.swap_interval_smoothed = self.swap_interval_sum / NUM_STORED_SWAP_INTERVALS as u32;
        self.current_speed = speed_from_interval(self.swap_interval_smoothed);
    }

    /// 一定のステップ間隔で履歴を埋める
    pub fn seed_swap_intervals(&mut self, interval_us: u32) {
        self.swap_intervals = [interval_us; NUM_STORED_SWAP_INTERVALS];
        self.swap_interval_pointer = 0;
        self.swap_interval_sum = interval_us * NUM_STORED_SWAP_INTERVALS as u32;
        self.swap_interval_smoothed = interval_us;
        self.current_speed = speed_from_interval(interval_us);
    }

    /// デューティ [%]
    pub fn duty_percent(&self) -> u8 {
        (self.duty_cycle.clamp(0, HW_MAX_DUTY) * 100 / HW_MAX_DUTY) as u8
    }
}

/// ステップ間隔 [μs] → 電気角RPM
pub fn speed_from_interval(interval_us: u32) -> u32 {
    if interval_us == 0 {
        0
    } else {
        SPEED_SCALE / interval_us
    }
}

/// 電気角RPM → ステップ間隔 [μs]
pub fn interval_from_speed(rpm: u32) -> u32 {
    SPEED_SCALE / rpm.max(1)
}

/// STOPPEDでクリアしない診断情報
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Diagnostics {
    pub faults: u32,
    pub pre_fault_state: State,
    pub pre_fault_event: Event,
    /// DMAバッファ切替の取りこぼし
    pub bad_flips: u32,
    /// HT/TCどちらのフラグもなく捨てたADCバッチ
    pub unflagged_batches: u32,
    pub total_missed: u32,
    pub total_zcd: u32,
}

/// ステータスのエラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum EscError {
    #[default]
    None = 0,
    Fault = 1,
    StartupFailure = 2,
    ManyMissed = 3,
}

/// get-statusで返すステータスのバイト長
pub const STATUS_LEN: usize = 29;

/// 外部向けステータス
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EscStatus {
    /// [RPM]
    pub speed_setpoint: u16,
    /// [RPM]
    pub current_speed: u32,
    /// [mA]
    pub current_ma: i32,
    /// [mAh]
    pub total_current_mah: f32,
    /// [%]
    pub duty_cycle: u8,
    /// [mV]
    pub battery_mv: u32,
    /// [RPM/V]
    pub kv: f32,
    pub zcd_fraction: f32,
    pub error: EscError,
    pub state: State,
}

impl EscStatus {
    pub fn encode(&self) -> [u8; STATUS_LEN] {
        let mut data = [0u8; STATUS_LEN];
        data[0..2].copy_from_slice(&self.speed_setpoint.to_le_bytes());
        data[2..6].copy_from_slice(&self.current_speed.to_le_bytes());
        data[6..10].copy_from_slice(&self.current_ma.to_le_bytes());
        data[10..14].copy_from_slice(&self.total_current_mah.to_le_bytes());
        data[14] = self.duty_cycle;
        data[15..19].copy_from_slice(&self.battery_mv.to_le_bytes());
        data[19..23].copy_from_slice(&self.kv.to_le_bytes());
        data[23..27].copy_from_slice(&self.zcd_fraction.to_le_bytes());
        data[27] = self.error as u8;
        data[28] = self.state as u8;
        data
    }
}
