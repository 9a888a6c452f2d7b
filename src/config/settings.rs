//! 実行時設定
//!
//! 制御ゲイン、デューティ制限、始動パラメータ、入力マッピング、電流制限などを保持する。
//! バイト列表現（リトルエンディアン固定レイアウト）はフラッシュ保存と
//! set-config / get-config コマンドで共通。

use super::params::{defaults, HW_MAX_DUTY};
use super::storage::StorageError;
use crate::commutation::Direction;
use crate::control::ControlMode;

/// Settings本体のバイト長
pub const SETTINGS_BODY_LEN: usize = 54;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Settings {
    // === PID + フィードフォワード ===
    /// 速度誤差が正のときの比例ゲイン（PID_SCALE/RPM）
    pub rising_kp: i16,
    /// 速度誤差が負のときの比例ゲイン
    pub falling_kp: i16,
    pub ki: i16,
    /// モーター定数 [電気角RPM/V]
    pub kv: u16,
    /// フィードフォワードのオフセット（PID_SCALE単位）
    pub kff2: i16,
    /// 積分項の上限（PID_SCALE単位）
    pub ilim: i16,
    /// 速度誤差のクランプ [RPM]
    pub max_error: i16,

    // === デューティ ===
    /// 1転流あたりのデューティ変化上限（HW_MAX_DUTY単位）
    pub max_dc_change: i16,
    pub min_dc: i16,
    pub max_dc: i16,

    // === 始動 ===
    /// [RPM]
    pub initial_startup_speed: u16,
    /// [RPM]
    pub final_startup_speed: u16,
    pub startup_current_target: u16,
    /// ZCDから転流までの遅延（1/60電気角周期単位、30 - phase）
    pub commutation_phase: i8,
    /// [μs]
    pub commutation_offset: i16,

    // === 入力マッピング ===
    /// [μs]
    pub pwm_min: u16,
    /// [μs]
    pub pwm_max: u16,
    /// [RPM]
    pub rpm_min: u16,
    /// [RPM]
    pub rpm_max: u16,
    /// ブリッジPWM周波数 [Hz]
    pub pwm_freq: u16,

    // === 電流制限 [mA] ===
    pub soft_current_limit: u16,
    pub hard_current_limit: u16,

    pub braking: bool,
    pub direction: Direction,
    /// ControlModeの番号（不正値は制御則でFAULTになる）
    pub mode: u8,
    /// フィルタ長テーブルのスケール [%]
    pub filter_length_scalar: u8,
    /// ブレーキ開始の速度誤差 [RPM]
    pub brake_engage_error: i16,
    /// ブレーキ解除の速度誤差 [RPM]
    pub brake_release_error: i16,
    /// 強制転流による始動ランプを使うか
    pub active_startup: bool,
    /// 閉ループ移行直後のデューティ（HW_MAX_DUTY単位）
    pub startup_duty: i16,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    /// params.rsのデフォルト値で生成
    pub const fn new() -> Self {
        Self {
            rising_kp: defaults::RISING_KP,
            falling_kp: defaults::FALLING_KP,
            ki: defaults::KI,
            kv: defaults::KV,
            kff2: defaults::KFF2,
            ilim: defaults::ILIM,
            max_error: defaults::MAX_ERROR,
            max_dc_change: defaults::MAX_DC_CHANGE,
            min_dc: defaults::MIN_DC,
            max_dc: defaults::MAX_DC,
            initial_startup_speed: defaults::INITIAL_STARTUP_SPEED,
            final_startup_speed: defaults::FINAL_STARTUP_SPEED,
            startup_current_target: defaults::STARTUP_CURRENT_TARGET,
            commutation_phase: defaults::COMMUTATION_PHASE,
            commutation_offset: defaults::COMMUTATION_OFFSET,
            pwm_min: defaults::PWM_MIN,
            pwm_max: defaults::PWM_MAX,
            rpm_min: defaults::RPM_MIN,
            rpm_max: defaults::RPM_MAX,
            pwm_freq: defaults::PWM_FREQ,
            soft_current_limit: defaults::SOFT_CURRENT_LIMIT,
            hard_current_limit: defaults::HARD_CURRENT_LIMIT,
            braking: false,
            direction: Direction::Forward,
            mode: ControlMode::Closed as u8,
            filter_length_scalar: defaults::FILTER_LENGTH_SCALAR,
            brake_engage_error: defaults::BRAKE_ENGAGE_ERROR,
            brake_release_error: defaults::BRAKE_RELEASE_ERROR,
            active_startup: false,
            startup_duty: defaults::STARTUP_DUTY,
        }
    }

    pub fn control_mode(&self) -> Option<ControlMode> {
        ControlMode::from_u8(self.mode)
    }

    /// デューティ上限（MaxDcとハードウェア最大の小さい方）
    pub fn duty_ceiling(&self) -> i32 {
        (self.max_dc as i32).min(HW_MAX_DUTY)
    }

    /// デューティ下限（上限を超えない）
    pub fn duty_floor(&self) -> i32 {
        (self.min_dc as i32).max(0).min(self.duty_ceiling())
    }

    /// デューティを [MinDc, min(MaxDc, HW_MAX_DUTY)] にクランプ
    pub fn clamp_duty(&self, duty: i32) -> i32 {
        duty.clamp(self.duty_floor(), self.duty_ceiling())
    }

    /// 値の整合性チェック（set-configとフラッシュ読み込みの両方で使う）
    pub fn validate(&self) -> Result<(), StorageError> {
        let ok = self.min_dc >= 0
            && self.ki >= 0
            && self.ilim >= 0
            && self.max_error >= 0
            && self.max_dc as i32 <= HW_MAX_DUTY
            && self.min_dc <= self.max_dc
            && self.max_dc_change > 0
            && self.pwm_min < self.pwm_max
            && self.rpm_min <= self.rpm_max
            && self.pwm_freq > 0
            && self.filter_length_scalar > 0
            && self.brake_engage_error <= self.brake_release_error
            && self.startup_duty >= 0
            && self.startup_duty as i32 <= HW_MAX_DUTY;
        if ok {
            Ok(())
        } else {
            Err(StorageError::InvalidField)
        }
    }

    /// バイト列に変換
    pub fn encode(&self) -> [u8; SETTINGS_BODY_LEN] {
        let mut buf = [0u8; SETTINGS_BODY_LEN];
        let mut w = Writer { buf: &mut buf, pos: 0 };
        w.i16(self.rising_kp);
        w.i16(self.falling_kp);
        w.i16(self.ki);
        w.u16(self.kv);
        w.i16(self.kff2);
        w.i16(self.ilim);
        w.i16(self.max_error);
        w.i16(self.max_dc_change);
        w.i16(self.min_dc);
        w.i16(self.max_dc);
        w.u16(self.initial_startup_speed);
        w.u16(self.final_startup_speed);
        w.u16(self.startup_current_target);
        w.u8(self.commutation_phase as u8);
        w.i16(self.commutation_offset);
        w.u16(self.pwm_min);
        w.u16(self.pwm_max);
        w.u16(self.rpm_min);
        w.u16(self.rpm_max);
        w.u16(self.pwm_freq);
        w.u16(self.soft_current_limit);
        w.u16(self.hard_current_limit);
        w.u8(self.braking as u8);
        w.u8(self.direction as u8);
        w.u8(self.mode);
        w.u8(self.filter_length_scalar);
        w.i16(self.brake_engage_error);
        w.i16(self.brake_release_error);
        w.u8(self.active_startup as u8);
        w.i16(self.startup_duty);
        debug_assert_eq!(w.pos, SETTINGS_BODY_LEN);
        buf
    }

    /// バイト列から復元
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() < SETTINGS_BODY_LEN {
            return Err(StorageError::InvalidSize);
        }
        let mut r = Reader { buf: bytes, pos: 0 };
        Ok(Self {
            rising_kp: r.i16(),
            falling_kp: r.i16(),
            ki: r.i16(),
            kv: r.u16(),
            kff2: r.i16(),
            ilim: r.i16(),
            max_error: r.i16(),
            max_dc_change: r.i16(),
            min_dc: r.i16(),
            max_dc: r.i16(),
            initial_startup_speed: r.u16(),
            final_startup_speed: r.u16(),
            startup_current_target: r.u16(),
            commutation_phase: r.u8() as i8,
            commutation_offset: r.i16(),
            pwm_min: r.u16(),
            pwm_max: r.u16(),
            rpm_min: r.u16(),
            rpm_max: r.u16(),
            pwm_freq: r.u16(),
            soft_current_limit: r.u16(),
            hard_current_limit: r.u16(),
            braking: r.flag()?,
            direction: Direction::from_u8(r.u8()).ok_or(StorageError::InvalidField)?,
            mode: r.u8(),
            filter_length_scalar: r.u8(),
            brake_engage_error: r.i16(),
            brake_release_error: r.i16(),
            active_startup: r.flag()?,
            startup_duty: r.i16(),
        })
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    fn u16(&mut self, v: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&v.to_le_bytes());
        self.pos += 2;
    }

    fn i16(&mut self, v: i16) {
        self.u16(v as u16);
    }
}

// 呼び出し側で長さを確認済み
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        v
    }

    fn i16(&mut self) -> i16 {
        self.u16() as i16
    }

    fn flag(&mut self) -> Result<bool, StorageError> {
        match self.u8() {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(StorageError::InvalidField),
        }
    }
}
