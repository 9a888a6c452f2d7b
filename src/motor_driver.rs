//! 3相ブリッジドライバ
//!
//! 抽象的な転流ステップと駆動モードを6つのゲート出力とPWMコンペア値に変換し、
//! `GateBridge` に反映する。不正なモード/ステップ/デューティを受け取った場合は
//! 出力を更新せずに `off()` する。

use crate::commutation::{CommutationStep, Direction, DriveMode, PhaseGates};
use crate::config::HW_MAX_DUTY;
use crate::hardware::GateBridge;

/// ドライバ初期化パラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    pub mode: DriveMode,
    pub direction: Direction,
    /// [Hz]
    pub pwm_frequency_hz: u32,
}

/// ドライバ操作のエラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverError {
    /// デューティが0..=HW_MAX_DUTYの範囲外
    InvalidDutyCycle(i32),

    /// 未定義の駆動モード番号
    InvalidMode(u8),

    /// 未定義のステップ番号
    InvalidStep(u8),
}

/// 6ステップ用ブリッジドライバ
pub struct PhaseDriver<B> {
    bridge: B,
    armed: bool,
    mode: DriveMode,
    step: CommutationStep,
    direction: Direction,
    /// HW_MAX_DUTY単位
    duty: i32,
    compare: u16,
}

impl<B: GateBridge> PhaseDriver<B> {
    pub fn new(bridge: B) -> Self {
        Self {
            bridge,
            armed: false,
            mode: DriveMode::LowOnPwmHigh,
            step: CommutationStep::AB,
            direction: Direction::Forward,
            duty: 0,
            compare: 0,
        }
    }

    /// 設定を反映して出力を停止状態にする
    pub fn initialize(&mut self, config: &DriverConfig) {
        self.mode = config.mode;
        self.direction = config.direction;
        self.step = CommutationStep::AB;
        self.bridge.set_frequency(config.pwm_frequency_hz);
        self.off();
        debug!(
            "Phase driver initialized: mode={:?}, direction={:?}, pwm={}Hz",
            config.mode, config.direction, config.pwm_frequency_hz
        );
    }

    /// 非アーム化 + デューティ0 + 出力反映
    pub fn off(&mut self) {
        self.armed = false;
        self.duty = 0;
        self.compare = 0;
        self.bridge.write(&PhaseGates::ALL_OFF, 0);
        self.bridge.set_enabled(false);
    }

    pub fn arm(&mut self) {
        self.armed = true;
        self.bridge.set_enabled(true);
        self.push();
    }

    pub fn set_mode(&mut self, mode: DriveMode) {
        self.mode = mode;
        self.push();
    }

    /// 番号指定でモードを設定（未定義番号は `off()`）
    pub fn set_mode_raw(&mut self, raw: u8) -> Result<(), DriverError> {
        match DriveMode::from_u8(raw) {
            Some(mode) => {
                self.set_mode(mode);
                Ok(())
            }
            None => {
                error!("Invalid drive mode {}, forcing bridge off", raw);
                self.off();
                Err(DriverError::InvalidMode(raw))
            }
        }
    }

    /// デューティを設定（HW_MAX_DUTY単位、範囲外は `off()`）
    pub fn set_duty_cycle(&mut self, duty: i32) -> Result<(), DriverError> {
        if !(0..=HW_MAX_DUTY).contains(&duty) {
            error!("Invalid duty cycle {}, forcing bridge off", duty);
            self.off();
            return Err(DriverError::InvalidDutyCycle(duty));
        }
        self.duty = duty;
        self.compare = (duty as u32 * self.bridge.max_duty() as u32 / HW_MAX_DUTY as u32) as u16;
        self.push();
        Ok(())
    }

    pub fn set_state(&mut self, step: CommutationStep) {
        self.step = step;
        self.push();
    }

    /// 番号指定でステップを設定（未定義番号は `off()`）
    pub fn set_state_raw(&mut self, raw: u8) -> Result<(), DriverError> {
        match CommutationStep::from_u8(raw) {
            Some(step) => {
                self.set_state(step);
                Ok(())
            }
            None => {
                error!("Invalid commutation step {}, forcing bridge off", raw);
                self.off();
                Err(DriverError::InvalidStep(raw))
            }
        }
    }

    /// 回転方向に従って次のステップへ進める
    pub fn next_state(&mut self) -> CommutationStep {
        self.step = self.step.next(self.direction);
        self.push();
        self.step
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn set_pwm_frequency(&mut self, hz: u32) {
        self.bridge.set_frequency(hz);
        // 周期が変わるとコンペア値の最大値も変わる
        let duty = self.duty;
        self.compare = (duty as u32 * self.bridge.max_duty() as u32 / HW_MAX_DUTY as u32) as u16;
        self.push();
    }

    pub fn step(&self) -> CommutationStep {
        self.step
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn duty_cycle(&self) -> i32 {
        self.duty
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    fn push(&mut self) {
        if self.armed {
            let gates = PhaseGates::for_step(self.step, self.mode);
            self.bridge.write(&gates, self.compare);
        } else {
            self.bridge.write(&PhaseGates::ALL_OFF, 0);
        }
    }
}
