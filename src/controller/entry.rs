//! 各状態の入場処理
//!
//! 入場処理は入った状態だけを見て動作し、遷移元には依存しない。
//! 戻り値の `Some(event)` はその場で続けて処理される。

use super::Controller;
use crate::commutation::{CommutationStep, DriveMode};
use crate::config::{
    startup, tone, HW_MAX_DUTY, KV_ESTIMATE_MIN_DUTY, LOCK_DETECTIONS, MAX_CONSECUTIVE_MISSED,
    ZCD_TIMEOUT_MULTIPLIER,
};
use crate::control;
use crate::hardware::{elapsed_us, CommutationTimer, GateBridge};
use crate::state_machine::{Event, State};
use crate::telemetry::{interval_from_speed, EscError, MotorTelemetry};

/// ZCDから次の転流までの遅延 [μs]
///
/// `interval × (30 - phase) / 60 - offset`（0以下なら即時転流）
pub fn commutation_delay_us(interval_us: u32, phase: i8, offset_us: i16) -> i64 {
    interval_us as i64 * (30 - phase as i64) / 60 - offset_us as i64
}

/// 再生中のアーム確認音
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ArmTone {
    note: usize,
    since_us: u32,
}

impl<B, T> Controller<B, T>
where
    B: GateBridge,
    T: CommutationTimer,
{
    pub(super) fn enter(&mut self, state: State) -> Option<Event> {
        match state {
            State::Fault => self.enter_fault(),
            State::Init => self.enter_init(),
            State::WaitForArm | State::Idle => None,
            State::ArmedSound => self.enter_armed_sound(),
            State::Stopping => self.enter_stopping(),
            State::Stopped => self.enter_stopped(),
            State::StartupEnable => self.enter_startup_enable(),
            State::StartupGrab => self.enter_startup_grab(),
            State::StartupWait => self.enter_startup_wait(),
            State::StartupZcdDetected => self.enter_startup_zcd(),
            State::StartupNozcdCommutated => self.enter_startup_nozcd(),
            State::ClStart => self.enter_cl_start(),
            State::ClCommutated => self.enter_cl_commutated(),
            State::ClNozcd => self.enter_cl_nozcd(),
            State::ClZcd => self.enter_cl_zcd(),
        }
    }

    fn enter_fault(&mut self) -> Option<Event> {
        if self.arm_tone.is_some() {
            self.finish_arm_tone();
        }
        self.driver.off();
        self.sampling = false;
        None
    }

    fn enter_init(&mut self) -> Option<Event> {
        let config = self.driver_config();
        self.driver.initialize(&config);
        self.telemetry = MotorTelemetry::new();
        self.sampling = false;
        None
    }

    fn enter_armed_sound(&mut self) -> Option<Event> {
        info!("Armed");
        self.error = EscError::None;
        self.sampling = false;
        self.start_arm_tone();
        None
    }

    /// PWM周波数を音階に切り替えて鳴らし始める
    ///
    /// 音送りは周期処理の `advance_arm_tone` で行う。
    fn start_arm_tone(&mut self) {
        self.driver.set_state(CommutationStep::AB);
        self.driver.arm();
        if self.driver.set_duty_cycle(tone::DUTY).is_err() {
            self.finish_arm_tone();
            return;
        }
        self.driver.set_pwm_frequency(tone::NOTES_HZ[0] as u32);
        self.arm_tone = Some(ArmTone {
            note: 0,
            since_us: self.timer.now_us(),
        });
    }

    /// 1音が `NOTE_MS` 鳴ったら次の音へ。最後の音の後は設定周波数に戻す
    pub(super) fn advance_arm_tone(&mut self, now: u32) {
        let Some(playing) = self.arm_tone else {
            return;
        };
        if elapsed_us(now, playing.since_us) < tone::NOTE_MS * 1_000 {
            return;
        }
        let note = playing.note + 1;
        match tone::NOTES_HZ.get(note) {
            Some(&hz) => {
                self.driver.set_pwm_frequency(hz as u32);
                self.arm_tone = Some(ArmTone { note, since_us: now });
            }
            None => self.finish_arm_tone(),
        }
    }

    fn finish_arm_tone(&mut self) {
        self.arm_tone = None;
        self.driver.off();
        self.driver.set_pwm_frequency(self.settings.pwm_freq as u32);
    }

    fn enter_stopping(&mut self) -> Option<Event> {
        info!("Stopping motor");
        self.driver.off();
        self.sampling = false;
        None
    }

    fn enter_stopped(&mut self) -> Option<Event> {
        self.telemetry = MotorTelemetry::new();
        self.sampler.reset();
        self.arm_ticks = 0;
        self.zero_since_us = None;
        None
    }

    fn enter_startup_enable(&mut self) -> Option<Event> {
        info!("Starting motor (setpoint {})", self.telemetry.speed_setpoint);
        let t = &mut self.telemetry;
        t.consecutive_detected = 0;
        t.consecutive_missed = 0;
        t.detected = false;
        t.locked = false;
        t.error_accum = 0;
        t.startup_speed = self.settings.initial_startup_speed;

        self.sampler.reset();
        self.driver.set_direction(self.settings.direction);
        self.driver.set_mode(DriveMode::LowOnPwmHigh);
        self.driver.arm();
        None
    }

    /// 固定ステップ・低デューティでロータを引き込む
    ///
    /// `GRAB_TIME_MS` 後のTIMEOUTで抜ける。引き込み中はBEMFを見ない。
    fn enter_startup_grab(&mut self) -> Option<Event> {
        self.driver.set_state(CommutationStep::AB);
        if let Err(e) = self.apply_duty(startup::GRAB_DUTY) {
            return Some(e);
        }
        self.schedule(Event::Timeout, startup::GRAB_TIME_MS * 1_000);
        None
    }

    fn enter_startup_wait(&mut self) -> Option<Event> {
        self.sampling = true;
        if self.settings.active_startup {
            return self.forced_commutation();
        }

        // 一定速度で回っていたものとして履歴を作り、すぐ閉ループへ渡す
        let interval = interval_from_speed(self.settings.initial_startup_speed as u32);
        let now = self.timer.now_us();
        self.telemetry.seed_swap_intervals(interval);
        self.telemetry.last_swap_time = now.wrapping_sub(interval);
        if let Err(e) = self.apply_duty(self.settings.startup_duty as i32) {
            return Some(e);
        }
        Some(Event::Closed)
    }

    /// アクティブ始動: 強制転流して次の転流を予約
    fn forced_commutation(&mut self) -> Option<Event> {
        let interval = interval_from_speed(self.telemetry.startup_speed as u32);
        self.driver.next_state();
        let t = &mut self.telemetry;
        t.record_swap_interval(interval);
        t.last_swap_time = self.timer.now_us();
        t.detected = false;
        if let Err(e) = self.apply_duty(self.settings.startup_duty as i32) {
            return Some(e);
        }
        self.schedule(Event::Commutated, interval);
        None
    }

    fn enter_startup_zcd(&mut self) -> Option<Event> {
        let t = &mut self.telemetry;
        t.consecutive_detected += 1;
        t.consecutive_missed = 0;
        if t.consecutive_detected >= startup::DETECTIONS_TO_CLOSE {
            info!("Startup locked at {} RPM", t.current_speed);
            return Some(Event::Closed);
        }
        None
    }

    fn enter_startup_nozcd(&mut self) -> Option<Event> {
        let t = &mut self.telemetry;
        t.consecutive_missed += 1;
        t.consecutive_detected = 0;
        t.startup_speed = t
            .startup_speed
            .saturating_add(startup::SPEED_STEP_RPM)
            .min(self.settings.final_startup_speed);
        self.diagnostics.total_missed = self.diagnostics.total_missed.wrapping_add(1);

        if t.consecutive_missed > startup::MAX_MISSED {
            warn!("Startup failed after {} forced commutations", t.consecutive_missed);
            self.error = EscError::StartupFailure;
            return Some(Event::Fault);
        }
        None
    }

    fn enter_cl_start(&mut self) -> Option<Event> {
        let t = &mut self.telemetry;
        t.consecutive_detected = 0;
        t.consecutive_missed = 0;
        t.locked = false;
        t.error_accum = 0;
        debug!("Closed loop start at {} RPM", t.current_speed);
        None
    }

    fn enter_cl_commutated(&mut self) -> Option<Event> {
        let now = self.timer.now_us();
        self.driver.next_state();

        let t = &mut self.telemetry;
        let interval = elapsed_us(now, t.last_swap_time);
        t.record_swap_interval(interval);
        t.last_swap_time = now;
        t.detected = false;

        // ZCDを取り逃した場合の見張り
        let timeout = t
            .swap_interval_smoothed
            .saturating_mul(ZCD_TIMEOUT_MULTIPLIER)
            .max(1);
        self.schedule(Event::Timeout, timeout);
        self.update_kv_estimate();
        None
    }

    fn enter_cl_nozcd(&mut self) -> Option<Event> {
        let t = &mut self.telemetry;
        t.consecutive_missed += 1;
        t.consecutive_detected = 0;
        self.diagnostics.total_missed = self.diagnostics.total_missed.wrapping_add(1);

        if t.consecutive_missed > MAX_CONSECUTIVE_MISSED {
            warn!("{} consecutive missed ZCDs", t.consecutive_missed);
            self.error = EscError::ManyMissed;
            return Some(Event::Fault);
        }
        Some(Event::Commutated)
    }

    fn enter_cl_zcd(&mut self) -> Option<Event> {
        let t = &mut self.telemetry;
        t.consecutive_detected += 1;
        t.consecutive_missed = 0;

        if t.swap_interval_smoothed > 0 {
            let since_swap = elapsed_us(t.last_zcd_time, t.last_swap_time);
            let fraction = since_swap as f32 / t.swap_interval_smoothed as f32;
            t.zcd_fraction = 0.9 * t.zcd_fraction + 0.1 * fraction;
        }

        if !t.locked && t.consecutive_detected >= LOCK_DETECTIONS {
            t.locked = true;
            debug!("Closed loop engaged at {} RPM", t.current_speed);
        }

        match control::update_duty(&self.settings, &mut self.telemetry, self.driver.mode()) {
            Ok(out) => {
                if let Some(mode) = out.drive_mode {
                    self.driver.set_mode(mode);
                }
                if let Err(e) = self.apply_duty(out.duty_cycle) {
                    return Some(e);
                }
            }
            Err(e) => {
                error!("Control law failed: {:?}", e);
                return Some(Event::Fault);
            }
        }

        let delay = commutation_delay_us(
            self.telemetry.swap_interval_smoothed,
            self.settings.commutation_phase,
            self.settings.commutation_offset,
        );
        if delay <= 0 {
            Some(Event::Commutated)
        } else {
            self.schedule(Event::Commutated, delay as u32);
            None
        }
    }

    /// デューティをクランプしてテレメトリとドライバに反映（失敗時はFAULTイベント）
    pub(super) fn apply_duty(&mut self, duty: i32) -> Result<(), Event> {
        let duty = self.settings.clamp_duty(duty);
        self.telemetry.duty_cycle = duty;
        self.driver.set_duty_cycle(duty).map_err(|e| {
            error!("Duty update rejected: {:?}", e);
            Event::Fault
        })
    }

    /// 印加電圧と速度からKvを推定（重い平滑化）
    fn update_kv_estimate(&mut self) {
        let t = &mut self.telemetry;
        if t.duty_cycle <= KV_ESTIMATE_MIN_DUTY || t.battery_mv == 0 {
            return;
        }
        let applied_mv = t.battery_mv as f32 * t.duty_cycle as f32 / HW_MAX_DUTY as f32;
        let kv = t.current_speed as f32 * 1000.0 / applied_mv;
        t.kv_estimate = if t.kv_estimate == 0.0 {
            kv
        } else {
            0.95 * t.kv_estimate + 0.05 * kv
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commutation_delay() {
        assert_eq!(commutation_delay_us(6_000, 0, 0), 3_000);
        assert_eq!(commutation_delay_us(6_000, 23, 0), 700);
        assert_eq!(commutation_delay_us(6_000, 23, 700), 0);
        assert!(commutation_delay_us(6_000, 30, 10) < 0);
        assert_eq!(commutation_delay_us(6_000, -30, 0), 6_000);
    }
}
