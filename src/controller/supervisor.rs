//! 低優先度の周期処理
//!
//! - 予約イベントの期限切れ救済（コンペアマッチを取りこぼした場合）
//! - アーム判定（指令0が `ARM_DEBOUNCE_TICKS` 回続いたらARM）
//! - 始動判定と停止判定（指令0/指令なしが `STOP_DEBOUNCE_US` 続いたらSTOP）
//! - ソフト電流制限によるデューティ削減、ハード電流制限でFAULT
//! - 積算電流とステータスの更新

use super::Controller;
use crate::config::{Settings, ARM_DEBOUNCE_TICKS, STOP_DEBOUNCE_US};
use crate::hardware::{elapsed_us, CommutationTimer, GateBridge};
use crate::protocol::{self, LOG_FRAME_LEN};
use crate::state_machine::{Event, State};
use crate::telemetry::EscStatus;

/// mA·μs → mAh
const MA_US_PER_MAH: f32 = 3_600_000_000.0;

impl<B, T> Controller<B, T>
where
    B: GateBridge,
    T: CommutationTimer,
{
    /// 周期タスク（`SUPERVISOR_PERIOD_US` ごとに呼ぶ）
    pub fn tick(&mut self) {
        let now = self.timer.now_us();

        if let Some(event) = self.telemetry.scheduled.take_expired(now) {
            trace!("Late scheduled event {:?}", event);
            self.inject_event(event);
        }
        self.advance_arm_tone(now);

        let command = self.input.command(now);
        self.telemetry.speed_setpoint = command.unwrap_or(0);

        match self.state {
            state if state.awaits_arm() => self.check_arm(command),
            // 確認音が鳴り終わるまでは始動しない
            State::Idle if self.arm_tone.is_none() => {
                if command.is_some_and(|c| c > 0) {
                    self.inject_event(Event::Start);
                }
            }
            state if state.is_running() => {
                self.check_stop(command, now);
                self.limit_current();
            }
            _ => {}
        }

        self.integrate_current(now);
        self.update_status();
    }

    fn check_arm(&mut self, command: Option<u16>) {
        if command != Some(0) {
            self.arm_ticks = 0;
            return;
        }
        self.arm_ticks += 1;
        if self.arm_ticks >= ARM_DEBOUNCE_TICKS {
            self.arm_ticks = 0;
            self.inject_event(Event::Arm);
        }
    }

    fn check_stop(&mut self, command: Option<u16>, now: u32) {
        if command.unwrap_or(0) != 0 {
            self.zero_since_us = None;
            return;
        }
        let since = *self.zero_since_us.get_or_insert(now);
        if elapsed_us(now, since) >= STOP_DEBOUNCE_US {
            self.zero_since_us = None;
            info!("Zero command, stopping");
            self.inject_event(Event::Stop);
        }
    }

    /// ソフト電流制限（ZCDが来ない間も効かせる）
    ///
    /// `hard_current_limit` を超えたらデューティは下げずにFAULTにする。
    fn limit_current(&mut self) {
        if self.telemetry.current_ma > self.settings.hard_current_limit as i32 {
            error!(
                "Hard current limit: {}mA > {}mA",
                self.telemetry.current_ma, self.settings.hard_current_limit
            );
            self.inject_event(Event::Fault);
            return;
        }
        if !self.driver.is_armed()
            || self.telemetry.current_ma <= self.settings.soft_current_limit as i32
        {
            return;
        }
        let duty = self.telemetry.duty_cycle - self.settings.max_dc_change as i32;
        warn!(
            "Soft current limit: {}mA, duty -> {}",
            self.telemetry.current_ma, duty
        );
        if let Err(event) = self.apply_duty(duty) {
            self.inject_event(event);
        }
    }

    fn integrate_current(&mut self, now: u32) {
        if let Some(last) = self.last_tick_us {
            let dt = elapsed_us(now, last) as f32;
            self.total_current_mah += self.telemetry.current_ma as f32 * dt / MA_US_PER_MAH;
        }
        self.last_tick_us = Some(now);
    }

    /// テレメトリをステータスに写す
    pub(super) fn update_status(&mut self) {
        let t = &self.telemetry;
        self.status = EscStatus {
            speed_setpoint: t.speed_setpoint,
            current_speed: t.current_speed,
            current_ma: t.current_ma,
            total_current_mah: self.total_current_mah,
            duty_cycle: t.duty_percent(),
            battery_mv: t.battery_mv,
            kv: t.kv_estimate,
            zcd_fraction: t.zcd_fraction,
            error: self.error,
            state: self.state,
        };
    }

    /// 保存要求があり、かつIDLEなら保存する設定を取り出す（要求は消える）
    ///
    /// フラッシュ書き込みはコントローラのロックの外で行えるよう、値だけを返す。
    pub fn take_save_request(&mut self) -> Option<Settings> {
        if !self.save_requested || self.state != State::Idle {
            return None;
        }
        self.save_requested = false;
        debug!("Servicing deferred settings save");
        Some(self.settings)
    }

    /// シリアルログが有効なら1msごとのログフレームを返す
    pub fn log_frame(&self, ms_count: u32) -> Option<[u8; LOG_FRAME_LEN]> {
        self.serial_logging
            .then(|| protocol::log_frame(ms_count, &self.telemetry))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Settings;
    use crate::hardware::AdcBatch;
    use crate::protocol::LOG_FRAME_HEADER;
    use crate::state_machine::{Event, State};
    use crate::telemetry::EscError;
    use crate::testing::Rig;

    #[test]
    fn test_total_current_integrates() {
        let mut rig = Rig::new(Settings::default());
        rig.controller.telemetry.current_ma = 3_600;
        // 初回は基準時刻を取るだけ
        rig.tick(10_001);
        let total = rig.controller.status().total_current_mah;
        assert!((total - 1.0).abs() < 5e-3, "total = {}", total);
    }

    #[test]
    fn test_late_timeout_recovered_by_tick() {
        let mut rig = Rig::new(Settings::default());
        rig.start(3_000);

        rig.timer.advance(400_000);
        rig.tick(1);
        let c = &rig.controller;
        assert_eq!(c.state(), State::ClCommutated);
        assert_eq!(c.last_event(), Event::Commutated);
        assert_eq!(c.telemetry().consecutive_missed, 1);
        assert_eq!(c.diagnostics().total_missed, 1);
    }

    #[test]
    fn test_soft_current_limit_trims_duty() {
        let mut settings = Settings::default();
        settings.soft_current_limit = 1_000;
        settings.max_dc_change = 100;
        let mut rig = Rig::new(settings);
        rig.start(3_000);
        rig.timer.advance(100);

        // 平衡点 4000mA に向かって上昇（位相差なしなのでZCDは出ない）
        for _ in 0..100 {
            rig.adc(AdcBatch::new(500, [1_000; 3]));
        }
        assert!(rig.controller.telemetry().current_ma > 1_000);
        assert_eq!(rig.controller.telemetry().duty_cycle, 800);

        rig.tick(1);
        assert_eq!(rig.controller.telemetry().duty_cycle, 700);
        assert_eq!(rig.controller.driver().duty_cycle(), 700);
        rig.tick(1);
        assert_eq!(rig.controller.telemetry().duty_cycle, 600);
        assert_eq!(rig.controller.state(), State::ClCommutated);
    }

    #[test]
    fn test_hard_current_limit_faults() {
        let mut settings = Settings::default();
        settings.soft_current_limit = 1_000;
        settings.hard_current_limit = 2_000;
        let mut rig = Rig::new(settings);
        rig.start(3_000);

        rig.controller.telemetry.current_ma = 2_000;
        rig.tick(1);
        assert_eq!(rig.controller.state(), State::ClCommutated);

        rig.controller.telemetry.current_ma = 2_001;
        rig.tick(1);
        let c = &rig.controller;
        assert_eq!(c.state(), State::Stopped);
        assert_eq!(c.error(), EscError::Fault);
        assert_eq!(c.diagnostics().pre_fault_state, State::ClCommutated);
        assert_eq!(c.diagnostics().pre_fault_event, Event::Fault);
        assert!(!c.driver().bridge().enabled);
    }

    #[test]
    fn test_log_frame_only_when_enabled() {
        let mut rig = Rig::new(Settings::default());
        assert_eq!(rig.controller.log_frame(7), None);

        rig.controller.serial_logging = true;
        rig.controller.telemetry.speed_setpoint = 1_500;
        let frame = rig.controller.log_frame(0x0001_0002).unwrap();
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]), LOG_FRAME_HEADER);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 2);
        assert_eq!(u16::from_le_bytes([frame[4], frame[5]]), 1);
        assert_eq!(u16::from_le_bytes([frame[8], frame[9]]), 1_500);
    }

    #[test]
    fn test_status_tracks_setpoint() {
        let mut rig = Rig::new(Settings::default());
        rig.start(2_500);
        let status = rig.controller.status();
        assert_eq!(status.speed_setpoint, 2_500);
        assert_eq!(status.state, State::ClCommutated);
        assert_eq!(status.duty_cycle, 8);
    }
}
