//! シリアルコマンドの処理
//!
//! 拒否したコマンドはモーター状態に触れない。

use heapless::Vec;

use super::Controller;
use crate::config::Settings;
use crate::hardware::{CommutationTimer, GateBridge};
use crate::input::ControlSource;
use crate::protocol::{identify_reply, Command, ProtocolError};

/// 応答バッファの容量（最大は設定レコード本体）
pub const REPLY_CAPACITY: usize = 64;

/// コマンドへの応答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// 応答なし
    None,
    /// 送信するバイト列
    Data(Vec<u8, REPLY_CAPACITY>),
    /// ADCキャプチャログの送信を開始する（`CaptureLog::read_chunk` で取り出す）
    CaptureLog,
}

impl Reply {
    fn data(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Vec::from_slice(bytes)
            .map(Reply::Data)
            .map_err(|_| ProtocolError::ReplyOverflow)
    }
}

impl<B, T> Controller<B, T>
where
    B: GateBridge,
    T: CommutationTimer,
{
    /// 受信したコマンドを処理する
    pub fn handle_command(&mut self, command: Command) -> Result<Reply, ProtocolError> {
        debug!("Serial command: {:?}", command);
        match command {
            Command::SetConfig(settings) => {
                self.apply_settings(settings)?;
                Ok(Reply::None)
            }
            Command::GetConfig => Reply::data(&self.settings.encode()),
            Command::SaveConfig => {
                self.save_requested = true;
                Ok(Reply::None)
            }
            Command::EnableLogging => {
                self.serial_logging = true;
                Ok(Reply::None)
            }
            Command::DisableLogging => {
                self.serial_logging = false;
                Ok(Reply::None)
            }
            Command::EnableSerialControl => {
                self.input.set_source(ControlSource::Serial);
                Ok(Reply::None)
            }
            Command::DisableSerialControl => {
                self.input.set_source(ControlSource::Pwm);
                Ok(Reply::None)
            }
            Command::SetSpeed(speed) => {
                self.input.set_serial(speed);
                Ok(Reply::None)
            }
            Command::Identify => Reply::data(&identify_reply(&self.serial_number)),
            Command::EnableAdcLog => {
                self.capture.start();
                Ok(Reply::None)
            }
            Command::GetAdcLog => {
                self.capture.begin_fetch()?;
                Ok(Reply::CaptureLog)
            }
            Command::SetPwmFrequency(hz) => {
                info!("PWM frequency -> {}Hz", hz);
                self.settings.pwm_freq = hz;
                self.driver.set_pwm_frequency(hz as u32);
                Ok(Reply::None)
            }
            Command::GetStatus => {
                self.update_status();
                Reply::data(&self.status.encode())
            }
            Command::GetVoltages => Reply::data(&self.self_test.encode()),
        }
    }

    /// 設定レコードを差し替える
    ///
    /// 回転方向と駆動モードは次の始動時に反映される。
    fn apply_settings(&mut self, settings: Settings) -> Result<(), ProtocolError> {
        settings
            .validate()
            .map_err(ProtocolError::InvalidSettings)?;
        if settings.pwm_freq != self.settings.pwm_freq {
            self.driver.set_pwm_frequency(settings.pwm_freq as u32);
        }
        self.settings = settings;
        info!("Settings replaced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureState;
    use crate::config::{capture::LOG_BYTES, SettingsStore, StorageError};
    use crate::hardware::AdcBatch;
    use crate::protocol::{IDENTIFY_MARKER, SERIAL_NUMBER_LEN};
    use crate::selftest::SelfTestReport;
    use crate::state_machine::State;
    use crate::telemetry::STATUS_LEN;
    use crate::testing::{MemFlash, Rig};

    fn data(reply: Result<Reply, ProtocolError>) -> Vec<u8, REPLY_CAPACITY> {
        match reply {
            Ok(Reply::Data(bytes)) => bytes,
            other => panic!("expected data reply, got {:?}", other),
        }
    }

    #[test]
    fn test_get_config_returns_settings_body() {
        let mut rig = Rig::new(Settings::default());
        let bytes = data(rig.controller.handle_command(Command::GetConfig));
        assert_eq!(&bytes[..], &Settings::default().encode()[..]);
    }

    #[test]
    fn test_set_config_replaces_and_retunes() {
        let mut rig = Rig::new(Settings::default());
        let mut settings = Settings::default();
        settings.rising_kp = 9;
        settings.pwm_freq = 24_000;

        let reply = rig.controller.handle_command(Command::SetConfig(settings));
        assert_eq!(reply, Ok(Reply::None));
        assert_eq!(rig.controller.settings().rising_kp, 9);
        assert_eq!(rig.controller.driver().bridge().frequency_hz, 24_000);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut rig = Rig::new(Settings::default());
        let mut settings = Settings::default();
        settings.min_dc = 5_000;
        settings.max_dc = 1_000;

        let reply = rig.controller.handle_command(Command::SetConfig(settings));
        assert!(matches!(reply, Err(ProtocolError::InvalidSettings(_))));
        assert_eq!(rig.controller.settings(), &Settings::default());
    }

    #[test]
    fn test_save_deferred_until_idle() {
        let mut rig = Rig::new(Settings::default());
        let mut store = SettingsStore::new(MemFlash::new(256));
        let mut settings = Settings::default();
        settings.ki = 3;
        rig.command(Command::SetConfig(settings));
        rig.command(Command::SaveConfig);

        assert_eq!(rig.controller.take_save_request(), None);

        rig.arm();
        assert_eq!(rig.controller.state(), State::Idle);
        let pending = rig.controller.take_save_request().unwrap();
        assert_eq!(pending, settings);
        // 1回だけ
        assert_eq!(rig.controller.take_save_request(), None);
        assert_eq!(store.save(&pending), Ok(()));

        let mut loaded = Settings::default();
        assert_eq!(store.load(&mut loaded), Ok(()));
        assert_eq!(loaded.ki, 3);
    }

    #[test]
    fn test_save_failure_reported() {
        let mut rig = Rig::new(Settings::default());
        let mut flash = MemFlash::new(256);
        flash.fail_write = true;
        let mut store = SettingsStore::new(flash);
        rig.arm();
        rig.command(Command::SaveConfig);
        let pending = rig.controller.take_save_request().unwrap();
        assert_eq!(store.save(&pending), Err(StorageError::FlashWrite));
    }

    #[test]
    fn test_serial_control_and_logging_flags() {
        let mut rig = Rig::new(Settings::default());
        rig.command(Command::EnableLogging);
        assert!(rig.controller.serial_logging());
        assert!(rig.controller.log_frame(1).is_some());
        rig.command(Command::DisableLogging);
        assert!(rig.controller.log_frame(1).is_none());

        rig.command(Command::EnableSerialControl);
        rig.command(Command::SetSpeed(1_234));
        assert_eq!(rig.controller.input_mut().command(rig.timer.now()), Some(1_234));
        rig.command(Command::DisableSerialControl);
        // パルス入力は未受信
        assert_eq!(rig.controller.input_mut().command(rig.timer.now()), None);
    }

    #[test]
    fn test_identify_returns_serial_number() {
        let mut rig = Rig::new(Settings::default());
        let serial = [0x42; SERIAL_NUMBER_LEN];
        rig.controller = rig.controller.with_serial_number(serial);

        let bytes = data(rig.controller.handle_command(Command::Identify));
        assert_eq!(bytes.len(), 34);
        assert_eq!(bytes[0], IDENTIFY_MARKER);
        assert_eq!(&bytes[1..33], &serial[..]);
        assert_eq!(bytes[33], IDENTIFY_MARKER);
    }

    #[test]
    fn test_get_status_reflects_state() {
        let mut rig = Rig::new(Settings::default());
        rig.arm();
        let bytes = data(rig.controller.handle_command(Command::GetStatus));
        assert_eq!(bytes.len(), STATUS_LEN);
        assert_eq!(bytes[27], 0);
        assert_eq!(bytes[28], State::Idle as u8);
    }

    #[test]
    fn test_set_pwm_frequency() {
        let mut rig = Rig::new(Settings::default());
        rig.command(Command::SetPwmFrequency(16_000));
        assert_eq!(rig.controller.settings().pwm_freq, 16_000);
        assert_eq!(rig.controller.driver().bridge().frequency_hz, 16_000);
    }

    #[test]
    fn test_get_voltages_after_self_test() {
        let mut rig = Rig::new(Settings::default());
        let mut report = SelfTestReport::default();
        report.voltages[0] = [2_000, 500, 500];
        rig.controller.set_self_test(report);

        let bytes = data(rig.controller.handle_command(Command::GetVoltages));
        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[..6], &[0xD0, 0x07, 0xF4, 0x01, 0xF4, 0x01]);
    }

    #[test]
    fn test_adc_log_capture_and_fetch() {
        let mut rig = Rig::new(Settings::default());
        assert_eq!(
            rig.controller.handle_command(Command::GetAdcLog),
            Err(ProtocolError::LogNotReady)
        );

        rig.command(Command::EnableAdcLog);
        let mut batches = 0;
        while rig.controller.capture_mut().state() == CaptureState::Capturing {
            rig.adc(AdcBatch::new(1, [2, 3, 4]));
            batches += 1;
        }
        assert_eq!(batches, LOG_BYTES / 8);

        assert_eq!(
            rig.controller.handle_command(Command::GetAdcLog),
            Ok(Reply::CaptureLog)
        );
        let mut chunk = [0u8; 64];
        let n = rig.controller.capture_mut().read_chunk(&mut chunk);
        assert_eq!(n, 64);
        assert_eq!(&chunk[..8], &[1, 0, 2, 0, 3, 0, 4, 0]);

        let mut total = n;
        loop {
            let n = rig.controller.capture_mut().read_chunk(&mut chunk);
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, LOG_BYTES);
        assert_eq!(rig.controller.capture_mut().state(), CaptureState::Idle);
    }
}
