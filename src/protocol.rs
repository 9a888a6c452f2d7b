//! シリアルコマンドプロトコル
//!
//! フレーム: `[0x85][コマンド][ペイロード]`。ペイロード長はコマンドごとに固定。
//!
//! | コマンド | 値 | ペイロード |
//! |----------|----|------------|
//! | SetConfig | 0 | 設定レコード本体 54 bytes |
//! | GetConfig | 1 | - |
//! | SaveConfig | 2 | - |
//! | EnableLogging / DisableLogging | 3 / 4 | - |
//! | EnableSerialControl / DisableSerialControl | 6 / 7 | - |
//! | SetSpeed | 8 | i16 LE（0..10000） |
//! | Identify | 9 | - |
//! | EnableAdcLog / GetAdcLog | 10 / 11 | - |
//! | SetPwmFrequency | 12 | u16 LE [Hz] |
//! | GetStatus | 13 | - |
//! | GetVoltages | 15 | - |
//!
//! 5と14（ブートローダ関連）は受け付けない。1コマンド処理するごとにパーサは同期待ちに戻る。

use crate::config::{Settings, StorageError, SETTINGS_BODY_LEN};
use crate::telemetry::MotorTelemetry;

/// 同期バイト
pub const SYNC_BYTE: u8 = 0x85;

/// Identify応答の囲みバイト
pub const IDENTIFY_MARKER: u8 = 0x73;

/// Identify応答のバイト長（マーカー + シリアル番号32 bytes + マーカー）
pub const IDENTIFY_LEN: usize = 34;

/// シリアル番号のバイト長
pub const SERIAL_NUMBER_LEN: usize = 32;

/// SetSpeedで受け付ける上限（この値は含まない）
pub const MAX_SERIAL_SPEED: i16 = 10_000;

/// シリアルログフレームのバイト長
pub const LOG_FRAME_LEN: usize = 12;

/// シリアルログフレームの先頭ワード
pub const LOG_FRAME_HEADER: u16 = 0xFF00;

const MAX_PAYLOAD: usize = SETTINGS_BODY_LEN;

/// コマンドID
pub mod command_id {
    pub const SET_CONFIG: u8 = 0;
    pub const GET_CONFIG: u8 = 1;
    pub const SAVE_CONFIG: u8 = 2;
    pub const ENABLE_LOGGING: u8 = 3;
    pub const DISABLE_LOGGING: u8 = 4;
    pub const REBOOT_BOOTLOADER: u8 = 5;
    pub const ENABLE_SERIAL_CONTROL: u8 = 6;
    pub const DISABLE_SERIAL_CONTROL: u8 = 7;
    pub const SET_SPEED: u8 = 8;
    pub const IDENTIFY: u8 = 9;
    pub const ENABLE_ADC_LOG: u8 = 10;
    pub const GET_ADC_LOG: u8 = 11;
    pub const SET_PWM_FREQUENCY: u8 = 12;
    pub const GET_STATUS: u8 = 13;
    pub const BOOTLOADER: u8 = 14;
    pub const GET_VOLTAGES: u8 = 15;
    /// これ以上の値は未定義
    pub const LAST: u8 = 16;
}

/// 受信したコマンド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    SetConfig(Settings),
    GetConfig,
    SaveConfig,
    EnableLogging,
    DisableLogging,
    EnableSerialControl,
    DisableSerialControl,
    SetSpeed(u16),
    Identify,
    EnableAdcLog,
    GetAdcLog,
    SetPwmFrequency(u16),
    GetStatus,
    GetVoltages,
}

/// プロトコル層のエラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// 未定義のコマンドID
    UnknownCommand(u8),

    /// 対応しないコマンド（ブートローダ関連）
    Unsupported(u8),

    /// 設定レコードを復号できない
    InvalidSettings(StorageError),

    /// SetSpeedの値が範囲外
    SpeedOutOfRange(i16),

    /// ペイロード長がコマンドの定義と合わない
    InvalidPayloadSize,

    /// PWM周波数0
    InvalidFrequency,

    /// ADCログがまだ満杯でない
    LogNotReady,

    /// 応答が送信バッファに収まらない
    ReplyOverflow,
}

/// ペイロード長（未定義・非対応コマンドは `None`）
pub const fn payload_len(command: u8) -> Option<usize> {
    use command_id::*;
    match command {
        SET_CONFIG => Some(SETTINGS_BODY_LEN),
        SET_SPEED | SET_PWM_FREQUENCY => Some(2),
        GET_CONFIG | SAVE_CONFIG | ENABLE_LOGGING | DISABLE_LOGGING | ENABLE_SERIAL_CONTROL
        | DISABLE_SERIAL_CONTROL | IDENTIFY | ENABLE_ADC_LOG | GET_ADC_LOG | GET_STATUS
        | GET_VOLTAGES => Some(0),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum ParserState {
    WaitSync,
    WaitCommand,
    WaitData,
}

/// 1バイトずつ受け取るフレームパーサ
pub struct Parser {
    state: ParserState,
    command: u8,
    buffer: [u8; MAX_PAYLOAD],
    len: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub const fn new() -> Self {
        Self {
            state: ParserState::WaitSync,
            command: 0,
            buffer: [0; MAX_PAYLOAD],
            len: 0,
        }
    }

    /// 同期待ちに戻す
    pub fn reset(&mut self) {
        self.state = ParserState::WaitSync;
        self.len = 0;
    }

    /// 1バイト処理する。フレームが完成したら復号結果を返す
    pub fn push(&mut self, byte: u8) -> Option<Result<Command, ProtocolError>> {
        match self.state {
            ParserState::WaitSync => {
                if byte == SYNC_BYTE {
                    self.state = ParserState::WaitCommand;
                    self.len = 0;
                }
                None
            }
            ParserState::WaitCommand => match payload_len(byte) {
                Some(0) => {
                    self.command = byte;
                    Some(self.finish())
                }
                Some(_) => {
                    self.command = byte;
                    self.state = ParserState::WaitData;
                    None
                }
                None => {
                    self.reset();
                    let err = if byte >= command_id::LAST {
                        ProtocolError::UnknownCommand(byte)
                    } else {
                        ProtocolError::Unsupported(byte)
                    };
                    warn!("Rejected serial command: {:?}", err);
                    Some(Err(err))
                }
            },
            ParserState::WaitData => {
                self.buffer[self.len] = byte;
                self.len += 1;
                if self.len >= payload_len(self.command).unwrap_or(0) {
                    Some(self.finish())
                } else {
                    None
                }
            }
        }
    }

    fn finish(&mut self) -> Result<Command, ProtocolError> {
        let result = decode(self.command, &self.buffer[..self.len]);
        if let Err(e) = &result {
            warn!("Rejected serial command {}: {:?}", self.command, e);
        }
        self.reset();
        result
    }
}

/// コマンドIDとペイロードからコマンドを復号
pub fn decode(command: u8, payload: &[u8]) -> Result<Command, ProtocolError> {
    use command_id::*;
    if payload_len(command).is_some_and(|len| payload.len() < len) {
        return Err(ProtocolError::InvalidPayloadSize);
    }
    let word = || i16::from_le_bytes([payload[0], payload[1]]);
    let cmd = match command {
        SET_CONFIG => Command::SetConfig(
            Settings::decode(payload).map_err(ProtocolError::InvalidSettings)?,
        ),
        GET_CONFIG => Command::GetConfig,
        SAVE_CONFIG => Command::SaveConfig,
        ENABLE_LOGGING => Command::EnableLogging,
        DISABLE_LOGGING => Command::DisableLogging,
        ENABLE_SERIAL_CONTROL => Command::EnableSerialControl,
        DISABLE_SERIAL_CONTROL => Command::DisableSerialControl,
        SET_SPEED => {
            let speed = word();
            if !(0..MAX_SERIAL_SPEED).contains(&speed) {
                return Err(ProtocolError::SpeedOutOfRange(speed));
            }
            Command::SetSpeed(speed as u16)
        }
        IDENTIFY => Command::Identify,
        ENABLE_ADC_LOG => Command::EnableAdcLog,
        GET_ADC_LOG => Command::GetAdcLog,
        SET_PWM_FREQUENCY => {
            let hz = word() as u16;
            if hz == 0 {
                return Err(ProtocolError::InvalidFrequency);
            }
            Command::SetPwmFrequency(hz)
        }
        GET_STATUS => Command::GetStatus,
        GET_VOLTAGES => Command::GetVoltages,
        REBOOT_BOOTLOADER | BOOTLOADER => return Err(ProtocolError::Unsupported(command)),
        other => return Err(ProtocolError::UnknownCommand(other)),
    };
    Ok(cmd)
}

/// Identify応答
pub fn identify_reply(serial_number: &[u8; SERIAL_NUMBER_LEN]) -> [u8; IDENTIFY_LEN] {
    let mut reply = [0u8; IDENTIFY_LEN];
    reply[0] = IDENTIFY_MARKER;
    reply[1..=SERIAL_NUMBER_LEN].copy_from_slice(serial_number);
    reply[IDENTIFY_LEN - 1] = IDENTIFY_MARKER;
    reply
}

/// 1msごとのシリアルログフレーム（u16 LE × 6）
///
/// `[0xFF00, ms下位, ms上位, 速度, 指令値, 電流]`
pub fn log_frame(ms_count: u32, telemetry: &MotorTelemetry) -> [u8; LOG_FRAME_LEN] {
    let words: [u16; 6] = [
        LOG_FRAME_HEADER,
        ms_count as u16,
        (ms_count >> 16) as u16,
        telemetry.current_speed.min(u16::MAX as u32) as u16,
        telemetry.speed_setpoint,
        telemetry.current_ma.clamp(i16::MIN as i32, i16::MAX as i32) as i16 as u16,
    ];
    let mut frame = [0u8; LOG_FRAME_LEN];
    for (chunk, word) in frame.chunks_exact_mut(2).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    frame
}
