//! 設定の永続化
//!
//! フラッシュ上のレコード形式:
//!
//! | offset | size | 内容 |
//! |---|---|---|
//! | 0 | 4 | マジックナンバー（"ESC1"） |
//! | 4 | 2 | バージョン |
//! | 6 | 2 | 本体長 |
//! | 8 | 54 | Settings本体 |
//! | 62 | 4 | CRC32（先頭から本体末尾まで） |
//!
//! CRC32はSTM32のCRCユニットと同じ設定（poly=0x04C11DB7、init=0xFFFFFFFF、反転なし）。

use super::settings::{Settings, SETTINGS_BODY_LEN};

/// 設定データのマジックナンバー（"ESC1"のASCII）
pub const CONFIG_MAGIC: u32 = 0x3143_5345;

/// 現在の設定バージョン
pub const CONFIG_VERSION: u16 = 1;

const HEADER_LEN: usize = 8;

/// レコード全体のバイト長
pub const RECORD_LEN: usize = HEADER_LEN + SETTINGS_BODY_LEN + 4;

/// 永続化操作のエラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// フラッシュ読み取りエラー
    FlashRead,

    /// フラッシュ消去エラー
    FlashErase,

    /// フラッシュ書き込みエラー
    FlashWrite,

    /// マジックナンバー不一致
    InvalidMagic,

    /// バージョン不一致
    VersionMismatch,

    /// データサイズエラー
    InvalidSize,

    /// CRC検証エラー
    CrcMismatch,

    /// フィールド値が不正
    InvalidField,

    /// 書き込み後の読み戻しが一致しない
    VerifyFailed,
}

/// 設定保存用フラッシュ領域（1ページ）
pub trait ConfigFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError>;

    /// ページ全体を消去
    fn erase(&mut self) -> Result<(), StorageError>;

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError>;
}

const CRC_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// CRC-32/MPEG-2
pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(0xFFFF_FFFF, |crc, &byte| {
        (crc << 8) ^ CRC_TABLE[((crc >> 24) as u8 ^ byte) as usize]
    })
}

/// Settingsをレコードに変換
pub fn encode_record(settings: &Settings) -> [u8; RECORD_LEN] {
    let mut record = [0u8; RECORD_LEN];
    record[0..4].copy_from_slice(&CONFIG_MAGIC.to_le_bytes());
    record[4..6].copy_from_slice(&CONFIG_VERSION.to_le_bytes());
    record[6..8].copy_from_slice(&(SETTINGS_BODY_LEN as u16).to_le_bytes());
    record[HEADER_LEN..HEADER_LEN + SETTINGS_BODY_LEN].copy_from_slice(&settings.encode());
    let crc = crc32(&record[..RECORD_LEN - 4]);
    record[RECORD_LEN - 4..].copy_from_slice(&crc.to_le_bytes());
    record
}

/// レコードを検証してSettingsに変換
pub fn decode_record(record: &[u8; RECORD_LEN]) -> Result<Settings, StorageError> {
    let magic = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
    if magic != CONFIG_MAGIC {
        return Err(StorageError::InvalidMagic);
    }

    let version = u16::from_le_bytes([record[4], record[5]]);
    if version != CONFIG_VERSION {
        return Err(StorageError::VersionMismatch);
    }

    let len = u16::from_le_bytes([record[6], record[7]]) as usize;
    if len != SETTINGS_BODY_LEN {
        return Err(StorageError::InvalidSize);
    }

    let stored = u32::from_le_bytes([
        record[RECORD_LEN - 4],
        record[RECORD_LEN - 3],
        record[RECORD_LEN - 2],
        record[RECORD_LEN - 1],
    ]);
    let calculated = crc32(&record[..RECORD_LEN - 4]);
    if stored != calculated {
        return Err(StorageError::CrcMismatch);
    }

    Settings::decode(&record[HEADER_LEN..HEADER_LEN + SETTINGS_BODY_LEN])
}

/// フラッシュ上のSettingsストア
pub struct SettingsStore<F> {
    flash: F,
}

impl<F: ConfigFlash> SettingsStore<F> {
    pub fn new(flash: F) -> Self {
        Self { flash }
    }

    /// フラッシュから読み込む（失敗時は `settings` を変更しない）
    pub fn load(&mut self, settings: &mut Settings) -> Result<(), StorageError> {
        let mut record = [0u8; RECORD_LEN];
        self.flash.read(0, &mut record)?;

        match decode_record(&record).and_then(|loaded| loaded.validate().map(|()| loaded)) {
            Ok(loaded) => {
                *settings = loaded;
                info!("Settings loaded: version={}", CONFIG_VERSION);
                Ok(())
            }
            Err(e) => {
                error!("Settings record rejected: {:?}", e);
                Err(e)
            }
        }
    }

    /// フラッシュに書き込み、読み戻して検証する
    pub fn save(&mut self, settings: &Settings) -> Result<(), StorageError> {
        let record = encode_record(settings);

        self.flash.erase().inspect_err(|e| {
            error!("Flash erase failed: {:?}", e);
        })?;
        self.flash.write(0, &record).inspect_err(|e| {
            error!("Flash write failed: {:?}", e);
        })?;

        let mut readback = Settings::new();
        self.load(&mut readback)?;
        if readback != *settings {
            error!("Settings verify failed after write");
            return Err(StorageError::VerifyFailed);
        }

        info!("Settings saved ({} bytes)", RECORD_LEN);
        Ok(())
    }

    /// コンパイル時デフォルトに戻す
    pub fn defaults(&self, settings: &mut Settings) {
        *settings = Settings::new();
    }

    /// 読み込み、失敗時はデフォルトで初期化
    pub fn load_or_default(&mut self) -> Settings {
        let mut settings = Settings::new();
        if let Err(e) = self.load(&mut settings) {
            warn!("Failed to load settings: {:?}, initializing with defaults", e);
            if let Err(e) = self.save(&settings) {
                error!("Failed to store default settings: {:?}, using in-memory defaults", e);
            }
        }
        settings
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }
}
