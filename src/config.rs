//! Configuration module
//!
//! 固定パラメータ、実行時設定（Settings）とそのフラッシュ永続化を提供します。

pub mod params;
pub mod settings;
pub mod storage;

// params.rsから主要な定数を再エクスポート
pub use params::*;

pub use settings::{Settings, SETTINGS_BODY_LEN};
pub use storage::{crc32, ConfigFlash, SettingsStore, StorageError, CONFIG_MAGIC, CONFIG_VERSION};
