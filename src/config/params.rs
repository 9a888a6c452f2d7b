//! モーター制御の固定パラメータとデフォルト値
//!
//! 単位は各定数のドキュメントに記載する。デューティは `HW_MAX_DUTY` を100%とする整数、
//! 速度は電気角RPM（1ステップ間隔 [μs] から `SPEED_SCALE / interval` で算出）。

/// ハードウェア最大デューティ（0.01%単位、10000 = 100%）
pub const HW_MAX_DUTY: i32 = 10_000;

/// PID演算の固定小数点スケール（PID_SCALE = デューティ100%）
pub const PID_SCALE: i32 = 10_000;

/// ステップ間隔 [μs] → 電気角RPM の変換係数（60e6 / 6ステップ）
pub const SPEED_SCALE: u32 = 10_000_000;

/// ランニングフィルタの最大窓長 [サンプル]
pub const MAX_RUNNING_FILTER: usize = 512;

/// 転流直後の消磁ブランキング時間 [μs]
pub const DEMAG_BLANKING_US: u32 = 70;

/// フィルタ長テーブル参照時の速度上限 [RPM]
pub const FILTER_SPEED_CLAMP_RPM: u32 = 8_500;

/// 保存するステップ間隔の数（移動平均）
pub const NUM_STORED_SWAP_INTERVALS: usize = 3;

/// 電流ADC 1LSBあたりの電流 [mA]
pub const CURRENT_MA_PER_LSB: i32 = 8;

/// バッテリー電圧推定を行う最小デューティ（5%）
pub const BATTERY_ESTIMATE_MIN_DUTY: i32 = HW_MAX_DUTY / 20;

/// Kv推定を行う最小デューティ（5%）
pub const KV_ESTIMATE_MIN_DUTY: i32 = HW_MAX_DUTY / 20;

/// ZCD待ちタイムアウト = 平滑化ステップ間隔 × この値
pub const ZCD_TIMEOUT_MULTIPLIER: u32 = 4;

/// 閉ループで許容する連続ZCD欠落数（これを超えるとFAULT）
pub const MAX_CONSECUTIVE_MISSED: u32 = 10_000;

/// 制御則を有効化するまでに必要な連続検出数
pub const LOCK_DETECTIONS: u32 = 12;

/// スーパーバイザ周期 [μs]
pub const SUPERVISOR_PERIOD_US: u32 = 100;

/// 再アーム前にゼロ指令を観測し続ける必要があるスーパーバイザtick数
pub const ARM_DEBOUNCE_TICKS: u32 = 10_000;

/// 回転中にゼロ指令が続いたら停止するまでの時間 [μs]
pub const STOP_DEBOUNCE_US: u32 = 100_000;

/// 始動シーケンス
pub mod startup {
    /// ステータグラブのデューティ（5%）
    pub const GRAB_DUTY: i32 = 500;

    /// ステータグラブ時間 [ms]
    pub const GRAB_TIME_MS: u32 = 100;

    /// アクティブ始動でCLOSEDを出すのに必要な連続検出数
    pub const DETECTIONS_TO_CLOSE: u32 = 6;

    /// アクティブ始動で許容する強制転流の連続欠落数
    pub const MAX_MISSED: u32 = 200;

    /// アクティブ始動の強制転流1回あたりの加速量 [RPM]
    pub const SPEED_STEP_RPM: u16 = 10;
}

/// アーム確認音
pub mod tone {
    /// 音階 [Hz]（C6, E6, G6）
    pub const NOTES_HZ: [u16; 3] = [1_047, 1_319, 1_568];

    /// 1音の長さ [ms]
    pub const NOTE_MS: u32 = 120;

    /// 発音時のデューティ（3%）
    pub const DUTY: i32 = 300;
}

/// PWMパルス入力
pub mod input {
    /// 有効パルス幅の下限 [μs]
    pub const PULSE_MIN_VALID_US: u32 = 900;

    /// 有効パルス幅の上限 [μs]
    pub const PULSE_MAX_VALID_US: u32 = 2_200;

    /// パルスが途絶えてから指令なしとみなすまでの時間 [μs]
    pub const TIMEOUT_US: u32 = 100_000;
}

/// ゲートセルフテスト
pub mod selftest {
    /// ハイサイドON時に相電圧が超えるべきADC値
    pub const HIGH_SIDE_MIN_COUNTS: i16 = 1_000;

    /// ローサイドON時に相電圧が下回るべきADC値
    pub const LOW_SIDE_MAX_COUNTS: i16 = 30;

    /// FET切替後の安定待ち [μs]
    pub const SETTLE_US: u32 = 1_000;

    /// 電流オフセット取得の平均回数
    pub const CURRENT_OFFSET_SAMPLES: u32 = 64;
}

/// ADCキャプチャログ
pub mod capture {
    /// バックバッファサイズ [byte]
    pub const LOG_BYTES: usize = 12_048;
}

/// バッテリー電圧推定（ハードウェアリビジョン依存）
pub mod battery {
    /// 分圧比の分子
    pub const DIVIDER_NUM: u32 = 127;

    /// 分圧比の分母
    pub const DIVIDER_DEN: u32 = 27;

    /// ADCフルスケール [mV]
    pub const ADC_FULL_SCALE_MV: u32 = 3_300;

    /// ADC分解能（12ビット）
    pub const ADC_COUNTS: u32 = 4_096;
}

/// Settingsのデフォルト値
pub mod defaults {
    pub const RISING_KP: i16 = 5;
    pub const FALLING_KP: i16 = 5;
    pub const KI: i16 = 1;
    /// 電気角RPM/V
    pub const KV: u16 = 7_000;
    /// PID_SCALE単位（-5%）
    pub const KFF2: i16 = -500;
    pub const ILIM: i16 = 500;
    /// [RPM]
    pub const MAX_ERROR: i16 = 1_000;
    pub const MAX_DC_CHANGE: i16 = 1_000;
    pub const MIN_DC: i16 = 0;
    pub const MAX_DC: i16 = 9_000;
    /// [RPM]
    pub const INITIAL_STARTUP_SPEED: u16 = 100;
    /// [RPM]
    pub const FINAL_STARTUP_SPEED: u16 = 400;
    pub const STARTUP_CURRENT_TARGET: u16 = 20;
    /// 1/60 電気角周期単位
    pub const COMMUTATION_PHASE: i8 = 23;
    /// [μs]
    pub const COMMUTATION_OFFSET: i16 = 0;
    /// [μs]
    pub const PWM_MIN: u16 = 1_050;
    /// [μs]
    pub const PWM_MAX: u16 = 2_050;
    pub const RPM_MIN: u16 = 400;
    pub const RPM_MAX: u16 = 7_400;
    /// [Hz]
    pub const PWM_FREQ: u16 = 20_000;
    /// [mA]
    pub const SOFT_CURRENT_LIMIT: u16 = 30_000;
    /// [mA]
    pub const HARD_CURRENT_LIMIT: u16 = 23_500;
    /// [%]
    pub const FILTER_LENGTH_SCALAR: u8 = 25;
    /// [RPM]
    pub const BRAKE_ENGAGE_ERROR: i16 = -300;
    /// [RPM]
    pub const BRAKE_RELEASE_ERROR: i16 = -100;
    pub const STARTUP_DUTY: i16 = 800;
}
