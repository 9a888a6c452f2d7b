//! ハードウェア抽象化
//!
//! コアが必要とするペリフェラル機能をトレイトとして定義する。
//! ファームウェア側でSTM32のタイマー/ADC/PWMに実装し、テストではモックを使う。
//! 待ち時間が必要なのはセルフテストだけで、`embedded_hal::delay::DelayNs` で注入する。

use crate::commutation::{Phase, PhaseGates};

/// 3相ハーフブリッジ
pub trait GateBridge {
    /// PWMコンペア値の最大値（100%デューティ）
    fn max_duty(&self) -> u16;

    /// ゲートドライバの有効/無効
    fn set_enabled(&mut self, enabled: bool);

    /// ゲート出力とコンペア値を反映
    fn write(&mut self, gates: &PhaseGates, compare: u16);

    /// PWM周波数を変更 [Hz]
    fn set_frequency(&mut self, hz: u32);
}

/// フリーランカウンタとコンペアマッチ割り込み
///
/// カウンタは1MHz（1カウント = 1μs）でラップアラウンドする。
pub trait CommutationTimer {
    /// 現在のカウンタ値 [μs]
    fn now_us(&self) -> u32;

    /// 指定時刻にコンペアマッチ割り込みを発生させる
    fn set_compare(&mut self, deadline_us: u32);
}

/// 単発ADC読み取り（セルフテスト用）
pub trait PhaseAdc {
    fn read_phase(&mut self, phase: Phase) -> i16;

    fn read_current(&mut self) -> i16;
}

/// ADC 1バッチ分のサンプル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdcBatch {
    /// シャント電流（生値）
    pub current: i16,
    /// A/B/C相電圧（生値）
    pub phases: [i16; 3],
}

impl AdcBatch {
    pub const fn new(current: i16, phases: [i16; 3]) -> Self {
        Self { current, phases }
    }

    pub fn phase(&self, phase: Phase) -> i16 {
        self.phases[phase.index()]
    }
}

/// 時刻差 [μs]（ラップアラウンド対応）
#[inline(always)]
pub fn elapsed_us(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

/// `deadline` が `now` 以前か（半周期以内の過去を「到達済み」とみなす）
#[inline(always)]
pub fn deadline_reached(now: u32, deadline: u32) -> bool {
    (now.wrapping_sub(deadline) as i32) >= 0
}
