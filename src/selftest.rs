//! 起動時のパワー段セルフテスト
//!
//! 6つのFETを1つずつ単独でONにして相電圧を読み、
//! ハイサイドなら電源側へ、ローサイドならGND側へ相を引けるかを確認する。
//! 事前にゲート全OFFで電流ADCのゼロ点を取る。

use embedded_hal::delay::DelayNs;

use crate::commutation::{Gate, LegGates, Phase, PhaseGates};
use crate::config::selftest::{
    CURRENT_OFFSET_SAMPLES, HIGH_SIDE_MIN_COUNTS, LOW_SIDE_MAX_COUNTS, SETTLE_US,
};
use crate::hardware::{GateBridge, PhaseAdc};

/// 電圧表のバイト長（6 FET × 3相 × i16）
pub const VOLTAGES_LEN: usize = 36;

/// 試験対象のFET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fet {
    High(Phase),
    Low(Phase),
}

impl Fet {
    /// 試験順（電圧表の行順）
    pub const ALL: [Fet; 6] = [
        Fet::High(Phase::A),
        Fet::Low(Phase::A),
        Fet::High(Phase::B),
        Fet::Low(Phase::B),
        Fet::High(Phase::C),
        Fet::Low(Phase::C),
    ];

    pub fn phase(self) -> Phase {
        match self {
            Fet::High(p) | Fet::Low(p) => p,
        }
    }

    /// このFETだけをONにするゲート状態
    pub fn gates(self) -> PhaseGates {
        let mut gates = PhaseGates::ALL_OFF;
        let leg = match self {
            Fet::High(_) => LegGates {
                high: Gate::On,
                low: Gate::Off,
            },
            Fet::Low(_) => LegGates {
                high: Gate::Off,
                low: Gate::On,
            },
        };
        gates.legs[self.phase().index()] = leg;
        gates
    }
}

/// セルフテストのエラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SelfTestError {
    /// ハイサイドFETが相を引き上げられない
    DeadHighSide(Phase),

    /// ローサイドFETが相を引き下げられない
    DeadLowSide(Phase),
}

/// 測定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SelfTestReport {
    /// 電流ADCのゼロ点
    pub current_offset: i16,
    /// `Fet::ALL` の順に、各FET単独ON時の3相電圧
    pub voltages: [[i16; 3]; 6],
}

impl SelfTestReport {
    /// 判定（最初に見つかった故障FETを返す）
    pub fn check(&self) -> Result<(), SelfTestError> {
        for (fet, row) in Fet::ALL.iter().zip(self.voltages.iter()) {
            let v = row[fet.phase().index()];
            match *fet {
                Fet::High(p) if v < HIGH_SIDE_MIN_COUNTS => {
                    return Err(SelfTestError::DeadHighSide(p))
                }
                Fet::Low(p) if v > LOW_SIDE_MAX_COUNTS => {
                    return Err(SelfTestError::DeadLowSide(p))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// GetVoltages応答（i16 LE、行優先）
    pub fn encode(&self) -> [u8; VOLTAGES_LEN] {
        let mut data = [0u8; VOLTAGES_LEN];
        for (chunk, v) in data
            .chunks_exact_mut(2)
            .zip(self.voltages.iter().flatten())
        {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        data
    }
}

/// セルフテストを実行する（終了時はブリッジ無効）
pub fn run<B, A, D>(bridge: &mut B, adc: &mut A, delay: &mut D) -> SelfTestReport
where
    B: GateBridge,
    A: PhaseAdc,
    D: DelayNs,
{
    let mut report = SelfTestReport::default();

    bridge.write(&PhaseGates::ALL_OFF, 0);
    bridge.set_enabled(false);
    delay.delay_us(SETTLE_US);

    let mut sum: i32 = 0;
    for _ in 0..CURRENT_OFFSET_SAMPLES {
        sum += adc.read_current() as i32;
    }
    report.current_offset = (sum / CURRENT_OFFSET_SAMPLES as i32) as i16;

    bridge.set_enabled(true);
    let full = bridge.max_duty();
    for (fet, row) in Fet::ALL.iter().zip(report.voltages.iter_mut()) {
        bridge.write(&fet.gates(), full);
        delay.delay_us(SETTLE_US);
        for phase in Phase::ALL {
            row[phase.index()] = adc.read_phase(phase);
        }
        trace!("Self test {:?}: {:?}", fet, row);
    }

    bridge.write(&PhaseGates::ALL_OFF, 0);
    bridge.set_enabled(false);

    match report.check() {
        Ok(()) => info!("Self test passed (current offset {})", report.current_offset),
        Err(e) => error!("Self test failed: {:?}", e),
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAdc, MockBridge, MockDelay};
    use core::cell::Cell;
    use std::rc::Rc;

    fn rig() -> (MockBridge, MockAdc) {
        let shared = Rc::new(Cell::new(PhaseGates::ALL_OFF));
        let bridge = MockBridge::new(1_000).with_shared_gates(shared.clone());
        (bridge, MockAdc::new(shared))
    }

    #[test]
    fn test_healthy_bridge_passes() {
        let (mut bridge, mut adc) = rig();
        adc.current = 37;
        let mut delay = MockDelay::new();
        let report = run(&mut bridge, &mut adc, &mut delay);
        assert_eq!(report.check(), Ok(()));
        assert_eq!(report.current_offset, 37);
        assert_eq!(report.voltages[0], [MockAdc::SUPPLY, MockAdc::FLOATING, MockAdc::FLOATING]);
        assert_eq!(report.voltages[3][Phase::B.index()], 0);
        assert!(!bridge.enabled);
        assert_eq!(bridge.gates, PhaseGates::ALL_OFF);
        assert_eq!(delay.slept_us(), 7 * SETTLE_US as u64);
    }

    #[test]
    fn test_dead_fets_detected() {
        for (phase, high) in [(Phase::A, true), (Phase::B, false), (Phase::C, true)] {
            let (mut bridge, mut adc) = rig();
            adc.dead_fet = Some((phase, high));
            let report = run(&mut bridge, &mut adc, &mut MockDelay::new());
            let expected = if high {
                SelfTestError::DeadHighSide(phase)
            } else {
                SelfTestError::DeadLowSide(phase)
            };
            assert_eq!(report.check(), Err(expected));
        }
    }

    #[test]
    fn test_single_fet_gates() {
        let gates = Fet::Low(Phase::C).gates();
        assert_eq!(gates.leg(Phase::C).low, Gate::On);
        assert_eq!(gates.leg(Phase::C).high, Gate::Off);
        assert_eq!(gates.leg(Phase::A), LegGates::OFF);
    }

    #[test]
    fn test_voltage_encoding() {
        let mut report = SelfTestReport::default();
        report.voltages[0][0] = 0x0201;
        report.voltages[5][2] = -1;
        let data = report.encode();
        assert_eq!(&data[0..2], &[0x01, 0x02]);
        assert_eq!(&data[34..36], &[0xFF, 0xFF]);
    }
}
