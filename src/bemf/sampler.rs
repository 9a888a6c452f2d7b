//! ADC完了割り込みで動くBEMFサンプラ
//!
//! ## 1バッチの処理順
//! 1. 最後の転流から消磁ブランキング時間内なら破棄
//! 2. 電流をIIR（1/128）で平滑化
//! 3. ステップが変わっていたらフィルタをリセットし、速度から窓長を再計算
//!    （同じステップで検出済みなら破棄）
//! 4. `diff = フロート相 - 3相平均`（ステップの極性と回転方向で符号反転）
//! 5. ボックスカーフィルタに積算
//! 6. 窓が満杯で積算値が正になったらZCD（タイムスタンプ付き）
//! 7. デューティが十分ならバッテリー電圧を推定

use super::battery::BatteryEstimator;
use super::filter::{FilterLengthTable, RunningFilter};
use crate::commutation::{CommutationStep, Direction};
use crate::config::{CURRENT_MA_PER_LSB, DEMAG_BLANKING_US};
use crate::hardware::{elapsed_us, AdcBatch};
use crate::telemetry::MotorTelemetry;

/// DMAダブルバッファのどちら側が有効か
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferHalf {
    First,
    Second,
}

/// DMA割り込みフラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaStatus {
    pub half_transfer: bool,
    pub transfer_complete: bool,
}

/// ダブルバッファの有効側の選択と取りこぼし検出
#[derive(Debug, Default)]
pub struct DoubleBuffer {
    last: Option<BufferHalf>,
    glitches: u32,
    unflagged: u32,
}

impl DoubleBuffer {
    pub const fn new() -> Self {
        Self {
            last: None,
            glitches: 0,
            unflagged: 0,
        }
    }

    /// フラグから有効なバッファ半分を選ぶ（どちらのフラグもなければ `None`）
    ///
    /// 前回と同じ側が選ばれた場合は切替の取りこぼしとして数える。
    /// フラグなしで捨てたバッチは `unflagged` に数える。
    pub fn select(&mut self, status: DmaStatus) -> Option<BufferHalf> {
        let half = if status.transfer_complete {
            BufferHalf::Second
        } else if status.half_transfer {
            BufferHalf::First
        } else {
            self.unflagged = self.unflagged.wrapping_add(1);
            return None;
        };
        if self.last == Some(half) {
            self.glitches = self.glitches.wrapping_add(1);
        }
        self.last = Some(half);
        Some(half)
    }

    pub fn glitches(&self) -> u32 {
        self.glitches
    }

    pub fn unflagged(&self) -> u32 {
        self.unflagged
    }
}

/// サンプル処理に必要な転流側の状態
#[derive(Debug, Clone, Copy)]
pub struct SampleContext {
    pub step: CommutationStep,
    pub direction: Direction,
    /// [μs]
    pub now_us: u32,
    /// [%]
    pub filter_length_scalar: u8,
}

/// BEMFゼロクロス検出器
pub struct BemfSampler {
    filter: RunningFilter,
    table: FilterLengthTable,
    battery: BatteryEstimator,
    prev_step: Option<CommutationStep>,
    demag_blanking_us: u32,
    current_offset: i16,
    calls_to_detect: u32,
    calls_to_last_detect: u32,
}

impl BemfSampler {
    pub fn new(battery: BatteryEstimator) -> Self {
        Self {
            filter: RunningFilter::new(),
            table: FilterLengthTable::new(),
            battery,
            prev_step: None,
            demag_blanking_us: DEMAG_BLANKING_US,
            current_offset: 0,
            calls_to_detect: 0,
            calls_to_last_detect: 0,
        }
    }

    /// 次のバッチで窓長を再計算させる
    pub fn reset(&mut self) {
        self.prev_step = None;
        self.filter.reset(1);
    }

    pub fn set_demag_blanking(&mut self, us: u32) {
        self.demag_blanking_us = us;
    }

    /// 電流ADCのゼロ点（セルフテストで取得）
    pub fn set_current_offset(&mut self, offset: i16) {
        self.current_offset = offset;
    }

    pub fn filter(&self) -> &RunningFilter {
        &self.filter
    }

    /// 直近のZCDまでに要したサンプル数
    pub fn calls_to_last_detect(&self) -> u32 {
        self.calls_to_last_detect
    }

    /// 1バッチ処理する。ZCDを検出したらそのタイムスタンプ [μs] を返す
    pub fn process(
        &mut self,
        batch: &AdcBatch,
        ctx: &SampleContext,
        telemetry: &mut MotorTelemetry,
    ) -> Option<u32> {
        if elapsed_us(ctx.now_us, telemetry.last_swap_time) < self.demag_blanking_us {
            return None;
        }

        let current = (batch.current as i32 - self.current_offset as i32) * CURRENT_MA_PER_LSB;
        telemetry.current_ma = (127 * telemetry.current_ma + current) / 128;

        if self.prev_step == Some(ctx.step) {
            if telemetry.detected {
                return None;
            }
        } else {
            self.prev_step = Some(ctx.step);
            self.calls_to_detect = 0;
            let length = self
                .table
                .window_length(telemetry.current_speed, ctx.filter_length_scalar);
            self.filter.reset(length);
        }

        self.calls_to_detect += 1;

        let high = batch.phase(ctx.step.high());
        self.battery
            .update(&mut telemetry.battery_mv, high, telemetry.duty_cycle);

        let undriven = batch.phase(ctx.step.undriven()) as i32;
        let reference = batch.phases.iter().map(|p| *p as i32).sum::<i32>() / 3;
        let diff = if ctx.step.bemf_rising(ctx.direction) {
            undriven - reference
        } else {
            reference - undriven
        };

        self.filter.push(diff);

        if self.filter.crossed() {
            telemetry.detected = true;
            self.calls_to_last_detect = self.calls_to_detect;
            return Some(ctx.now_us);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commutation::Phase;

    const NEUTRAL: i16 = 1_000;

    /// フロート相を中性点から `bemf` だけずらしたバッチ
    fn batch_for(step: CommutationStep, bemf: i16) -> AdcBatch {
        let mut phases = [NEUTRAL; 3];
        phases[step.undriven().index()] = NEUTRAL + bemf;
        AdcBatch::new(0, phases)
    }

    /// ステップの極性に合わせて、ステップ前半は負・後半は正になるBEMF
    fn expected_bemf(
        step: CommutationStep,
        direction: Direction,
        sample: u32,
        per_step: u32,
    ) -> i16 {
        let magnitude: i16 = if sample < per_step / 2 { -60 } else { 60 };
        if step.bemf_rising(direction) {
            magnitude
        } else {
            -magnitude
        }
    }

    fn ctx(step: CommutationStep, now_us: u32) -> SampleContext {
        SampleContext {
            step,
            direction: Direction::Forward,
            now_us,
            filter_length_scalar: 25,
        }
    }

    #[test]
    fn test_blanking_drops_batch() {
        let mut sampler = BemfSampler::new(BatteryEstimator::default());
        let mut telemetry = MotorTelemetry::new();
        telemetry.last_swap_time = 1_000;
        let batch = AdcBatch::new(100, [NEUTRAL; 3]);
        assert_eq!(
            sampler.process(&batch, &ctx(CommutationStep::AC, 1_050), &mut telemetry),
            None
        );
        assert_eq!(telemetry.current_ma, 0, "blanked batch must not touch current");
    }

    #[test]
    fn test_current_iir() {
        let mut sampler = BemfSampler::new(BatteryEstimator::default());
        let mut telemetry = MotorTelemetry::new();
        let batch = AdcBatch::new(128, [NEUTRAL; 3]);
        sampler.process(&batch, &ctx(CommutationStep::AB, 10_000), &mut telemetry);
        assert_eq!(telemetry.current_ma, 8);

        sampler.set_current_offset(128);
        sampler.process(&batch, &ctx(CommutationStep::AB, 10_010), &mut telemetry);
        assert_eq!(telemetry.current_ma, 7);
    }

    #[test]
    fn test_window_follows_speed_on_step_change() {
        let mut sampler = BemfSampler::new(BatteryEstimator::default());
        let mut telemetry = MotorTelemetry::new();
        telemetry.current_speed = 5_000;
        sampler.process(
            &batch_for(CommutationStep::AC, -10),
            &ctx(CommutationStep::AC, 10_000),
            &mut telemetry,
        );
        assert_eq!(sampler.filter().length(), 3);
    }

    #[test]
    fn test_one_zcd_per_commutation_period() {
        let mut sampler = BemfSampler::new(BatteryEstimator::default());
        let mut telemetry = MotorTelemetry::new();
        telemetry.current_speed = 5_000;

        const SAMPLES_PER_STEP: u32 = 40;
        const SAMPLE_PERIOD_US: u32 = 5;
        let mut now = 10_000u32;
        let mut step = CommutationStep::AB;
        let mut zcd_per_step = [0u32; 12];

        for count in zcd_per_step.iter_mut() {
            // 転流
            step = step.next(Direction::Forward);
            telemetry.detected = false;
            telemetry.last_swap_time = now;
            now += DEMAG_BLANKING_US;

            for sample in 0..SAMPLES_PER_STEP {
                let bemf = expected_bemf(step, Direction::Forward, sample, SAMPLES_PER_STEP);
                if sampler
                    .process(&batch_for(step, bemf), &ctx(step, now), &mut telemetry)
                    .is_some()
                {
                    *count += 1;
                    assert!(
                        sampler.filter().samples_averaged() as usize >= sampler.filter().length()
                    );
                }
                now += SAMPLE_PERIOD_US;
            }
        }

        assert!(zcd_per_step.iter().all(|c| *c == 1), "{:?}", zcd_per_step);
    }

    #[test]
    fn test_reverse_direction_flips_sign() {
        let mut sampler = BemfSampler::new(BatteryEstimator::default());
        let mut telemetry = MotorTelemetry::new();
        telemetry.current_speed = 5_000;
        let step = CommutationStep::AC;
        let reverse = SampleContext {
            direction: Direction::Reverse,
            ..ctx(step, 10_000)
        };
        // 正転で上昇するステップに上昇BEMFを与えても、逆転では検出しない
        for i in 0..10 {
            let r = SampleContext {
                now_us: 10_000 + i,
                ..reverse
            };
            assert_eq!(sampler.process(&batch_for(step, 80), &r, &mut telemetry), None);
        }
        assert!(!telemetry.detected);
    }

    #[test]
    fn test_detected_step_is_suppressed() {
        let mut sampler = BemfSampler::new(BatteryEstimator::default());
        let mut telemetry = MotorTelemetry::new();
        telemetry.current_speed = 5_000;
        let step = CommutationStep::AC;
        let mut hits = 0;
        for i in 0..20 {
            if sampler
                .process(&batch_for(step, 80), &ctx(step, 10_000 + i), &mut telemetry)
                .is_some()
            {
                hits += 1;
            }
        }
        assert_eq!(hits, 1);
        assert!(telemetry.detected);
    }

    #[test]
    fn test_battery_estimated_from_pwm_phase() {
        let mut sampler = BemfSampler::new(BatteryEstimator::default());
        let mut telemetry = MotorTelemetry::new();
        telemetry.duty_cycle = 5_000;
        let step = CommutationStep::AB;
        let mut phases = [NEUTRAL; 3];
        phases[Phase::B.index()] = 1_024;
        sampler.process(&AdcBatch::new(0, phases), &ctx(step, 10_000), &mut telemetry);
        // 1024カウント@50% = 2048カウント@100% 相当
        assert_eq!(telemetry.battery_mv, 7761);
    }

    #[test]
    fn test_double_buffer_glitch_counter() {
        let mut buffer = DoubleBuffer::new();
        let half = DmaStatus {
            half_transfer: true,
            transfer_complete: false,
        };
        let full = DmaStatus {
            half_transfer: false,
            transfer_complete: true,
        };
        assert_eq!(buffer.select(half), Some(BufferHalf::First));
        assert_eq!(buffer.select(full), Some(BufferHalf::Second));
        assert_eq!(buffer.glitches(), 0);
        assert_eq!(buffer.select(full), Some(BufferHalf::Second));
        assert_eq!(buffer.glitches(), 1);
        assert_eq!(buffer.unflagged(), 0);
        assert_eq!(buffer.select(DmaStatus::default()), None);
        assert_eq!(buffer.unflagged(), 1);
        assert_eq!(buffer.glitches(), 1);
    }
}
