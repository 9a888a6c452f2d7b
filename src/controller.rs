//! ESCコントローラ
//!
//! ステートマシン・テレメトリ・設定・ドライバ・サンプラを1つの所有コンテキストにまとめる。
//! 割り込み/タスクからは次の入口で呼ばれる:
//! - [`Controller::on_adc_batch`]: ADC DMA完了（BEMFサンプリング、ZCD注入）
//! - [`Controller::on_compare_match`]: 転流タイマーのコンペアマッチ（予約イベント注入）
//! - [`Controller::tick`]: 低優先度の周期タスク（アーム/停止判定、電流制限、ステータス）
//! - [`Controller::handle_command`]: シリアルコマンド

mod commands;
mod entry;
mod supervisor;

pub use commands::{Reply, REPLY_CAPACITY};

use entry::ArmTone;

use crate::bemf::{
    BatteryCalibration, BatteryEstimator, BemfSampler, DmaStatus, DoubleBuffer, SampleContext,
};
use crate::capture::CaptureLog;
use crate::commutation::DriveMode;
use crate::config::Settings;
use crate::hardware::{AdcBatch, CommutationTimer, GateBridge};
use crate::input::ControlInput;
use crate::motor_driver::{DriverConfig, PhaseDriver};
use crate::protocol::SERIAL_NUMBER_LEN;
use crate::selftest::SelfTestReport;
use crate::state_machine::{cascades, next_state, Event, State};
use crate::telemetry::{Diagnostics, EscError, EscStatus, MotorTelemetry};

/// コントローラが使うハードウェア
pub struct Hardware<B, T> {
    pub bridge: B,
    pub timer: T,
}

pub struct Controller<B, T> {
    driver: PhaseDriver<B>,
    timer: T,
    settings: Settings,
    telemetry: MotorTelemetry,
    diagnostics: Diagnostics,
    error: EscError,
    status: EscStatus,
    state: State,
    last_event: Event,
    sampler: BemfSampler,
    buffers: DoubleBuffer,
    sampling: bool,
    arm_tone: Option<ArmTone>,
    input: ControlInput,
    capture: CaptureLog,
    self_test: SelfTestReport,
    serial_number: [u8; SERIAL_NUMBER_LEN],
    serial_logging: bool,
    save_requested: bool,
    arm_ticks: u32,
    zero_since_us: Option<u32>,
    last_tick_us: Option<u32>,
    total_current_mah: f32,
}

impl<B, T> Controller<B, T>
where
    B: GateBridge,
    T: CommutationTimer,
{
    /// コントローラを構築し、INITからWAIT_FOR_ARMまで進める
    pub fn init(
        hw: Hardware<B, T>,
        settings: Settings,
        calibration: BatteryCalibration,
    ) -> Self {
        let mut controller = Self {
            driver: PhaseDriver::new(hw.bridge),
            timer: hw.timer,
            settings,
            telemetry: MotorTelemetry::new(),
            diagnostics: Diagnostics::default(),
            error: EscError::None,
            status: EscStatus::default(),
            state: State::Init,
            last_event: Event::Auto,
            sampler: BemfSampler::new(BatteryEstimator::new(calibration)),
            buffers: DoubleBuffer::new(),
            sampling: false,
            arm_tone: None,
            input: ControlInput::new(),
            capture: CaptureLog::new(),
            self_test: SelfTestReport::default(),
            serial_number: [0; SERIAL_NUMBER_LEN],
            serial_logging: false,
            save_requested: false,
            arm_ticks: 0,
            zero_since_us: None,
            last_tick_us: None,
            total_current_mah: 0.0,
        };
        info!("ESC controller init");
        if let Some(event) = controller.run_entry(State::Init) {
            controller.inject_event(event);
        }
        controller
    }

    /// Identifyで返すシリアル番号
    pub fn with_serial_number(mut self, serial_number: [u8; SERIAL_NUMBER_LEN]) -> Self {
        self.serial_number = serial_number;
        self
    }

    /// セルフテスト結果を反映（電流ゼロ点と電圧表）
    pub fn set_self_test(&mut self, report: SelfTestReport) {
        self.sampler.set_current_offset(report.current_offset);
        self.self_test = report;
    }

    /// イベントを即時に処理する
    ///
    /// 次の状態を決めてから入場処理を呼ぶ。入場処理が返した後続イベントと
    /// AUTO遷移は同じ呼び出しの中で順に処理する。
    pub fn inject_event(&mut self, event: Event) {
        let mut pending = Some(event);
        while let Some(event) = pending {
            let next = self.transition(event);
            pending = self.run_entry(next);
        }
    }

    /// 状態の読み書きは割り込み禁止区間で行う
    fn transition(&mut self, event: Event) -> State {
        let (prev, next) = critical_section::with(|_| {
            let prev = self.state;
            let next = next_state(prev, event);
            if next == State::Fault {
                self.diagnostics.pre_fault_state = prev;
                self.diagnostics.pre_fault_event = event;
                self.diagnostics.faults = self.diagnostics.faults.wrapping_add(1);
            }
            self.last_event = event;
            self.state = next;
            (prev, next)
        });
        if next == State::Fault {
            if self.error == EscError::None {
                self.error = EscError::Fault;
            }
            error!(
                "FAULT: {:?} on {:?} (error {:?}, total {})",
                prev, event, self.error, self.diagnostics.faults
            );
        } else {
            debug!("{:?} --{:?}--> {:?}", prev, event, next);
        }
        next
    }

    /// 入場処理を実行し、後続イベント（なければAUTO遷移）を返す
    fn run_entry(&mut self, entered: State) -> Option<Event> {
        let follow_up = self.enter(entered);
        follow_up.or_else(|| cascades(entered).then_some(Event::Auto))
    }

    /// コンペアマッチ割り込み: 予約イベントを注入
    pub fn on_compare_match(&mut self) {
        if let Some(event) = self.telemetry.scheduled.take() {
            self.inject_event(event);
        }
    }

    /// ADC DMA割り込み: 1バッチ処理し、ZCDならイベントを注入
    pub fn on_adc_batch(&mut self, dma: DmaStatus, batch: &AdcBatch) {
        let selected = self.buffers.select(dma);
        self.diagnostics.bad_flips = self.buffers.glitches();
        self.diagnostics.unflagged_batches = self.buffers.unflagged();
        if selected.is_none() {
            trace!("ADC batch without HT/TC flag dropped");
            return;
        }
        self.capture.record(batch);

        if !self.sampling {
            return;
        }
        let ctx = SampleContext {
            step: self.driver.step(),
            direction: self.driver.direction(),
            now_us: self.timer.now_us(),
            filter_length_scalar: self.settings.filter_length_scalar,
        };
        if let Some(zcd_time) = self.sampler.process(batch, &ctx, &mut self.telemetry) {
            self.telemetry.last_zcd_time = zcd_time;
            self.diagnostics.total_zcd = self.diagnostics.total_zcd.wrapping_add(1);
            self.inject_event(Event::Zcd);
        }
    }

    /// ドライバ初期化パラメータ
    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            mode: DriveMode::LowOnPwmHigh,
            direction: self.settings.direction,
            pwm_frequency_hz: self.settings.pwm_freq as u32,
        }
    }

    fn schedule(&mut self, event: Event, delay_us: u32) {
        self.telemetry
            .scheduled
            .schedule(&mut self.timer, event, delay_us);
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn last_event(&self) -> Event {
        self.last_event
    }

    pub fn error(&self) -> EscError {
        self.error
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn telemetry(&self) -> &MotorTelemetry {
        &self.telemetry
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn status(&self) -> &EscStatus {
        &self.status
    }

    pub fn driver(&self) -> &PhaseDriver<B> {
        &self.driver
    }

    pub fn input_mut(&mut self) -> &mut ControlInput {
        &mut self.input
    }

    pub fn capture_mut(&mut self) -> &mut CaptureLog {
        &mut self.capture
    }

    pub fn serial_logging(&self) -> bool {
        self.serial_logging
    }

    /// RCパルス入力のエッジ
    pub fn on_pulse_edge(&mut self, rising: bool) {
        let now = self.timer.now_us();
        let settings = self.settings;
        self.input.pulse_mut().on_edge(rising, now, &settings);
    }
}
