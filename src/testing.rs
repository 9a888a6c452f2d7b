//! テスト用モック

use core::cell::Cell;
use std::rc::Rc;
use std::vec::Vec;

use embedded_hal::delay::DelayNs;

use crate::bemf::{BatteryCalibration, DmaStatus};
use crate::commutation::{Gate, Phase, PhaseGates};
use crate::config::{
    startup, tone, ConfigFlash, Settings, StorageError, ARM_DEBOUNCE_TICKS,
    SUPERVISOR_PERIOD_US,
};
use crate::controller::{Controller, Hardware};
use crate::hardware::{AdcBatch, CommutationTimer, GateBridge, PhaseAdc};
use crate::protocol::Command;

/// 出力を記録するブリッジ
pub struct MockBridge {
    pub max_duty: u16,
    pub enabled: bool,
    pub gates: PhaseGates,
    pub compare: u16,
    pub frequency_hz: u32,
    pub frequency_log: Vec<u32>,
    pub writes: u32,
    shared: Option<Rc<Cell<PhaseGates>>>,
}

impl MockBridge {
    pub fn new(max_duty: u16) -> Self {
        Self {
            max_duty,
            enabled: false,
            gates: PhaseGates::ALL_OFF,
            compare: 0,
            frequency_hz: 0,
            frequency_log: Vec::new(),
            writes: 0,
            shared: None,
        }
    }

    /// ゲート状態を `MockAdc` と共有する
    pub fn with_shared_gates(mut self, shared: Rc<Cell<PhaseGates>>) -> Self {
        self.shared = Some(shared);
        self
    }
}

impl GateBridge for MockBridge {
    fn max_duty(&self) -> u16 {
        self.max_duty
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn write(&mut self, gates: &PhaseGates, compare: u16) {
        self.gates = *gates;
        self.compare = compare;
        self.writes += 1;
        if let Some(shared) = &self.shared {
            shared.set(*gates);
        }
    }

    fn set_frequency(&mut self, hz: u32) {
        self.frequency_hz = hz;
        self.frequency_log.push(hz);
    }
}

/// 手動で進めるタイマー
#[derive(Clone, Default)]
pub struct MockTimer {
    now: Rc<Cell<u32>>,
    compare: Rc<Cell<Option<u32>>>,
}

impl MockTimer {
    pub fn new(start_us: u32) -> Self {
        let timer = Self::default();
        timer.now.set(start_us);
        timer
    }

    pub fn advance(&self, us: u32) {
        self.now.set(self.now.get().wrapping_add(us));
    }

    pub fn set_now(&self, us: u32) {
        self.now.set(us);
    }

    pub fn now(&self) -> u32 {
        self.now.get()
    }

    pub fn compare(&self) -> Option<u32> {
        self.compare.get()
    }
}

impl CommutationTimer for MockTimer {
    fn now_us(&self) -> u32 {
        self.now.get()
    }

    fn set_compare(&mut self, deadline_us: u32) {
        self.compare.set(Some(deadline_us));
    }
}

/// 待たずに要求時間だけ記録するディレイ
#[derive(Default)]
pub struct MockDelay {
    slept_ns: u64,
}

impl MockDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slept_us(&self) -> u64 {
        self.slept_ns / 1_000
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.slept_ns += ns as u64;
    }
}

/// RAM上のフラッシュページ
pub struct MemFlash {
    pub data: Vec<u8>,
    pub fail_write: bool,
}

impl MemFlash {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0xFF; size],
            fail_write: false,
        }
    }
}

impl ConfigFlash for MemFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(StorageError::FlashRead);
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.data.iter_mut().for_each(|b| *b = 0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        if self.fail_write {
            return Err(StorageError::FlashWrite);
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > self.data.len() {
            return Err(StorageError::FlashWrite);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// ブリッジのゲート状態から相電圧を返すADC
pub struct MockAdc {
    gates: Rc<Cell<PhaseGates>>,
    /// 導通しないFET（相, ハイサイドならtrue）
    pub dead_fet: Option<(Phase, bool)>,
    pub current: i16,
}

impl MockAdc {
    pub const SUPPLY: i16 = 2_000;
    pub const FLOATING: i16 = 500;

    pub fn new(gates: Rc<Cell<PhaseGates>>) -> Self {
        Self {
            gates,
            dead_fet: None,
            current: 0,
        }
    }
}

impl PhaseAdc for MockAdc {
    fn read_phase(&mut self, phase: Phase) -> i16 {
        let leg = self.gates.get().leg(phase);
        let dead_high = self.dead_fet == Some((phase, true));
        let dead_low = self.dead_fet == Some((phase, false));
        if leg.high == Gate::On && !dead_high {
            Self::SUPPLY
        } else if leg.low == Gate::On && !dead_low {
            0
        } else {
            Self::FLOATING
        }
    }

    fn read_current(&mut self) -> i16 {
        self.current
    }
}

pub type TestController = Controller<MockBridge, MockTimer>;

/// アーム確認音が鳴り終わるまでの周期処理回数
pub const ARM_TONE_TICKS: u32 =
    tone::NOTES_HZ.len() as u32 * tone::NOTE_MS * 1_000 / SUPERVISOR_PERIOD_US;

/// モックハードウェアに載せたコントローラ
pub struct Rig {
    pub controller: TestController,
    pub timer: MockTimer,
    second_half: bool,
}

impl Rig {
    pub fn new(settings: Settings) -> Self {
        let timer = MockTimer::new(0);
        let controller = Controller::init(
            Hardware {
                bridge: MockBridge::new(1_000),
                timer: timer.clone(),
            },
            settings,
            BatteryCalibration::default(),
        );
        Self {
            controller,
            timer,
            second_half: false,
        }
    }

    /// 周期タスクを `n` 回まわす
    pub fn tick(&mut self, n: u32) {
        for _ in 0..n {
            self.timer.advance(SUPERVISOR_PERIOD_US);
            self.controller.tick();
        }
    }

    /// DMAの半分/全体完了を交互に立ててADCバッチを渡す
    pub fn adc(&mut self, batch: AdcBatch) {
        self.second_half = !self.second_half;
        let status = DmaStatus {
            half_transfer: !self.second_half,
            transfer_complete: self.second_half,
        };
        self.controller.on_adc_batch(status, &batch);
    }

    pub fn command(&mut self, command: Command) {
        assert!(self.controller.handle_command(command).is_ok());
    }

    /// シリアル指令0でアームし、確認音が終わるまで進める
    pub fn arm(&mut self) {
        self.command(Command::EnableSerialControl);
        self.command(Command::SetSpeed(0));
        self.tick(ARM_DEBOUNCE_TICKS + ARM_TONE_TICKS);
    }

    /// アームしてから指令値を与えて始動させ、引き込みを終える
    pub fn start(&mut self, command: u16) {
        self.arm();
        self.command(Command::SetSpeed(command));
        self.tick(1);
        self.timer.advance(startup::GRAB_TIME_MS * 1_000);
        self.controller.on_compare_match();
    }
}
