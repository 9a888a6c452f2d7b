//! ハードウェア層
//!
//! コアのトレイトをSTM32G431VBに実装します。
//!
//! ## 割り当て
//! - TIM1 CH1-3 / CH1N-3N: A/B/C相ハーフブリッジ（TRGOでADCをトリガ）
//! - TIM2: 1MHz 32bitフリーランカウンタ、CC1で転流イベント
//! - ADC1 + DMA1_CH1: 電流（PA0）+ 相電圧（PC0/PC1/PC2）を循環DMAでダブルバッファへ
//!   （DMA割り込みはembassyが持つので、シーケンス終了はADC1_2割り込みで拾う）
//! - フラッシュ最終ページ（0x0801F800）: 設定レコード

use core::cell::UnsafeCell;

use bemf_esc::bemf::DmaStatus;
use bemf_esc::commutation::{Gate, LegGates, Phase, PhaseGates};
use bemf_esc::config::{ConfigFlash, StorageError};
use bemf_esc::hardware::{AdcBatch, CommutationTimer, GateBridge, PhaseAdc};
use bemf_esc::protocol::SERIAL_NUMBER_LEN;
use embassy_stm32::{
    adc::{Adc, AnyAdcChannel},
    bind_interrupts,
    flash::{Blocking, Flash, WRITE_SIZE},
    pac, peripherals,
    time::Hertz,
    timer::{complementary_pwm::ComplementaryPwm, Channel},
    usart, Config,
};

use crate::state;

bind_interrupts!(pub struct Irqs {
    USART2 => usart::InterruptHandler<peripherals::USART2>;
});

/// PWMデッドタイム
pub const PWM_DEAD_TIME: u16 = 40;

/// TIM2プリスケーラ（170MHz / 170 = 1MHz）
const TIMER_PRESCALER: u16 = 170 - 1;

/// 設定ページのフラッシュ先頭からのオフセット（128KB - 2KB）
const CONFIG_OFFSET: u32 = 0x1F800;

/// 設定ページサイズ
const CONFIG_PAGE_SIZE: u32 = 2048;

/// 1バッチの変換数（電流 + 3相）
const BATCH_WORDS: usize = 4;

/// ADC1の変換チャネル（電流, A, B, C）
const ADC_SEQUENCE: [u8; BATCH_WORDS] = [1, 6, 7, 8];

/// DMAMUXのADC1リクエスト番号
const ADC1_DMA_REQUEST: u8 = 5;

/// ADC12外部トリガ: TIM1_TRGO
const ADC_EXTSEL_TIM1_TRGO: u8 = 9;

const PHASE_CHANNELS: [Channel; 3] = [Channel::Ch1, Channel::Ch2, Channel::Ch3];

/// RCCクロック設定を初期化
///
/// HSI → PLL（÷4 × 85 ÷ 2）で170MHz生成
pub fn create_clock_config() -> Config {
    let mut config = Config::default();
    {
        use embassy_stm32::rcc::mux::{Adcsel, ClockMux};
        use embassy_stm32::rcc::{Pll, PllMul, PllPreDiv, PllRDiv, PllSource, Sysclk};

        config.rcc.hsi = true;
        config.rcc.pll = Some(Pll {
            source: PllSource::HSI,
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL85,
            divp: None,
            divq: None,
            divr: Some(PllRDiv::DIV2),
        });
        config.rcc.sys = Sysclk::PLL1_R;

        let mut clock_mux = ClockMux::default();
        clock_mux.adc12sel = Adcsel::SYS;
        config.rcc.mux = clock_mux;
    }
    config
}

/// TIM1の3相補完PWMをハーフブリッジとして扱う
///
/// 周波数とコンペア値はembassyのドライバ経由、レグごとの出力モードはPACで直接設定する。
pub struct Tim1Bridge {
    pwm: ComplementaryPwm<'static, peripherals::TIM1>,
}

impl Tim1Bridge {
    pub fn new(mut pwm: ComplementaryPwm<'static, peripherals::TIM1>) -> Self {
        for ch in PHASE_CHANNELS {
            pwm.disable(ch);
        }
        pwm.set_dead_time(PWM_DEAD_TIME);

        // 更新イベントをTRGOに出してADCをPWM周期に同期させる
        pac::TIM1
            .cr2()
            .modify(|w| w.set_mms(pac::timer::vals::Mms::UPDATE));

        let mut bridge = Self { pwm };
        bridge.write(&PhaseGates::ALL_OFF, 0);
        bridge
    }
}

/// レグのゲート指定 → (出力比較モード, CCxE, CCxNE)
fn leg_output(leg: LegGates) -> (pac::timer::vals::Ocm, bool, bool) {
    use pac::timer::vals::Ocm;

    match (leg.high, leg.low) {
        (Gate::Off, Gate::Off) => (Ocm::FORCE_INACTIVE, false, false),
        (Gate::On, Gate::Off) => (Ocm::FORCE_ACTIVE, true, false),
        (Gate::Off, Gate::On) => (Ocm::FORCE_INACTIVE, true, true),
        (Gate::Pwm, Gate::Off) => (Ocm::PWM_MODE1, true, false),
        (Gate::Pwm, Gate::PwmComplement) => (Ocm::PWM_MODE1, true, true),
        (Gate::Off, Gate::PwmComplement) => (Ocm::PWM_MODE1, false, true),
        (Gate::Off, Gate::Pwm) => (Ocm::PWM_MODE2, false, true),
        (Gate::PwmComplement, Gate::Pwm) => (Ocm::PWM_MODE2, true, true),
        (Gate::PwmComplement, Gate::Off) => (Ocm::PWM_MODE2, true, false),
        // 上下同時導通になる組み合わせは出力しない
        _ => (Ocm::FORCE_INACTIVE, false, false),
    }
}

impl GateBridge for Tim1Bridge {
    fn max_duty(&self) -> u16 {
        self.pwm.get_max_duty()
    }

    fn set_enabled(&mut self, enabled: bool) {
        pac::TIM1.bdtr().modify(|w| w.set_moe(enabled));
    }

    fn write(&mut self, gates: &PhaseGates, compare: u16) {
        let tim1 = pac::TIM1;
        for (i, phase) in Phase::ALL.iter().enumerate() {
            let (mode, high, low) = leg_output(gates.leg(*phase));
            tim1.ccmr_output(i / 2).modify(|w| w.set_ocm(i % 2, mode));
            tim1.ccer().modify(|w| {
                w.set_cce(i, high);
                w.set_ccne(i, low);
            });
            self.pwm.set_duty(PHASE_CHANNELS[i], compare);
        }
    }

    fn set_frequency(&mut self, hz: u32) {
        self.pwm.set_frequency(Hertz(hz));
    }
}

/// TIM2フリーランカウンタ（1カウント = 1μs）
pub struct Tim2Timer {
    _private: (),
}

impl Tim2Timer {
    /// TIM2を1MHzで起動し、CC1割り込みを許可する
    ///
    /// # Safety
    /// PACを使用した直接的なレジスタ操作を含む
    pub unsafe fn init() -> Self {
        let rcc = pac::RCC;
        let tim2 = pac::TIM2;

        rcc.apb1enr1().modify(|w| w.set_tim2en(true));

        tim2.cr1().modify(|w| w.set_cen(false));
        tim2.psc().write_value(TIMER_PRESCALER);
        tim2.arr().write_value(u32::MAX);
        tim2.dier().modify(|w| w.set_ccie(0, false));
        tim2.cnt().write_value(0);
        tim2.sr().write(|w| w.0 = 0);
        tim2.egr().write(|w| w.set_ug(true));
        tim2.sr().write(|w| w.0 = 0);

        // 転流割り込みはADC DMAより高優先度
        unsafe {
            cortex_m::peripheral::NVIC::unmask(pac::Interrupt::TIM2);
            let mut cp = cortex_m::Peripherals::steal();
            cp.NVIC.set_priority(pac::Interrupt::TIM2, 0x10);
        }

        tim2.cr1().modify(|w| w.set_cen(true));
        info!("TIM2 commutation timer started (1MHz)");
        Self { _private: () }
    }
}

impl CommutationTimer for Tim2Timer {
    fn now_us(&self) -> u32 {
        pac::TIM2.cnt().read()
    }

    fn set_compare(&mut self, deadline_us: u32) {
        let tim2 = pac::TIM2;
        tim2.ccr(0).write_value(deadline_us);
        tim2.sr().modify(|w| w.set_ccif(0, false));
        tim2.dier().modify(|w| w.set_ccie(0, true));
    }
}

/// TIM2割り込み: 予約イベントを注入
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn TIM2() {
    let tim2 = pac::TIM2;
    if tim2.sr().read().ccif(0) {
        tim2.sr().modify(|w| w.set_ccif(0, false));
        tim2.dier().modify(|w| w.set_ccie(0, false));
        state::with_controller(|c| c.on_compare_match());
    }
}

/// セルフテスト用の単発ADC読み取り
pub struct BlockingPhaseAdc {
    adc: Adc<'static, peripherals::ADC1>,
    current: AnyAdcChannel<peripherals::ADC1>,
    phases: [AnyAdcChannel<peripherals::ADC1>; 3],
}

impl BlockingPhaseAdc {
    pub fn new(
        adc: Adc<'static, peripherals::ADC1>,
        current: AnyAdcChannel<peripherals::ADC1>,
        phases: [AnyAdcChannel<peripherals::ADC1>; 3],
    ) -> Self {
        Self {
            adc,
            current,
            phases,
        }
    }

    /// 連続変換に切り替える（embassyのADCドライバは手放す）
    ///
    /// # Safety
    /// PACを使用した直接的なレジスタ操作を含む
    pub unsafe fn into_dma_sampling(self) {
        // ドロップでADCが止まらないようにリークさせる
        core::mem::forget(self);
        start_adc_dma();
    }
}

impl PhaseAdc for BlockingPhaseAdc {
    fn read_phase(&mut self, phase: Phase) -> i16 {
        self.adc.blocking_read(&mut self.phases[phase.index()]) as i16
    }

    fn read_current(&mut self) -> i16 {
        self.adc.blocking_read(&mut self.current) as i16
    }
}

/// DMAの書き込み先（前半/後半 × 1バッチ）
#[repr(C, align(4))]
struct AdcBuffer(UnsafeCell<[u16; 2 * BATCH_WORDS]>);

// DMAとDMA割り込みからしか触らない
unsafe impl Sync for AdcBuffer {}

static ADC_BUFFER: AdcBuffer = AdcBuffer(UnsafeCell::new([0; 2 * BATCH_WORDS]));

/// ADC1をTIM1_TRGOトリガの4変換シーケンスにして、DMA1_CH1で循環転送する
unsafe fn start_adc_dma() {
    let rcc = pac::RCC;
    let adc = pac::ADC1;
    let dma = pac::DMA1;

    rcc.ahb1enr().modify(|w| {
        w.set_dma1en(true);
        w.set_dmamux1en(true);
    });
    pac::DMAMUX1
        .ccr(0)
        .write(|w| w.set_dmareq_id(ADC1_DMA_REQUEST));

    let ch = dma.ch(0);
    ch.cr().modify(|w| w.set_en(false));
    ch.par().write_value(adc.dr().as_ptr() as u32);
    ch.mar().write_value(ADC_BUFFER.0.get() as u32);
    ch.ndtr().write(|w| w.set_ndt((2 * BATCH_WORDS) as u16));
    ch.cr().write(|w| {
        w.set_dir(pac::bdma::vals::Dir::FROM_PERIPHERAL);
        w.set_minc(true);
        w.set_circ(true);
        w.set_psize(pac::bdma::vals::Size::BITS16);
        w.set_msize(pac::bdma::vals::Size::BITS16);
        w.set_en(true);
    });

    adc.sqr1().modify(|w| {
        w.set_l((BATCH_WORDS - 1) as u8);
        for (i, channel) in ADC_SEQUENCE.iter().enumerate() {
            w.set_sq(i, *channel);
        }
    });
    adc.cfgr().modify(|w| {
        w.set_dmaen(true);
        w.set_dmacfg(pac::adc::vals::Dmacfg::CIRCULAR);
        w.set_exten(pac::adc::vals::Exten::RISING_EDGE);
        w.set_extsel(ADC_EXTSEL_TIM1_TRGO);
    });
    adc.isr().write(|w| w.set_eos(true));
    adc.ier().modify(|w| w.set_eosie(true));

    unsafe {
        cortex_m::peripheral::NVIC::unmask(pac::Interrupt::ADC1_2);
        let mut cp = cortex_m::Peripherals::steal();
        cp.NVIC.set_priority(pac::Interrupt::ADC1_2, 0x20);
    }

    adc.cr().modify(|w| w.set_adstart(true));
    info!("ADC DMA sampling started");
}

/// DMAバッファの片側をバッチとして読む
fn read_batch(second_half: bool) -> AdcBatch {
    let offset = if second_half { BATCH_WORDS } else { 0 };
    let words = unsafe { core::ptr::read_volatile(ADC_BUFFER.0.get()) };
    let w = &words[offset..offset + BATCH_WORDS];
    AdcBatch::new(w[0] as i16, [w[1] as i16, w[2] as i16, w[3] as i16])
}

/// ADC1_2割り込み: シーケンス終了ごとに、DMAが埋め終えた側のバッチをサンプラへ渡す
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn ADC1_2() {
    let adc = pac::ADC1;
    if !adc.isr().read().eos() {
        return;
    }
    adc.isr().write(|w| w.set_eos(true));

    let dma = pac::DMA1;
    let isr = dma.isr().read();
    let status = DmaStatus {
        half_transfer: isr.htif(0),
        transfer_complete: isr.tcif(0),
    };
    dma.ifcr().write(|w| {
        w.set_htif(0, true);
        w.set_tcif(0, true);
        w.set_gif(0, true);
    });

    let batch = read_batch(status.transfer_complete);
    state::with_controller(|c| c.on_adc_batch(status, &batch));
}

/// フラッシュ最終ページ
pub struct FlashPage {
    flash: Flash<'static, Blocking>,
}

impl FlashPage {
    pub fn new(flash: Flash<'static, Blocking>) -> Self {
        Self { flash }
    }
}

impl ConfigFlash for FlashPage {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        self.flash
            .blocking_read(CONFIG_OFFSET + offset, buf)
            .map_err(|e| {
                error!("Flash read failed: {:?}", e);
                StorageError::FlashRead
            })
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.flash
            .blocking_erase(CONFIG_OFFSET, CONFIG_OFFSET + CONFIG_PAGE_SIZE)
            .map_err(|e| {
                error!("Flash erase failed: {:?}", e);
                StorageError::FlashErase
            })
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        // 書き込み単位（8バイト）に揃える
        let mut aligned = [0xFFu8; 128];
        if data.len() > aligned.len() {
            return Err(StorageError::InvalidSize);
        }
        let len = data.len().div_ceil(WRITE_SIZE) * WRITE_SIZE;
        aligned[..data.len()].copy_from_slice(data);

        self.flash
            .blocking_write(CONFIG_OFFSET + offset, &aligned[..len])
            .map_err(|e| {
                error!("Flash write failed: {:?}", e);
                StorageError::FlashWrite
            })
    }
}

/// 96bit UIDを16進ASCIIにしたシリアル番号（残りは0埋め）
pub fn serial_number() -> [u8; SERIAL_NUMBER_LEN] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut serial = [0u8; SERIAL_NUMBER_LEN];
    for (i, byte) in embassy_stm32::uid::uid().iter().enumerate() {
        serial[2 * i] = HEX[(byte >> 4) as usize];
        serial[2 * i + 1] = HEX[(byte & 0x0F) as usize];
    }
    serial
}
