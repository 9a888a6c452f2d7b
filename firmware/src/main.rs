#![no_std]
#![no_main]

mod fmt;
mod hardware;
mod state;
mod tasks;

#[cfg(not(feature = "defmt"))]
use panic_halt as _;
#[cfg(feature = "defmt")]
use {defmt_rtt as _, panic_probe as _};

use bemf_esc::bemf::BatteryCalibration;
use bemf_esc::config::SettingsStore;
use bemf_esc::{selftest, Controller, Hardware};
use embassy_executor::Spawner;
use embassy_stm32::{
    adc::{Adc, AdcChannel, SampleTime},
    exti::ExtiInput,
    flash::Flash,
    gpio::{Level, Output, OutputType, Pull, Speed},
    time::Hertz,
    timer::{
        complementary_pwm::{ComplementaryPwm, ComplementaryPwmPin},
        low_level::CountingMode,
        simple_pwm::PwmPin,
    },
    usart::{self, Uart},
};
use embassy_time::{Delay, Duration, Timer};

use hardware::{BlockingPhaseAdc, FlashPage, Irqs, Tim1Bridge, Tim2Timer};
use tasks::{led_task, pulse_input_task, serial_rx_task, serial_tx_task, supervisor_task};

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    // ハードウェア初期化
    let config = hardware::create_clock_config();
    let p = embassy_stm32::init(config);

    info!("═══════════════════════════════════════════════════════");
    info!("    Sensorless BLDC ESC • STM32G431VB @ 170MHz");
    info!("═══════════════════════════════════════════════════════");

    // 設定をフラッシュから読み込み（失敗時はデフォルトで初期化）
    info!("Loading settings from flash...");
    let mut store = SettingsStore::new(FlashPage::new(Flash::new_blocking(p.FLASH)));
    let settings = store.load_or_default();
    info!(
        "Settings: pwm={}Hz, kv={}, mode={}",
        settings.pwm_freq, settings.kv, settings.mode
    );

    // LED初期化＆タスク起動
    let led1 = Output::new(p.PC13, Level::High, Speed::Low);
    let led2 = Output::new(p.PC14, Level::High, Speed::Low);
    let led3 = Output::new(p.PC15, Level::High, Speed::Low);
    spawner.spawn(led_task(led1, led2, led3)).unwrap();

    // PWM初期化（TIM1、3相補完PWM）
    let pwm = ComplementaryPwm::new(
        p.TIM1,
        Some(PwmPin::new(p.PE9, OutputType::PushPull)),
        Some(ComplementaryPwmPin::new(p.PE8, OutputType::PushPull)),
        Some(PwmPin::new(p.PE11, OutputType::PushPull)),
        Some(ComplementaryPwmPin::new(p.PE10, OutputType::PushPull)),
        Some(PwmPin::new(p.PE13, OutputType::PushPull)),
        Some(ComplementaryPwmPin::new(p.PE12, OutputType::PushPull)),
        None,
        None,
        Hertz(settings.pwm_freq as u32),
        CountingMode::EdgeAlignedUp,
    );
    let mut bridge = Tim1Bridge::new(pwm);

    // ADC初期化（セルフテストは単発変換）
    let mut adc1 = Adc::new(p.ADC1);
    adc1.set_sample_time(SampleTime::CYCLES12_5);
    let mut phase_adc = BlockingPhaseAdc::new(
        adc1,
        p.PA0.degrade_adc(),
        [p.PC0.degrade_adc(), p.PC1.degrade_adc(), p.PC2.degrade_adc()],
    );

    // FETセルフテスト
    let report = selftest::run(&mut bridge, &mut phase_adc, &mut Delay);

    // コントローラ構築（INIT → WAIT_FOR_ARM）
    let timer = unsafe { Tim2Timer::init() };
    let mut controller = Controller::init(
        Hardware { bridge, timer },
        settings,
        BatteryCalibration::default(),
    )
    .with_serial_number(hardware::serial_number());
    controller.set_self_test(report);
    state::install(controller);

    // 連続サンプリング開始（以降はADC1_2割り込みでBEMF処理）
    unsafe {
        phase_adc.into_dma_sampling();
    }

    spawner.spawn(supervisor_task(store)).unwrap();

    // USART2初期化＆シリアルタスク起動
    let mut uart_config = usart::Config::default();
    uart_config.baudrate = 115_200;
    let uart = Uart::new(
        p.USART2,
        p.PA3,
        p.PA2,
        Irqs,
        p.DMA1_CH2,
        p.DMA1_CH3,
        uart_config,
    )
    .unwrap();
    let (tx, rx) = uart.split();
    spawner.spawn(serial_rx_task(rx)).unwrap();
    spawner.spawn(serial_tx_task(tx)).unwrap();

    // RCパルス入力（PB6）
    let pulse_pin = ExtiInput::new(p.PB6, p.EXTI6, Pull::Down);
    spawner.spawn(pulse_input_task(pulse_pin)).unwrap();

    info!("ESC ready, waiting for arm");

    // メインループ（将来の拡張用）
    loop {
        Timer::after(Duration::from_millis(100)).await;
    }
}
