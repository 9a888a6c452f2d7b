//! LED制御タスク
//!
//! ESCの状態をLED1-3で表示します。

use bemf_esc::state_machine::State;
use embassy_stm32::gpio::Output;
use embassy_time::{Duration, Timer};

use crate::state::with_controller;

/// LED制御タスク
///
/// - LED1: アーム待ち（点滅） / アーム済み（点灯）
/// - LED2: 回転中
/// - LED3: フォールト
#[embassy_executor::task]
pub async fn led_task(
    mut led1: Output<'static>,
    mut led2: Output<'static>,
    mut led3: Output<'static>,
) {
    info!("LED task started");

    let mut blink = false;
    loop {
        let state = with_controller(|c| c.state()).unwrap_or(State::Init);
        blink = !blink;

        let armed = !state.awaits_arm() && !matches!(state, State::Init | State::Fault);
        led1.set_level((armed || blink).into());
        led2.set_level(state.is_running().into());
        led3.set_level((state == State::Fault).into());

        Timer::after(Duration::from_millis(250)).await;
    }
}
