//! RCパルス入力タスク

use embassy_stm32::exti::ExtiInput;

use crate::state::with_controller;

/// 入力ピンの両エッジをコントローラに渡す
#[embassy_executor::task]
pub async fn pulse_input_task(mut pin: ExtiInput<'static>) {
    info!("Pulse input task started");

    loop {
        pin.wait_for_any_edge().await;
        let rising = pin.is_high();
        with_controller(|c| c.on_pulse_edge(rising));
    }
}
