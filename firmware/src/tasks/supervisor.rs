//! 周期監視タスク

use bemf_esc::config::{SettingsStore, SUPERVISOR_PERIOD_US};
use embassy_time::{Duration, Ticker};

use crate::hardware::FlashPage;
use crate::state::with_controller;

/// `SUPERVISOR_PERIOD_US` ごとにコントローラの周期処理を回す
///
/// IDLE中の保存要求もここでフラッシュに書く（書き込みはロックの外）。
#[embassy_executor::task]
pub async fn supervisor_task(mut store: SettingsStore<FlashPage>) {
    info!("Supervisor task started");

    let mut ticker = Ticker::every(Duration::from_micros(SUPERVISOR_PERIOD_US as u64));

    loop {
        ticker.next().await;

        let pending = with_controller(|c| {
            c.tick();
            c.take_save_request()
        })
        .flatten();

        if let Some(settings) = pending {
            match store.save(&settings) {
                Ok(()) => info!("Settings saved"),
                Err(e) => error!("Settings save failed: {:?}", e),
            }
        }
    }
}
