//! グローバル共有状態管理
//!
//! コントローラは割り込み（TIM2, ADC1_2）とタスクの両方から触るので、
//! クリティカルセクションのMutexに入れて管理します。

use core::cell::RefCell;

use bemf_esc::{Controller, Reply};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;

use crate::hardware::{Tim1Bridge, Tim2Timer};

pub type EscController = Controller<Tim1Bridge, Tim2Timer>;

/// ESCコントローラ（初期化前は `None`）
static CONTROLLER: Mutex<CriticalSectionRawMutex, RefCell<Option<EscController>>> =
    Mutex::new(RefCell::new(None));

/// シリアル応答の送信キュー
pub static REPLY_QUEUE: Channel<CriticalSectionRawMutex, Reply, 4> = Channel::new();

/// コントローラを登録する
pub fn install(controller: EscController) {
    CONTROLLER.lock(|c| *c.borrow_mut() = Some(controller));
}

/// コントローラにアクセスする（未登録なら `None`）
///
/// `f` は割り込み禁止のまま実行されるので、待ちやフラッシュ書き込みを入れないこと。
pub fn with_controller<R>(f: impl FnOnce(&mut EscController) -> R) -> Option<R> {
    CONTROLLER.lock(|c| c.borrow_mut().as_mut().map(f))
}
