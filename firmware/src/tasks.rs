//! タスクモジュール
//!
//! 各タスクの実装を分離して管理します。

pub mod led;
pub mod pulse_input;
pub mod serial;
pub mod supervisor;

// タスク関数を再エクスポート
pub use led::led_task;
pub use pulse_input::pulse_input_task;
pub use serial::{serial_rx_task, serial_tx_task};
pub use supervisor::supervisor_task;
