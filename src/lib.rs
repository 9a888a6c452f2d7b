//! センサレス6ステップBLDC ESCのコア
//!
//! BEMFゼロクロス検出、転流ステートマシン、PID+フィードフォワードのデューティ制御。
//! ハードウェアは [`hardware`] のトレイト越しに扱うので、ホスト上でもテストできる。
#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod bemf;
pub mod capture;
pub mod commutation;
pub mod config;
pub mod control;
pub mod controller;
pub mod hardware;
pub mod input;
pub mod motor_driver;
pub mod protocol;
pub mod scheduler;
pub mod selftest;
pub mod state_machine;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use controller::{Controller, Hardware, Reply};
