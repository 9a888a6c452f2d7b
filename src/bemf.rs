//! BEMFサンプリングとゼロクロス検出

pub mod battery;
pub mod filter;
pub mod sampler;

pub use battery::{BatteryCalibration, BatteryEstimator};
pub use filter::{FilterLengthTable, RunningFilter};
pub use sampler::{BemfSampler, BufferHalf, DmaStatus, DoubleBuffer, SampleContext};
