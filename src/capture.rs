//! ADCキャプチャログ
//!
//! 有効化するとADCバッチ（電流 + 3相、i16 LE × 4 = 8 bytes）を満杯になるまで記録する。
//! 満杯になったログは一度だけ読み出せ、読み出し後は待機状態に戻る。

use heapless::Vec;

use crate::config::capture::LOG_BYTES;
use crate::hardware::AdcBatch;
use crate::protocol::ProtocolError;

/// 1バッチあたりのバイト数
pub const BATCH_BYTES: usize = 8;

/// キャプチャの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CaptureState {
    #[default]
    Idle,
    Capturing,
    Full,
    /// 読み出し中
    Echo,
}

pub struct CaptureLog {
    buffer: Vec<u8, LOG_BYTES>,
    state: CaptureState,
    sent: usize,
}

impl Default for CaptureLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureLog {
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            state: CaptureState::Idle,
            sent: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// ログを空にして記録開始
    pub fn start(&mut self) {
        self.buffer.clear();
        self.sent = 0;
        self.state = CaptureState::Capturing;
        info!("ADC capture started ({} bytes)", LOG_BYTES);
    }

    /// 記録中なら1バッチ追記
    pub fn record(&mut self, batch: &AdcBatch) {
        if self.state != CaptureState::Capturing {
            return;
        }
        let words = [batch.current, batch.phases[0], batch.phases[1], batch.phases[2]];
        for word in words {
            if self.buffer.extend_from_slice(&word.to_le_bytes()).is_err() {
                break;
            }
        }
        if self.buffer.capacity() - self.buffer.len() < BATCH_BYTES {
            self.state = CaptureState::Full;
            info!("ADC capture full");
        }
    }

    /// 読み出しを開始（満杯でなければエラー）
    pub fn begin_fetch(&mut self) -> Result<(), ProtocolError> {
        if self.state != CaptureState::Full {
            return Err(ProtocolError::LogNotReady);
        }
        self.state = CaptureState::Echo;
        self.sent = 0;
        Ok(())
    }

    /// 未送信分を `out` に詰め、詰めたバイト数を返す
    ///
    /// 全て送り終えたら待機状態に戻る。
    pub fn read_chunk(&mut self, out: &mut [u8]) -> usize {
        if self.state != CaptureState::Echo {
            return 0;
        }
        let remaining = &self.buffer[self.sent..];
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.sent += n;
        if self.sent >= self.buffer.len() {
            self.state = CaptureState::Idle;
            self.sent = 0;
            debug!("ADC capture log sent");
        }
        n
    }

    /// 送信失敗時などに読み出しを打ち切る
    pub fn abort(&mut self) {
        self.state = CaptureState::Idle;
        self.sent = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> CaptureLog {
        let mut log = CaptureLog::new();
        log.start();
        let mut n = 0i16;
        while log.state() == CaptureState::Capturing {
            log.record(&AdcBatch::new(n, [n, n + 1, n + 2]));
            n += 1;
        }
        log
    }

    #[test]
    fn test_idle_log_ignores_batches() {
        let mut log = CaptureLog::new();
        log.record(&AdcBatch::new(1, [2, 3, 4]));
        assert!(log.is_empty());
    }

    #[test]
    fn test_fills_to_capacity() {
        let log = filled();
        assert_eq!(log.state(), CaptureState::Full);
        assert_eq!(log.len(), LOG_BYTES / BATCH_BYTES * BATCH_BYTES);
    }

    #[test]
    fn test_batch_layout() {
        let mut log = CaptureLog::new();
        log.start();
        log.record(&AdcBatch::new(-1, [0x0102, 3, 4]));
        assert_eq!(&log.buffer[..4], &[0xFF, 0xFF, 0x02, 0x01]);
        assert_eq!(log.len(), BATCH_BYTES);
    }

    #[test]
    fn test_fetch_requires_full_log() {
        let mut log = CaptureLog::new();
        assert_eq!(log.begin_fetch(), Err(ProtocolError::LogNotReady));
        log.start();
        assert_eq!(log.begin_fetch(), Err(ProtocolError::LogNotReady));
    }

    #[test]
    fn test_fetch_streams_once() {
        let mut log = filled();
        log.begin_fetch().unwrap();
        let mut total = 0;
        let mut chunk = [0u8; 64];
        loop {
            let n = log.read_chunk(&mut chunk);
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, log.len());
        assert_eq!(log.state(), CaptureState::Idle);
        assert_eq!(log.begin_fetch(), Err(ProtocolError::LogNotReady));
    }
}
