//! シリアル通信タスク
//!
//! USART2（PA2: TX, PA3: RX）でコマンドを受け、応答とログフレームを送ります。

use bemf_esc::protocol::Parser;
use bemf_esc::Reply;
use embassy_futures::select::{select, Either};
use embassy_stm32::mode::Async;
use embassy_stm32::usart::{UartRx, UartTx};
use embassy_time::{Duration, Ticker};

use crate::state::{with_controller, REPLY_QUEUE};

/// 受信バッファサイズ
const RX_BUFFER_SIZE: usize = 128;

/// キャプチャログ送信の1チャンク
const LOG_CHUNK_SIZE: usize = 64;

/// 受信タスク
///
/// 受信バイトをパーサに流し、完成したコマンドをコントローラで処理する。
#[embassy_executor::task]
pub async fn serial_rx_task(mut rx: UartRx<'static, Async>) {
    info!("Serial RX task started");

    let mut parser = Parser::new();
    let mut buffer = [0u8; RX_BUFFER_SIZE];

    loop {
        let len = match rx.read_until_idle(&mut buffer).await {
            Ok(len) => len,
            Err(e) => {
                warn!("UART RX error: {:?}", e);
                parser.reset();
                continue;
            }
        };

        for &byte in &buffer[..len] {
            let command = match parser.push(byte) {
                Some(Ok(command)) => command,
                Some(Err(e)) => {
                    warn!("Rejected frame: {:?}", e);
                    continue;
                }
                None => continue,
            };

            match with_controller(|c| c.handle_command(command)) {
                Some(Ok(Reply::None)) | None => {}
                Some(Ok(reply)) => REPLY_QUEUE.send(reply).await,
                Some(Err(e)) => warn!("Command failed: {:?}", e),
            }
        }
    }
}

/// 送信タスク
///
/// 応答を優先し、空いている間はシリアルログが有効なら1msごとにログフレームを送る。
#[embassy_executor::task]
pub async fn serial_tx_task(mut tx: UartTx<'static, Async>) {
    info!("Serial TX task started");

    let mut ticker = Ticker::every(Duration::from_millis(1));
    let mut ms_count: u32 = 0;

    loop {
        match select(REPLY_QUEUE.receive(), ticker.next()).await {
            Either::First(Reply::Data(bytes)) => {
                if let Err(e) = tx.write(&bytes).await {
                    warn!("UART TX error: {:?}", e);
                }
            }
            Either::First(Reply::CaptureLog) => send_capture_log(&mut tx).await,
            Either::First(Reply::None) => {}
            Either::Second(()) => {
                ms_count = ms_count.wrapping_add(1);
                let frame = with_controller(|c| c.log_frame(ms_count)).flatten();
                if let Some(frame) = frame {
                    if let Err(e) = tx.write(&frame).await {
                        warn!("UART TX error: {:?}", e);
                    }
                }
            }
        }
    }
}

/// キャプチャログを全部送る
async fn send_capture_log(tx: &mut UartTx<'static, Async>) {
    let mut chunk = [0u8; LOG_CHUNK_SIZE];
    let mut total = 0usize;
    loop {
        let len = with_controller(|c| c.capture_mut().read_chunk(&mut chunk)).unwrap_or(0);
        if len == 0 {
            break;
        }
        if let Err(e) = tx.write(&chunk[..len]).await {
            warn!("UART TX error during log dump: {:?}", e);
            break;
        }
        total += len;
    }
    info!("ADC log sent: {} bytes", total);
}
