//! 単一スロットの転流スケジューラ
//!
//! 「N μs後にイベントを発行」という要求をコンペアマッチ割り込みの期限に変換する。
//! 保留できるイベントは1つだけで、新しい予約は前の期限を上書きする（キャンセル手段は上書きのみ）。
//! `armed` フラグで未消費の期限と消費済みの期限を区別する。

use crate::hardware::{deadline_reached, CommutationTimer};
use crate::state_machine::Event;

/// 予約済みイベント
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScheduledEvent {
    pub event: Event,
    /// [μs]（フリーランカウンタ値）
    pub deadline_us: u32,
    pub armed: bool,
}

impl ScheduledEvent {
    pub const fn new() -> Self {
        Self {
            event: Event::Fault,
            deadline_us: 0,
            armed: false,
        }
    }

    /// `delay_us` 後に `event` を発行するよう予約（既存の予約は上書き）
    pub fn schedule<T: CommutationTimer>(&mut self, timer: &mut T, event: Event, delay_us: u32) {
        let deadline = timer.now_us().wrapping_add(delay_us);
        critical_section::with(|_| {
            self.event = event;
            self.deadline_us = deadline;
            self.armed = true;
        });
        timer.set_compare(deadline);
    }

    /// コンペアマッチ割り込みから呼ぶ: 予約があれば取り出して非アーム化
    pub fn take(&mut self) -> Option<Event> {
        critical_section::with(|_| {
            if self.armed {
                self.armed = false;
                Some(self.event)
            } else {
                None
            }
        })
    }

    /// 周期タスクから呼ぶフォールバック: 期限を過ぎた予約だけ取り出す
    pub fn take_expired(&mut self, now_us: u32) -> Option<Event> {
        critical_section::with(|_| {
            if self.armed && deadline_reached(now_us, self.deadline_us) {
                self.armed = false;
                Some(self.event)
            } else {
                None
            }
        })
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}
