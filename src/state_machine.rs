//! 転流・制御ステートマシンの状態遷移表
//!
//! 遷移表は `(State, Event)` 全体で定義された全域関数で、表にない組み合わせは
//! すべて `State::Fault` になる。`Event::Auto` が定義された状態には留まらず、
//! 入場直後に連鎖的に遷移する。

/// ステート（`Fault` は 0 / デフォルト）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum State {
    #[default]
    Fault = 0,
    Init,
    WaitForArm,
    ArmedSound,
    Idle,
    Stopping,
    Stopped,
    StartupEnable,
    StartupGrab,
    StartupWait,
    StartupZcdDetected,
    StartupNozcdCommutated,
    ClStart,
    ClCommutated,
    ClNozcd,
    ClZcd,
}

impl State {
    pub const ALL: [State; 16] = [
        State::Fault,
        State::Init,
        State::WaitForArm,
        State::ArmedSound,
        State::Idle,
        State::Stopping,
        State::Stopped,
        State::StartupEnable,
        State::StartupGrab,
        State::StartupWait,
        State::StartupZcdDetected,
        State::StartupNozcdCommutated,
        State::ClStart,
        State::ClCommutated,
        State::ClNozcd,
        State::ClZcd,
    ];

    /// モーターを駆動している状態（始動 + 閉ループ）
    pub fn is_running(self) -> bool {
        matches!(
            self,
            State::StartupEnable
                | State::StartupGrab
                | State::StartupWait
                | State::StartupZcdDetected
                | State::StartupNozcdCommutated
                | State::ClStart
                | State::ClCommutated
                | State::ClNozcd
                | State::ClZcd
        )
    }

    /// 再アーム待ちの状態
    pub fn awaits_arm(self) -> bool {
        matches!(self, State::WaitForArm | State::Stopped)
    }
}

/// イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Event {
    #[default]
    Fault = 0,
    Arm,
    Start,
    Commutated,
    Zcd,
    Closed,
    /// 予約（発行されない）
    Overcurrent,
    Timeout,
    Stop,
    Auto,
}

impl Event {
    pub const ALL: [Event; 10] = [
        Event::Fault,
        Event::Arm,
        Event::Start,
        Event::Commutated,
        Event::Zcd,
        Event::Closed,
        Event::Overcurrent,
        Event::Timeout,
        Event::Stop,
        Event::Auto,
    ];
}

/// 定義済み遷移（表にない組み合わせは `None`）
pub fn transition(state: State, event: Event) -> Option<State> {
    use Event as E;
    use State as S;

    let next = match (state, event) {
        (S::Fault, E::Auto) => S::Stopping,
        (S::Init, E::Auto) => S::WaitForArm,
        (S::WaitForArm, E::Arm) => S::ArmedSound,
        (S::ArmedSound, E::Auto) => S::Idle,
        (S::Idle, E::Start) => S::StartupEnable,
        (S::Stopping, E::Auto) => S::Stopped,
        (S::Stopped, E::Arm) => S::ArmedSound,

        (S::StartupEnable, E::Auto) => S::StartupGrab,
        (S::StartupGrab, E::Timeout) => S::StartupWait,
        (S::StartupGrab, E::Stop) => S::Stopping,
        (S::StartupWait, E::Closed) => S::ClStart,
        (S::StartupWait, E::Zcd) => S::StartupZcdDetected,
        (S::StartupWait, E::Commutated) => S::StartupNozcdCommutated,
        (S::StartupWait, E::Stop) => S::Stopping,
        (S::StartupZcdDetected, E::Commutated) => S::StartupWait,
        (S::StartupZcdDetected, E::Closed) => S::ClStart,
        (S::StartupZcdDetected, E::Stop) => S::Stopping,
        (S::StartupNozcdCommutated, E::Auto) => S::StartupWait,

        (S::ClStart, E::Auto) => S::ClCommutated,
        (S::ClCommutated, E::Zcd) => S::ClZcd,
        (S::ClCommutated, E::Timeout) => S::ClNozcd,
        (S::ClCommutated, E::Stop) => S::Stopping,
        (S::ClZcd, E::Commutated) => S::ClCommutated,
        (S::ClZcd, E::Stop) => S::Stopping,
        (S::ClNozcd, E::Commutated) => S::ClCommutated,
        (S::ClNozcd, E::Stop) => S::Stopping,

        _ => return None,
    };
    Some(next)
}

/// 遷移先（未定義なら `Fault`）
pub fn next_state(state: State, event: Event) -> State {
    transition(state, event).unwrap_or(State::Fault)
}

/// 入場直後に `Auto` で連鎖するか
pub fn cascades(state: State) -> bool {
    transition(state, Event::Auto).is_some()
}
