//! 6ステップ転流テーブル
//!
//! ステップ名 `XY` は「X相をホールド側、Y相をPWM側」として駆動し、残りの1相をフロート
//! （BEMF検出相）とする。転流順は正転で AB → AC → BC → BA → CA → CB → AB。

/// 3相のインデックス
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Phase {
    A = 0,
    B = 1,
    C = 2,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// 回転方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Direction {
    #[default]
    Forward = 0,
    Reverse = 1,
}

impl Direction {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Forward),
            1 => Some(Self::Reverse),
            _ => None,
        }
    }
}

/// 転流ステップ（数値はブリッジドライバのステップ番号）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CommutationStep {
    AB = 0,
    AC = 1,
    BA = 2,
    BC = 3,
    CA = 4,
    CB = 5,
}

impl CommutationStep {
    /// 正転方向の巡回順
    pub const SEQUENCE: [CommutationStep; 6] = [
        CommutationStep::AB,
        CommutationStep::AC,
        CommutationStep::BC,
        CommutationStep::BA,
        CommutationStep::CA,
        CommutationStep::CB,
    ];

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AB),
            1 => Some(Self::AC),
            2 => Some(Self::BA),
            3 => Some(Self::BC),
            4 => Some(Self::CA),
            5 => Some(Self::CB),
            _ => None,
        }
    }

    fn position(self) -> usize {
        match self {
            Self::AB => 0,
            Self::AC => 1,
            Self::BC => 2,
            Self::BA => 3,
            Self::CA => 4,
            Self::CB => 5,
        }
    }

    /// 回転方向に従って次のステップを返す
    pub fn next(self, direction: Direction) -> Self {
        let pos = self.position();
        let next = match direction {
            Direction::Forward => (pos + 1) % 6,
            Direction::Reverse => (pos + 5) % 6,
        };
        Self::SEQUENCE[next]
    }

    /// ホールド側の相（電流の戻り側）
    pub const fn held(self) -> Phase {
        match self {
            Self::AB | Self::AC => Phase::A,
            Self::BA | Self::BC => Phase::B,
            Self::CA | Self::CB => Phase::C,
        }
    }

    /// PWM側の相（PWM-high駆動時にバッテリー電圧が現れる相）
    pub const fn high(self) -> Phase {
        match self {
            Self::BA | Self::CA => Phase::A,
            Self::AB | Self::CB => Phase::B,
            Self::AC | Self::BC => Phase::C,
        }
    }

    /// フロート相（BEMF検出相）
    pub const fn undriven(self) -> Phase {
        match self {
            Self::BC | Self::CB => Phase::A,
            Self::AC | Self::CA => Phase::B,
            Self::AB | Self::BA => Phase::C,
        }
    }

    /// このステップでフロート相のBEMFが上昇するか
    pub const fn bemf_rising(self, direction: Direction) -> bool {
        let forward = matches!(self, Self::AC | Self::BA | Self::CB);
        match direction {
            Direction::Forward => forward,
            Direction::Reverse => !forward,
        }
    }
}

/// ブリッジの駆動モード（数値はブリッジドライバのモード番号）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DriveMode {
    /// ローサイド保持、ハイサイドPWM
    #[default]
    LowOnPwmHigh = 0,
    /// ローサイド保持、ローサイドPWM
    LowOnPwmLow = 1,
    /// ローサイド保持、相補PWM（アクティブブレーキ）
    LowOnPwmBoth = 2,
    /// ハイサイド保持、ローサイドPWM
    HighOnPwmLow = 3,
    /// ハイサイド保持、ハイサイドPWM
    HighOnPwmHigh = 4,
    /// ハイサイド保持、相補PWM
    HighOnPwmBoth = 5,
}

impl DriveMode {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::LowOnPwmHigh),
            1 => Some(Self::LowOnPwmLow),
            2 => Some(Self::LowOnPwmBoth),
            3 => Some(Self::HighOnPwmLow),
            4 => Some(Self::HighOnPwmHigh),
            5 => Some(Self::HighOnPwmBoth),
            _ => None,
        }
    }
}

/// 1つのFETの駆動状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Gate {
    #[default]
    Off,
    On,
    /// PWMオン期間に導通
    Pwm,
    /// PWMオフ期間に導通（同期整流）
    PwmComplement,
}

/// 1相分（ハイサイド + ローサイド）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LegGates {
    pub high: Gate,
    pub low: Gate,
}

impl LegGates {
    pub const OFF: LegGates = LegGates {
        high: Gate::Off,
        low: Gate::Off,
    };

    const fn new(high: Gate, low: Gate) -> Self {
        Self { high, low }
    }
}

/// 6つのゲート出力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PhaseGates {
    pub legs: [LegGates; 3],
}

impl PhaseGates {
    pub const ALL_OFF: PhaseGates = PhaseGates {
        legs: [LegGates::OFF; 3],
    };

    pub fn leg(&self, phase: Phase) -> LegGates {
        self.legs[phase.index()]
    }

    /// ステップと駆動モードからゲート出力を生成
    pub fn for_step(step: CommutationStep, mode: DriveMode) -> Self {
        let (held, pwm) = match mode {
            DriveMode::LowOnPwmHigh => (
                LegGates::new(Gate::Off, Gate::On),
                LegGates::new(Gate::Pwm, Gate::Off),
            ),
            DriveMode::LowOnPwmLow => (
                LegGates::new(Gate::Off, Gate::On),
                LegGates::new(Gate::Off, Gate::PwmComplement),
            ),
            DriveMode::LowOnPwmBoth => (
                LegGates::new(Gate::Off, Gate::On),
                LegGates::new(Gate::Pwm, Gate::PwmComplement),
            ),
            // ハイサイド保持ではPWM側の相がハイサイドONとなり、ホールド側の相を変調する
            DriveMode::HighOnPwmLow => (
                LegGates::new(Gate::Off, Gate::Pwm),
                LegGates::new(Gate::On, Gate::Off),
            ),
            DriveMode::HighOnPwmHigh => (
                LegGates::new(Gate::PwmComplement, Gate::Off),
                LegGates::new(Gate::On, Gate::Off),
            ),
            DriveMode::HighOnPwmBoth => (
                LegGates::new(Gate::PwmComplement, Gate::Pwm),
                LegGates::new(Gate::On, Gate::Off),
            ),
        };

        let mut gates = Self::ALL_OFF;
        gates.legs[step.held().index()] = held;
        gates.legs[step.high().index()] = pwm;
        gates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_cyclic_permutation() {
        let mut step = CommutationStep::AB;
        let mut seen = [false; 6];
        for _ in 0..6 {
            seen[step as usize] = true;
            step = step.next(Direction::Forward);
        }
        assert_eq!(step, CommutationStep::AB);
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_reverse_undoes_forward() {
        for step in CommutationStep::SEQUENCE {
            assert_eq!(step.next(Direction::Forward).next(Direction::Reverse), step);
        }
    }

    #[test]
    fn test_each_step_has_one_floating_phase() {
        for step in CommutationStep::SEQUENCE {
            let phases = [step.held(), step.high(), step.undriven()];
            assert_ne!(phases[0], phases[1]);
            assert_ne!(phases[0], phases[2]);
            assert_ne!(phases[1], phases[2]);
        }
    }

    #[test]
    fn test_phase_tables() {
        use CommutationStep::*;
        // フロート相
        assert_eq!(AC.undriven(), Phase::B);
        assert_eq!(CA.undriven(), Phase::B);
        assert_eq!(AB.undriven(), Phase::C);
        assert_eq!(BA.undriven(), Phase::C);
        assert_eq!(BC.undriven(), Phase::A);
        assert_eq!(CB.undriven(), Phase::A);
        // PWM側
        assert_eq!(AC.high(), Phase::C);
        assert_eq!(CA.high(), Phase::A);
        assert_eq!(AB.high(), Phase::B);
        assert_eq!(BA.high(), Phase::A);
        assert_eq!(BC.high(), Phase::C);
        assert_eq!(CB.high(), Phase::B);
    }

    #[test]
    fn test_bemf_polarity_alternates() {
        for direction in [Direction::Forward, Direction::Reverse] {
            let mut step = CommutationStep::AB;
            for _ in 0..6 {
                let next = step.next(direction);
                assert_ne!(step.bemf_rising(direction), next.bemf_rising(direction));
                step = next;
            }
        }
    }

    #[test]
    fn test_gates_low_on_pwm_high() {
        let gates = PhaseGates::for_step(CommutationStep::AB, DriveMode::LowOnPwmHigh);
        assert_eq!(gates.leg(Phase::A), LegGates::new(Gate::Off, Gate::On));
        assert_eq!(gates.leg(Phase::B), LegGates::new(Gate::Pwm, Gate::Off));
        assert_eq!(gates.leg(Phase::C), LegGates::OFF);
    }

    #[test]
    fn test_gates_braking_uses_complementary_pwm() {
        let gates = PhaseGates::for_step(CommutationStep::CB, DriveMode::LowOnPwmBoth);
        assert_eq!(gates.leg(Phase::C), LegGates::new(Gate::Off, Gate::On));
        assert_eq!(
            gates.leg(Phase::B),
            LegGates::new(Gate::Pwm, Gate::PwmComplement)
        );
        assert_eq!(gates.leg(Phase::A), LegGates::OFF);
    }

    #[test]
    fn test_floating_phase_always_off() {
        for raw in 0..6 {
            let mode = DriveMode::from_u8(raw).unwrap();
            for step in CommutationStep::SEQUENCE {
                let gates = PhaseGates::for_step(step, mode);
                assert_eq!(gates.leg(step.undriven()), LegGates::OFF);
            }
        }
    }

    #[test]
    fn test_from_u8_rejects_out_of_range() {
        assert_eq!(CommutationStep::from_u8(6), None);
        assert_eq!(DriveMode::from_u8(6), None);
        assert_eq!(Direction::from_u8(2), None);
    }
}
