//! Scripted pilot input for the headless client

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::ControlState;

/// Drives a ship with random control changes, holding each choice for a
/// random number of ticks
pub struct BotInput {
    rng: StdRng,
    current: ControlState,
    hold_ticks: u32,
}

impl BotInput {
    /// Reproducible bot for a given seed
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            current: ControlState::default(),
            hold_ticks: 0,
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            current: ControlState::default(),
            hold_ticks: 0,
        }
    }

    /// Controls for the next tick
    pub fn update(&mut self) -> ControlState {
        if self.hold_ticks == 0 {
            let turn = self.rng.gen_range(0..3);
            self.current = ControlState {
                thrust: self.rng.gen_bool(0.6),
                turn_left: turn == 1,
                turn_right: turn == 2,
                fire: self.rng.gen_bool(0.1),
            };
            self.hold_ticks = self.rng.gen_range(10..60);
        }

        self.hold_ticks -= 1;
        self.current
    }

    pub fn current(&self) -> ControlState {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_inputs() {
        let mut a = BotInput::new(7);
        let mut b = BotInput::new(7);

        for _ in 0..500 {
            assert_eq!(a.update(), b.update());
        }
    }

    #[test]
    fn test_never_turns_both_ways() {
        let mut bot = BotInput::new(1);
        for _ in 0..1000 {
            let controls = bot.update();
            assert!(!(controls.turn_left && controls.turn_right));
        }
    }

    #[test]
    fn test_choice_is_held_for_at_least_ten_ticks() {
        let mut bot = BotInput::new(99);
        let first = bot.update();
        for _ in 0..9 {
            assert_eq!(bot.update(), first);
        }
        assert_eq!(bot.current(), first);
    }
}
