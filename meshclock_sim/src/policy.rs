//! Action policies: what a peer does on each step of its event loop.
//!
//! The event loop asks its policy for the next `Action` and never draws the
//! decision itself, so tests can replace the random policy with a script.

use crate::config::MeshConfig;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;

/// The two things a peer can do in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Send,
    Receive,
}

/// Chooses the next action. Receives the peer's own RNG so a seeded run
/// stays reproducible.
pub trait ActionPolicy: Send {
    fn next_action(&mut self, rng: &mut ChaCha8Rng) -> Action;
}

/// Draws uniformly from `outcomes` choices; the first `send_outcomes` of
/// them mean `Send`.
#[derive(Debug, Clone)]
pub struct RandomPolicy {
    outcomes: u32,
    send_outcomes: u32,
}

impl RandomPolicy {
    pub fn new(outcomes: u32, send_outcomes: u32) -> Self {
        Self {
            outcomes: outcomes.max(1),
            send_outcomes: send_outcomes.min(outcomes),
        }
    }

    pub fn from_config(config: &MeshConfig) -> Self {
        Self::new(config.choice_outcomes, config.send_outcomes)
    }

    /// Probability of choosing `Send`.
    pub fn send_probability(&self) -> f64 {
        f64::from(self.send_outcomes) / f64::from(self.outcomes)
    }
}

impl Default for RandomPolicy {
    /// Four sends to one receive.
    fn default() -> Self {
        Self::new(5, 4)
    }
}

impl ActionPolicy for RandomPolicy {
    fn next_action(&mut self, rng: &mut ChaCha8Rng) -> Action {
        if rng.gen_range(0..self.outcomes) < self.send_outcomes {
            Action::Send
        } else {
            Action::Receive
        }
    }
}

/// Replays a fixed sequence, then repeats `fallback` forever.
#[derive(Debug, Clone)]
pub struct ScriptedPolicy {
    script: VecDeque<Action>,
    fallback: Action,
}

impl ScriptedPolicy {
    pub fn new(script: impl IntoIterator<Item = Action>) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback: Action::Receive,
        }
    }

    pub fn with_fallback(mut self, fallback: Action) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl ActionPolicy for ScriptedPolicy {
    fn next_action(&mut self, _rng: &mut ChaCha8Rng) -> Action {
        self.script.pop_front().unwrap_or(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_random_policy_extremes() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let mut always_send = RandomPolicy::new(5, 5);
        let mut never_send = RandomPolicy::new(5, 0);
        for _ in 0..100 {
            assert_eq!(always_send.next_action(&mut rng), Action::Send);
            assert_eq!(never_send.next_action(&mut rng), Action::Receive);
        }
    }

    #[test]
    fn test_random_policy_default_split() {
        let mut rng = ChaCha8Rng::seed_from_u64(100);
        let mut policy = RandomPolicy::default();
        assert!((policy.send_probability() - 0.8).abs() < 1e-9);

        let sends = (0..10_000)
            .filter(|_| policy.next_action(&mut rng) == Action::Send)
            .count();
        // 8000 expected; well inside five standard deviations.
        assert!((7800..=8200).contains(&sends), "sends = {}", sends);
    }

    #[test]
    fn test_random_policy_is_reproducible() {
        let draw = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut policy = RandomPolicy::default();
            (0..50).map(|_| policy.next_action(&mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(draw(100), draw(100));
        assert_ne!(draw(100), draw(101));
    }

    #[test]
    fn test_scripted_policy_replays_then_falls_back() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut policy = ScriptedPolicy::new([Action::Send, Action::Send, Action::Receive])
            .with_fallback(Action::Send);

        assert_eq!(policy.remaining(), 3);
        assert_eq!(policy.next_action(&mut rng), Action::Send);
        assert_eq!(policy.next_action(&mut rng), Action::Send);
        assert_eq!(policy.next_action(&mut rng), Action::Receive);
        assert_eq!(policy.next_action(&mut rng), Action::Send);
        assert_eq!(policy.remaining(), 0);
    }
}
