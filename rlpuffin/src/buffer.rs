use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::feedback::StateVector;
use crate::fuzzer::Action;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: StateVector,
    pub action: Action,
    pub reward: f64,
    /// Log-probability of `action` under the policy which sampled it
    pub log_prob: f64,
    pub value_estimate: f64,
    pub done: bool,
}

/// Fixed-capacity store of transitions in the order they were collected.
///
/// Appending never overwrites; the buffer has to be drained before it accepts new
/// transitions once it is full.
#[derive(Clone, Debug)]
pub struct ExperienceBuffer {
    transitions: Vec<Transition>,
    capacity: usize,
}

impl ExperienceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            transitions: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn append(&mut self, transition: Transition) -> Result<(), Error> {
        if self.is_full() {
            return Err(Error::Capacity {
                capacity: self.capacity,
            });
        }
        self.transitions.push(transition);
        Ok(())
    }

    /// Hands out all transitions in insertion order and leaves the buffer empty
    pub fn drain(&mut self) -> Vec<Transition> {
        std::mem::replace(&mut self.transitions, Vec::with_capacity(self.capacity))
    }

    pub fn is_full(&self) -> bool {
        self.transitions.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(reward: f64) -> Transition {
        Transition {
            state: StateVector::default(),
            action: Action::Havoc,
            reward,
            log_prob: -1.6,
            value_estimate: 0.0,
            done: false,
        }
    }

    #[test_log::test]
    fn test_append_past_capacity_fails() {
        let mut buffer = ExperienceBuffer::new(4);
        for i in 0..4 {
            assert!(!buffer.is_full());
            buffer.append(transition(i as f64)).unwrap();
        }

        assert!(buffer.is_full());
        assert!(matches!(
            buffer.append(transition(4.0)),
            Err(Error::Capacity { capacity: 4 })
        ));
        assert_eq!(buffer.len(), 4);
    }

    #[test_log::test]
    fn test_drain_returns_everything_in_order() {
        let mut buffer = ExperienceBuffer::new(8);
        for i in 0..8 {
            buffer.append(transition(i as f64)).unwrap();
        }

        let drained = buffer.drain();
        assert_eq!(drained.len(), buffer.capacity());
        assert!(drained
            .iter()
            .enumerate()
            .all(|(i, t)| t.reward == i as f64));
        assert!(buffer.is_empty());

        buffer.append(transition(0.0)).unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.drain().len(), 1);
        assert!(buffer.drain().is_empty());
    }
}
