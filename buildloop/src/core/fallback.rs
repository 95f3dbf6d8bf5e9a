//! Agent fallback chain state machine.
//!
//! Exactly one agent in the configured chain is active. Qualifying failures
//! are counted; once the count reaches the threshold the chain advances to the
//! next available agent (wrapping). A success resets the count and reactivates
//! the first available agent in chain order.
//!
//! Host availability is injected as a predicate so the state machine stays pure.

use serde::{Deserialize, Serialize};

use crate::core::types::FailureKind;

/// Cross-run agent failure bookkeeping (`switch-state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchState {
    pub current_agent: String,
    pub consecutive_failures: u32,
    pub last_failure: Option<FailureKind>,
    /// Index into the configured chain.
    pub chain_position: usize,
}

/// Outcome of feeding one failure to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchDecision {
    /// Failure kind is not enabled for switching.
    NotQualifying,
    /// Counted, threshold not reached yet.
    Counted { failures: u32, threshold: u32 },
    Switched {
        from: String,
        to: String,
        reason: FailureKind,
    },
    /// Threshold reached but no other agent is available.
    Exhausted { current: String },
}

/// Configured chain of interchangeable agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackChain {
    agents: Vec<String>,
    threshold: u32,
    switch_on: Vec<FailureKind>,
}

impl FallbackChain {
    /// Returns `None` if the chain is empty.
    pub fn new(agents: Vec<String>, threshold: u32, switch_on: Vec<FailureKind>) -> Option<Self> {
        if agents.is_empty() {
            return None;
        }
        Some(Self {
            agents,
            threshold: threshold.max(1),
            switch_on,
        })
    }

    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    /// Initial state: first available agent, or the primary if none is available.
    pub fn initial_state<F: Fn(&str) -> bool>(&self, available: F) -> SwitchState {
        let position = self.first_available(&available).unwrap_or(0);
        SwitchState {
            current_agent: self.agents[position].clone(),
            consecutive_failures: 0,
            last_failure: None,
            chain_position: position,
        }
    }

    /// Re-anchor a persisted state against the current chain.
    ///
    /// A state naming an agent no longer in the chain is replaced by the initial state.
    pub fn reconcile<F: Fn(&str) -> bool>(&self, state: SwitchState, available: F) -> SwitchState {
        match self.agents.iter().position(|a| *a == state.current_agent) {
            Some(position) => SwitchState {
                chain_position: position,
                ..state
            },
            None => self.initial_state(available),
        }
    }

    pub fn qualifies(&self, kind: FailureKind) -> bool {
        kind.is_failure() && kind != FailureKind::Interrupted && self.switch_on.contains(&kind)
    }

    pub fn record_failure<F: Fn(&str) -> bool>(
        &self,
        state: &mut SwitchState,
        kind: FailureKind,
        available: F,
    ) -> SwitchDecision {
        state.last_failure = Some(kind);
        if !self.qualifies(kind) {
            return SwitchDecision::NotQualifying;
        }
        state.consecutive_failures += 1;
        if state.consecutive_failures < self.threshold {
            return SwitchDecision::Counted {
                failures: state.consecutive_failures,
                threshold: self.threshold,
            };
        }

        let len = self.agents.len();
        let next = (1..len)
            .map(|offset| (state.chain_position + offset) % len)
            .find(|idx| available(&self.agents[*idx]));
        match next {
            Some(idx) => {
                let from = state.current_agent.clone();
                state.chain_position = idx;
                state.current_agent = self.agents[idx].clone();
                state.consecutive_failures = 0;
                SwitchDecision::Switched {
                    from,
                    to: state.current_agent.clone(),
                    reason: kind,
                }
            }
            None => SwitchDecision::Exhausted {
                current: state.current_agent.clone(),
            },
        }
    }

    pub fn record_success<F: Fn(&str) -> bool>(&self, state: &mut SwitchState, available: F) {
        state.consecutive_failures = 0;
        state.last_failure = None;
        if let Some(position) = self.first_available(&available) {
            state.chain_position = position;
            state.current_agent = self.agents[position].clone();
        }
    }

    fn first_available<F: Fn(&str) -> bool>(&self, available: &F) -> Option<usize> {
        self.agents.iter().position(|agent| available(agent))
    }
}
