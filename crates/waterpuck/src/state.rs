use std::collections::VecDeque;
use time::OffsetDateTime;

use crate::valve::ValveId;

/// Maximum number of valve transitions retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Where the current watering run stands.
///
/// When `running` is false no valve is energized and the timer is disarmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequencerState {
    /// Valves still waiting for their turn, front = next.
    pub remaining_valves: VecDeque<ValveId>,
    pub active_valve: Option<ValveId>,
    /// Sub-interval ticks fired since `active_valve` was switched on.
    pub elapsed_subintervals: u32,
    pub running: bool,
    /// Last hardware fault that forced a fail-safe stop.
    pub last_fault: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValveEvent {
    pub at: OffsetDateTime,
    pub valve: ValveId,
    pub on: bool,
}

/// Point-in-time copy of the sequencer, published after every step.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub state: SequencerState,
    /// Oldest first.
    pub events: Vec<ValveEvent>,
}

// ---------------------------------------------------------------------------
// Transition history
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct History {
    events: VecDeque<ValveEvent>,
}

impl History {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a valve switching on or off.
    pub fn record_valve(&mut self, valve: ValveId, on: bool) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(ValveEvent {
            at: OffsetDateTime::now_utc(),
            valve,
            on,
        });
    }

    pub fn snapshot(&self, state: &SequencerState) -> Snapshot {
        Snapshot {
            state: state.clone(),
            events: self.events.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_keeps_insertion_order() {
        let mut h = History::new();
        h.record_valve(ValveId(4), true);
        h.record_valve(ValveId(4), false);

        let snap = h.snapshot(&SequencerState::default());
        let seen: Vec<(ValveId, bool)> = snap.events.iter().map(|e| (e.valve, e.on)).collect();
        assert_eq!(seen, vec![(ValveId(4), true), (ValveId(4), false)]);
    }

    #[test]
    fn history_drops_oldest_when_full() {
        let mut h = History::new();
        for i in 0..(MAX_EVENTS + 5) {
            h.record_valve(ValveId((i % 20) as u8), true);
        }
        let snap = h.snapshot(&SequencerState::default());
        assert_eq!(snap.events.len(), MAX_EVENTS);
        assert_eq!(snap.events[0].valve, ValveId(5));
    }

    #[test]
    fn snapshot_copies_state() {
        let h = History::new();
        let state = SequencerState {
            remaining_valves: VecDeque::from([ValveId(5)]),
            active_valve: Some(ValveId(4)),
            elapsed_subintervals: 2,
            running: true,
            last_fault: None,
        };
        let snap = h.snapshot(&state);
        assert_eq!(snap.state, state);
        assert!(snap.events.is_empty());
    }
}
