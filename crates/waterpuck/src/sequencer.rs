//! Valve sequencing state machine: waters a list of valves one at a time,
//! each for a fixed number of timer sub-intervals.
//!
//! The machine never touches a timer. Every operation hands back a
//! [`TimerDirective`] and the driver in `engine` arms or disarms the real
//! timer accordingly; each expiry comes back in as [`Sequencer::on_tick`].
//!
//! ```text
//! Idle ──start([v, ..])──▶ Watering(v, 0) ──tick, n+1 < N──▶ Watering(v, n+1)
//!  ▲                            │
//!  │                            └──tick, n+1 == N──▶ Watering(next, 0)
//!  │                                                  or Idle (queue empty)
//!  └────────────────stop (from any state)─────────────────┘
//! ```

use anyhow::Result;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::WateringPlan;
use crate::state::{History, SequencerState, Snapshot};
use crate::valve::{ValveBoard, ValveId};

/// What the driver must do with the timer after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDirective {
    /// (Re-)arm for one shot of this length.
    Arm(Duration),
    Disarm,
    /// Leave the timer as it is.
    Unchanged,
}

pub(crate) struct Sequencer {
    board: ValveBoard,
    plan: WateringPlan,
    state: SequencerState,
    history: History,
}

impl Sequencer {
    pub(crate) fn new(board: ValveBoard, plan: WateringPlan) -> Self {
        Self {
            board,
            plan,
            state: SequencerState::default(),
            history: History::new(),
        }
    }

    pub(crate) fn state(&self) -> &SequencerState {
        &self.state
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        self.history.snapshot(&self.state)
    }

    /// Begin a watering run over `valves` in order.
    ///
    /// A run already in progress is abandoned: its open valve is closed
    /// first and the queue starts over. An empty list is ignored.
    pub(crate) fn start(&mut self, valves: &[ValveId]) -> TimerDirective {
        if valves.is_empty() {
            debug!("start ignored: no valves given");
            return TimerDirective::Unchanged;
        }

        if self.state.running {
            info!(active = ?self.state.active_valve, "restarting watering run");
            if let Err(e) = self.release_active() {
                return self.fail_safe(e);
            }
        }

        self.state.last_fault = None;
        self.state.remaining_valves = valves.iter().copied().collect();
        self.state.elapsed_subintervals = 0;

        match self.advance() {
            Ok(directive) => directive,
            Err(e) => self.fail_safe(e),
        }
    }

    /// Close every valve and go idle. Safe to call in any state, any number
    /// of times; it drives all lines off even if the recorded state is wrong.
    pub(crate) fn stop(&mut self) -> TimerDirective {
        let was_running = self.state.running;

        if let Err(e) = self.board.all_off() {
            self.state.last_fault = Some(format!("{e:#}"));
        }
        if let Some(valve) = self.state.active_valve.take() {
            self.history.record_valve(valve, false);
            info!(%valve, "turned off valve");
        }

        self.state.remaining_valves.clear();
        self.state.elapsed_subintervals = 0;
        self.state.running = false;

        if was_running {
            info!("watering stopped");
        }
        TimerDirective::Disarm
    }

    /// One sub-interval elapsed for the open valve.
    pub(crate) fn on_tick(&mut self) -> TimerDirective {
        let Some(valve) = self.state.active_valve.filter(|_| self.state.running) else {
            debug!("tick while idle ignored");
            return TimerDirective::Disarm;
        };

        self.state.elapsed_subintervals += 1;
        debug!(
            %valve,
            elapsed = self.state.elapsed_subintervals,
            of = self.plan.count,
            "sub-interval elapsed"
        );

        if self.state.elapsed_subintervals < self.plan.count {
            return TimerDirective::Arm(self.plan.sub_interval);
        }

        let next = self.release_active().and_then(|()| self.advance());
        match next {
            Ok(directive) => directive,
            Err(e) => self.fail_safe(e),
        }
    }

    /// Record a hardware fault and fall back to the de-energized idle state.
    pub(crate) fn fail_safe(&mut self, err: anyhow::Error) -> TimerDirective {
        error!(
            active = ?self.state.active_valve,
            "hardware fault, stopping all valves: {err:#}"
        );
        let directive = self.stop();
        self.state.last_fault = Some(format!("{err:#}"));
        directive
    }

    /// Open the next queued valve, or go idle when the queue is empty.
    fn advance(&mut self) -> Result<TimerDirective> {
        let Some(valve) = self.state.remaining_valves.pop_front() else {
            self.state.running = false;
            self.state.active_valve = None;
            self.state.elapsed_subintervals = 0;
            info!("watering run complete");
            return Ok(TimerDirective::Disarm);
        };

        // A failed switch is never marked active; the fail-safe sweep covers
        // every line anyway.
        self.board.set(valve, true)?;
        self.state.active_valve = Some(valve);
        self.state.elapsed_subintervals = 0;
        self.state.running = true;
        self.history.record_valve(valve, true);
        info!(
            %valve,
            remaining = self.state.remaining_valves.len(),
            minutes = self.plan.total().as_secs() / 60,
            "turned on valve"
        );

        Ok(TimerDirective::Arm(self.plan.sub_interval))
    }

    fn release_active(&mut self) -> Result<()> {
        if let Some(valve) = self.state.active_valve {
            self.board.set(valve, false)?;
            self.state.active_valve = None;
            self.history.record_valve(valve, false);
            info!(%valve, "turned off valve");
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    const SUB: Duration = Duration::from_secs(300);

    fn valves(pins: &[u8]) -> Vec<ValveId> {
        pins.iter().map(|p| ValveId(*p)).collect()
    }

    fn sequencer(pins: &[u8], shots: u32) -> Sequencer {
        let board = ValveBoard::new(&valves(pins), true).unwrap();
        Sequencer::new(board, WateringPlan::new(SUB, shots))
    }

    /// Tick until the run ends; returns which valve was open at each tick.
    fn run_to_idle(seq: &mut Sequencer) -> Vec<ValveId> {
        let mut watered = Vec::new();
        for _ in 0..1000 {
            let Some(valve) = seq.state.active_valve else {
                break;
            };
            assert!(seq.board.energized().len() <= 1, "two valves open at once");
            watered.push(valve);
            seq.on_tick();
        }
        watered
    }

    // -- start ------------------------------------------------------------

    #[test]
    fn start_opens_first_valve_and_arms_timer() {
        let mut seq = sequencer(&[4, 5], 4);

        assert_eq!(seq.start(&valves(&[4, 5])), TimerDirective::Arm(SUB));
        assert!(seq.state.running);
        assert_eq!(seq.state.active_valve, Some(ValveId(4)));
        assert_eq!(seq.state.remaining_valves, valves(&[5]));
        assert_eq!(seq.state.elapsed_subintervals, 0);
        assert_eq!(seq.board.energized(), valves(&[4]));
    }

    #[test]
    fn start_with_no_valves_is_ignored() {
        let mut seq = sequencer(&[4], 4);
        assert_eq!(seq.start(&[]), TimerDirective::Unchanged);
        assert_eq!(*seq.state(), SequencerState::default());
        assert!(seq.snapshot().events.is_empty());
    }

    // -- full run ---------------------------------------------------------

    #[test]
    fn each_valve_watered_once_in_order_for_full_duration() {
        let mut seq = sequencer(&[4, 5, 12], 4);
        seq.start(&valves(&[4, 5, 12]));

        let watered = run_to_idle(&mut seq);

        let mut expected = Vec::new();
        for pin in [4, 5, 12] {
            expected.extend(std::iter::repeat(ValveId(pin)).take(4));
        }
        assert_eq!(watered, expected);
        assert!(!seq.state.running);
        assert!(seq.board.energized().is_empty());

        let transitions: Vec<(ValveId, bool)> =
            seq.snapshot().events.iter().map(|e| (e.valve, e.on)).collect();
        assert_eq!(
            transitions,
            vec![
                (ValveId(4), true),
                (ValveId(4), false),
                (ValveId(5), true),
                (ValveId(5), false),
                (ValveId(12), true),
                (ValveId(12), false),
            ]
        );
    }

    #[test]
    fn tick_rearms_until_last_sub_interval() {
        let mut seq = sequencer(&[4, 5], 3);
        seq.start(&valves(&[4, 5]));

        assert_eq!(seq.on_tick(), TimerDirective::Arm(SUB));
        assert_eq!(seq.state.elapsed_subintervals, 1);
        assert_eq!(seq.on_tick(), TimerDirective::Arm(SUB));
        assert_eq!(seq.state.elapsed_subintervals, 2);

        // Third tick hands over to the next valve with a fresh count.
        assert_eq!(seq.on_tick(), TimerDirective::Arm(SUB));
        assert_eq!(seq.state.active_valve, Some(ValveId(5)));
        assert_eq!(seq.state.elapsed_subintervals, 0);
        assert_eq!(seq.board.energized(), valves(&[5]));
    }

    #[test]
    fn last_valve_finishing_disarms_timer() {
        let mut seq = sequencer(&[4], 1);
        seq.start(&valves(&[4]));

        assert_eq!(seq.on_tick(), TimerDirective::Disarm);
        assert!(!seq.state.running);
        assert_eq!(seq.state.active_valve, None);
        assert!(seq.board.energized().is_empty());
    }

    #[test]
    fn completed_run_rests_in_the_same_idle_state_as_stop() {
        let mut seq = sequencer(&[4], 4);
        seq.start(&valves(&[4]));
        run_to_idle(&mut seq);

        let finished = seq.state().clone();
        assert_eq!(finished.elapsed_subintervals, 0);
        let events = seq.snapshot().events.len();

        seq.stop();
        assert_eq!(*seq.state(), finished);
        assert_eq!(seq.snapshot().events.len(), events);
    }

    #[test]
    fn single_shot_plan_advances_every_tick() {
        let mut seq = sequencer(&[4, 5], 1);
        seq.start(&valves(&[4, 5]));
        assert_eq!(run_to_idle(&mut seq), valves(&[4, 5]));
    }

    #[test]
    fn configured_order_is_kept_even_when_unsorted() {
        let mut seq = sequencer(&[4, 5, 12], 2);
        seq.start(&valves(&[12, 4, 5]));
        let watered = run_to_idle(&mut seq);
        assert_eq!(watered, valves(&[12, 12, 4, 4, 5, 5]));
    }

    // -- stop -------------------------------------------------------------

    #[test]
    fn stop_mid_run_closes_valve_and_silences_ticks() {
        let mut seq = sequencer(&[4, 5], 4);
        seq.start(&valves(&[4, 5]));
        seq.on_tick();

        assert_eq!(seq.stop(), TimerDirective::Disarm);
        assert!(!seq.state.running);
        assert_eq!(seq.state.active_valve, None);
        assert!(seq.state.remaining_valves.is_empty());
        assert!(seq.board.energized().is_empty());

        // A shot that was already in flight must not revive the run.
        assert_eq!(seq.on_tick(), TimerDirective::Disarm);
        assert!(seq.board.energized().is_empty());
        assert!(!seq.state.running);
    }

    #[test]
    fn stop_when_idle_is_a_noop() {
        let mut seq = sequencer(&[4], 4);
        assert_eq!(seq.stop(), TimerDirective::Disarm);
        assert_eq!(seq.stop(), TimerDirective::Disarm);
        assert_eq!(*seq.state(), SequencerState::default());
        assert!(seq.snapshot().events.is_empty());
    }

    #[test]
    fn stop_releases_lines_the_state_lost_track_of() {
        let mut seq = sequencer(&[4, 5], 4);
        seq.board.set(ValveId(5), true).unwrap();

        seq.stop();
        assert!(seq.board.energized().is_empty());
    }

    // -- restart ----------------------------------------------------------

    #[test]
    fn restart_closes_open_valve_before_starting_over() {
        let mut seq = sequencer(&[4, 5], 4);
        seq.start(&valves(&[4, 5]));
        for _ in 0..5 {
            seq.on_tick();
        }
        assert_eq!(seq.state.active_valve, Some(ValveId(5)));

        assert_eq!(seq.start(&valves(&[4, 5])), TimerDirective::Arm(SUB));
        assert_eq!(seq.board.energized(), valves(&[4]));
        assert_eq!(seq.state.active_valve, Some(ValveId(4)));
        assert_eq!(seq.state.elapsed_subintervals, 0);
        assert_eq!(seq.state.remaining_valves, valves(&[5]));
    }

    #[test]
    fn restart_resets_rather_than_accumulates() {
        let mut seq = sequencer(&[4, 5], 4);
        seq.start(&valves(&[4, 5]));
        seq.on_tick();
        seq.on_tick();

        seq.start(&valves(&[4, 5]));
        let watered = run_to_idle(&mut seq);

        let for_4 = watered.iter().filter(|v| **v == ValveId(4)).count();
        let for_5 = watered.iter().filter(|v| **v == ValveId(5)).count();
        assert_eq!((for_4, for_5), (4, 4));
    }

    // -- hardware faults --------------------------------------------------

    #[test]
    fn fault_opening_first_valve_leaves_everything_off() {
        let mut seq = sequencer(&[4, 5], 4);
        seq.board.break_line(ValveId(4));

        assert_eq!(seq.start(&valves(&[4, 5])), TimerDirective::Disarm);
        assert!(!seq.state.running);
        assert_eq!(seq.state.active_valve, None);
        assert!(seq.board.energized().is_empty());
        assert!(seq.state.last_fault.as_deref().unwrap().contains("gpio4"));
    }

    #[test]
    fn failed_open_leaves_no_transition_behind() {
        let mut seq = sequencer(&[4, 5], 4);
        seq.board.break_line(ValveId(4));

        seq.start(&valves(&[4, 5]));
        assert!(seq.snapshot().events.is_empty());
    }

    #[test]
    fn failed_handover_records_only_real_transitions() {
        let mut seq = sequencer(&[4, 5], 1);
        seq.start(&valves(&[4, 5]));
        seq.board.break_line(ValveId(5));
        seq.on_tick();

        let transitions: Vec<(ValveId, bool)> =
            seq.snapshot().events.iter().map(|e| (e.valve, e.on)).collect();
        assert_eq!(transitions, vec![(ValveId(4), true), (ValveId(4), false)]);
    }

    #[test]
    fn fault_opening_next_valve_stops_the_run() {
        let mut seq = sequencer(&[4, 5, 12], 1);
        seq.start(&valves(&[4, 5, 12]));
        seq.board.break_line(ValveId(5));

        assert_eq!(seq.on_tick(), TimerDirective::Disarm);
        assert!(!seq.state.running);
        assert!(seq.state.remaining_valves.is_empty());
        assert!(seq.board.energized().is_empty());
        assert!(seq.state.last_fault.is_some());
    }

    #[test]
    fn new_start_clears_previous_fault() {
        let mut seq = sequencer(&[4], 1);
        seq.board.break_line(ValveId(4));
        seq.start(&valves(&[4]));
        assert!(seq.state.last_fault.is_some());

        seq.board.repair();
        assert_eq!(seq.start(&valves(&[4])), TimerDirective::Arm(SUB));
        assert!(seq.state.last_fault.is_none());
    }

    #[test]
    fn unknown_valve_is_a_fault_not_a_panic() {
        let mut seq = sequencer(&[4], 1);
        assert_eq!(seq.start(&valves(&[9])), TimerDirective::Disarm);
        assert!(seq.state.last_fault.is_some());
    }
}
