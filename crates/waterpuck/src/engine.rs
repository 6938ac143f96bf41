//! Drives the [`Sequencer`] from a single task.
//!
//! Commands from the dispatcher and timer expiries arrive on two queues and
//! are applied strictly one at a time, so the state machine is never touched
//! from two contexts at once. Every timer shot carries the generation it was
//! armed under; shots from before the latest arm/disarm are dropped.

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::sequencer::{Sequencer, TimerDirective};
use crate::state::Snapshot;
use crate::timer::OneShotTimer;
use crate::valve::ValveId;

enum Request {
    Start {
        valves: Vec<ValveId>,
        done: oneshot::Sender<()>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable access to the running sequencer. The sequencer task shuts down,
/// closing every valve, once all handles are dropped.
#[derive(Clone)]
pub struct SequencerHandle {
    requests: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<Snapshot>,
}

impl SequencerHandle {
    /// Start a watering run; resolves once the first valve is open.
    pub async fn start(&self, valves: Vec<ValveId>) -> Result<()> {
        let (done, applied) = oneshot::channel();
        self.requests
            .send(Request::Start { valves, done })
            .map_err(|_| anyhow!("sequencer has shut down"))?;
        applied.await.context("sequencer dropped start request")
    }

    /// Stop watering; resolves once every valve is closed.
    pub async fn stop(&self) -> Result<()> {
        let (done, applied) = oneshot::channel();
        self.requests
            .send(Request::Stop { done })
            .map_err(|_| anyhow!("sequencer has shut down"))?;
        applied.await.context("sequencer dropped stop request")
    }

    pub fn snapshot(&self) -> Snapshot {
        self.status.borrow().clone()
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.status.clone()
    }
}

/// Move `sequencer` onto its own task.
pub(crate) fn spawn(sequencer: Sequencer) -> (SequencerHandle, JoinHandle<()>) {
    let (tick_tx, ticks) = mpsc::unbounded_channel();
    drive(sequencer, OneShotTimer::new(tick_tx), ticks)
}

/// Like [`spawn`], with the timer and the queue its shots arrive on supplied
/// by the caller.
pub(crate) fn drive(
    sequencer: Sequencer,
    timer: OneShotTimer<u64>,
    ticks: mpsc::UnboundedReceiver<u64>,
) -> (SequencerHandle, JoinHandle<()>) {
    let (requests, inbox) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(sequencer.snapshot());

    let task = tokio::spawn(run(sequencer, inbox, status_tx, timer, ticks));
    (SequencerHandle { requests, status }, task)
}

async fn run(
    mut seq: Sequencer,
    mut inbox: mpsc::UnboundedReceiver<Request>,
    status: watch::Sender<Snapshot>,
    mut timer: OneShotTimer<u64>,
    mut ticks: mpsc::UnboundedReceiver<u64>,
) {
    let mut generation: u64 = 0;

    loop {
        let (directive, done) = tokio::select! {
            request = inbox.recv() => match request {
                Some(Request::Start { valves, done }) => (seq.start(&valves), Some(done)),
                Some(Request::Stop { done }) => (seq.stop(), Some(done)),
                None => break,
            },
            Some(shot) = ticks.recv() => {
                if shot != generation {
                    debug!(shot, generation, "stale timer shot dropped");
                    continue;
                }
                (seq.on_tick(), None)
            }
        };

        apply(directive, &mut seq, &mut timer, &mut generation);
        debug!(
            running = seq.state().running,
            active = ?seq.state().active_valve,
            armed = timer.is_armed(),
            "sequencer step"
        );

        status.send_replace(seq.snapshot());
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    timer.deinit();
    seq.stop();
    status.send_replace(seq.snapshot());
    info!("sequencer shut down");
}

fn apply(
    directive: TimerDirective,
    seq: &mut Sequencer,
    timer: &mut OneShotTimer<u64>,
    generation: &mut u64,
) {
    match directive {
        TimerDirective::Arm(period) => {
            *generation += 1;
            if let Err(e) = timer.init(period, *generation) {
                seq.fail_safe(e);
                *generation += 1;
                timer.deinit();
            }
        }
        TimerDirective::Disarm => {
            *generation += 1;
            timer.deinit();
        }
        TimerDirective::Unchanged => {}
    }
}
