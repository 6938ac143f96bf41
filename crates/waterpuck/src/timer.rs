//! One-shot timer that delivers a message into its owner's queue instead of
//! running a callback in place.

use anyhow::{bail, Result};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

pub struct OneShotTimer<T> {
    sink: UnboundedSender<T>,
    pending: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> OneShotTimer<T> {
    pub fn new(sink: UnboundedSender<T>) -> Self {
        Self {
            sink,
            pending: None,
        }
    }

    /// Arm the timer to deliver `message` once after `period`, replacing any
    /// shot still pending.
    pub fn init(&mut self, period: Duration, message: T) -> Result<()> {
        self.deinit();
        if self.sink.is_closed() {
            bail!("timer queue closed");
        }

        let sink = self.sink.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(period).await;
            // Receiver gone means the owner shut down; nothing to deliver to.
            let _ = sink.send(message);
        }));
        Ok(())
    }

    pub fn deinit(&mut self) {
        if let Some(shot) = self.pending.take() {
            shot.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.as_ref().is_some_and(|shot| !shot.is_finished())
    }
}

impl<T> Drop for OneShotTimer<T> {
    fn drop(&mut self) {
        if let Some(shot) = self.pending.take() {
            shot.abort();
        }
    }
}
