//! Valve outputs. The `gpio` feature gates the real rppal driver; without it,
//! a mock board keeps line levels in memory and logs every change.

use anyhow::Result;
use std::collections::HashMap;
use std::fmt;

#[cfg(feature = "gpio")]
use anyhow::anyhow;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// BCM GPIO number of the line driving one valve relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValveId(pub u8);

impl fmt::Display for ValveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpio{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Real GPIO valve board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct ValveBoard {
    pins: HashMap<ValveId, OutputPin>,
    active_low: bool, // most relay boards switch on LOW
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub(crate) fn new(valves: &[ValveId], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for valve in valves {
            let mut pin = gpio.get(valve.0)?.into_output();

            // Fail-safe: every relay starts released
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(*valve, pin);
        }

        Ok(Self { pins, active_low })
    }

    pub(crate) fn set(&mut self, valve: ValveId, on: bool) -> Result<()> {
        let pin = self
            .pins
            .get_mut(&valve)
            .ok_or_else(|| anyhow!("valve {valve} is not on this board"))?;

        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        tracing::debug!(%valve, on, "valve line driven");
        Ok(())
    }

    pub(crate) fn all_off(&mut self) -> Result<()> {
        let valves: Vec<ValveId> = self.pins.keys().copied().collect();
        sweep_off(valves, |v| self.set(v, false))
    }
}

// ---------------------------------------------------------------------------
// Mock valve board (no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct ValveBoard {
    pub(super) lines: HashMap<ValveId, bool>,
    faulty: Vec<ValveId>,
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub(crate) fn new(valves: &[ValveId], _active_low: bool) -> Result<Self> {
        let mut lines = HashMap::new();
        for valve in valves {
            tracing::info!(%valve, "[mock-gpio] registered valve (not wired)");
            lines.insert(*valve, false);
        }
        Ok(Self {
            lines,
            faulty: Vec::new(),
        })
    }

    pub(crate) fn set(&mut self, valve: ValveId, on: bool) -> Result<()> {
        if self.faulty.contains(&valve) {
            anyhow::bail!("[mock-gpio] line {valve} failed to switch");
        }
        let Some(level) = self.lines.get_mut(&valve) else {
            anyhow::bail!("valve {valve} is not on this board");
        };
        *level = on;
        tracing::debug!(%valve, on, "[mock-gpio] valve line driven");
        Ok(())
    }

    pub(crate) fn all_off(&mut self) -> Result<()> {
        let valves: Vec<ValveId> = self.lines.keys().copied().collect();
        sweep_off(valves, |v| self.set(v, false))
    }

    /// Make every later switch of `valve` fail.
    #[cfg(test)]
    pub(crate) fn break_line(&mut self, valve: ValveId) {
        self.faulty.push(valve);
    }

    #[cfg(test)]
    pub(crate) fn repair(&mut self) {
        self.faulty.clear();
    }

    #[cfg(test)]
    pub(crate) fn energized(&self) -> Vec<ValveId> {
        let mut on: Vec<ValveId> = self
            .lines
            .iter()
            .filter(|(_, on)| **on)
            .map(|(v, _)| *v)
            .collect();
        on.sort();
        on
    }
}

/// Drive every line off, carrying on past failures so one stuck relay cannot
/// keep the others open. Returns the first failure.
fn sweep_off(valves: Vec<ValveId>, mut off: impl FnMut(ValveId) -> Result<()>) -> Result<()> {
    let mut first_err = None;
    for valve in valves {
        if let Err(e) = off(valve) {
            tracing::error!(%valve, "failed to release valve: {e:#}");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

// ===========================================================================
// Tests
// ===========================================================================
