//! TOML config file loading and validation for the valve list, watering
//! timing and listener settings.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::valve::ValveId;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
    pub valves: ValvesEntry,
    #[serde(default)]
    pub watering: WateringEntry,
    /// Static addressing; DHCP when absent.
    #[serde(default)]
    pub network: Option<StaticAddressing>,
}

#[derive(Debug, Deserialize)]
pub struct ValvesEntry {
    /// BCM pins in watering order.
    pub pins: Vec<i64>,
    #[serde(default = "default_active_low")]
    pub active_low: bool,
}

#[derive(Debug, Deserialize)]
pub struct WateringEntry {
    #[serde(default = "default_total_min")]
    pub total_min: i64,
    #[serde(default = "default_sub_interval_min")]
    pub sub_interval_min: i64,
}

impl Default for WateringEntry {
    fn default() -> Self {
        Self {
            total_min: default_total_min(),
            sub_interval_min: default_sub_interval_min(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StaticAddressing {
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
}

fn default_port() -> u16 {
    80
}

fn default_credentials_path() -> String {
    "lib/wifi.dat".to_string()
}

fn default_active_low() -> bool {
    true
}

fn default_total_min() -> i64 {
    20
}

fn default_sub_interval_min() -> i64 {
    5
}

// ---------------------------------------------------------------------------
// Watering plan
// ---------------------------------------------------------------------------

/// Longest single timer shot the board fires reliably.
const TIMER_CEILING_MIN: i64 = 7;

/// How long each valve stays open, as `count` shots of `sub_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WateringPlan {
    pub sub_interval: Duration,
    pub count: u32,
}

impl WateringPlan {
    pub fn new(sub_interval: Duration, count: u32) -> Self {
        Self {
            sub_interval,
            count: count.max(1),
        }
    }

    pub fn from_minutes(total_min: i64, sub_interval_min: i64) -> Result<Self> {
        if total_min <= 0 || sub_interval_min <= 0 {
            bail!("watering durations must be positive (total {total_min}, sub-interval {sub_interval_min})");
        }
        if total_min % sub_interval_min != 0 {
            bail!("total_min ({total_min}) is not a multiple of sub_interval_min ({sub_interval_min})");
        }
        let count = u32::try_from(total_min / sub_interval_min)
            .context("too many sub-intervals")?;
        Ok(Self::new(
            Duration::from_secs(sub_interval_min as u64 * 60),
            count,
        ))
    }

    pub fn total(&self) -> Duration {
        self.sub_interval * self.count
    }
}

impl Default for WateringPlan {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60), 4)
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.port == 0 {
            errors.push("port must be non-zero".to_string());
        }
        if self.credentials_path.trim().is_empty() {
            errors.push("credentials_path is empty".to_string());
        }
        self.validate_valves(&mut errors);
        self.validate_watering(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_valves(&self, errors: &mut Vec<String>) {
        if self.valves.pins.is_empty() {
            errors.push("valves.pins must list at least one valve".to_string());
        }

        let mut seen: HashSet<i64> = HashSet::new();
        for (i, pin) in self.valves.pins.iter().enumerate() {
            if !VALID_GPIO_PINS.contains(pin) {
                errors.push(format!(
                    "valves.pins[{i}]: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(*pin) {
                errors.push(format!(
                    "valves.pins[{i}]: gpio {pin} is already used by another valve"
                ));
            }
        }
    }

    fn validate_watering(&self, errors: &mut Vec<String>) {
        let w = &self.watering;
        if w.total_min <= 0 {
            errors.push(format!(
                "watering.total_min must be positive, got {}",
                w.total_min
            ));
        }
        if w.sub_interval_min <= 0 {
            errors.push(format!(
                "watering.sub_interval_min must be positive, got {}",
                w.sub_interval_min
            ));
        } else {
            if w.sub_interval_min > TIMER_CEILING_MIN {
                errors.push(format!(
                    "watering.sub_interval_min ({}) exceeds the {TIMER_CEILING_MIN} minute timer ceiling",
                    w.sub_interval_min
                ));
            }
            if w.total_min > 0 && w.total_min % w.sub_interval_min != 0 {
                errors.push(format!(
                    "watering.total_min ({}) is not a multiple of sub_interval_min ({})",
                    w.total_min, w.sub_interval_min
                ));
            }
        }
    }

    /// Valves in watering order. Only meaningful after [`Config::validate`].
    pub fn valve_ids(&self) -> Vec<ValveId> {
        self.valves
            .pins
            .iter()
            .filter_map(|p| u8::try_from(*p).ok())
            .map(ValveId)
            .collect()
    }

    pub fn plan(&self) -> Result<WateringPlan> {
        WateringPlan::from_minutes(self.watering.total_min, self.watering.sub_interval_min)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
