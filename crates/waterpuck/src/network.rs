//! Boot-time network association. Failure is reported, never retried; the
//! listener bind that follows is what fails loudly if the link is down.

use anyhow::Result;
use std::net::{IpAddr, UdpSocket};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::StaticAddressing;
use crate::credentials::Credentials;

const CONNECT_ATTEMPTS: u32 = 100;
const CONNECT_POLL: Duration = Duration::from_millis(100);

/// A network interface in station mode.
pub trait Station {
    fn is_connected(&self) -> bool;
    /// Kick off association; completion is observed through `is_connected`.
    fn begin_connect(&mut self, ssid: &str, password: &str) -> Result<()>;
    fn apply_static(&mut self, addressing: &StaticAddressing) -> Result<()>;
    fn address(&self) -> Option<IpAddr>;
}

/// Associate with the configured network, polling until the link comes up.
///
/// Returns `true` straight away, without touching the interface, when it is
/// already connected.
pub async fn associate<S: Station>(
    station: &mut S,
    credentials: &Credentials,
    static_addr: Option<&StaticAddressing>,
) -> bool {
    if station.is_connected() {
        info!(address = ?station.address(), "network already connected");
        return true;
    }

    if let Some(addressing) = static_addr {
        if let Err(e) = station.apply_static(addressing) {
            warn!(ip = %addressing.ip, "failed to apply static addressing: {e:#}");
        }
    }

    info!(ssid = %credentials.ssid, "trying to connect");
    if let Err(e) = station.begin_connect(&credentials.ssid, &credentials.password) {
        warn!(ssid = %credentials.ssid, "association failed to start: {e:#}");
        return false;
    }

    for _ in 0..CONNECT_ATTEMPTS {
        if station.is_connected() {
            info!(ssid = %credentials.ssid, address = ?station.address(), "network connected");
            return true;
        }
        sleep(CONNECT_POLL).await;
    }

    warn!(
        ssid = %credentials.ssid,
        attempts = CONNECT_ATTEMPTS,
        "failed, not connected"
    );
    false
}

// ---------------------------------------------------------------------------
// Host station
// ---------------------------------------------------------------------------

/// Station for a Linux host, where the OS owns the wireless link.
pub struct HostStation;

impl Station for HostStation {
    fn is_connected(&self) -> bool {
        self.address().is_some()
    }

    fn begin_connect(&mut self, ssid: &str, _password: &str) -> Result<()> {
        info!(ssid, "association is managed by the host OS");
        Ok(())
    }

    fn apply_static(&mut self, addressing: &StaticAddressing) -> Result<()> {
        warn!(
            ip = %addressing.ip,
            subnet = %addressing.subnet,
            gateway = %addressing.gateway,
            dns = %addressing.dns,
            "static addressing is managed by the host OS; ignoring"
        );
        Ok(())
    }

    /// Address of the interface holding the default route. Connecting a UDP
    /// socket only selects a route, no packet leaves the host.
    fn address(&self) -> Option<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("192.0.2.1:9").ok()?;
        socket
            .local_addr()
            .ok()
            .map(|a| a.ip())
            .filter(|ip| !ip.is_unspecified())
    }
}
