/*
 * options.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Traghetto, a cross-platform file transfer client.
 *
 * Traghetto is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Traghetto is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Traghetto.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Engine configuration knobs. One value per knob, typed; the UI owns
//! persistence, the engine just reads (and updates `last_resolved_ip`).

use std::time::Duration;

/// How to determine the address sent in PORT/EPRT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalIpMode {
    UseLocal,
    UseConfigured,
    ResolveViaWeb,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// TCP keepalive interval in minutes; applied only when in 1..=9999.
    pub tcp_keepalive_interval: u32,
    /// Send protocol-level keep-alive commands while idle.
    pub ftp_send_keepalive: bool,
    /// Default for servers whose data-connection mode is "default".
    pub use_passive: bool,
    pub external_ip_mode: ExternalIpMode,
    /// Address used in UseConfigured mode.
    pub external_ip: String,
    /// Use the local address when the peer is on a non-routable network.
    pub no_external_on_local: bool,
    /// URL fetched in ResolveViaWeb mode.
    pub external_ip_resolver: String,
    /// Cache of the last web-resolved address, keyed by nothing but time;
    /// validated against the local socket address before reuse.
    pub last_resolved_ip: String,
    pub preserve_timestamps: bool,
    pub preallocate_space: bool,
    /// Reply watchdog, seconds.
    pub timeout_secs: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            tcp_keepalive_interval: 15,
            ftp_send_keepalive: false,
            use_passive: true,
            external_ip_mode: ExternalIpMode::UseLocal,
            external_ip: String::new(),
            no_external_on_local: true,
            external_ip_resolver: "http://api.ipify.org/".to_string(),
            last_resolved_ip: String::new(),
            preserve_timestamps: false,
            preallocate_space: false,
            timeout_secs: 20,
        }
    }
}

impl Options {
    /// The socket keepalive interval, if the configured value is in range.
    pub fn tcp_keepalive(&self) -> Option<Duration> {
        if (1..10000).contains(&self.tcp_keepalive_interval) {
            Some(Duration::from_secs(u64::from(self.tcp_keepalive_interval) * 60))
        } else {
            None
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_range() {
        let mut o = Options::default();
        o.tcp_keepalive_interval = 0;
        assert!(o.tcp_keepalive().is_none());
        o.tcp_keepalive_interval = 10000;
        assert!(o.tcp_keepalive().is_none());
        o.tcp_keepalive_interval = 2;
        assert_eq!(o.tcp_keepalive(), Some(Duration::from_secs(120)));
    }
}
