/*
 * extip.rs
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

//! Which address goes into PORT/EPRT: the local socket address, a configured
//! one, or one resolved through a web service. The fallbacks run as a linear
//! sequence of guarded steps: configured, cached resolution, fresh
//! resolution, local.

use std::net::{IpAddr, Ipv4Addr};

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::notify::{LogLevel, Notifier};
use crate::options::{ExternalIpMode, Options};
use crate::protocol::ftp::engine::EngineHost;

/// Outcome of one determination attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalIp {
    Ready(String),
    /// A web resolution is in flight; retry on its completion event.
    Pending,
    /// Not even a local address is known.
    Unavailable,
}

/// Per-session resolver state.
#[derive(Debug, Default)]
pub struct ExternalIpState {
    pub resolving: bool,
    /// Result of the last successful resolution, valid while the local
    /// socket address stays the same.
    cache: Option<(IpAddr, String)>,
    /// Resolution failed once; stick to the local address for this session.
    failed: bool,
}

impl ExternalIpState {
    /// Record a finished web resolution.
    pub fn finish(
        &mut self,
        local: Option<IpAddr>,
        result: Result<String, String>,
        options: &mut Options,
        notifier: &Notifier,
    ) {
        self.resolving = false;
        match result {
            Ok(ip) => {
                debug!("got external IP address {}", ip);
                if let Some(l) = local {
                    self.cache = Some((l, ip.clone()));
                }
                options.last_resolved_ip = ip;
            }
            Err(e) => {
                notifier.log(
                    LogLevel::Warning,
                    format!("Failed to retrieve external ip address: {}", e),
                );
                self.failed = true;
            }
        }
    }

    /// Forget an in-flight resolution (operation reset).
    pub fn abort(&mut self) {
        self.resolving = false;
    }
}

/// Pick the address to advertise for active-mode transfers.
pub fn determine_external_ip(
    state: &mut ExternalIpState,
    options: &Options,
    notifier: &Notifier,
    host: &mut dyn EngineHost,
) -> ExternalIp {
    let local = host.local_addr();
    let peer = host.peer_addr();

    // The local address works for IPv6; NAT is an IPv4 affliction.
    if matches!(peer, Some(IpAddr::V6(_))) {
        return local_or_unavailable(local);
    }

    let mode = options.external_ip_mode;
    if mode != ExternalIpMode::UseLocal && options.no_external_on_local {
        if let Some(p) = peer {
            if !is_routable(p) {
                return local_or_unavailable(local);
            }
        }
    }

    match mode {
        ExternalIpMode::UseLocal => local_or_unavailable(local),
        ExternalIpMode::UseConfigured => {
            if !options.external_ip.is_empty() {
                ExternalIp::Ready(options.external_ip.clone())
            } else {
                notifier.log(
                    LogLevel::Warning,
                    "No external IP address set, using local address",
                );
                local_or_unavailable(local)
            }
        }
        ExternalIpMode::ResolveViaWeb => {
            if state.failed {
                return local_or_unavailable(local);
            }
            if let (Some(l), Some((cached_local, ip))) = (local, &state.cache) {
                if l == *cached_local {
                    debug!("using cached external IP address");
                    return ExternalIp::Ready(ip.clone());
                }
            }
            if let Some(l) = local {
                // Directly on the internet: the local address was the last
                // resolution result.
                if l.to_string() == options.last_resolved_ip && !options.last_resolved_ip.is_empty()
                {
                    return ExternalIp::Ready(options.last_resolved_ip.clone());
                }
            }
            if !state.resolving {
                notifier.status(format!(
                    "Retrieving external IP address from {}",
                    options.external_ip_resolver
                ));
                state.resolving = true;
                host.resolve_external_ip(&options.external_ip_resolver);
            }
            ExternalIp::Pending
        }
    }
}

fn local_or_unavailable(local: Option<IpAddr>) -> ExternalIp {
    match local {
        Some(ip) => ExternalIp::Ready(ip.to_string()),
        None => ExternalIp::Unavailable,
    }
}

/// True for addresses reachable from the public internet.
pub fn is_routable(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || in_cgnat(v4))
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}

/// 100.64.0.0/10, carrier-grade NAT.
fn in_cgnat(v4: Ipv4Addr) -> bool {
    let o = v4.octets();
    o[0] == 100 && (o[1] & 0xc0) == 64
}

/// Fetch the public address from an HTTP resolver (IPv4 only). The reply
/// body is the address, possibly with surrounding whitespace.
pub async fn fetch_external_ip(url: &str) -> Result<String, String> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| format!("unsupported resolver URL: {}", url))?;
    let (host_port, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = match host_port.rsplit_once(':') {
        Some((h, p)) => (h, p.parse::<u16>().map_err(|e| e.to_string())?),
        None => (host_port, 80),
    };

    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| e.to_string())?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nUser-Agent: Traghetto\r\n\r\n",
        path, host
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| e.to_string())?;

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .map_err(|e| e.to_string())?;
    let text = String::from_utf8_lossy(&response);
    let mut parts = text.splitn(2, "\r\n\r\n");
    let head = parts.next().unwrap_or("");
    let body = parts.next().ok_or("malformed HTTP response")?;
    if !head.starts_with("HTTP/1.1 200") && !head.starts_with("HTTP/1.0 200") {
        return Err(format!(
            "resolver returned {}",
            head.lines().next().unwrap_or("nothing")
        ));
    }
    // Tolerate chunked encoding by scanning for the address token.
    let ip = body
        .split_whitespace()
        .find(|tok| tok.parse::<Ipv4Addr>().is_ok())
        .ok_or("no address in resolver response")?;
    Ok(ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routable_classification() {
        assert!(!is_routable("192.168.1.10".parse().unwrap()));
        assert!(!is_routable("10.0.0.1".parse().unwrap()));
        assert!(!is_routable("172.16.5.5".parse().unwrap()));
        assert!(!is_routable("127.0.0.1".parse().unwrap()));
        assert!(!is_routable("100.64.1.1".parse().unwrap()));
        assert!(is_routable("100.128.1.1".parse().unwrap()));
        assert!(is_routable("8.8.8.8".parse().unwrap()));
    }
}
