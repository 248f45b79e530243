/*
 * rawtransfer.rs
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

//! Control-side choreography of one data transfer: TYPE, EPSV/PASV or
//! PORT/EPRT, REST, the data command itself, then the join of two racing
//! events: the final control reply and the data socket's end.

use std::net::IpAddr;

use log::debug;

use crate::extip::{determine_external_ip, is_routable, ExternalIp};

use super::super::capabilities::{Capability, TriState};
use super::super::engine::{EngineHost, SessionState};
use super::super::reply::Reply;
use super::super::transfer::TransferEndReason;
use super::super::{PasvMode, ResultFlags};
use super::OpOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTransferState {
    Type,
    PortPasv,
    Rest,
    /// Data command sent; no reply seen yet.
    Transfer,
    /// Preliminary seen; final reply and data end both outstanding.
    WaitFinish,
    /// Data ended; awaiting the final reply.
    WaitTransfer,
    /// Data ended before even the preliminary reply.
    WaitTransferPre,
    /// Replies complete; awaiting the data end.
    WaitSocket,
}

#[derive(Debug)]
pub struct RawTransferOpData {
    pub state: RawTransferState,
    cmd: String,
    passive: bool,
    tried_active: bool,
    used_epsv: bool,
}

impl RawTransferOpData {
    /// The parent must have set up `session.transfer_ctl` before pushing.
    pub fn new(cmd: String, session: &SessionState) -> Self {
        let passive = match session.server.pasv_mode {
            PasvMode::Passive => true,
            PasvMode::Active => false,
            PasvMode::Default => session.options.use_passive,
        };
        let state = if session.last_type_binary == Some(session.transfer_ctl.binary) {
            RawTransferState::PortPasv
        } else {
            RawTransferState::Type
        };
        RawTransferOpData {
            state,
            cmd,
            passive,
            tried_active: false,
            used_epsv: false,
        }
    }
}

pub fn send(
    op: &mut RawTransferOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
) -> OpOutcome {
    match op.state {
        RawTransferState::Type => {
            let cmd = if session.transfer_ctl.binary {
                "TYPE I"
            } else {
                "TYPE A"
            };
            if !session.send_command(host, cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        RawTransferState::PortPasv => {
            if op.passive {
                op.used_epsv = session
                    .caps
                    .get(&session.server_key, Capability::EpsvCommand)
                    != TriState::No;
                let cmd = if op.used_epsv { "EPSV" } else { "PASV" };
                if !session.send_command(host, cmd, false, true) {
                    return OpOutcome::Error(ResultFlags::ERROR);
                }
                return OpOutcome::WouldBlock;
            }
            // Active mode: find our address, open the listener, advertise it.
            let ip = match determine_external_ip(
                &mut session.extip,
                &session.options,
                &session.notifier,
                host,
            ) {
                ExternalIp::Ready(ip) => ip,
                ExternalIp::Pending => return OpOutcome::WouldBlock,
                ExternalIp::Unavailable => {
                    session
                        .notifier
                        .error("Failed to retrieve local ip address");
                    return active_failed(op, session, host);
                }
            };
            let port = match host.listen_data(session.transfer_ctl.mode, session.prot_p) {
                Ok(p) => p,
                Err(e) => {
                    session
                        .notifier
                        .error(format!("Could not open data listen socket: {}", e));
                    return active_failed(op, session, host);
                }
            };
            let cmd = if ip.contains(':') {
                format!("EPRT |2|{}|{}|", ip, port)
            } else {
                format!("PORT {},{},{}", ip.replace('.', ","), port >> 8, port & 0xff)
            };
            if !session.send_command(host, &cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        RawTransferState::Rest => {
            if session.transfer_ctl.resume_offset == 0 {
                op.state = RawTransferState::Transfer;
                return OpOutcome::Continue;
            }
            let cmd = format!("REST {}", session.transfer_ctl.resume_offset);
            if !session.send_command(host, &cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        RawTransferState::Transfer => {
            let cmd = op.cmd.clone();
            if !session.send_command(host, &cmd, false, false) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            session.transfer_ctl.command_sent = true;
            OpOutcome::WouldBlock
        }
        _ => OpOutcome::WouldBlock,
    }
}

pub fn parse_reply(
    op: &mut RawTransferOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
    reply: &Reply,
) -> OpOutcome {
    let code = reply.code_class();
    match op.state {
        RawTransferState::Type => {
            if code != 2 {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            session.last_type_binary = Some(session.transfer_ctl.binary);
            op.state = RawTransferState::PortPasv;
            OpOutcome::Continue
        }
        RawTransferState::PortPasv => {
            if op.passive {
                if code != 2 {
                    if op.used_epsv {
                        // Fall back to plain PASV and remember the refusal.
                        session.caps.set(
                            &session.server_key,
                            Capability::EpsvCommand,
                            TriState::No,
                        );
                        op.used_epsv = false;
                        return OpOutcome::Continue;
                    }
                    return OpOutcome::Error(ResultFlags::ERROR);
                }
                let target = if op.used_epsv {
                    parse_epsv_reply(reply.text()).map(|port| {
                        let peer = host
                            .peer_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_default();
                        (peer, port)
                    })
                } else {
                    parse_pasv_reply(reply.text())
                };
                let (mut ip, port) = match target {
                    Some(t) => t,
                    None => {
                        session
                            .notifier
                            .error("Failed to parse passive mode reply");
                        return OpOutcome::Error(ResultFlags::ERROR);
                    }
                };
                if let (Ok(parsed), Some(peer)) = (ip.parse::<IpAddr>(), host.peer_addr()) {
                    if !is_routable(parsed) && is_routable(peer) {
                        session.notifier.status(
                            "Server sent passive reply with unroutable address. Using server address instead.",
                        );
                        ip = peer.to_string();
                    }
                }
                host.connect_data(&ip, port, session.transfer_ctl.mode, session.prot_p);
                op.state = RawTransferState::Rest;
                return OpOutcome::Continue;
            }
            // Reply to PORT/EPRT.
            if code == 2 {
                op.state = RawTransferState::Rest;
                return OpOutcome::Continue;
            }
            active_failed(op, session, host)
        }
        RawTransferState::Rest => {
            if code == 2 || code == 3 {
                op.state = RawTransferState::Transfer;
                OpOutcome::Continue
            } else {
                OpOutcome::Error(ResultFlags::ERROR)
            }
        }
        RawTransferState::Transfer
        | RawTransferState::WaitFinish
        | RawTransferState::WaitTransfer
        | RawTransferState::WaitTransferPre => {
            if code == 1 {
                // Expected even before the data connection is accepted; some
                // servers race ahead.
                match op.state {
                    RawTransferState::Transfer => op.state = RawTransferState::WaitFinish,
                    RawTransferState::WaitTransferPre => {
                        op.state = RawTransferState::WaitTransfer
                    }
                    _ => debug!("preliminary reply in state {:?}", op.state),
                }
                return OpOutcome::WouldBlock;
            }
            if code == 2 {
                return match op.state {
                    RawTransferState::Transfer | RawTransferState::WaitFinish => {
                        op.state = RawTransferState::WaitSocket;
                        OpOutcome::WouldBlock
                    }
                    _ => finish(session),
                };
            }
            // 4xx/5xx: the transfer command (or the transfer) failed.
            if session.transfer_ctl.end_reason == TransferEndReason::Successful
                || session.transfer_ctl.end_reason == TransferEndReason::None
            {
                session.transfer_ctl.end_reason =
                    if op.state == RawTransferState::Transfer && code == 5 {
                        TransferEndReason::TransferCommandFailureImmediate
                    } else {
                        TransferEndReason::TransferCommandFailure
                    };
            }
            host.reset_data();
            OpOutcome::Error(ResultFlags::ERROR)
        }
        RawTransferState::WaitSocket => {
            debug!("reply while waiting for data socket, ignoring");
            OpOutcome::WouldBlock
        }
    }
}

/// The data channel reported its end (the engine already merged the reason
/// into the transfer control block).
pub fn on_transfer_end(op: &mut RawTransferOpData, session: &mut SessionState) -> OpOutcome {
    match op.state {
        RawTransferState::Transfer => {
            op.state = RawTransferState::WaitTransferPre;
            OpOutcome::WouldBlock
        }
        RawTransferState::WaitFinish => {
            op.state = RawTransferState::WaitTransfer;
            OpOutcome::WouldBlock
        }
        RawTransferState::WaitSocket => finish(session),
        s => {
            debug!("transfer end at unusual op state {:?}, ignoring", s);
            OpOutcome::WouldBlock
        }
    }
}

fn finish(session: &mut SessionState) -> OpOutcome {
    if session.transfer_ctl.end_reason == TransferEndReason::Successful {
        OpOutcome::Ok
    } else {
        OpOutcome::Error(ResultFlags::ERROR)
    }
}

fn active_failed(
    op: &mut RawTransferOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
) -> OpOutcome {
    if !op.tried_active {
        session
            .notifier
            .status("Active mode failed, trying passive mode");
        op.tried_active = true;
        op.passive = true;
        host.reset_data();
        return OpOutcome::Continue;
    }
    OpOutcome::Error(ResultFlags::ERROR)
}

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`. Servers vary in the
/// decoration, so scan for the six numbers.
pub fn parse_pasv_reply(text: &str) -> Option<(String, u16)> {
    let mut nums = Vec::new();
    let mut current: Option<u32> = None;
    for c in text.chars().skip(4) {
        match c {
            '0'..='9' => {
                let d = c as u32 - '0' as u32;
                let value = current.unwrap_or(0) * 10 + d;
                if value > 255 {
                    current = None;
                    nums.clear();
                } else {
                    current = Some(value);
                }
            }
            ',' => match current.take() {
                Some(n) => nums.push(n),
                None => nums.clear(),
            },
            _ => {
                if let Some(n) = current.take() {
                    nums.push(n);
                }
                if nums.len() >= 6 {
                    break;
                }
                nums.clear();
            }
        }
    }
    if let Some(n) = current {
        nums.push(n);
    }
    if nums.len() < 6 {
        return None;
    }
    let ip = format!("{}.{}.{}.{}", nums[0], nums[1], nums[2], nums[3]);
    let port = (nums[4] << 8 | nums[5]) as u16;
    Some((ip, port))
}

/// `229 Entering Extended Passive Mode (|||port|)`.
pub fn parse_epsv_reply(text: &str) -> Option<u16> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let inner = &text[open + 1..close];
    let mut parts = inner.split('|');
    parts.next()?; // before first delimiter
    parts.next()?; // protocol
    parts.next()?; // address
    parts.next()?.trim().parse().ok()
}
