/*
 * logon.rs
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

//! Logon sequence: welcome, AUTH TLS/SSL, USER/PASS/ACCT (interactive when
//! needed), SYST, FEAT, CLNT, OPTS UTF8, PBSZ/PROT, per-server custom
//! commands. A logon failure always brings the connection down.

use log::debug;

use crate::notify::{AsyncRequest, LogLevel, Notification};
use crate::path::PathKind;

use super::super::capabilities::{Capability, TriState};
use super::super::engine::{EngineHost, SessionState};
use super::super::reply::Reply;
use super::super::{EncodingMode, FtpProtocol, ResultFlags};
use super::OpOutcome;

/// Name sent with CLNT when the server supports it.
const CLIENT_NAME: &str = "Traghetto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogonState {
    /// TCP (and possibly implicit TLS) still coming up.
    Connect,
    Welcome,
    AuthTls,
    AuthSsl,
    /// AUTH accepted; TLS handshake in progress.
    AuthWait,
    User,
    Pass,
    Acct,
    Syst,
    Feat,
    Clnt,
    OptsUtf8,
    Pbsz,
    Prot,
    CustomCommands,
    Done,
}

#[derive(Debug)]
pub struct LogonOpData {
    pub state: LogonState,
    pub wait_async: bool,
    /// Server text accumulated for the interactive login prompt.
    challenge: String,
    collect_challenge: bool,
    got_first_welcome_line: bool,
    tried_auth_ssl: bool,
    custom_index: usize,
}

impl LogonOpData {
    pub fn new(server: &super::super::ServerDescriptor) -> Self {
        LogonOpData {
            state: LogonState::Connect,
            wait_async: false,
            challenge: String::new(),
            collect_challenge: server.password.is_none(),
            got_first_welcome_line: false,
            tried_auth_ssl: false,
            custom_index: 0,
        }
    }
}

/// The TCP socket (or implicit-TLS handshake) is up; the welcome reply is
/// next on the wire.
pub fn socket_connected(op: &mut LogonOpData) {
    if op.state == LogonState::Connect {
        op.state = LogonState::Welcome;
    }
}

/// A mid-session TLS handshake finished (explicit TLS path).
pub fn tls_established(op: &mut LogonOpData) {
    match op.state {
        LogonState::AuthWait => op.state = LogonState::User,
        LogonState::Connect => op.state = LogonState::Welcome,
        s => debug!("TLS established in unexpected logon state {:?}", s),
    }
}

/// The user answered the interactive login prompt.
pub fn password_provided(op: &mut LogonOpData, session: &mut SessionState, value: String) {
    match op.state {
        LogonState::Acct => session.server.account = Some(value),
        _ => session.server.password = Some(value),
    }
    op.collect_challenge = false;
}

/// Per-line hook, called before reply assembly. Returns Some(flags) when the
/// connection must be torn down at once.
pub fn on_line(op: &mut LogonOpData, session: &mut SessionState, line: &str) -> Option<ResultFlags> {
    if op.state == LogonState::Welcome && !op.got_first_welcome_line {
        op.got_first_welcome_line = true;
        if line.len() >= 3 && line[..3].eq_ignore_ascii_case("ssh") {
            session.notifier.error(
                "Cannot establish FTP connection to an SFTP server. Please select proper protocol.",
            );
            return Some(ResultFlags::CRITICAL_ERROR);
        }
    }
    if op.state == LogonState::Feat {
        parse_feat(session, line);
    }
    if op.collect_challenge && op.state <= LogonState::Pass {
        if !op.challenge.is_empty() {
            op.challenge.push('\n');
        }
        op.challenge.push_str(line);
    }
    None
}

pub fn send(op: &mut LogonOpData, session: &mut SessionState, host: &mut dyn EngineHost) -> OpOutcome {
    match op.state {
        LogonState::Connect | LogonState::Welcome | LogonState::AuthWait => OpOutcome::WouldBlock,
        LogonState::AuthTls => {
            if !session.send_command(host, "AUTH TLS", false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        LogonState::AuthSsl => {
            if !session.send_command(host, "AUTH SSL", false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        LogonState::User => {
            let user = session.server.user.clone();
            if !session.send_command(host, &format!("USER {}", user), false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        LogonState::Pass => match session.server.password.clone() {
            Some(p) => {
                if !session.send_command(host, &format!("PASS {}", p), true, true) {
                    return OpOutcome::Error(ResultFlags::ERROR);
                }
                OpOutcome::WouldBlock
            }
            None => request_interactive(op, session),
        },
        LogonState::Acct => match session.server.account.clone() {
            Some(a) => {
                if !session.send_command(host, &format!("ACCT {}", a), true, true) {
                    return OpOutcome::Error(ResultFlags::ERROR);
                }
                OpOutcome::WouldBlock
            }
            None => request_interactive(op, session),
        },
        LogonState::Syst => {
            if !session.send_command(host, "SYST", false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        LogonState::Feat => {
            if !session.send_command(host, "FEAT", false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        LogonState::Clnt => {
            if session.caps.get(&session.server_key, Capability::ClntCommand) != TriState::Yes {
                op.state = LogonState::OptsUtf8;
                return OpOutcome::Continue;
            }
            if !session.send_command(host, &format!("CLNT {}", CLIENT_NAME), false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        LogonState::OptsUtf8 => {
            let advertised =
                session.caps.get(&session.server_key, Capability::Utf8Command) == TriState::Yes;
            let wanted = match session.server.encoding {
                EncodingMode::Force8Bit => false,
                EncodingMode::ForceUtf8 => true,
                EncodingMode::Auto => advertised,
            };
            if !wanted {
                op.state = LogonState::Pbsz;
                return OpOutcome::Continue;
            }
            if !session.send_command(host, "OPTS UTF8 ON", false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        LogonState::Pbsz => {
            if !session.tls_active {
                op.state = LogonState::CustomCommands;
                return OpOutcome::Continue;
            }
            if !session.send_command(host, "PBSZ 0", false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        LogonState::Prot => {
            if !session.send_command(host, "PROT P", false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        LogonState::CustomCommands => {
            let cmd = match session.server.post_logon_commands.get(op.custom_index) {
                Some(c) => c.clone(),
                None => {
                    op.state = LogonState::Done;
                    return OpOutcome::Continue;
                }
            };
            op.custom_index += 1;
            if !session.send_command(host, &cmd, false, false) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        LogonState::Done => {
            session.notifier.send(Notification::ConnectionInfo {
                host: session.server.host.clone(),
                port: session.server.port,
                user: session.server.user.clone(),
            });
            session.notifier.status("Logged in");
            OpOutcome::Ok
        }
    }
}

fn request_interactive(op: &mut LogonOpData, session: &mut SessionState) -> OpOutcome {
    op.wait_async = true;
    session
        .notifier
        .send(Notification::AsyncRequest(AsyncRequest::InteractiveLogin {
            challenge: op.challenge.clone(),
        }));
    OpOutcome::WouldBlock
}

pub fn parse_reply(
    op: &mut LogonOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
    reply: &Reply,
) -> OpOutcome {
    let code = reply.code_class();
    match op.state {
        LogonState::Welcome => {
            if code != 2 {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            let explicit = matches!(
                session.server.protocol,
                FtpProtocol::ExplicitTls | FtpProtocol::ExplicitTlsCompat
            );
            op.state = if explicit && !session.tls_active {
                LogonState::AuthTls
            } else {
                LogonState::User
            };
            OpOutcome::Continue
        }
        LogonState::AuthTls => {
            if code == 2 {
                op.state = LogonState::AuthWait;
                host.start_tls();
                return OpOutcome::WouldBlock;
            }
            if session.server.protocol == FtpProtocol::ExplicitTlsCompat && !op.tried_auth_ssl {
                op.tried_auth_ssl = true;
                op.state = LogonState::AuthSsl;
                return OpOutcome::Continue;
            }
            session
                .notifier
                .error("Server refused TLS, closing connection");
            OpOutcome::Error(ResultFlags::CRITICAL_ERROR)
        }
        LogonState::AuthSsl => {
            if code == 2 {
                op.state = LogonState::AuthWait;
                host.start_tls();
                return OpOutcome::WouldBlock;
            }
            // Compatibility mode: continue without TLS.
            session
                .notifier
                .log(LogLevel::Warning, "Server does not support TLS, continuing unencrypted");
            op.state = LogonState::User;
            OpOutcome::Continue
        }
        LogonState::AuthWait => {
            debug!("reply during TLS handshake, ignoring");
            OpOutcome::WouldBlock
        }
        LogonState::User => match code {
            2 => {
                op.collect_challenge = false;
                op.state = LogonState::Syst;
                OpOutcome::Continue
            }
            3 => {
                op.state = LogonState::Pass;
                OpOutcome::Continue
            }
            _ => OpOutcome::Error(ResultFlags::ERROR),
        },
        LogonState::Pass => match code {
            2 => {
                op.collect_challenge = false;
                op.state = LogonState::Syst;
                OpOutcome::Continue
            }
            3 => {
                op.state = LogonState::Acct;
                OpOutcome::Continue
            }
            _ => OpOutcome::Error(ResultFlags::ERROR | ResultFlags::PASSWORD_FAILED),
        },
        LogonState::Acct => {
            if code == 2 {
                op.collect_challenge = false;
                op.state = LogonState::Syst;
                OpOutcome::Continue
            } else {
                OpOutcome::Error(ResultFlags::ERROR | ResultFlags::PASSWORD_FAILED)
            }
        }
        LogonState::Syst => {
            if reply.code() == 215 {
                apply_system_type(session, reply.tail());
            }
            op.state = LogonState::Feat;
            OpOutcome::Continue
        }
        LogonState::Feat => {
            // Capability lines were consumed per-line; a refused FEAT is fine.
            op.state = LogonState::Clnt;
            OpOutcome::Continue
        }
        LogonState::Clnt => {
            op.state = LogonState::OptsUtf8;
            OpOutcome::Continue
        }
        LogonState::OptsUtf8 => {
            if code == 2 {
                session.utf8_active = true;
            }
            op.state = LogonState::Pbsz;
            OpOutcome::Continue
        }
        LogonState::Pbsz => {
            op.state = LogonState::Prot;
            OpOutcome::Continue
        }
        LogonState::Prot => {
            if code == 2 {
                session.prot_p = true;
            } else {
                session.notifier.log(
                    LogLevel::Warning,
                    "Server does not support encrypted data connections",
                );
            }
            op.state = LogonState::CustomCommands;
            OpOutcome::Continue
        }
        LogonState::CustomCommands => {
            if code != 2 && code != 3 {
                session
                    .notifier
                    .log(LogLevel::Warning, format!("Command failed: {}", reply.text()));
            }
            OpOutcome::Continue
        }
        LogonState::Connect | LogonState::Done => {
            debug!("reply in logon state {:?}", op.state);
            OpOutcome::Error(ResultFlags::ERROR | ResultFlags::INTERNAL)
        }
    }
}

/// Adjust the path-syntax hint from the SYST reply when none is configured.
fn apply_system_type(session: &mut SessionState, text: &str) {
    if session.server.server_type != PathKind::Default {
        return;
    }
    let up = text.to_ascii_uppercase();
    if up.starts_with("VMS") {
        session.server.server_type = PathKind::Vms;
    } else if up.starts_with("MVS") {
        session.server.server_type = PathKind::Mvs;
    }
}

/// Case-insensitive prefix match with a mandatory following space or end.
fn has_feature(line: &str, feature: &str) -> bool {
    line == feature
        || (line.len() > feature.len()
            && line.starts_with(feature)
            && line.as_bytes()[feature.len()] == b' ')
}

/// One FEAT continuation line.
pub fn parse_feat(session: &mut SessionState, line: &str) {
    let line = line.trim();
    let up = line.to_ascii_uppercase();
    let key = session.server_key.clone();

    if has_feature(&up, "UTF8") {
        session.caps.set(&key, Capability::Utf8Command, TriState::Yes);
    } else if has_feature(&up, "CLNT") {
        session.caps.set(&key, Capability::ClntCommand, TriState::Yes);
    } else if has_feature(&up, "MLSD") {
        // FEAT output for MLST overrides MLSD.
        let facts = match session.caps.param(&key, Capability::MlsdCommand) {
            Some(f) => f.to_string(),
            None => {
                if line.len() > 5 {
                    line[5..].to_string()
                } else {
                    String::new()
                }
            }
        };
        session
            .caps
            .set_with_param(&key, Capability::MlsdCommand, TriState::Yes, Some(&facts));
        // MLST/MLSD specs require use of UTC.
        session.caps.set(&key, Capability::TimezoneOffset, TriState::No);
    } else if has_feature(&up, "MLST") {
        let mut facts = if line.len() > 5 {
            line[5..].to_string()
        } else {
            String::new()
        };
        if facts.is_empty() {
            if let Some(f) = session.caps.param(&key, Capability::MlsdCommand) {
                facts = f.to_string();
            }
        }
        session
            .caps
            .set_with_param(&key, Capability::MlsdCommand, TriState::Yes, Some(&facts));
        session.caps.set(&key, Capability::TimezoneOffset, TriState::No);
    } else if has_feature(&up, "MODE Z") {
        session.caps.set(&key, Capability::ModeZSupport, TriState::Yes);
    } else if has_feature(&up, "MFMT") {
        session.caps.set(&key, Capability::MfmtCommand, TriState::Yes);
    } else if has_feature(&up, "MDTM") {
        session.caps.set(&key, Capability::MdtmCommand, TriState::Yes);
    } else if has_feature(&up, "SIZE") {
        session.caps.set(&key, Capability::SizeCommand, TriState::Yes);
    } else if has_feature(&up, "TVFS") {
        session.caps.set(&key, Capability::TvfsSupport, TriState::Yes);
    } else if has_feature(&up, "REST STREAM") {
        session.caps.set(&key, Capability::RestStream, TriState::Yes);
    } else if has_feature(&up, "EPSV") {
        session.caps.set(&key, Capability::EpsvCommand, TriState::Yes);
    }
}
