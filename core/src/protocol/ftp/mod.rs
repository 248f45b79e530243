/*
 * mod.rs
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

//! FTP control-channel engine: reply reader, capability registry, operation
//! state machines, dispatcher, and the async session shell.
//!
//! The engine core ([`engine::FtpEngine`]) is synchronous and event-driven;
//! [`session`] pumps the sockets and timers around it.

pub mod capabilities;
pub mod engine;
pub mod ops;
pub mod reply;
pub mod session;
pub mod transfer;

use crate::path::PathKind;

/// Connection security of an FTP server entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpProtocol {
    /// Plain FTP, no TLS ever.
    Plain,
    /// FTP with mandatory explicit TLS via AUTH TLS.
    ExplicitTls,
    /// Explicit TLS with AUTH SSL fallback; falls back to plain if the
    /// server supports neither.
    ExplicitTlsCompat,
    /// TLS handshake immediately after connect (usually port 990).
    ImplicitTls,
}

impl FtpProtocol {
    /// True if the session must not proceed without TLS.
    pub fn requires_tls(self) -> bool {
        matches!(self, FtpProtocol::ExplicitTls | FtpProtocol::ImplicitTls)
    }
}

/// Preferred data-connection mode for one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasvMode {
    /// Follow the global `use_passive` option.
    Default,
    Passive,
    Active,
}

/// How server bytes are turned into strings (and back).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingMode {
    /// UTF-8 when the server accepted OPTS UTF8 ON, otherwise try UTF-8 and
    /// fall back to Latin-1.
    Auto,
    ForceUtf8,
    Force8Bit,
}

/// Everything the engine needs to know about the server it talks to.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    pub protocol: FtpProtocol,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub account: Option<String>,
    pub pasv_mode: PasvMode,
    /// Path-syntax hint; Default autodetects from the first PWD.
    pub server_type: PathKind,
    /// Minutes added to server-reported times (MDTM) and subtracted for MFMT.
    pub timezone_offset_minutes: i32,
    pub encoding: EncodingMode,
    /// Raw commands to issue after a successful logon.
    pub post_logon_commands: Vec<String>,
}

impl ServerDescriptor {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        ServerDescriptor {
            protocol: FtpProtocol::Plain,
            host: host.into(),
            port,
            user: user.into(),
            password: None,
            account: None,
            pasv_mode: PasvMode::Default,
            server_type: PathKind::Default,
            timezone_offset_minutes: 0,
            encoding: EncodingMode::Auto,
            post_logon_commands: Vec::new(),
        }
    }

    /// Registry/snapshot key: one capability set per (host, port, user).
    pub fn capability_key(&self) -> (String, u16, String) {
        (self.host.clone(), self.port, self.user.clone())
    }
}

/// Operation result: OK is the empty set, anything else is a failure with
/// qualifying bits. Mirrors the reply-code bitset the ops pass around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultFlags(u32);

impl ResultFlags {
    pub const OK: ResultFlags = ResultFlags(0);
    pub const ERROR: ResultFlags = ResultFlags(1 << 0);
    pub const CRITICAL: ResultFlags = ResultFlags(1 << 1);
    pub const NOTSUPPORTED: ResultFlags = ResultFlags(1 << 2);
    pub const SYNTAX: ResultFlags = ResultFlags(1 << 3);
    pub const TIMEOUT: ResultFlags = ResultFlags(1 << 4);
    pub const DISCONNECTED: ResultFlags = ResultFlags(1 << 5);
    pub const CANCELED: ResultFlags = ResultFlags(1 << 6);
    pub const WRITEFAILED: ResultFlags = ResultFlags(1 << 7);
    pub const INTERNAL: ResultFlags = ResultFlags(1 << 8);
    pub const PASSWORD_FAILED: ResultFlags = ResultFlags(1 << 9);

    pub const CRITICAL_ERROR: ResultFlags = ResultFlags(1 << 0 | 1 << 1);

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    pub fn is_err(self) -> bool {
        self.0 != 0
    }

    pub fn contains(self, other: ResultFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ResultFlags {
    type Output = ResultFlags;
    fn bitor(self, rhs: ResultFlags) -> ResultFlags {
        ResultFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ResultFlags {
    fn bitor_assign(&mut self, rhs: ResultFlags) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Display for ResultFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_ok() {
            return write!(f, "ok");
        }
        let names = [
            (ResultFlags::ERROR, "error"),
            (ResultFlags::CRITICAL, "critical"),
            (ResultFlags::NOTSUPPORTED, "not-supported"),
            (ResultFlags::SYNTAX, "syntax"),
            (ResultFlags::TIMEOUT, "timeout"),
            (ResultFlags::DISCONNECTED, "disconnected"),
            (ResultFlags::CANCELED, "canceled"),
            (ResultFlags::WRITEFAILED, "write-failed"),
            (ResultFlags::INTERNAL, "internal"),
            (ResultFlags::PASSWORD_FAILED, "password-failed"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let f = ResultFlags::ERROR | ResultFlags::DISCONNECTED;
        assert!(f.is_err());
        assert!(f.contains(ResultFlags::ERROR));
        assert!(f.contains(ResultFlags::DISCONNECTED));
        assert!(!f.contains(ResultFlags::CRITICAL));
        assert_eq!(format!("{}", f), "error|disconnected");
    }

    #[test]
    fn critical_error_is_both_bits() {
        assert!(ResultFlags::CRITICAL_ERROR.contains(ResultFlags::ERROR));
        assert!(ResultFlags::CRITICAL_ERROR.contains(ResultFlags::CRITICAL));
    }
}
