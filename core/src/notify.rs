/*
 * notify.rs
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

//! Notifications from an engine to the UI layer: ordered, lossless, delivered
//! over an unbounded mpsc channel. Async requests (password, certificate
//! trust, file-exists resolution) are notifications whose reply comes back
//! through the session as an event.

use crate::path::ServerPath;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Severity/kind of a log line shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Status,
    /// Command echo (possibly with masked arguments).
    Command,
    /// Raw server reply echo.
    Response,
    Warning,
    Error,
}

/// What the user may decide when the target of a transfer already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileExistsAction {
    /// Re-issue the prompt.
    Ask,
    Overwrite,
    OverwriteIfNewer,
    OverwriteIfDifferentSize,
    OverwriteIfNewerOrDifferentSize,
    Resume,
    Rename(String),
    Skip,
}

/// Payload of the file-exists prompt: both sides of the conflict.
#[derive(Debug, Clone)]
pub struct FileExistsPrompt {
    pub download: bool,
    pub local_file: String,
    pub local_size: Option<u64>,
    pub local_time: Option<DateTime<Utc>>,
    pub remote_file: String,
    pub remote_path: ServerPath,
    pub remote_size: Option<u64>,
    pub remote_time: Option<DateTime<Utc>>,
}

/// Certificate data surfaced for a trust decision.
#[derive(Debug, Clone)]
pub struct CertificatePrompt {
    pub host: String,
    pub port: u16,
    /// DER of the presented chain, leaf first.
    pub chain: Vec<Vec<u8>>,
    /// SHA-256 fingerprint of the leaf, hex.
    pub fingerprint: String,
    /// True if the chain verified against the system roots.
    pub system_trust: bool,
}

/// An asynchronous request the engine poses to the user. The engine stalls
/// (top op frame waits) until the matching [`AsyncReply`] arrives.
#[derive(Debug, Clone)]
pub enum AsyncRequest {
    /// Password (and possibly account) needed to continue logon; the payload
    /// is the server challenge text accumulated so far.
    InteractiveLogin { challenge: String },
    Certificate(CertificatePrompt),
    FileExists(FileExistsPrompt),
    /// Host key verification (SFTP sessions; never raised by the FTP engine).
    Hostkey { host: String, port: u16, fingerprint: String },
}

/// Reply to an [`AsyncRequest`], fed back into the session.
#[derive(Debug, Clone)]
pub enum AsyncReply {
    /// `None` cancels the logon.
    InteractiveLogin { password: Option<String> },
    Certificate { trusted: bool },
    FileExists(FileExistsAction),
    Hostkey { trusted: bool },
}

/// One notification to the UI layer.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Connection endpoint and resolved identity, sent once per logon.
    ConnectionInfo { host: String, port: u16, user: String },
    LogMsg { level: LogLevel, text: String },
    /// A remote directory changed (or a listing attempt failed).
    DirectoryListing {
        path: ServerPath,
        modified: bool,
        failed: bool,
    },
    /// Start-of-transfer status: total size if known and the resume offset.
    TransferStatus {
        total: Option<u64>,
        current: u64,
        start_offset: u64,
    },
    AsyncRequest(AsyncRequest),
    /// The engine became idle (op stack empty), after completion or cancel.
    Idle,
}

/// Sending half of the notification queue. Cloneable; never blocks.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn channel() -> (Notifier, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Notifier { tx }, rx)
    }

    pub fn send(&self, n: Notification) {
        // A closed receiver means the UI is gone; nothing useful to do.
        let _ = self.tx.send(n);
    }

    pub fn log(&self, level: LogLevel, text: impl Into<String>) {
        self.send(Notification::LogMsg {
            level,
            text: text.into(),
        });
    }

    pub fn status(&self, text: impl Into<String>) {
        self.log(LogLevel::Status, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.log(LogLevel::Error, text);
    }

    /// Echo a command at Command level. With `mask_args` everything after the
    /// first space is replaced by stars (PASS, ACCT).
    pub fn command(&self, cmd: &str, mask_args: bool) {
        if mask_args {
            if let Some(pos) = cmd.find(' ') {
                let stars = "*".repeat(cmd.len() - pos - 1);
                self.log(LogLevel::Command, format!("{}{}", &cmd[..pos + 1], stars));
                return;
            }
        }
        self.log(LogLevel::Command, cmd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_echo_masks_arguments() {
        let (n, mut rx) = Notifier::channel();
        n.command("PASS hunter2", true);
        match rx.try_recv().unwrap() {
            Notification::LogMsg { level, text } => {
                assert_eq!(level, LogLevel::Command);
                assert_eq!(text, "PASS *******");
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[test]
    fn command_echo_without_args_unmasked() {
        let (n, mut rx) = Notifier::channel();
        n.command("PWD", true);
        match rx.try_recv().unwrap() {
            Notification::LogMsg { text, .. } => assert_eq!(text, "PWD"),
            other => panic!("unexpected notification {:?}", other),
        }
    }
}
