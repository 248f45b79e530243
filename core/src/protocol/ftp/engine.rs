/*
 * engine.rs
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

//! The control-channel engine proper: reply accounting, the operation stack,
//! and the dispatcher that advances the top frame on every event.
//!
//! The engine is synchronous. Socket bytes, data-channel completions, timer
//! fires, and user replies are fed in as calls; everything the engine wants
//! done in the world goes out through [`EngineHost`]. The async shell in
//! [`super::session`] wires both ends to tokio.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::cache::{DirectoryCache, PathCache, ServerKey};
use crate::extip::ExternalIpState;
use crate::notify::{AsyncReply, LogLevel, Notification, Notifier};
use crate::options::Options;
use crate::path::ServerPath;

use super::capabilities::CapabilityRegistry;
use super::ops::{OpData, OpOutcome};
use super::reply::{encode_command, ConversionError, ReaderEvent, Reply, ReplyReader};
use super::transfer::{TransferEndReason, TransferMode};
use super::{FtpProtocol, ResultFlags, ServerDescriptor};

/// How long after the last completed command keep-alives are still sent.
const KEEPALIVE_WINDOW: Duration = Duration::from_secs(30 * 60);
/// One-shot idle timer interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// How the engine wants a local file opened for the coming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOpenMode {
    /// Open for reading (upload source).
    ReadUpload,
    /// Open existing for writing, keep content, position at end (resume).
    WriteResume,
    /// Create or truncate (fresh download).
    WriteFresh,
}

/// What the engine can learn about a local file without opening it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileInfo {
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

/// Everything the engine asks of the outside world. Implemented by the async
/// shell; tests use a recording mock.
pub trait EngineHost {
    /// Queue bytes on the control connection.
    fn send_control(&mut self, data: &[u8]);
    /// Begin a TLS handshake on the control connection (AUTH accepted, or
    /// implicit TLS right after connect). Completion arrives as
    /// `on_tls_result`.
    fn start_tls(&mut self);
    /// Record the user's verdict on the current certificate chain so data
    /// connections can reuse it.
    fn trust_current_cert(&mut self, trusted: bool);
    /// Tear down the control connection.
    fn close_connection(&mut self);

    /// Start a passive-mode data connection. Failures surface as a
    /// `TransferEnd` event.
    fn connect_data(&mut self, host: &str, port: u16, mode: TransferMode, tls: bool);
    /// Open a listen socket for active mode; returns the local port.
    fn listen_data(&mut self, mode: TransferMode, tls: bool) -> Result<u16, String>;
    /// Drop the data socket (and listener) if any.
    fn reset_data(&mut self);

    fn local_addr(&self) -> Option<IpAddr>;
    fn peer_addr(&self) -> Option<IpAddr>;
    /// Fetch the public address from `url`; completion arrives as
    /// `on_ip_resolved`.
    fn resolve_external_ip(&mut self, url: &str);

    fn start_idle_timer(&mut self, after: Duration);
    fn stop_idle_timer(&mut self);

    /// The op stack emptied; the result is for the caller of the high-level
    /// operation.
    fn operation_complete(&mut self, result: ResultFlags);

    // Local filesystem, kept behind the host so the engine stays pure.
    fn local_file_info(&mut self, path: &str) -> Option<LocalFileInfo>;
    /// Open the local file for the coming transfer and hand it to the io
    /// worker. `offset` is where an upload starts reading; resumed downloads
    /// position at the end instead. Returns the resulting offset (the file
    /// size for a resumed download).
    fn open_local_file(
        &mut self,
        path: &str,
        mode: LocalOpenMode,
        offset: u64,
        binary: bool,
    ) -> Result<u64, String>;
    fn preallocate_local(&mut self, bytes: u64);
    /// Delete `path` if it exists with size zero (failed-download hygiene).
    fn remove_empty_local_file(&mut self, path: &str);
    fn set_local_mtime(&mut self, path: &str, mtime: DateTime<Utc>);
}

/// Shared per-transfer control block. There is at most one transfer on the
/// stack at a time, so the file-transfer (or list) op and its raw-transfer
/// child share state here instead of holding links to each other.
#[derive(Debug)]
pub struct TransferCtl {
    pub command_sent: bool,
    pub end_reason: TransferEndReason,
    pub resume_offset: u64,
    pub binary: bool,
    pub mode: TransferMode,
}

impl Default for TransferCtl {
    fn default() -> Self {
        TransferCtl {
            command_sent: false,
            end_reason: TransferEndReason::None,
            resume_offset: 0,
            binary: true,
            mode: TransferMode::Download,
        }
    }
}

/// Session state the op state machines read and write.
pub struct SessionState {
    pub server: ServerDescriptor,
    pub server_key: ServerKey,
    pub current_path: ServerPath,
    /// Last TYPE accepted by the server: None = unknown.
    pub last_type_binary: Option<bool>,
    pub pending_replies: u32,
    pub replies_to_skip: u32,
    /// OPTS UTF8 ON accepted.
    pub utf8_active: bool,
    pub tls_active: bool,
    /// PROT P accepted: data connections run TLS.
    pub prot_p: bool,
    pub caps: CapabilityRegistry,
    pub dir_cache: DirectoryCache,
    pub path_cache: PathCache,
    pub options: Options,
    pub notifier: Notifier,
    pub transfer_ctl: TransferCtl,
    pub extip: ExternalIpState,
    /// First digit of the most recent non-skipped reply.
    pub last_reply_class: u8,
    rtt_start: Option<Instant>,
    pub latest_rtt: Option<Duration>,
}

impl SessionState {
    /// Send one command: echo it, convert to the wire charset, count the
    /// pending reply. Returns false (and aborts nothing itself) when charset
    /// conversion fails.
    pub fn send_command(
        &mut self,
        host: &mut dyn EngineHost,
        cmd: &str,
        mask_args: bool,
        measure_rtt: bool,
    ) -> bool {
        self.notifier.command(cmd, mask_args);
        let encoded = match encode_command(cmd, self.server.encoding, self.utf8_active) {
            Some(e) => e,
            None => {
                self.notifier
                    .error("Failed to convert command to 8 bit charset");
                return false;
            }
        };
        let mut wire = encoded;
        wire.extend_from_slice(b"\r\n");
        host.send_control(&wire);
        self.pending_replies += 1;
        if measure_rtt {
            self.rtt_start = Some(Instant::now());
        }
        true
    }

    fn rtt_stop(&mut self) {
        if let Some(t) = self.rtt_start.take() {
            self.latest_rtt = Some(t.elapsed());
        }
    }
}

/// The engine: one per control connection.
pub struct FtpEngine {
    session: SessionState,
    stack: Vec<OpData>,
    reader: ReplyReader,
    closed: bool,
    last_command_completion: Option<Instant>,
    idle_timer_running: bool,
    keepalive_rng: SmallRng,
}

impl FtpEngine {
    pub fn new(server: ServerDescriptor, options: Options, notifier: Notifier) -> Self {
        Self::with_capabilities(server, options, notifier, CapabilityRegistry::new())
    }

    /// Construct with a pre-loaded capability registry (snapshot from disk).
    pub fn with_capabilities(
        server: ServerDescriptor,
        options: Options,
        notifier: Notifier,
        caps: CapabilityRegistry,
    ) -> Self {
        let server_key = server.capability_key();
        FtpEngine {
            session: SessionState {
                server,
                server_key,
                current_path: ServerPath::empty(),
                last_type_binary: None,
                pending_replies: 0,
                replies_to_skip: 0,
                utf8_active: false,
                tls_active: false,
                prot_p: false,
                caps,
                dir_cache: DirectoryCache::new(),
                path_cache: PathCache::new(),
                options,
                notifier,
                transfer_ctl: TransferCtl::default(),
                extip: ExternalIpState::default(),
                last_reply_class: 0,
                rtt_start: None,
                latest_rtt: None,
            },
            stack: Vec::new(),
            reader: ReplyReader::new(),
            closed: false,
            last_command_completion: None,
            idle_timer_running: false,
            keepalive_rng: SmallRng::from_entropy(),
        }
    }

    /// Deterministic keep-alive choice for tests.
    pub fn seed_keepalive_rng(&mut self, seed: u64) {
        self.keepalive_rng = SmallRng::seed_from_u64(seed);
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionState {
        &mut self.session
    }

    pub fn pending_replies(&self) -> u32 {
        self.session.pending_replies
    }

    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Name of the current top frame, for diagnostics and tests.
    pub fn current_op(&self) -> Option<&'static str> {
        self.stack.last().map(OpData::kind_name)
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    // ---- high-level operations ----------------------------------------

    /// Begin the logon sequence. The shell calls this right before opening
    /// the TCP connection.
    pub fn connect(&mut self, host: &mut dyn EngineHost) -> ResultFlags {
        if !self.stack.is_empty() {
            warn!("connect with nonempty op stack");
            return ResultFlags::ERROR | ResultFlags::INTERNAL;
        }
        self.stack
            .push(OpData::Logon(super::ops::LogonOpData::new(&self.session.server)));
        let _ = host;
        ResultFlags::OK
    }

    pub fn list(
        &mut self,
        host: &mut dyn EngineHost,
        path: ServerPath,
        sub_dir: String,
    ) -> ResultFlags {
        if let Some(f) = self.check_ready() {
            return f;
        }
        let target = if sub_dir.is_empty() {
            path.clone()
        } else {
            path.change_path(&sub_dir)
        };
        if target.is_empty() {
            self.session
                .notifier
                .status("Retrieving directory listing...");
        } else {
            self.session.notifier.status(format!(
                "Retrieving directory listing of \"{}\"...",
                target.get_path()
            ));
        }
        self.stack
            .push(OpData::List(super::ops::ListOpData::new(path, sub_dir)));
        self.send_next(host);
        ResultFlags::OK
    }

    pub fn change_dir(
        &mut self,
        host: &mut dyn EngineHost,
        path: ServerPath,
        sub_dir: String,
    ) -> ResultFlags {
        if let Some(f) = self.check_ready() {
            return f;
        }
        self.stack.push(OpData::Cwd(super::ops::CwdOpData::new(
            path, sub_dir, false, false,
        )));
        self.send_next(host);
        ResultFlags::OK
    }

    pub fn file_transfer(
        &mut self,
        host: &mut dyn EngineHost,
        local_file: String,
        remote_path: ServerPath,
        remote_file: String,
        download: bool,
        binary: bool,
    ) -> ResultFlags {
        if let Some(f) = self.check_ready() {
            return f;
        }
        if local_file.is_empty() {
            return if download {
                ResultFlags::ERROR | ResultFlags::SYNTAX
            } else {
                ResultFlags::CRITICAL_ERROR | ResultFlags::NOTSUPPORTED
            };
        }
        if download {
            self.session.notifier.status(format!(
                "Starting download of {}",
                remote_path.format_filename(&remote_file, false)
            ));
        } else {
            self.session
                .notifier
                .status(format!("Starting upload of {}", local_file));
        }
        self.session.transfer_ctl = TransferCtl::default();
        let local_size = host.local_file_info(&local_file).map(|i| i.size);
        self.stack
            .push(OpData::FileTransfer(super::ops::FileTransferOpData::new(
                local_file,
                remote_path,
                remote_file,
                download,
                binary,
                local_size,
            )));
        self.send_next(host);
        ResultFlags::OK
    }

    pub fn delete(
        &mut self,
        host: &mut dyn EngineHost,
        path: ServerPath,
        files: Vec<String>,
    ) -> ResultFlags {
        if let Some(f) = self.check_ready() {
            return f;
        }
        self.stack
            .push(OpData::Delete(super::ops::DeleteOpData::new(path, files)));
        self.send_next(host);
        ResultFlags::OK
    }

    pub fn remove_dir(
        &mut self,
        host: &mut dyn EngineHost,
        path: ServerPath,
        sub_dir: String,
    ) -> ResultFlags {
        if let Some(f) = self.check_ready() {
            return f;
        }
        let op = match super::ops::RemoveDirOpData::new(path, sub_dir) {
            Some(v) => v,
            None => {
                self.session
                    .notifier
                    .error("Path cannot be constructed for the directory to remove");
                return ResultFlags::ERROR;
            }
        };
        self.stack.push(OpData::RemoveDir(op));
        self.send_next(host);
        ResultFlags::OK
    }

    pub fn mkdir(&mut self, host: &mut dyn EngineHost, path: ServerPath) -> ResultFlags {
        if let Some(f) = self.check_ready() {
            return f;
        }
        if path.is_empty() {
            return ResultFlags::ERROR | ResultFlags::SYNTAX;
        }
        self.session
            .notifier
            .status(format!("Creating directory '{}'...", path.get_path()));
        self.stack
            .push(OpData::Mkdir(super::ops::MkdirOpData::new(path)));
        self.send_next(host);
        ResultFlags::OK
    }

    pub fn rename(
        &mut self,
        host: &mut dyn EngineHost,
        from_path: ServerPath,
        from_file: String,
        to_path: ServerPath,
        to_file: String,
    ) -> ResultFlags {
        if let Some(f) = self.check_ready() {
            return f;
        }
        self.session.notifier.status(format!(
            "Renaming '{}' to '{}'",
            from_path.format_filename(&from_file, false),
            to_path.format_filename(&to_file, false)
        ));
        self.stack.push(OpData::Rename(super::ops::RenameOpData::new(
            from_path, from_file, to_path, to_file,
        )));
        self.send_next(host);
        ResultFlags::OK
    }

    pub fn chmod(
        &mut self,
        host: &mut dyn EngineHost,
        path: ServerPath,
        file: String,
        permission: String,
    ) -> ResultFlags {
        if let Some(f) = self.check_ready() {
            return f;
        }
        self.session.notifier.status(format!(
            "Set permissions of '{}' to '{}'",
            path.format_filename(&file, false),
            permission
        ));
        self.stack.push(OpData::Chmod(super::ops::ChmodOpData::new(
            path, file, permission,
        )));
        self.send_next(host);
        ResultFlags::OK
    }

    pub fn raw_command(&mut self, host: &mut dyn EngineHost, command: String) -> ResultFlags {
        if let Some(f) = self.check_ready() {
            return f;
        }
        if command.is_empty() {
            return ResultFlags::ERROR | ResultFlags::SYNTAX;
        }
        self.stack
            .push(OpData::RawCommand(super::ops::RawCommandOpData::new(command)));
        self.send_next(host);
        ResultFlags::OK
    }

    /// Abort whatever is running: every frame pops with CANCELED, in-flight
    /// replies will be swallowed, the data socket dies first.
    pub fn cancel(&mut self, host: &mut dyn EngineHost) {
        if self.stack.is_empty() {
            return;
        }
        self.session.notifier.error("Interrupted by user");
        self.reset_operation(host, ResultFlags::ERROR | ResultFlags::CANCELED);
    }

    /// Graceful disconnect: QUIT if we can still talk, then close.
    pub fn disconnect(&mut self, host: &mut dyn EngineHost) {
        if self.closed {
            return;
        }
        if self.stack.is_empty() && self.session.replies_to_skip == 0 {
            let _ = self.session.send_command(host, "QUIT", false, false);
        }
        self.do_close(host, ResultFlags::DISCONNECTED);
    }

    fn check_ready(&mut self) -> Option<ResultFlags> {
        if self.closed {
            return Some(ResultFlags::ERROR | ResultFlags::DISCONNECTED);
        }
        if !self.stack.is_empty() {
            warn!("operation started while another is active");
            return Some(ResultFlags::ERROR | ResultFlags::INTERNAL);
        }
        self.stop_keepalive(None);
        None
    }

    // ---- events from the shell ----------------------------------------

    /// TCP connect finished (also re-entered when a TLS handshake brings the
    /// control channel back up; see `on_tls_result`).
    pub fn on_connected(&mut self, host: &mut dyn EngineHost) {
        self.session.last_type_binary = None;
        if self.session.server.protocol == FtpProtocol::ImplicitTls && !self.session.tls_active {
            self.session
                .notifier
                .status("Connection established, initializing TLS...");
            host.start_tls();
            return;
        }
        self.session
            .notifier
            .status("Connection established, waiting for welcome message...");
        self.session.pending_replies = 1;
        self.session.replies_to_skip = 0;
        if let Some(OpData::Logon(op)) = self.stack.last_mut() {
            super::ops::logon::socket_connected(op);
        }
    }

    /// TLS handshake finished. `prompt` is Some when the certificate needs a
    /// user verdict before the session continues.
    pub fn on_tls_result(
        &mut self,
        host: &mut dyn EngineHost,
        ok: bool,
        prompt: Option<crate::notify::CertificatePrompt>,
    ) {
        if !ok {
            self.session.notifier.error("TLS handshake failed");
            self.do_close(host, ResultFlags::ERROR | ResultFlags::DISCONNECTED);
            return;
        }
        match prompt {
            Some(p) => {
                if let Some(OpData::Logon(op)) = self.stack.last_mut() {
                    op.wait_async = true;
                }
                self.session
                    .notifier
                    .send(Notification::AsyncRequest(crate::notify::AsyncRequest::Certificate(p)));
            }
            None => self.tls_accepted(host),
        }
    }

    fn tls_accepted(&mut self, host: &mut dyn EngineHost) {
        self.session.tls_active = true;
        self.session.notifier.status("TLS connection established");
        if let Some(OpData::Logon(op)) = self.stack.last_mut() {
            super::ops::logon::tls_established(op);
        }
        if self.session.server.protocol == FtpProtocol::ImplicitTls
            && self.session.pending_replies == 0
        {
            // Welcome still to come, now over TLS.
            self.session.pending_replies = 1;
            self.session.replies_to_skip = 0;
            return;
        }
        self.send_next(host);
    }

    /// Raw bytes off the control socket.
    pub fn on_bytes(&mut self, host: &mut dyn EngineHost, data: &[u8]) {
        let events = match self.reader.receive(
            data,
            self.session.server.encoding,
            self.session.utf8_active,
        ) {
            Ok(ev) => ev,
            Err(ConversionError) => {
                self.session
                    .notifier
                    .error("Failed to convert reply to the session charset");
                self.reset_operation(host, ResultFlags::ERROR);
                return;
            }
        };
        for ev in events {
            if self.closed {
                return;
            }
            match ev {
                ReaderEvent::Line(line) => self.on_line(host, &line),
                ReaderEvent::Reply(reply) => self.process_reply(host, reply),
            }
        }
    }

    /// Per-line processing, before reply assembly: RTT, response echo, and
    /// the logon hooks (welcome sniffing, challenge text, FEAT lines).
    fn on_line(&mut self, host: &mut dyn EngineHost, line: &str) {
        self.session.rtt_stop();
        self.session.notifier.log(LogLevel::Response, line);
        if let Some(OpData::Logon(op)) = self.stack.last_mut() {
            if let Some(flags) = super::ops::logon::on_line(op, &mut self.session, line) {
                self.do_close(host, flags);
            }
        }
    }

    fn process_reply(&mut self, host: &mut dyn EngineHost, reply: Reply) {
        trace!("reply: {}", reply.text());
        if !reply.is_preliminary() {
            if self.session.pending_replies > 0 {
                self.session.pending_replies -= 1;
            } else {
                debug!("unexpected reply, no reply was pending");
                return;
            }
        }
        self.session.last_reply_class = reply.code_class();

        if self.session.replies_to_skip > 0 {
            debug!("skipping reply after cancelled operation or keepalive command");
            if !reply.is_preliminary() {
                self.session.replies_to_skip -= 1;
            }
            if self.session.replies_to_skip == 0 {
                if self.stack.is_empty() {
                    self.start_keepalive(host);
                } else if self.session.pending_replies == 0 {
                    self.send_next(host);
                }
            }
            return;
        }

        if self.stack.is_empty() {
            debug!("skipping reply without active operation");
            return;
        }

        let mut top = self.stack.pop().expect("stack checked nonempty");
        let outcome = top.parse_reply(&mut self.session, host, &reply);
        self.stack.push(top);
        self.apply_outcome(host, outcome);
    }

    /// Data channel finished. Ignored unless a raw transfer is on top (the
    /// event may belong to a frame that already popped).
    pub fn on_transfer_end(&mut self, host: &mut dyn EngineHost, reason: TransferEndReason) {
        if reason == TransferEndReason::None {
            return;
        }
        let on_rawtransfer = matches!(self.stack.last(), Some(OpData::RawTransfer(_)));
        if !on_rawtransfer {
            debug!("transfer end at unusual time, ignoring");
            return;
        }
        if self.session.transfer_ctl.end_reason == TransferEndReason::None
            || self.session.transfer_ctl.end_reason == TransferEndReason::Successful
        {
            self.session.transfer_ctl.end_reason = reason;
        }
        let mut top = self.stack.pop().expect("raw transfer frame present");
        let outcome = match &mut top {
            OpData::RawTransfer(op) => {
                super::ops::rawtransfer::on_transfer_end(op, &mut self.session)
            }
            _ => unreachable!(),
        };
        self.stack.push(top);
        self.apply_outcome(host, outcome);
    }

    /// Reply watchdog fired with commands still outstanding.
    pub fn on_timeout(&mut self, host: &mut dyn EngineHost) {
        if self.session.pending_replies == 0 && self.stack.is_empty() {
            return;
        }
        self.session
            .notifier
            .error("Connection timed out after 20 seconds of inactivity");
        self.do_close(
            host,
            ResultFlags::ERROR | ResultFlags::TIMEOUT | ResultFlags::DISCONNECTED,
        );
    }

    /// The control socket died under us.
    pub fn on_connection_lost(&mut self, host: &mut dyn EngineHost, error: Option<&str>) {
        match error {
            Some(e) => self
                .session
                .notifier
                .error(format!("Could not read from socket: {}", e)),
            None => {
                let level = if self.stack.is_empty() {
                    LogLevel::Status
                } else {
                    LogLevel::Error
                };
                self.session.notifier.log(level, "Connection closed by server");
            }
        }
        self.do_close(host, ResultFlags::ERROR | ResultFlags::DISCONNECTED);
    }

    /// External-IP resolution finished.
    pub fn on_ip_resolved(&mut self, host: &mut dyn EngineHost, result: Result<String, String>) {
        if !self.session.extip.resolving {
            debug!("ignoring external IP resolution event");
            return;
        }
        self.session.extip.finish(
            host.local_addr(),
            result,
            &mut self.session.options,
            &self.session.notifier,
        );
        self.send_next(host);
    }

    /// The 30-second idle timer fired: maybe send a keep-alive.
    pub fn on_idle_timer(&mut self, host: &mut dyn EngineHost) {
        self.idle_timer_running = false;
        if !self.stack.is_empty()
            || self.session.pending_replies > 0
            || self.session.replies_to_skip > 0
        {
            return;
        }
        self.session.notifier.status("Sending keep-alive command");
        let cmd = match self.keepalive_rng.gen_range(0..3u32) {
            0 => "NOOP".to_string(),
            1 => {
                if self.session.last_type_binary == Some(false) {
                    "TYPE A".to_string()
                } else {
                    "TYPE I".to_string()
                }
            }
            _ => "PWD".to_string(),
        };
        if self.session.send_command(host, &cmd, false, true) {
            self.session.replies_to_skip += 1;
        }
    }

    /// Reply to an outstanding async request.
    pub fn on_async_reply(&mut self, host: &mut dyn EngineHost, reply: AsyncReply) {
        let waiting = self.stack.last().map(OpData::waiting_async).unwrap_or(false);
        if !waiting {
            debug!("not waiting for a request reply, ignoring");
            return;
        }
        match reply {
            AsyncReply::Certificate { trusted } => {
                host.trust_current_cert(trusted);
                if let Some(OpData::Logon(op)) = self.stack.last_mut() {
                    op.wait_async = false;
                }
                if !trusted {
                    self.do_close(host, ResultFlags::CRITICAL_ERROR);
                    return;
                }
                self.tls_accepted(host);
            }
            AsyncReply::InteractiveLogin { password } => {
                let op = match self.stack.last_mut() {
                    Some(OpData::Logon(op)) => op,
                    _ => {
                        debug!("interactive login reply without logon in progress");
                        return;
                    }
                };
                op.wait_async = false;
                match password {
                    Some(p) => {
                        super::ops::logon::password_provided(op, &mut self.session, p);
                        self.send_next(host);
                    }
                    None => self.reset_operation(host, ResultFlags::ERROR | ResultFlags::CANCELED),
                }
            }
            AsyncReply::FileExists(action) => {
                let mut top = self.stack.pop().expect("waiting frame present");
                let outcome = match &mut top {
                    OpData::FileTransfer(op) => super::ops::filetransfer::file_exists_action(
                        op,
                        &mut self.session,
                        host,
                        action,
                    ),
                    _ => {
                        debug!("file-exists reply without transfer in progress");
                        self.stack.push(top);
                        return;
                    }
                };
                self.stack.push(top);
                self.apply_outcome(host, outcome);
            }
            AsyncReply::Hostkey { .. } => {
                debug!("host key reply has no meaning on an FTP session");
            }
        }
    }

    // ---- dispatcher ----------------------------------------------------

    fn apply_outcome(&mut self, host: &mut dyn EngineHost, outcome: OpOutcome) {
        match outcome {
            OpOutcome::Ok => self.reset_operation(host, ResultFlags::OK),
            OpOutcome::Continue => self.send_next(host),
            OpOutcome::WouldBlock => {}
            OpOutcome::Push(child) => {
                self.stack.push(*child);
                self.send_next(host);
            }
            OpOutcome::Error(flags) => {
                let logon = matches!(self.stack.last(), Some(OpData::Logon(_)));
                if logon || flags.contains(ResultFlags::DISCONNECTED) {
                    self.do_close(host, flags | ResultFlags::DISCONNECTED);
                } else {
                    self.reset_operation(host, flags);
                }
            }
        }
    }

    /// Drive the top frame until something blocks.
    pub fn send_next(&mut self, host: &mut dyn EngineHost) {
        loop {
            let top = match self.stack.last() {
                Some(t) => t,
                None => return,
            };
            if top.waiting_async() {
                debug!("waiting for async request, not sending");
                return;
            }
            if self.session.replies_to_skip > 0 {
                debug!("waiting for replies to skip before sending next command");
                return;
            }
            let mut top = self.stack.pop().expect("stack checked nonempty");
            let outcome = top.send(&mut self.session, host);
            self.stack.push(top);
            match outcome {
                OpOutcome::Continue => continue,
                OpOutcome::WouldBlock => return,
                OpOutcome::Push(child) => {
                    self.stack.push(*child);
                    continue;
                }
                OpOutcome::Ok => {
                    self.reset_operation(host, ResultFlags::OK);
                    return;
                }
                OpOutcome::Error(flags) => {
                    let logon = matches!(self.stack.last(), Some(OpData::Logon(_)));
                    if logon || flags.contains(ResultFlags::DISCONNECTED) {
                        self.do_close(host, flags | ResultFlags::DISCONNECTED);
                    } else {
                        self.reset_operation(host, flags);
                    }
                    return;
                }
            }
        }
    }

    /// Pop the top frame with `flags`, run its cleanup, and either deliver
    /// the result to the parent or finish the whole operation.
    fn reset_operation(&mut self, host: &mut dyn EngineHost, mut flags: ResultFlags) {
        debug!("reset operation: {}", flags);

        host.reset_data();
        self.session.extip.abort();
        self.session.replies_to_skip = self.session.pending_replies;

        // Per-op cleanup before the pop.
        match self.stack.last_mut() {
            Some(OpData::FileTransfer(op)) => {
                if self.session.transfer_ctl.command_sent {
                    if self.session.transfer_ctl.end_reason
                        == TransferEndReason::TransferFailureCritical
                    {
                        flags |= ResultFlags::CRITICAL | ResultFlags::WRITEFAILED;
                    }
                    if self.session.transfer_ctl.end_reason
                        == TransferEndReason::TransferCommandFailureImmediate
                        && self.session.last_reply_class == 5
                        && flags.is_err()
                    {
                        // The file itself was rejected; retrying is pointless.
                        flags |= ResultFlags::CRITICAL;
                    }
                }
                if flags.is_err() && op.download && !op.file_did_exist {
                    debug!("removing empty file left by failed download");
                    host.remove_empty_local_file(&op.local_file);
                }
            }
            Some(OpData::Delete(op)) => {
                if op.need_listing_flush() && !flags.contains(ResultFlags::DISCONNECTED) {
                    self.session.notifier.send(Notification::DirectoryListing {
                        path: op.path.clone(),
                        modified: true,
                        failed: false,
                    });
                }
            }
            Some(OpData::RawTransfer(_)) => {
                if flags.is_err()
                    && self.session.transfer_ctl.end_reason == TransferEndReason::Successful
                {
                    self.session.transfer_ctl.end_reason =
                        if flags.contains(ResultFlags::TIMEOUT) {
                            TransferEndReason::Timeout
                        } else if !self.session.transfer_ctl.command_sent {
                            TransferEndReason::PreTransferCommandFailure
                        } else {
                            TransferEndReason::Failure
                        };
                }
            }
            _ => {}
        }

        self.last_command_completion = Some(Instant::now());

        let popped = self.stack.pop();
        if popped.is_none() {
            return;
        }

        let unwind = flags.contains(ResultFlags::DISCONNECTED)
            || flags.contains(ResultFlags::CANCELED);
        if !self.stack.is_empty() && !unwind {
            self.deliver_sub_result(host, flags);
            return;
        }

        self.stack.clear();
        self.finish_operation(host, flags);
    }

    fn deliver_sub_result(&mut self, host: &mut dyn EngineHost, prev: ResultFlags) {
        let mut top = self.stack.pop().expect("parent frame present");
        let outcome = top.sub_result(&mut self.session, host, prev);
        self.stack.push(top);
        self.apply_outcome(host, outcome);
    }

    fn finish_operation(&mut self, host: &mut dyn EngineHost, flags: ResultFlags) {
        if flags.is_err() && !flags.contains(ResultFlags::CANCELED) {
            self.session
                .notifier
                .error(format!("Operation failed ({})", flags));
        }
        host.operation_complete(flags);
        self.session.notifier.send(Notification::Idle);
        if !flags.contains(ResultFlags::DISCONNECTED) {
            self.start_keepalive(host);
        } else {
            self.stop_keepalive(Some(host));
        }
    }

    /// Tear the connection down, failing whatever was in progress.
    pub fn do_close(&mut self, host: &mut dyn EngineHost, flags: ResultFlags) {
        if self.closed {
            return;
        }
        self.closed = true;
        let flags = flags | ResultFlags::DISCONNECTED;
        host.reset_data();
        if !self.stack.is_empty() {
            self.stack.clear();
            self.finish_operation(host, flags | ResultFlags::ERROR);
        }
        self.stop_keepalive(Some(host));
        self.session.pending_replies = 0;
        self.session.replies_to_skip = 0;
        self.reader.reset();
        host.close_connection();
    }

    // ---- keep-alive ----------------------------------------------------

    fn start_keepalive(&mut self, host: &mut dyn EngineHost) {
        if !self.session.options.ftp_send_keepalive || self.closed {
            return;
        }
        if self.session.replies_to_skip > 0 || self.session.pending_replies > 0 {
            return;
        }
        let last = match self.last_command_completion {
            Some(t) => t,
            None => return,
        };
        if last.elapsed() >= KEEPALIVE_WINDOW {
            return;
        }
        self.idle_timer_running = true;
        host.start_idle_timer(KEEPALIVE_INTERVAL);
    }

    fn stop_keepalive(&mut self, host: Option<&mut dyn EngineHost>) {
        if self.idle_timer_running {
            self.idle_timer_running = false;
            if let Some(h) = host {
                h.stop_idle_timer();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::capabilities::Capability;
    use super::super::capabilities::TriState;
    use super::super::ops::rawtransfer::RawTransferState;
    use super::super::EncodingMode;
    use super::*;
    use crate::notify::{AsyncRequest, FileExistsAction};
    use crate::path::{PathKind, ServerPath};
    use std::collections::HashMap;

    const GIB: u64 = 1 << 30;

    #[derive(Default)]
    struct MockHost {
        sent: Vec<u8>,
        tls_starts: u32,
        trust_calls: Vec<bool>,
        closed: bool,
        data_connects: Vec<(String, u16, TransferMode, bool)>,
        listens: u32,
        data_resets: u32,
        resolver_urls: Vec<String>,
        idle_timer_starts: u32,
        completions: Vec<ResultFlags>,
        files: HashMap<String, LocalFileInfo>,
        opened: Vec<(String, LocalOpenMode, u64)>,
        removed_empty: Vec<String>,
        mtimes_set: Vec<String>,
        local: Option<IpAddr>,
        peer: Option<IpAddr>,
    }

    impl MockHost {
        fn new() -> Self {
            MockHost {
                local: Some("192.168.1.5".parse().unwrap()),
                peer: Some("93.184.216.34".parse().unwrap()),
                ..MockHost::default()
            }
        }

        fn with_file(mut self, path: &str, size: u64) -> Self {
            self.files.insert(
                path.to_string(),
                LocalFileInfo {
                    size,
                    mtime: None,
                },
            );
            self
        }

        /// Commands sent since the last call, decoded and split on CRLF.
        fn commands(&mut self) -> Vec<String> {
            let raw = std::mem::take(&mut self.sent);
            String::from_utf8(raw)
                .unwrap()
                .split("\r\n")
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        }
    }

    impl EngineHost for MockHost {
        fn send_control(&mut self, data: &[u8]) {
            self.sent.extend_from_slice(data);
        }
        fn start_tls(&mut self) {
            self.tls_starts += 1;
        }
        fn trust_current_cert(&mut self, trusted: bool) {
            self.trust_calls.push(trusted);
        }
        fn close_connection(&mut self) {
            self.closed = true;
        }
        fn connect_data(&mut self, host: &str, port: u16, mode: TransferMode, tls: bool) {
            self.data_connects.push((host.to_string(), port, mode, tls));
        }
        fn listen_data(&mut self, _mode: TransferMode, _tls: bool) -> Result<u16, String> {
            self.listens += 1;
            Ok(20021)
        }
        fn reset_data(&mut self) {
            self.data_resets += 1;
        }
        fn local_addr(&self) -> Option<IpAddr> {
            self.local
        }
        fn peer_addr(&self) -> Option<IpAddr> {
            self.peer
        }
        fn resolve_external_ip(&mut self, url: &str) {
            self.resolver_urls.push(url.to_string());
        }
        fn start_idle_timer(&mut self, _after: Duration) {
            self.idle_timer_starts += 1;
        }
        fn stop_idle_timer(&mut self) {}
        fn operation_complete(&mut self, result: ResultFlags) {
            self.completions.push(result);
        }
        fn local_file_info(&mut self, path: &str) -> Option<LocalFileInfo> {
            self.files.get(path).copied()
        }
        fn open_local_file(
            &mut self,
            path: &str,
            mode: LocalOpenMode,
            offset: u64,
            _binary: bool,
        ) -> Result<u64, String> {
            self.opened.push((path.to_string(), mode, offset));
            match mode {
                LocalOpenMode::ReadUpload | LocalOpenMode::WriteResume => self
                    .files
                    .get(path)
                    .map(|i| i.size)
                    .ok_or_else(|| "no such file".to_string()),
                LocalOpenMode::WriteFresh => {
                    self.files
                        .insert(path.to_string(), LocalFileInfo { size: 0, mtime: None });
                    Ok(0)
                }
            }
        }
        fn preallocate_local(&mut self, _bytes: u64) {}
        fn remove_empty_local_file(&mut self, path: &str) {
            self.removed_empty.push(path.to_string());
        }
        fn set_local_mtime(&mut self, path: &str, _mtime: DateTime<Utc>) {
            self.mtimes_set.push(path.to_string());
        }
    }

    fn server() -> ServerDescriptor {
        let mut s = ServerDescriptor::new("ftp.example.org", 21, "u");
        s.password = Some("p".to_string());
        s
    }

    fn path(s: &str) -> ServerPath {
        ServerPath::parse(s, PathKind::Default)
    }

    fn feed(engine: &mut FtpEngine, host: &mut MockHost, data: &str) {
        engine.on_bytes(host, data.as_bytes());
    }

    /// Run the standard logon: welcome, USER/PASS, SYST, FEAT (UTF8+SIZE),
    /// OPTS UTF8 ON, then PWD into /home/u.
    fn login(engine: &mut FtpEngine, host: &mut MockHost) {
        assert!(engine.connect(host).is_ok());
        engine.on_connected(host);
        feed(engine, host, "220 Welcome\r\n");
        feed(engine, host, "331 need pw\r\n");
        feed(engine, host, "230 ok\r\n");
        feed(engine, host, "215 UNIX Type: L8\r\n");
        feed(engine, host, "211-Features\r\n UTF8\r\n SIZE\r\n211 End\r\n");
        feed(engine, host, "200 ok\r\n");
        assert_eq!(host.completions, vec![ResultFlags::OK]);
        host.completions.clear();
        let _ = host.commands();

        assert!(engine.change_dir(host, ServerPath::empty(), String::new()).is_ok());
        feed(engine, host, "257 \"/home/u\" is cwd\r\n");
        assert_eq!(host.completions, vec![ResultFlags::OK]);
        host.completions.clear();
        let _ = host.commands();
        assert!(engine.is_idle());
    }

    fn raw_state(engine: &FtpEngine) -> Option<RawTransferState> {
        match engine.stack.last() {
            Some(OpData::RawTransfer(op)) => Some(op.state),
            _ => None,
        }
    }

    #[test]
    fn s1_plain_login_then_pwd() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);

        assert!(engine.connect(&mut host).is_ok());
        engine.on_connected(&mut host);
        feed(&mut engine, &mut host, "220 Welcome\r\n");
        feed(&mut engine, &mut host, "331 need pw\r\n");
        feed(&mut engine, &mut host, "230 ok\r\n");
        feed(&mut engine, &mut host, "215 UNIX Type: L8\r\n");
        feed(
            &mut engine,
            &mut host,
            "211-Features\r\n UTF8\r\n SIZE\r\n211 End\r\n",
        );
        feed(&mut engine, &mut host, "200 ok\r\n");
        assert_eq!(host.completions, vec![ResultFlags::OK]);

        assert!(engine
            .change_dir(&mut host, ServerPath::empty(), String::new())
            .is_ok());
        feed(&mut engine, &mut host, "257 \"/home/u\" is cwd\r\n");

        assert_eq!(
            host.commands(),
            vec!["USER u", "PASS p", "SYST", "FEAT", "OPTS UTF8 ON", "PWD"]
        );
        assert_eq!(engine.session().current_path.get_path(), "/home/u");
        let key = engine.session().server_key.clone();
        assert_eq!(
            engine.session().caps.get(&key, Capability::Utf8Command),
            TriState::Yes
        );
        assert_eq!(
            engine.session().caps.get(&key, Capability::SizeCommand),
            TriState::Yes
        );
        assert!(engine.session().utf8_active);
    }

    #[test]
    fn s2_retr_with_data_end_before_final_reply() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);

        let key = engine.session().server_key.clone();
        engine.session_mut().dir_cache.store(
            &key,
            &path("/home/u"),
            vec![crate::cache::DirEntry {
                name: "f".to_string(),
                size: Some(10),
                mtime: Some(Utc::now()),
                has_time: true,
                ..crate::cache::DirEntry::default()
            }],
        );

        assert!(engine
            .file_transfer(
                &mut host,
                "/tmp/dl".to_string(),
                path("/home/u"),
                "f".to_string(),
                true,
                true,
            )
            .is_ok());
        assert_eq!(host.commands(), vec!["TYPE I"]);
        feed(&mut engine, &mut host, "200 ok\r\n");
        assert_eq!(host.commands(), vec!["EPSV"]);
        feed(
            &mut engine,
            &mut host,
            "229 Entering Extended Passive Mode (|||21000|)\r\n",
        );
        assert_eq!(host.data_connects.len(), 1);
        assert_eq!(host.data_connects[0].1, 21000);
        assert_eq!(host.commands(), vec!["RETR f"]);
        assert_eq!(raw_state(&engine), Some(RawTransferState::Transfer));

        feed(&mut engine, &mut host, "150 Opening data connection\r\n");
        assert_eq!(raw_state(&engine), Some(RawTransferState::WaitFinish));
        // Data socket finishes first, then the control reply.
        engine.on_transfer_end(&mut host, TransferEndReason::Successful);
        assert_eq!(raw_state(&engine), Some(RawTransferState::WaitTransfer));
        feed(&mut engine, &mut host, "226 Transfer complete\r\n");
        assert_eq!(host.completions, vec![ResultFlags::OK]);
        assert!(engine.is_idle());
    }

    #[test]
    fn s2_retr_with_final_reply_before_data_end() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);

        let key = engine.session().server_key.clone();
        engine.session_mut().dir_cache.store(
            &key,
            &path("/home/u"),
            vec![crate::cache::DirEntry {
                name: "f".to_string(),
                size: Some(10),
                mtime: Some(Utc::now()),
                has_time: true,
                ..crate::cache::DirEntry::default()
            }],
        );
        assert!(engine
            .file_transfer(
                &mut host,
                "/tmp/dl".to_string(),
                path("/home/u"),
                "f".to_string(),
                true,
                true,
            )
            .is_ok());
        feed(&mut engine, &mut host, "200 ok\r\n");
        feed(&mut engine, &mut host, "229 Entering Extended Passive Mode (|||21000|)\r\n");
        feed(&mut engine, &mut host, "150 Opening\r\n226 Done\r\n");
        assert_eq!(raw_state(&engine), Some(RawTransferState::WaitSocket));
        assert!(host.completions.is_empty());
        engine.on_transfer_end(&mut host, TransferEndReason::Successful);
        assert_eq!(host.completions, vec![ResultFlags::OK]);
    }

    #[test]
    fn s3_resume_probe_confirms_support() {
        let mut host = MockHost::new().with_file("/tmp/big", 5 * GIB);
        let (notifier, mut rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);

        let key = engine.session().server_key.clone();
        engine.session_mut().dir_cache.store(
            &key,
            &path("/home/u"),
            vec![crate::cache::DirEntry {
                name: "big".to_string(),
                size: Some(5 * GIB + 100),
                mtime: Some(Utc::now()),
                has_time: true,
                ..crate::cache::DirEntry::default()
            }],
        );
        assert!(engine
            .file_transfer(
                &mut host,
                "/tmp/big".to_string(),
                path("/home/u"),
                "big".to_string(),
                true,
                true,
            )
            .is_ok());
        // The local file exists, so the engine asks what to do.
        let mut prompted = false;
        while let Ok(n) = rx.try_recv() {
            if let Notification::AsyncRequest(AsyncRequest::FileExists(p)) = n {
                assert_eq!(p.remote_size, Some(5 * GIB + 100));
                prompted = true;
            }
        }
        assert!(prompted);
        engine.on_async_reply(&mut host, AsyncReply::FileExists(FileExistsAction::Resume));

        feed(&mut engine, &mut host, "200 ok\r\n");
        feed(&mut engine, &mut host, "229 Entering Extended Passive Mode (|||21001|)\r\n");
        let cmds = host.commands();
        assert!(cmds.contains(&format!("REST {}", 5 * GIB + 99)));
        feed(&mut engine, &mut host, "350 ok\r\n");
        assert_eq!(host.commands(), vec!["RETR big"]);
        feed(&mut engine, &mut host, "150 sending\r\n");
        // The probe byte arrived; the server honours large resume offsets.
        engine.on_transfer_end(&mut host, TransferEndReason::Successful);
        feed(&mut engine, &mut host, "226 done\r\n");
        assert_eq!(
            engine.session().caps.get(&key, Capability::Resume4GbBug),
            TriState::No
        );
        // The real transfer follows at the true resume offset.
        feed(&mut engine, &mut host, "229 Entering Extended Passive Mode (|||21002|)\r\n");
        let cmds = host.commands();
        assert!(cmds.contains(&"EPSV".to_string()));
        assert!(cmds.contains(&format!("REST {}", 5 * GIB)));
        assert!(host.completions.is_empty());
    }

    #[test]
    fn s3_resume_probe_failure_is_critical() {
        let mut host = MockHost::new().with_file("/tmp/big", 5 * GIB);
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);

        let key = engine.session().server_key.clone();
        engine.session_mut().dir_cache.store(
            &key,
            &path("/home/u"),
            vec![crate::cache::DirEntry {
                name: "big".to_string(),
                size: Some(5 * GIB + 100),
                mtime: Some(Utc::now()),
                has_time: true,
                ..crate::cache::DirEntry::default()
            }],
        );
        assert!(engine
            .file_transfer(
                &mut host,
                "/tmp/big".to_string(),
                path("/home/u"),
                "big".to_string(),
                true,
                true,
            )
            .is_ok());
        engine.on_async_reply(&mut host, AsyncReply::FileExists(FileExistsAction::Resume));
        feed(&mut engine, &mut host, "200 ok\r\n");
        feed(&mut engine, &mut host, "229 Entering Extended Passive Mode (|||21001|)\r\n");
        feed(&mut engine, &mut host, "350 ok\r\n");
        feed(&mut engine, &mut host, "550 resume offset out of range\r\n");

        assert_eq!(
            engine.session().caps.get(&key, Capability::Resume4GbBug),
            TriState::Yes
        );
        assert_eq!(host.completions.len(), 1);
        assert!(host.completions[0].contains(ResultFlags::ERROR));
        assert!(host.completions[0].contains(ResultFlags::CRITICAL));
    }

    #[test]
    fn s4_rename_across_directories() {
        let mut host = MockHost::new();
        let (notifier, mut rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);
        while rx.try_recv().is_ok() {}

        assert!(engine
            .rename(
                &mut host,
                path("/a"),
                "x".to_string(),
                path("/b"),
                "y".to_string(),
            )
            .is_ok());
        feed(&mut engine, &mut host, "250 ok\r\n");
        feed(&mut engine, &mut host, "257 \"/a\"\r\n");
        feed(&mut engine, &mut host, "350 ready\r\n");
        feed(&mut engine, &mut host, "250 ok\r\n");

        assert_eq!(
            host.commands(),
            vec!["CWD /a", "PWD", "RNFR x", "RNTO /b/y"]
        );
        assert_eq!(host.completions, vec![ResultFlags::OK]);
        let mut listings = Vec::new();
        while let Ok(n) = rx.try_recv() {
            if let Notification::DirectoryListing { path, .. } = n {
                listings.push(path.get_path());
            }
        }
        assert_eq!(listings, vec!["/a", "/b"]);
    }

    #[test]
    fn s5_cancel_mid_upload_keeps_session() {
        let mut host = MockHost::new().with_file("/tmp/up", 10);
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);

        let key = engine.session().server_key.clone();
        engine
            .session_mut()
            .dir_cache
            .store(&key, &path("/home/u"), Vec::new());
        assert!(engine
            .file_transfer(
                &mut host,
                "/tmp/up".to_string(),
                path("/home/u"),
                "f".to_string(),
                false,
                true,
            )
            .is_ok());
        feed(&mut engine, &mut host, "200 ok\r\n");
        feed(&mut engine, &mut host, "229 Entering Extended Passive Mode (|||21000|)\r\n");
        let cmds = host.commands();
        assert!(cmds.contains(&"STOR f".to_string()));
        feed(&mut engine, &mut host, "150 go ahead\r\n");

        let resets_before = host.data_resets;
        engine.cancel(&mut host);
        assert!(host.data_resets > resets_before);
        assert_eq!(host.completions.len(), 1);
        assert!(host.completions[0].contains(ResultFlags::CANCELED));
        host.completions.clear();

        // The server's late replies are swallowed without feeding any op.
        feed(&mut engine, &mut host, "426 aborted\r\n");
        assert_eq!(engine.pending_replies(), 0);

        assert!(engine
            .change_dir(&mut host, path("/other"), String::new())
            .is_ok());
        feed(&mut engine, &mut host, "250 ok\r\n");
        feed(&mut engine, &mut host, "257 \"/other\"\r\n");
        assert_eq!(host.completions, vec![ResultFlags::OK]);
        assert_eq!(engine.session().current_path.get_path(), "/other");
    }

    #[test]
    fn s6_feat_with_mlsd_facts() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);

        assert!(engine.connect(&mut host).is_ok());
        engine.on_connected(&mut host);
        feed(&mut engine, &mut host, "220 hi\r\n");
        feed(&mut engine, &mut host, "331 pw\r\n");
        feed(&mut engine, &mut host, "230 ok\r\n");
        feed(&mut engine, &mut host, "215 UNIX\r\n");
        feed(
            &mut engine,
            &mut host,
            "211-Features\r\n MLSD type*;size*;modify*;\r\n MLST type*;size*;modify*;\r\n211 End\r\n",
        );
        let key = engine.session().server_key.clone();
        assert_eq!(
            engine.session().caps.get(&key, Capability::MlsdCommand),
            TriState::Yes
        );
        assert_eq!(
            engine.session().caps.param(&key, Capability::MlsdCommand),
            Some("type*;size*;modify*;")
        );
        assert_eq!(
            engine.session().caps.get(&key, Capability::TimezoneOffset),
            TriState::No
        );
    }

    #[test]
    fn wrong_protocol_welcome_closes_connection() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        assert!(engine.connect(&mut host).is_ok());
        engine.on_connected(&mut host);
        feed(&mut engine, &mut host, "SSH-2.0-OpenSSH_9.0\r\n");
        assert!(engine.is_closed());
        assert!(host.closed);
        assert_eq!(host.completions.len(), 1);
        assert!(host.completions[0].contains(ResultFlags::CRITICAL));
        assert!(host.completions[0].contains(ResultFlags::DISCONNECTED));
    }

    #[test]
    fn reply_accounting_never_underflows() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);

        assert!(engine.raw_command(&mut host, "NOOP".to_string()).is_ok());
        assert_eq!(engine.pending_replies(), 1);
        feed(&mut engine, &mut host, "200 ok\r\n");
        assert_eq!(engine.pending_replies(), 0);
        // A reply without a pending command is logged and dropped.
        feed(&mut engine, &mut host, "200 stray\r\n");
        assert_eq!(engine.pending_replies(), 0);
        assert!(engine.is_idle());
    }

    #[test]
    fn preliminary_reply_does_not_decrement() {
        let mut host = MockHost::new().with_file("/tmp/up", 10);
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);
        let key = engine.session().server_key.clone();
        engine
            .session_mut()
            .dir_cache
            .store(&key, &path("/home/u"), Vec::new());
        assert!(engine
            .file_transfer(
                &mut host,
                "/tmp/up".to_string(),
                path("/home/u"),
                "f".to_string(),
                false,
                true,
            )
            .is_ok());
        feed(&mut engine, &mut host, "200 ok\r\n");
        feed(&mut engine, &mut host, "229 Entering Extended Passive Mode (|||21000|)\r\n");
        assert_eq!(engine.pending_replies(), 1);
        feed(&mut engine, &mut host, "150 ok\r\n");
        assert_eq!(engine.pending_replies(), 1);
        feed(&mut engine, &mut host, "226 done\r\n");
        assert_eq!(engine.pending_replies(), 0);
    }

    #[test]
    fn failed_download_removes_fresh_empty_file() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);
        let key = engine.session().server_key.clone();
        engine.session_mut().dir_cache.store(
            &key,
            &path("/home/u"),
            vec![crate::cache::DirEntry {
                name: "f".to_string(),
                size: Some(10),
                mtime: Some(Utc::now()),
                has_time: true,
                ..crate::cache::DirEntry::default()
            }],
        );
        assert!(engine
            .file_transfer(
                &mut host,
                "/tmp/fresh".to_string(),
                path("/home/u"),
                "f".to_string(),
                true,
                true,
            )
            .is_ok());
        feed(&mut engine, &mut host, "200 ok\r\n");
        feed(&mut engine, &mut host, "229 Entering Extended Passive Mode (|||21000|)\r\n");
        // The server rejects the file outright: critical, no retry.
        feed(&mut engine, &mut host, "550 no such file\r\n");
        assert_eq!(host.removed_empty, vec!["/tmp/fresh"]);
        assert_eq!(host.completions.len(), 1);
        assert!(host.completions[0].contains(ResultFlags::CRITICAL));
    }

    #[test]
    fn upload_resume_with_equal_sizes_skips_transfer() {
        let mut host = MockHost::new().with_file("/tmp/same", 10);
        let (notifier, mut rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);
        let key = engine.session().server_key.clone();
        engine.session_mut().dir_cache.store(
            &key,
            &path("/home/u"),
            vec![crate::cache::DirEntry {
                name: "same".to_string(),
                size: Some(10),
                mtime: None,
                has_time: false,
                ..crate::cache::DirEntry::default()
            }],
        );
        assert!(engine
            .file_transfer(
                &mut host,
                "/tmp/same".to_string(),
                path("/home/u"),
                "same".to_string(),
                false,
                true,
            )
            .is_ok());
        let mut prompted = false;
        while let Ok(n) = rx.try_recv() {
            if matches!(n, Notification::AsyncRequest(AsyncRequest::FileExists(_))) {
                prompted = true;
            }
        }
        assert!(prompted);
        engine.on_async_reply(&mut host, AsyncReply::FileExists(FileExistsAction::Resume));
        // Nothing left to send: sizes match in binary mode.
        assert!(host.commands().is_empty());
        assert_eq!(host.completions, vec![ResultFlags::OK]);
        assert!(host.data_connects.is_empty());
    }

    #[test]
    fn epsv_refused_falls_back_to_pasv() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);
        assert!(engine.list(&mut host, ServerPath::empty(), String::new()).is_ok());
        assert_eq!(host.commands(), vec!["TYPE A"]);
        feed(&mut engine, &mut host, "200 ok\r\n");
        assert_eq!(host.commands(), vec!["EPSV"]);
        feed(&mut engine, &mut host, "500 not understood\r\n");
        assert_eq!(host.commands(), vec!["PASV"]);
        let key = engine.session().server_key.clone();
        assert_eq!(
            engine.session().caps.get(&key, Capability::EpsvCommand),
            TriState::No
        );
        feed(
            &mut engine,
            &mut host,
            "227 Entering Passive Mode (93,184,216,34,82,25)\r\n",
        );
        assert_eq!(host.data_connects.len(), 1);
        assert_eq!(host.data_connects[0].0, "93.184.216.34");
        assert_eq!(host.data_connects[0].1, 82 * 256 + 25);
        assert_eq!(host.commands(), vec!["LIST"]);
    }

    #[test]
    fn keepalive_reply_is_swallowed() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut options = Options::default();
        options.ftp_send_keepalive = true;
        let mut engine = FtpEngine::new(server(), options, notifier);
        engine.seed_keepalive_rng(7);
        login(&mut engine, &mut host);
        assert!(host.idle_timer_starts > 0);

        engine.on_idle_timer(&mut host);
        let cmds = host.commands();
        assert_eq!(cmds.len(), 1);
        assert!(
            cmds[0] == "NOOP" || cmds[0] == "PWD" || cmds[0].starts_with("TYPE "),
            "unexpected keep-alive {}",
            cmds[0]
        );
        assert_eq!(engine.pending_replies(), 1);
        feed(&mut engine, &mut host, "200 ok\r\n");
        assert_eq!(engine.pending_replies(), 0);
        assert!(engine.is_idle());
        // Nothing reached any op; no completion was reported.
        assert!(host.completions.is_empty());
    }

    #[test]
    fn charset_failure_aborts_operation_but_keeps_session() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut srv = server();
        srv.encoding = EncodingMode::ForceUtf8;
        let mut engine = FtpEngine::new(srv, Options::default(), notifier);
        login(&mut engine, &mut host);

        assert!(engine.change_dir(&mut host, path("/dir"), String::new()).is_ok());
        engine.on_bytes(&mut host, b"250 \xff\xfe\r\n");
        assert_eq!(host.completions.len(), 1);
        assert!(host.completions[0].is_err());
        assert!(!engine.is_closed());
    }

    #[test]
    fn explicit_tls_auth_sequence() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut srv = server();
        srv.protocol = FtpProtocol::ExplicitTls;
        let mut engine = FtpEngine::new(srv, Options::default(), notifier);
        assert!(engine.connect(&mut host).is_ok());
        engine.on_connected(&mut host);
        feed(&mut engine, &mut host, "220 hello\r\n");
        assert_eq!(host.commands(), vec!["AUTH TLS"]);
        feed(&mut engine, &mut host, "234 proceed\r\n");
        assert_eq!(host.tls_starts, 1);
        engine.on_tls_result(&mut host, true, None);
        assert!(engine.session().tls_active);
        let cmds = host.commands();
        assert_eq!(cmds, vec!["USER u"]);
        feed(&mut engine, &mut host, "331 pw\r\n");
        feed(&mut engine, &mut host, "230 in\r\n");
        feed(&mut engine, &mut host, "215 UNIX\r\n");
        feed(&mut engine, &mut host, "211 End\r\n");
        // PBSZ/PROT follow because the control channel is TLS.
        assert_eq!(host.commands(), vec!["PASS p", "SYST", "FEAT", "PBSZ 0"]);
        feed(&mut engine, &mut host, "200 ok\r\n");
        assert_eq!(host.commands(), vec!["PROT P"]);
        feed(&mut engine, &mut host, "200 ok\r\n");
        assert!(engine.session().prot_p);
        assert_eq!(host.completions, vec![ResultFlags::OK]);
    }

    #[test]
    fn explicit_tls_refused_is_fatal() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut srv = server();
        srv.protocol = FtpProtocol::ExplicitTls;
        let mut engine = FtpEngine::new(srv, Options::default(), notifier);
        assert!(engine.connect(&mut host).is_ok());
        engine.on_connected(&mut host);
        feed(&mut engine, &mut host, "220 hello\r\n");
        feed(&mut engine, &mut host, "502 no tls here\r\n");
        assert!(engine.is_closed());
        assert!(host.completions[0].contains(ResultFlags::CRITICAL));
    }

    #[test]
    fn compat_tls_falls_back_to_plain() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut srv = server();
        srv.protocol = FtpProtocol::ExplicitTlsCompat;
        let mut engine = FtpEngine::new(srv, Options::default(), notifier);
        assert!(engine.connect(&mut host).is_ok());
        engine.on_connected(&mut host);
        feed(&mut engine, &mut host, "220 hello\r\n");
        assert_eq!(host.commands(), vec!["AUTH TLS"]);
        feed(&mut engine, &mut host, "502 nope\r\n");
        assert_eq!(host.commands(), vec!["AUTH SSL"]);
        feed(&mut engine, &mut host, "502 still no\r\n");
        // Plain continuation.
        assert_eq!(host.commands(), vec!["USER u"]);
        assert!(!engine.session().tls_active);
    }

    #[test]
    fn interactive_login_challenge_and_cancel() {
        let mut host = MockHost::new();
        let (notifier, mut rx) = Notifier::channel();
        let mut srv = server();
        srv.password = None;
        let mut engine = FtpEngine::new(srv, Options::default(), notifier);
        assert!(engine.connect(&mut host).is_ok());
        engine.on_connected(&mut host);
        feed(&mut engine, &mut host, "220 private system\r\n");
        feed(&mut engine, &mut host, "331 who goes there\r\n");
        let mut challenge = None;
        while let Ok(n) = rx.try_recv() {
            if let Notification::AsyncRequest(AsyncRequest::InteractiveLogin { challenge: c }) = n {
                challenge = Some(c);
            }
        }
        let challenge = challenge.expect("interactive login prompt");
        assert!(challenge.contains("private system"));
        assert!(challenge.contains("who goes there"));

        engine.on_async_reply(
            &mut host,
            AsyncReply::InteractiveLogin { password: None },
        );
        assert_eq!(host.completions.len(), 1);
        assert!(host.completions[0].contains(ResultFlags::CANCELED));
    }

    #[test]
    fn delete_loop_attempts_remaining_files_after_failure() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);

        assert!(engine
            .delete(
                &mut host,
                path("/home/u"),
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
            )
            .is_ok());
        assert_eq!(host.commands(), vec!["DELE a"]);
        feed(&mut engine, &mut host, "250 gone\r\n");
        assert_eq!(host.commands(), vec!["DELE b"]);
        feed(&mut engine, &mut host, "550 denied\r\n");
        assert_eq!(host.commands(), vec!["DELE c"]);
        feed(&mut engine, &mut host, "250 gone\r\n");
        assert_eq!(host.completions.len(), 1);
        assert!(host.completions[0].contains(ResultFlags::ERROR));
    }

    #[test]
    fn mkdir_walks_up_then_creates() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);

        assert!(engine.mkdir(&mut host, path("/new/deep/dir")).is_ok());
        assert_eq!(host.commands(), vec!["CWD /new/deep"]);
        feed(&mut engine, &mut host, "550 no\r\n");
        assert_eq!(host.commands(), vec!["CWD /new"]);
        feed(&mut engine, &mut host, "550 no\r\n");
        assert_eq!(host.commands(), vec!["CWD /"]);
        feed(&mut engine, &mut host, "250 ok\r\n");
        assert_eq!(host.commands(), vec!["MKD new"]);
        feed(&mut engine, &mut host, "257 \"/new\" created\r\n");
        assert_eq!(host.commands(), vec!["CWD new"]);
        feed(&mut engine, &mut host, "250 ok\r\n");
        assert_eq!(host.commands(), vec!["MKD deep"]);
        feed(&mut engine, &mut host, "257 ok\r\n");
        assert_eq!(host.commands(), vec!["CWD deep"]);
        feed(&mut engine, &mut host, "250 ok\r\n");
        assert_eq!(host.commands(), vec!["MKD dir"]);
        feed(&mut engine, &mut host, "257 ok\r\n");
        assert_eq!(host.completions, vec![ResultFlags::OK]);
    }

    #[test]
    fn timeout_closes_connection() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);
        assert!(engine.raw_command(&mut host, "NOOP".to_string()).is_ok());
        engine.on_timeout(&mut host);
        assert!(engine.is_closed());
        assert!(host.completions[0].contains(ResultFlags::TIMEOUT));
        assert!(host.completions[0].contains(ResultFlags::DISCONNECTED));
    }

    #[test]
    fn rejected_list_retries_with_nlst() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);
        assert!(engine.list(&mut host, ServerPath::empty(), String::new()).is_ok());
        feed(&mut engine, &mut host, "200 ok\r\n");
        feed(
            &mut engine,
            &mut host,
            "229 Entering Extended Passive Mode (|||21000|)\r\n",
        );
        assert_eq!(host.commands(), vec!["TYPE A", "EPSV", "LIST"]);
        feed(&mut engine, &mut host, "500 LIST not understood\r\n");
        feed(
            &mut engine,
            &mut host,
            "229 Entering Extended Passive Mode (|||21001|)\r\n",
        );
        assert_eq!(host.commands(), vec!["EPSV", "NLST"]);
        assert!(host.completions.is_empty());
    }

    #[test]
    fn dotdot_segment_becomes_cdup() {
        let mut host = MockHost::new();
        let (notifier, _rx) = Notifier::channel();
        let mut engine = FtpEngine::new(server(), Options::default(), notifier);
        login(&mut engine, &mut host);
        assert!(engine
            .change_dir(&mut host, ServerPath::empty(), "../sub".to_string())
            .is_ok());
        assert_eq!(host.commands(), vec!["CDUP"]);
        feed(&mut engine, &mut host, "200 ok\r\n");
        feed(&mut engine, &mut host, "257 \"/home\"\r\n");
        assert_eq!(host.commands(), vec!["PWD", "CWD sub"]);
        feed(&mut engine, &mut host, "250 ok\r\n");
        feed(&mut engine, &mut host, "257 \"/home/sub\"\r\n");
        assert_eq!(host.completions, vec![ResultFlags::OK]);
        assert_eq!(engine.session().current_path.get_path(), "/home/sub");
    }
}
