/*
 * session.rs
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

//! The async shell around the engine: one spawned task owns the control
//! socket and pumps bytes, timer fires, data-channel completions, and user
//! replies into the synchronous state machine. Commands are queued over an
//! `mpsc::UnboundedSender`, results come back on oneshots.

use std::io::{Seek, SeekFrom};
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::extip::fetch_external_ip;
use crate::net::{CapturedCert, FtpStream, SessionTls};
use crate::notify::{AsyncReply, CertificatePrompt, Notification, Notifier};
use crate::options::Options;
use crate::path::ServerPath;

use super::engine::{EngineHost, FtpEngine, LocalFileInfo, LocalOpenMode};
use super::reply::RECV_BUFFER_SIZE;
use super::transfer::{
    is_local_failure, pump_download, pump_list, pump_resume_test, pump_upload, IoWorker,
    TransferEndReason, TransferMode,
};
use super::{ResultFlags, ServerDescriptor};

/// Handle to a running FTP session. Cloneable; all methods queue onto the
/// session task.
#[derive(Clone)]
pub struct FtpSession {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
}

enum SessionCommand {
    List {
        path: ServerPath,
        sub_dir: String,
        done: oneshot::Sender<Result<Vec<u8>, ResultFlags>>,
    },
    ChangeDir {
        path: ServerPath,
        sub_dir: String,
        done: oneshot::Sender<ResultFlags>,
    },
    FileTransfer {
        local_file: String,
        remote_path: ServerPath,
        remote_file: String,
        download: bool,
        binary: bool,
        done: oneshot::Sender<ResultFlags>,
    },
    Delete {
        path: ServerPath,
        files: Vec<String>,
        done: oneshot::Sender<ResultFlags>,
    },
    RemoveDir {
        path: ServerPath,
        sub_dir: String,
        done: oneshot::Sender<ResultFlags>,
    },
    Mkdir {
        path: ServerPath,
        done: oneshot::Sender<ResultFlags>,
    },
    Rename {
        from_path: ServerPath,
        from_file: String,
        to_path: ServerPath,
        to_file: String,
        done: oneshot::Sender<ResultFlags>,
    },
    Chmod {
        path: ServerPath,
        file: String,
        permission: String,
        done: oneshot::Sender<ResultFlags>,
    },
    Raw {
        command: String,
        done: oneshot::Sender<ResultFlags>,
    },
    AsyncReply(AsyncReply),
    Cancel,
    Disconnect,
}

impl FtpSession {
    /// Spawn the session task. The logon result arrives on the returned
    /// oneshot; notifications (including logon prompts) flow immediately.
    pub fn start(
        server: ServerDescriptor,
        options: Options,
    ) -> (
        FtpSession,
        mpsc::UnboundedReceiver<Notification>,
        oneshot::Receiver<ResultFlags>,
    ) {
        let (notifier, notif_rx) = Notifier::channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        tokio::spawn(drive(server, options, notifier, cmd_rx, connected_tx));
        (FtpSession { cmd_tx }, notif_rx, connected_rx)
    }

    pub async fn list(&self, path: ServerPath, sub_dir: &str) -> Result<Vec<u8>, ResultFlags> {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::List {
            path,
            sub_dir: sub_dir.to_string(),
            done,
        });
        rx.await
            .unwrap_or(Err(ResultFlags::ERROR | ResultFlags::DISCONNECTED))
    }

    pub async fn change_dir(&self, path: ServerPath, sub_dir: &str) -> ResultFlags {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::ChangeDir {
            path,
            sub_dir: sub_dir.to_string(),
            done,
        });
        rx.await
            .unwrap_or(ResultFlags::ERROR | ResultFlags::DISCONNECTED)
    }

    pub async fn download(
        &self,
        local_file: &str,
        remote_path: ServerPath,
        remote_file: &str,
        binary: bool,
    ) -> ResultFlags {
        self.transfer(local_file, remote_path, remote_file, true, binary)
            .await
    }

    pub async fn upload(
        &self,
        local_file: &str,
        remote_path: ServerPath,
        remote_file: &str,
        binary: bool,
    ) -> ResultFlags {
        self.transfer(local_file, remote_path, remote_file, false, binary)
            .await
    }

    async fn transfer(
        &self,
        local_file: &str,
        remote_path: ServerPath,
        remote_file: &str,
        download: bool,
        binary: bool,
    ) -> ResultFlags {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::FileTransfer {
            local_file: local_file.to_string(),
            remote_path,
            remote_file: remote_file.to_string(),
            download,
            binary,
            done,
        });
        rx.await
            .unwrap_or(ResultFlags::ERROR | ResultFlags::DISCONNECTED)
    }

    pub async fn delete(&self, path: ServerPath, files: Vec<String>) -> ResultFlags {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::Delete { path, files, done });
        rx.await
            .unwrap_or(ResultFlags::ERROR | ResultFlags::DISCONNECTED)
    }

    pub async fn remove_dir(&self, path: ServerPath, sub_dir: &str) -> ResultFlags {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::RemoveDir {
            path,
            sub_dir: sub_dir.to_string(),
            done,
        });
        rx.await
            .unwrap_or(ResultFlags::ERROR | ResultFlags::DISCONNECTED)
    }

    pub async fn mkdir(&self, path: ServerPath) -> ResultFlags {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::Mkdir { path, done });
        rx.await
            .unwrap_or(ResultFlags::ERROR | ResultFlags::DISCONNECTED)
    }

    pub async fn rename(
        &self,
        from_path: ServerPath,
        from_file: &str,
        to_path: ServerPath,
        to_file: &str,
    ) -> ResultFlags {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::Rename {
            from_path,
            from_file: from_file.to_string(),
            to_path,
            to_file: to_file.to_string(),
            done,
        });
        rx.await
            .unwrap_or(ResultFlags::ERROR | ResultFlags::DISCONNECTED)
    }

    pub async fn chmod(&self, path: ServerPath, file: &str, permission: &str) -> ResultFlags {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::Chmod {
            path,
            file: file.to_string(),
            permission: permission.to_string(),
            done,
        });
        rx.await
            .unwrap_or(ResultFlags::ERROR | ResultFlags::DISCONNECTED)
    }

    pub async fn raw_command(&self, command: &str) -> ResultFlags {
        let (done, rx) = oneshot::channel();
        self.send(SessionCommand::Raw {
            command: command.to_string(),
            done,
        });
        rx.await
            .unwrap_or(ResultFlags::ERROR | ResultFlags::DISCONNECTED)
    }

    /// Answer an outstanding async request (password, certificate,
    /// file-exists).
    pub fn reply(&self, reply: AsyncReply) {
        self.send(SessionCommand::AsyncReply(reply));
    }

    pub fn cancel(&self) {
        self.send(SessionCommand::Cancel);
    }

    pub fn disconnect(&self) {
        self.send(SessionCommand::Disconnect);
    }

    fn send(&self, cmd: SessionCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            debug!("session task is gone, dropping command");
        }
    }
}

enum ShellEvent {
    TransferEnd(TransferEndReason),
    Listing(Vec<u8>),
    IpResolved(Result<String, String>),
}

struct PendingFile {
    file: std::fs::File,
    writing: bool,
    binary: bool,
}

enum DataTarget {
    Connect(String, u16),
    Accept(tokio::net::TcpListener),
}

/// Host implementation: records what the engine wants done; the driver loop
/// services it between events.
struct Shell {
    out_buf: Vec<u8>,
    start_tls_requested: bool,
    close_requested: bool,
    trust: SessionTls,
    local_addr: Option<IpAddr>,
    peer_addr: Option<IpAddr>,
    pending_data: Option<(DataTarget, TransferMode, bool)>,
    data_task: Option<JoinHandle<()>>,
    resolver_url: Option<String>,
    idle_deadline: Option<Instant>,
    completed: Option<ResultFlags>,
    pending_file: Option<PendingFile>,
    event_tx: mpsc::UnboundedSender<ShellEvent>,
}

impl Shell {
    fn new(event_tx: mpsc::UnboundedSender<ShellEvent>) -> Self {
        Shell {
            out_buf: Vec::new(),
            start_tls_requested: false,
            close_requested: false,
            trust: SessionTls::new(),
            local_addr: None,
            peer_addr: None,
            pending_data: None,
            data_task: None,
            resolver_url: None,
            idle_deadline: None,
            completed: None,
            pending_file: None,
            event_tx,
        }
    }
}

impl EngineHost for Shell {
    fn send_control(&mut self, data: &[u8]) {
        self.out_buf.extend_from_slice(data);
    }

    fn start_tls(&mut self) {
        self.start_tls_requested = true;
    }

    fn trust_current_cert(&mut self, trusted: bool) {
        self.trust.trust_current_cert(trusted);
    }

    fn close_connection(&mut self) {
        self.close_requested = true;
    }

    fn connect_data(&mut self, host: &str, port: u16, mode: TransferMode, tls: bool) {
        self.pending_data = Some((DataTarget::Connect(host.to_string(), port), mode, tls));
    }

    fn listen_data(&mut self, mode: TransferMode, tls: bool) -> Result<u16, String> {
        let ip = self
            .local_addr
            .ok_or_else(|| "local address unknown".to_string())?;
        let listener =
            std::net::TcpListener::bind((ip, 0)).map_err(|e| e.to_string())?;
        listener.set_nonblocking(true).map_err(|e| e.to_string())?;
        let port = listener.local_addr().map_err(|e| e.to_string())?.port();
        let listener =
            tokio::net::TcpListener::from_std(listener).map_err(|e| e.to_string())?;
        self.pending_data = Some((DataTarget::Accept(listener), mode, tls));
        Ok(port)
    }

    fn reset_data(&mut self) {
        if let Some(task) = self.data_task.take() {
            task.abort();
        }
        self.pending_data = None;
        self.pending_file = None;
    }

    fn local_addr(&self) -> Option<IpAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<IpAddr> {
        self.peer_addr
    }

    fn resolve_external_ip(&mut self, url: &str) {
        self.resolver_url = Some(url.to_string());
    }

    fn start_idle_timer(&mut self, after: Duration) {
        self.idle_deadline = Some(Instant::now() + after);
    }

    fn stop_idle_timer(&mut self) {
        self.idle_deadline = None;
    }

    fn operation_complete(&mut self, result: ResultFlags) {
        self.completed = Some(result);
    }

    fn local_file_info(&mut self, path: &str) -> Option<LocalFileInfo> {
        let meta = std::fs::metadata(path).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(LocalFileInfo {
            size: meta.len(),
            mtime: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    fn open_local_file(
        &mut self,
        path: &str,
        mode: LocalOpenMode,
        offset: u64,
        binary: bool,
    ) -> Result<u64, String> {
        let (mut file, writing, position) = match mode {
            LocalOpenMode::ReadUpload => {
                let f = std::fs::File::open(path).map_err(|e| e.to_string())?;
                (f, false, offset)
            }
            LocalOpenMode::WriteResume => {
                let f = std::fs::OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|e| e.to_string())?;
                let size = f.metadata().map_err(|e| e.to_string())?.len();
                (f, true, size)
            }
            LocalOpenMode::WriteFresh => {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                    }
                }
                let f = std::fs::File::create(path).map_err(|e| e.to_string())?;
                (f, true, 0)
            }
        };
        if position > 0 {
            file.seek(SeekFrom::Start(position)).map_err(|e| e.to_string())?;
        }
        let result = if mode == LocalOpenMode::ReadUpload {
            file.metadata().map_err(|e| e.to_string())?.len()
        } else {
            position
        };
        self.pending_file = Some(PendingFile {
            file,
            writing,
            binary,
        });
        Ok(result)
    }

    fn preallocate_local(&mut self, bytes: u64) {
        if let Some(pf) = &self.pending_file {
            if let Ok(meta) = pf.file.metadata() {
                if pf.file.set_len(meta.len() + bytes).is_err() {
                    debug!("could not preallocate the file");
                }
            }
        }
    }

    fn remove_empty_local_file(&mut self, path: &str) {
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.is_file() && meta.len() == 0 {
                debug!("deleting empty file {}", path);
                let _ = std::fs::remove_file(path);
            }
        }
    }

    fn set_local_mtime(&mut self, path: &str, mtime: DateTime<Utc>) {
        let file = match std::fs::OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(_) => return,
        };
        if file.set_modified(mtime.into()).is_err() {
            warn!("could not set modification time of {}", path);
        }
    }
}

enum DoneSender {
    Flags(oneshot::Sender<ResultFlags>),
    Listing(oneshot::Sender<Result<Vec<u8>, ResultFlags>>),
}

async fn drive(
    server: ServerDescriptor,
    options: Options,
    notifier: Notifier,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    connected_tx: oneshot::Sender<ResultFlags>,
) {
    let reply_timeout = options.reply_timeout();
    let keepalive = options.tcp_keepalive();
    let mut engine = FtpEngine::new(server.clone(), options, notifier.clone());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut shell = Shell::new(event_tx);

    let mut stream = match FtpStream::connect(&server.host, server.port).await {
        Ok(s) => s,
        Err(e) => {
            notifier.error(format!("Could not connect to server: {}", e));
            let _ = connected_tx.send(ResultFlags::ERROR | ResultFlags::DISCONNECTED);
            return;
        }
    };
    apply_socket_options(&stream, keepalive);
    shell.local_addr = stream.tcp().local_addr().ok().map(|a| a.ip());
    shell.peer_addr = stream.tcp().peer_addr().ok().map(|a| a.ip());

    let _ = engine.connect(&mut shell);
    engine.on_connected(&mut shell);

    let mut connected_tx = Some(connected_tx);
    let mut current_done: Option<DoneSender> = None;
    let mut last_listing: Vec<u8> = Vec::new();
    let mut read_buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut last_activity = Instant::now();

    loop {
        match service(&mut engine, &mut shell, stream, &server).await {
            Ok(s) => stream = s,
            Err(e) => {
                // The shell consumed the stream (failed TLS upgrade or write
                // error); nothing to pump anymore.
                debug!("control stream gone: {}", e);
                break;
            }
        }
        if let Some(flags) = shell.completed.take() {
            resolve_completion(flags, &mut current_done, &mut connected_tx, &mut last_listing);
        }
        if shell.close_requested {
            break;
        }

        let idle_deadline = shell.idle_deadline;
        let watchdog = if engine.pending_replies() > 0 {
            Some(last_activity + reply_timeout)
        } else {
            None
        };

        tokio::select! {
            r = stream.read(&mut read_buf) => match r {
                Ok(0) => engine.on_connection_lost(&mut shell, None),
                Ok(n) => {
                    last_activity = Instant::now();
                    engine.on_bytes(&mut shell, &read_buf[..n]);
                }
                Err(e) => engine.on_connection_lost(&mut shell, Some(&e.to_string())),
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(c) => handle_command(&mut engine, &mut shell, c, &mut current_done),
                None => engine.disconnect(&mut shell),
            },
            Some(ev) = event_rx.recv() => match ev {
                ShellEvent::TransferEnd(reason) => engine.on_transfer_end(&mut shell, reason),
                ShellEvent::Listing(bytes) => last_listing = bytes,
                ShellEvent::IpResolved(result) => engine.on_ip_resolved(&mut shell, result),
            },
            _ = sleep_until_opt(idle_deadline), if idle_deadline.is_some() => {
                shell.idle_deadline = None;
                engine.on_idle_timer(&mut shell);
            }
            _ = sleep_until_opt(watchdog), if watchdog.is_some() => {
                engine.on_timeout(&mut shell);
            }
        }
    }

    shell.reset_data();
    if let Some(flags) = shell.completed.take() {
        resolve_completion(flags, &mut current_done, &mut connected_tx, &mut last_listing);
    }
    let closing_flags = ResultFlags::ERROR | ResultFlags::DISCONNECTED;
    resolve_completion(closing_flags, &mut current_done, &mut connected_tx, &mut last_listing);
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Flush queued bytes, perform a requested TLS upgrade, spawn data and
/// resolver tasks. Loops until the engine stops producing effects.
async fn service(
    engine: &mut FtpEngine,
    shell: &mut Shell,
    mut stream: FtpStream,
    server: &ServerDescriptor,
) -> std::io::Result<FtpStream> {
    use tokio::io::AsyncWriteExt;
    loop {
        if !shell.out_buf.is_empty() {
            let data = std::mem::take(&mut shell.out_buf);
            stream.write_all(&data).await?;
            stream.flush().await?;
            continue;
        }
        if shell.start_tls_requested {
            shell.start_tls_requested = false;
            stream = match stream.upgrade_to_tls(&shell.trust, &server.host).await {
                Ok(s) => s,
                Err(e) => {
                    engine.on_tls_result(shell, false, None);
                    return Err(e);
                }
            };
            let prompt = shell
                .trust
                .last_captured()
                .filter(|c| !shell.trust.is_trusted(c))
                .map(|c| certificate_prompt(server, c));
            engine.on_tls_result(shell, true, prompt);
            continue;
        }
        if let Some((target, mode, tls)) = shell.pending_data.take() {
            let worker = shell
                .pending_file
                .take()
                .map(|pf| IoWorker::create(pf.file, pf.writing, pf.binary));
            let trust = tls.then(|| shell.trust.clone());
            let host_name = server.host.clone();
            let tx = shell.event_tx.clone();
            shell.data_task = Some(tokio::spawn(run_data_channel(
                target, trust, host_name, mode, worker, tx,
            )));
            continue;
        }
        if let Some(url) = shell.resolver_url.take() {
            let tx = shell.event_tx.clone();
            tokio::spawn(async move {
                let result = fetch_external_ip(&url).await;
                let _ = tx.send(ShellEvent::IpResolved(result));
            });
            continue;
        }
        return Ok(stream);
    }
}

fn certificate_prompt(server: &ServerDescriptor, cert: CapturedCert) -> CertificatePrompt {
    CertificatePrompt {
        host: server.host.clone(),
        port: server.port,
        chain: cert.chain,
        fingerprint: cert.fingerprint,
        system_trust: cert.system_trust,
    }
}

fn handle_command(
    engine: &mut FtpEngine,
    shell: &mut Shell,
    cmd: SessionCommand,
    current_done: &mut Option<DoneSender>,
) {
    let started = match cmd {
        SessionCommand::List { path, sub_dir, done } => {
            *current_done = Some(DoneSender::Listing(done));
            engine.list(shell, path, sub_dir)
        }
        SessionCommand::ChangeDir { path, sub_dir, done } => {
            *current_done = Some(DoneSender::Flags(done));
            engine.change_dir(shell, path, sub_dir)
        }
        SessionCommand::FileTransfer {
            local_file,
            remote_path,
            remote_file,
            download,
            binary,
            done,
        } => {
            *current_done = Some(DoneSender::Flags(done));
            engine.file_transfer(shell, local_file, remote_path, remote_file, download, binary)
        }
        SessionCommand::Delete { path, files, done } => {
            *current_done = Some(DoneSender::Flags(done));
            engine.delete(shell, path, files)
        }
        SessionCommand::RemoveDir { path, sub_dir, done } => {
            *current_done = Some(DoneSender::Flags(done));
            engine.remove_dir(shell, path, sub_dir)
        }
        SessionCommand::Mkdir { path, done } => {
            *current_done = Some(DoneSender::Flags(done));
            engine.mkdir(shell, path)
        }
        SessionCommand::Rename {
            from_path,
            from_file,
            to_path,
            to_file,
            done,
        } => {
            *current_done = Some(DoneSender::Flags(done));
            engine.rename(shell, from_path, from_file, to_path, to_file)
        }
        SessionCommand::Chmod {
            path,
            file,
            permission,
            done,
        } => {
            *current_done = Some(DoneSender::Flags(done));
            engine.chmod(shell, path, file, permission)
        }
        SessionCommand::Raw { command, done } => {
            *current_done = Some(DoneSender::Flags(done));
            engine.raw_command(shell, command)
        }
        SessionCommand::AsyncReply(reply) => {
            engine.on_async_reply(shell, reply);
            return;
        }
        SessionCommand::Cancel => {
            engine.cancel(shell);
            return;
        }
        SessionCommand::Disconnect => {
            engine.disconnect(shell);
            return;
        }
    };
    if started.is_err() {
        // Rejected synchronously; fail the caller now.
        match current_done.take() {
            Some(DoneSender::Flags(tx)) => {
                let _ = tx.send(started);
            }
            Some(DoneSender::Listing(tx)) => {
                let _ = tx.send(Err(started));
            }
            None => {}
        }
    }
}

fn resolve_completion(
    flags: ResultFlags,
    current_done: &mut Option<DoneSender>,
    connected_tx: &mut Option<oneshot::Sender<ResultFlags>>,
    last_listing: &mut Vec<u8>,
) {
    if let Some(tx) = connected_tx.take() {
        let _ = tx.send(flags);
        return;
    }
    match current_done.take() {
        Some(DoneSender::Flags(tx)) => {
            let _ = tx.send(flags);
        }
        Some(DoneSender::Listing(tx)) => {
            let result = if flags.is_ok() {
                Ok(std::mem::take(last_listing))
            } else {
                Err(flags)
            };
            let _ = tx.send(result);
        }
        None => {}
    }
}

fn apply_socket_options(stream: &FtpStream, keepalive: Option<Duration>) {
    if let Some(interval) = keepalive {
        let sock = socket2::SockRef::from(stream.tcp());
        let conf = socket2::TcpKeepalive::new().with_time(interval);
        if sock.set_tcp_keepalive(&conf).is_err() {
            debug!("could not enable TCP keepalive");
        }
    }
}

/// One data connection from connect/accept to the end event.
async fn run_data_channel(
    target: DataTarget,
    trust: Option<SessionTls>,
    host_name: String,
    mode: TransferMode,
    worker: Option<IoWorker>,
    tx: mpsc::UnboundedSender<ShellEvent>,
) {
    let reason = run_data_channel_inner(target, trust, &host_name, mode, worker, &tx).await;
    let _ = tx.send(ShellEvent::TransferEnd(reason));
}

async fn run_data_channel_inner(
    target: DataTarget,
    trust: Option<SessionTls>,
    host_name: &str,
    mode: TransferMode,
    worker: Option<IoWorker>,
    tx: &mpsc::UnboundedSender<ShellEvent>,
) -> TransferEndReason {
    let tcp = match target {
        DataTarget::Connect(host, port) => match TcpStream::connect((host.as_str(), port)).await {
            Ok(s) => s,
            Err(e) => {
                debug!("data connection failed: {}", e);
                return TransferEndReason::Failure;
            }
        },
        DataTarget::Accept(listener) => match listener.accept().await {
            Ok((s, _)) => s,
            Err(e) => {
                debug!("data accept failed: {}", e);
                return TransferEndReason::Failure;
            }
        },
    };
    let mut stream = match trust {
        Some(t) => match t.handshake(host_name, tcp).await {
            Ok(s) => FtpStream::Tls(Box::new(s)),
            Err(e) => {
                debug!("data TLS handshake failed: {}", e);
                return TransferEndReason::Failure;
            }
        },
        None => FtpStream::Plain(tcp),
    };

    match mode {
        TransferMode::List => match pump_list(&mut stream).await {
            Ok(bytes) => {
                let _ = tx.send(ShellEvent::Listing(bytes));
                TransferEndReason::Successful
            }
            Err(_) => TransferEndReason::TransferFailure,
        },
        TransferMode::Download => {
            let mut worker = match worker {
                Some(w) => w,
                None => return TransferEndReason::TransferFailureCritical,
            };
            match pump_download(&mut stream, &mut worker).await {
                Ok(_) => TransferEndReason::Successful,
                Err(e) if is_local_failure(&e) => TransferEndReason::TransferFailureCritical,
                Err(_) => TransferEndReason::TransferFailure,
            }
        }
        TransferMode::Upload => {
            let mut worker = match worker {
                Some(w) => w,
                None => return TransferEndReason::TransferFailureCritical,
            };
            match pump_upload(&mut stream, &mut worker).await {
                Ok(_) => TransferEndReason::Successful,
                Err(e) if is_local_failure(&e) => TransferEndReason::TransferFailureCritical,
                Err(_) => TransferEndReason::TransferFailure,
            }
        }
        TransferMode::ResumeTest => match pump_resume_test(&mut stream).await {
            Ok(n) if n > 0 => TransferEndReason::Successful,
            Ok(_) => TransferEndReason::FailedResumeTest,
            Err(_) => TransferEndReason::TransferFailure,
        },
    }
}
