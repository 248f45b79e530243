/*
 * filetransfer.rs
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

//! One file transfer: CWD to the remote directory, find out what exists
//! there (cache, listing refresh, SIZE/MDTM), resolve conflicts with the
//! user, probe resume quirks, then run the raw transfer and fix up
//! timestamps.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use log::debug;

use crate::notify::{
    AsyncRequest, FileExistsAction, FileExistsPrompt, Notification,
};
use crate::path::ServerPath;

use super::super::capabilities::{Capability, TriState};
use super::super::engine::{EngineHost, LocalOpenMode, SessionState, TransferCtl};
use super::super::reply::Reply;
use super::super::transfer::{TransferEndReason, TransferMode};
use super::super::ResultFlags;
use super::{OpData, OpOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTransferState {
    WaitCwd,
    WaitList,
    Size,
    Mdtm,
    ResumeTest,
    Transfer,
    WaitTransfer,
    WaitResumeTest,
    Mfmt,
}

#[derive(Debug)]
pub struct FileTransferOpData {
    pub state: FileTransferState,
    pub wait_async: bool,
    pub download: bool,
    pub binary: bool,
    pub local_file: String,
    remote_path: ServerPath,
    remote_file: String,
    try_absolute_path: bool,
    resume: bool,
    local_size: Option<u64>,
    remote_size: Option<u64>,
    file_time: Option<DateTime<Utc>>,
    /// The local file existed before we touched it (guards the empty-file
    /// cleanup after a failed download).
    pub file_did_exist: bool,
    cwd_pushed: bool,
    list_pushed: bool,
}

impl FileTransferOpData {
    pub fn new(
        local_file: String,
        remote_path: ServerPath,
        remote_file: String,
        download: bool,
        binary: bool,
        local_size: Option<u64>,
    ) -> Self {
        FileTransferOpData {
            state: FileTransferState::WaitCwd,
            wait_async: false,
            download,
            binary,
            local_file,
            remote_path,
            remote_file,
            try_absolute_path: false,
            resume: false,
            local_size,
            remote_size: None,
            file_time: None,
            file_did_exist: true,
            cwd_pushed: false,
            list_pushed: false,
        }
    }

    fn lookup_path<'a>(&'a self, session: &'a SessionState) -> &'a ServerPath {
        if self.try_absolute_path {
            &self.remote_path
        } else {
            &session.current_path
        }
    }

    fn formatted_name(&self) -> String {
        self.remote_path
            .format_filename(&self.remote_file, !self.try_absolute_path)
    }
}

pub fn send(
    op: &mut FileTransferOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
) -> OpOutcome {
    match op.state {
        FileTransferState::WaitCwd => {
            if op.cwd_pushed {
                return OpOutcome::WouldBlock;
            }
            op.cwd_pushed = true;
            OpOutcome::Push(Box::new(OpData::Cwd(super::CwdOpData::new(
                op.remote_path.clone(),
                String::new(),
                false,
                !op.download,
            ))))
        }
        FileTransferState::WaitList => {
            if op.list_pushed {
                return OpOutcome::WouldBlock;
            }
            op.list_pushed = true;
            OpOutcome::Push(Box::new(OpData::List(super::ListOpData::new(
                ServerPath::empty(),
                String::new(),
            ))))
        }
        FileTransferState::Size => {
            if session.caps.get(&session.server_key, Capability::SizeCommand) == TriState::No {
                op.state = FileTransferState::Mdtm;
                return OpOutcome::Continue;
            }
            let cmd = format!("SIZE {}", op.formatted_name());
            if !session.send_command(host, &cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        FileTransferState::Mdtm => {
            let wanted = op.download
                && session.options.preserve_timestamps
                && op.file_time.is_none()
                && session.caps.get(&session.server_key, Capability::MdtmCommand) != TriState::No;
            if !wanted {
                op.state = FileTransferState::ResumeTest;
                return check_overwrite(op, session, host);
            }
            let cmd = format!("MDTM {}", op.formatted_name());
            if !session.send_command(host, &cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        FileTransferState::ResumeTest | FileTransferState::Transfer => {
            start_transfer(op, session, host)
        }
        FileTransferState::Mfmt => {
            let t = match op.file_time {
                Some(t) => t,
                None => return OpOutcome::Ok,
            };
            let adjusted =
                t - ChronoDuration::minutes(i64::from(session.server.timezone_offset_minutes));
            let cmd = format!(
                "MFMT {} {}",
                adjusted.format("%Y%m%d%H%M%S"),
                op.formatted_name()
            );
            if !session.send_command(host, &cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        FileTransferState::WaitTransfer | FileTransferState::WaitResumeTest => {
            OpOutcome::WouldBlock
        }
    }
}

pub fn parse_reply(
    op: &mut FileTransferOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
    reply: &Reply,
) -> OpOutcome {
    let code = reply.code_class();
    match op.state {
        FileTransferState::Size => {
            if code == 2 || code == 3 {
                op.state = FileTransferState::Mdtm;
                if reply.code() == 213 {
                    if session.caps.get(&session.server_key, Capability::SizeCommand)
                        == TriState::Unknown
                    {
                        session
                            .caps
                            .set(&session.server_key, Capability::SizeCommand, TriState::Yes);
                    }
                    op.remote_size = parse_size_tail(reply.tail());
                    if op.remote_size.is_none() {
                        debug!("invalid SIZE reply");
                    }
                } else {
                    debug!("invalid SIZE reply");
                }
                return OpOutcome::Continue;
            }
            // SIZE failed. When the server clearly knows the file is absent
            // (or supports SIZE and rejected it anyway), MDTM will fail the
            // same way, so skip it.
            let tail_lower = reply.tail().to_lowercase();
            let known_absent = session.caps.get(&session.server_key, Capability::SizeCommand)
                == TriState::Yes
                || tail_lower == "file not found"
                || (!op.formatted_name().to_lowercase().contains("file not found")
                    && reply.text().to_lowercase().contains("file not found"));
            if known_absent {
                op.state = FileTransferState::ResumeTest;
                return check_overwrite(op, session, host);
            }
            op.state = FileTransferState::Mdtm;
            OpOutcome::Continue
        }
        FileTransferState::Mdtm => {
            if reply.code() == 213 {
                if let Some(t) = parse_mdtm_tail(reply.tail()) {
                    op.file_time = Some(
                        t + ChronoDuration::minutes(i64::from(
                            session.server.timezone_offset_minutes,
                        )),
                    );
                }
            }
            op.state = FileTransferState::ResumeTest;
            check_overwrite(op, session, host)
        }
        FileTransferState::Mfmt => OpOutcome::Ok,
        _ => {
            debug!("reply in unexpected transfer state {:?}", op.state);
            OpOutcome::Error(ResultFlags::ERROR | ResultFlags::INTERNAL)
        }
    }
}

pub fn sub_result(
    op: &mut FileTransferOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
    prev: ResultFlags,
) -> OpOutcome {
    match op.state {
        FileTransferState::WaitCwd => {
            if prev.is_ok() {
                after_directory_known(op, session, host, false)
            } else {
                op.try_absolute_path = true;
                op.state = FileTransferState::Size;
                OpOutcome::Continue
            }
        }
        FileTransferState::WaitList => {
            if prev.is_ok() {
                after_directory_known(op, session, host, true)
            } else {
                op.state = FileTransferState::Size;
                OpOutcome::Continue
            }
        }
        FileTransferState::WaitResumeTest => {
            let big = op.local_size.unwrap_or(0) >= 1u64 << 32;
            let cap = if big {
                Capability::Resume4GbBug
            } else {
                Capability::Resume2GbBug
            };
            if prev.is_ok() {
                session.caps.set(&session.server_key, cap, TriState::No);
                op.state = FileTransferState::Transfer;
                return OpOutcome::Continue;
            }
            let probe_refused = matches!(
                session.transfer_ctl.end_reason,
                TransferEndReason::FailedResumeTest
                    | TransferEndReason::TransferCommandFailure
                    | TransferEndReason::TransferCommandFailureImmediate
            );
            if probe_refused {
                session.caps.set(&session.server_key, cap, TriState::Yes);
                session.notifier.error(format!(
                    "Server does not support resume of files > {} GB",
                    if big { 4 } else { 2 }
                ));
                return OpOutcome::Error(prev | ResultFlags::CRITICAL);
            }
            OpOutcome::Error(prev)
        }
        FileTransferState::WaitTransfer => {
            if prev.is_ok() && session.options.preserve_timestamps {
                if !op.download
                    && session.caps.get(&session.server_key, Capability::MfmtCommand)
                        == TriState::Yes
                {
                    if let Some(info) = host.local_file_info(&op.local_file) {
                        if let Some(mtime) = info.mtime {
                            op.file_time = Some(mtime);
                            op.state = FileTransferState::Mfmt;
                            return OpOutcome::Continue;
                        }
                    }
                } else if op.download {
                    if let Some(t) = op.file_time {
                        host.set_local_mtime(&op.local_file, t);
                    }
                }
            }
            if prev.is_ok() {
                OpOutcome::Ok
            } else {
                OpOutcome::Error(prev)
            }
        }
        _ => {
            debug!("sub result in unexpected transfer state {:?}", op.state);
            OpOutcome::Error(ResultFlags::ERROR | ResultFlags::INTERNAL)
        }
    }
}

/// The remote directory is settled (CWD or listing refresh done); pick the
/// next probe from what the cache knows.
fn after_directory_known(
    op: &mut FileTransferOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
    listed: bool,
) -> OpOutcome {
    let lookup = session.dir_cache.lookup_file(
        &session.server_key,
        op.lookup_path(session),
        &op.remote_file,
    );
    let preserve = session.options.preserve_timestamps;
    let mdtm_yes =
        session.caps.get(&session.server_key, Capability::MdtmCommand) == TriState::Yes;

    let next = match lookup.entry {
        None => {
            if !lookup.dir_did_exist {
                if listed {
                    FileTransferState::Size
                } else {
                    FileTransferState::WaitList
                }
            } else if op.download && preserve && mdtm_yes {
                FileTransferState::Mdtm
            } else {
                FileTransferState::ResumeTest
            }
        }
        Some(entry) => {
            if entry.unsure && !listed {
                FileTransferState::WaitList
            } else if !lookup.matched_case || (entry.unsure && listed) {
                FileTransferState::Size
            } else {
                op.remote_size = entry.size;
                if entry.mtime.is_some() {
                    op.file_time = entry.mtime;
                }
                if op.download && !entry.has_time && preserve && mdtm_yes {
                    FileTransferState::Mdtm
                } else {
                    FileTransferState::ResumeTest
                }
            }
        }
    };
    op.state = next;
    if next == FileTransferState::ResumeTest {
        return check_overwrite(op, session, host);
    }
    OpOutcome::Continue
}

/// Ask the user what to do when the target exists; proceed silently when it
/// does not.
fn check_overwrite(
    op: &mut FileTransferOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
) -> OpOutcome {
    let local_info = host.local_file_info(&op.local_file);
    let conflict = if op.download {
        local_info.is_some()
    } else {
        op.remote_size.is_some() || op.file_time.is_some()
    };
    if !conflict {
        return OpOutcome::Continue;
    }
    op.wait_async = true;
    session
        .notifier
        .send(Notification::AsyncRequest(AsyncRequest::FileExists(
            FileExistsPrompt {
                download: op.download,
                local_file: op.local_file.clone(),
                local_size: local_info.map(|i| i.size),
                local_time: local_info.and_then(|i| i.mtime),
                remote_file: op.remote_file.clone(),
                remote_path: op.remote_path.clone(),
                remote_size: op.remote_size,
                remote_time: op.file_time,
            },
        )));
    OpOutcome::WouldBlock
}

/// The user's answer to the file-exists prompt.
pub fn file_exists_action(
    op: &mut FileTransferOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
    action: FileExistsAction,
) -> OpOutcome {
    op.wait_async = false;
    let local_info = host.local_file_info(&op.local_file);
    let (source_size, target_size, source_time, target_time) = if op.download {
        (
            op.remote_size,
            local_info.map(|i| i.size),
            op.file_time,
            local_info.and_then(|i| i.mtime),
        )
    } else {
        (
            local_info.map(|i| i.size),
            op.remote_size,
            local_info.and_then(|i| i.mtime),
            op.file_time,
        )
    };
    match action {
        FileExistsAction::Ask => {
            op.wait_async = true;
            session
                .notifier
                .send(Notification::AsyncRequest(AsyncRequest::FileExists(
                    FileExistsPrompt {
                        download: op.download,
                        local_file: op.local_file.clone(),
                        local_size: local_info.map(|i| i.size),
                        local_time: local_info.and_then(|i| i.mtime),
                        remote_file: op.remote_file.clone(),
                        remote_path: op.remote_path.clone(),
                        remote_size: op.remote_size,
                        remote_time: op.file_time,
                    },
                )));
            OpOutcome::WouldBlock
        }
        FileExistsAction::Overwrite => {
            op.resume = false;
            OpOutcome::Continue
        }
        FileExistsAction::OverwriteIfNewer => {
            overwrite_if(op, newer(source_time, target_time))
        }
        FileExistsAction::OverwriteIfDifferentSize => {
            overwrite_if(op, source_size != target_size)
        }
        FileExistsAction::OverwriteIfNewerOrDifferentSize => overwrite_if(
            op,
            source_size != target_size || newer(source_time, target_time),
        ),
        FileExistsAction::Resume => {
            op.resume = true;
            OpOutcome::Continue
        }
        FileExistsAction::Rename(new_name) => {
            if op.download {
                op.local_file = rename_local(&op.local_file, &new_name);
            } else {
                op.remote_file = new_name;
            }
            check_overwrite(op, session, host)
        }
        FileExistsAction::Skip => {
            session.notifier.status(format!(
                "Skipping transfer of {}",
                if op.download {
                    op.formatted_name()
                } else {
                    op.local_file.clone()
                }
            ));
            OpOutcome::Ok
        }
    }
}

fn overwrite_if(op: &mut FileTransferOpData, condition: bool) -> OpOutcome {
    if condition {
        op.resume = false;
        OpOutcome::Continue
    } else {
        OpOutcome::Ok
    }
}

fn newer(source: Option<DateTime<Utc>>, target: Option<DateTime<Utc>>) -> bool {
    match (source, target) {
        (Some(s), Some(t)) => s > t,
        _ => false,
    }
}

fn rename_local(path: &str, new_name: &str) -> String {
    match path.rfind(std::path::MAIN_SEPARATOR) {
        Some(i) => format!("{}{}", &path[..i + 1], new_name),
        None => new_name.to_string(),
    }
}

/// Open the local side, run the resume-quirk probe when needed, then push
/// the raw transfer.
fn start_transfer(
    op: &mut FileTransferOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
) -> OpOutcome {
    if op.download {
        let did_exist = host.local_file_info(&op.local_file).is_some();
        let start_offset;
        if op.resume {
            match host.open_local_file(&op.local_file, LocalOpenMode::WriteResume, 0, op.binary) {
                Ok(offset) => start_offset = offset,
                Err(e) => {
                    session.notifier.error(format!(
                        "Failed to open \"{}\" for appending/writing: {}",
                        op.local_file, e
                    ));
                    return OpOutcome::Error(ResultFlags::ERROR);
                }
            }
            op.local_size = Some(start_offset);
            if op.state == FileTransferState::ResumeTest {
                match test_resume_capability(op, session) {
                    ResumeCheck::Proceed => {}
                    ResumeCheck::NoopOk => return OpOutcome::Ok,
                    ResumeCheck::Critical => return OpOutcome::Error(ResultFlags::CRITICAL_ERROR),
                    ResumeCheck::Probe => {
                        let cmd = format!("RETR {}", op.formatted_name());
                        op.state = FileTransferState::WaitResumeTest;
                        session.transfer_ctl = TransferCtl {
                            command_sent: false,
                            end_reason: TransferEndReason::Successful,
                            resume_offset: op.remote_size.unwrap_or(1) - 1,
                            binary: op.binary,
                            mode: TransferMode::ResumeTest,
                        };
                        let raw = super::RawTransferOpData::new(cmd, session);
                        return OpOutcome::Push(Box::new(OpData::RawTransfer(raw)));
                    }
                }
            }
        } else {
            if let Err(e) =
                host.open_local_file(&op.local_file, LocalOpenMode::WriteFresh, 0, op.binary)
            {
                session.notifier.error(format!(
                    "Failed to open \"{}\" for writing: {}",
                    op.local_file, e
                ));
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            start_offset = 0;
            op.local_size = Some(0);
        }
        op.file_did_exist = did_exist;

        session.notifier.send(Notification::TransferStatus {
            total: op.remote_size,
            current: start_offset,
            start_offset,
        });
        if session.options.preallocate_space {
            if let Some(remote) = op.remote_size {
                if remote > start_offset {
                    debug!("preallocating {} bytes", remote - start_offset);
                    host.preallocate_local(remote - start_offset);
                }
            }
        }

        session.transfer_ctl = TransferCtl {
            command_sent: false,
            end_reason: TransferEndReason::Successful,
            resume_offset: if op.resume { start_offset } else { 0 },
            binary: op.binary,
            mode: TransferMode::Download,
        };
        let cmd = format!("RETR {}", op.formatted_name());
        op.state = FileTransferState::WaitTransfer;
        let raw = super::RawTransferOpData::new(cmd, session);
        OpOutcome::Push(Box::new(OpData::RawTransfer(raw)))
    } else {
        let start_offset = if op.resume {
            op.remote_size.unwrap_or(0)
        } else {
            0
        };
        if op.resume
            && start_offset > 0
            && Some(start_offset) == op.local_size
            && op.binary
        {
            debug!("no need to resume, remote file size matches local file size");
            if session.options.preserve_timestamps
                && session.caps.get(&session.server_key, Capability::MfmtCommand)
                    == TriState::Yes
            {
                if let Some(info) = host.local_file_info(&op.local_file) {
                    if let Some(mtime) = info.mtime {
                        op.file_time = Some(mtime);
                        op.state = FileTransferState::Mfmt;
                        return OpOutcome::Continue;
                    }
                }
            }
            return OpOutcome::Ok;
        }
        let size = match host.open_local_file(
            &op.local_file,
            LocalOpenMode::ReadUpload,
            start_offset,
            op.binary,
        ) {
            Ok(s) => s,
            Err(e) => {
                session.notifier.error(format!(
                    "Failed to open \"{}\" for reading: {}",
                    op.local_file, e
                ));
                return OpOutcome::Error(ResultFlags::ERROR);
            }
        };
        op.local_size = Some(size);

        let rest_stream =
            session.caps.get(&session.server_key, Capability::RestStream) == TriState::Yes;
        let resume_offset = if op.resume && rest_stream {
            start_offset
        } else {
            // Play it safe, use APPE when resuming without REST STREAM.
            0
        };

        session.notifier.send(Notification::TransferStatus {
            total: Some(size),
            current: start_offset,
            start_offset,
        });

        session.transfer_ctl = TransferCtl {
            command_sent: false,
            end_reason: TransferEndReason::Successful,
            resume_offset,
            binary: op.binary,
            mode: TransferMode::Upload,
        };
        let verb = if op.resume && !rest_stream {
            "APPE"
        } else {
            "STOR"
        };
        let cmd = format!("{} {}", verb, op.formatted_name());
        op.state = FileTransferState::WaitTransfer;
        let raw = super::RawTransferOpData::new(cmd, session);
        OpOutcome::Push(Box::new(OpData::RawTransfer(raw)))
    }
}

enum ResumeCheck {
    Proceed,
    /// Sizes already match; nothing to transfer.
    NoopOk,
    Critical,
    /// Run the one-byte probe transfer first.
    Probe,
}

/// Resume beyond 2/4 GiB is broken on some servers; decide whether we can
/// go ahead, must probe first, or must give up.
fn test_resume_capability(op: &mut FileTransferOpData, session: &mut SessionState) -> ResumeCheck {
    if !op.download {
        return ResumeCheck::Proceed;
    }
    let local = match op.local_size {
        Some(s) => s,
        None => return ResumeCheck::Proceed,
    };
    for (limit, cap, gb) in [
        (1u64 << 32, Capability::Resume4GbBug, 4),
        (1u64 << 31, Capability::Resume2GbBug, 2),
    ] {
        if local < limit {
            continue;
        }
        match session.caps.get(&session.server_key, cap) {
            TriState::Yes => {
                if op.remote_size == Some(local) {
                    debug!("sizes match, ending transfer despite resume bug");
                    return ResumeCheck::NoopOk;
                }
                session.notifier.error(format!(
                    "Server does not support resume of files > {} GB",
                    gb
                ));
                return ResumeCheck::Critical;
            }
            TriState::Unknown => {
                let remote = match op.remote_size {
                    Some(r) => r,
                    None => break,
                };
                if remote < local {
                    break;
                }
                if remote == local {
                    debug!("sizes match, server may not support resume > {} GB", gb);
                    return ResumeCheck::NoopOk;
                }
                session
                    .notifier
                    .status("Testing resume capabilities of server");
                return ResumeCheck::Probe;
            }
            TriState::No => {}
        }
    }
    ResumeCheck::Proceed
}

fn parse_size_tail(tail: &str) -> Option<u64> {
    let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// `YYYYMMDDHHMMSS` possibly followed by fractional seconds.
fn parse_mdtm_tail(tail: &str) -> Option<DateTime<Utc>> {
    let stamp = tail.trim();
    if stamp.len() < 14 {
        return None;
    }
    NaiveDateTime::parse_from_str(&stamp[..14], "%Y%m%d%H%M%S")
        .ok()
        .map(|t| t.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_tail_parses_leading_digits() {
        assert_eq!(parse_size_tail("12345"), Some(12345));
        assert_eq!(parse_size_tail("12345 bytes"), Some(12345));
        assert_eq!(parse_size_tail("none"), None);
    }

    #[test]
    fn mdtm_tail_parses() {
        let t = parse_mdtm_tail("20240229120000").unwrap();
        assert_eq!(t.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-02-29 12:00:00");
        assert!(parse_mdtm_tail("2024").is_none());
        let frac = parse_mdtm_tail("20240229120000.123").unwrap();
        assert_eq!(frac, t);
    }

    #[test]
    fn local_rename_keeps_directory() {
        assert_eq!(rename_local("/tmp/a.txt", "b.txt"), "/tmp/b.txt");
        assert_eq!(rename_local("a.txt", "b.txt"), "b.txt");
    }
}
