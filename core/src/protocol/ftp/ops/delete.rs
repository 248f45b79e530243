/*
 * delete.rs
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

//! File deletion: CWD, then one DELE per queued file. Failures are
//! remembered but the remaining files are still attempted. Listing
//! notifications are throttled to one per second during the loop.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::notify::Notification;
use crate::path::ServerPath;

use super::super::engine::{EngineHost, SessionState};
use super::super::reply::Reply;
use super::super::ResultFlags;
use super::{OpData, OpOutcome};

const LISTING_NOTIFY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct DeleteOpData {
    pub path: ServerPath,
    files: VecDeque<String>,
    omit_path: bool,
    delete_failed: bool,
    cwd_pushed: bool,
    cwd_done: bool,
    last_notify: Option<Instant>,
    need_listing: bool,
}

impl DeleteOpData {
    pub fn new(path: ServerPath, files: Vec<String>) -> Self {
        DeleteOpData {
            path,
            files: files.into(),
            omit_path: true,
            delete_failed: false,
            cwd_pushed: false,
            cwd_done: false,
            last_notify: None,
            need_listing: false,
        }
    }

    /// A listing notification is still owed (dispatcher flushes it when the
    /// frame pops, including on cancel).
    pub fn need_listing_flush(&self) -> bool {
        self.need_listing
    }
}

pub fn send(op: &mut DeleteOpData, session: &mut SessionState, host: &mut dyn EngineHost) -> OpOutcome {
    if !op.cwd_done {
        if op.cwd_pushed {
            return OpOutcome::WouldBlock;
        }
        op.cwd_pushed = true;
        return OpOutcome::Push(Box::new(OpData::Cwd(super::CwdOpData::new(
            op.path.clone(),
            String::new(),
            false,
            false,
        ))));
    }
    let file = match op.files.front() {
        Some(f) => f.clone(),
        None => return finish(op, session),
    };
    if file.is_empty() {
        return OpOutcome::Error(ResultFlags::ERROR | ResultFlags::INTERNAL);
    }
    let filename = op.path.format_filename(&file, op.omit_path);
    if filename.is_empty() {
        session.notifier.error(format!(
            "Filename cannot be constructed for directory {} and filename {}",
            op.path.get_path(),
            file
        ));
        return OpOutcome::Error(ResultFlags::ERROR);
    }
    if op.last_notify.is_none() {
        op.last_notify = Some(Instant::now());
    }
    session
        .dir_cache
        .invalidate_file(&session.server_key, &op.path, &file);
    if !session.send_command(host, &format!("DELE {}", filename), false, true) {
        return OpOutcome::Error(ResultFlags::ERROR);
    }
    OpOutcome::WouldBlock
}

pub fn parse_reply(
    op: &mut DeleteOpData,
    session: &mut SessionState,
    _host: &mut dyn EngineHost,
    reply: &Reply,
) -> OpOutcome {
    let code = reply.code_class();
    if code != 2 && code != 3 {
        op.delete_failed = true;
    } else if let Some(file) = op.files.front() {
        session
            .dir_cache
            .remove_file(&session.server_key, &op.path, file);
        let now = Instant::now();
        let due = op
            .last_notify
            .map(|t| now.duration_since(t) >= LISTING_NOTIFY_INTERVAL)
            .unwrap_or(true);
        if due {
            session.notifier.send(Notification::DirectoryListing {
                path: op.path.clone(),
                modified: true,
                failed: false,
            });
            op.last_notify = Some(now);
            op.need_listing = false;
        } else {
            op.need_listing = true;
        }
    }
    op.files.pop_front();
    if op.files.is_empty() {
        return finish(op, session);
    }
    OpOutcome::Continue
}

pub fn sub_result(
    op: &mut DeleteOpData,
    _session: &mut SessionState,
    _host: &mut dyn EngineHost,
    prev: ResultFlags,
) -> OpOutcome {
    op.cwd_done = true;
    if prev.is_err() {
        op.omit_path = false;
    }
    OpOutcome::Continue
}

fn finish(op: &mut DeleteOpData, session: &mut SessionState) -> OpOutcome {
    if op.need_listing {
        session.notifier.send(Notification::DirectoryListing {
            path: op.path.clone(),
            modified: true,
            failed: false,
        });
        op.need_listing = false;
    }
    if op.delete_failed {
        OpOutcome::Error(ResultFlags::ERROR)
    } else {
        OpOutcome::Ok
    }
}
