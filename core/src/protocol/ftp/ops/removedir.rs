/*
 * removedir.rs
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

//! Directory removal: CWD to the parent, RMD the subdirectory, drop the
//! removed subtree from both caches.

use crate::notify::Notification;
use crate::path::ServerPath;

use super::super::engine::{EngineHost, SessionState};
use super::super::reply::Reply;
use super::super::ResultFlags;
use super::{OpData, OpOutcome};

#[derive(Debug)]
pub struct RemoveDirOpData {
    path: ServerPath,
    sub_dir: String,
    full_path: ServerPath,
    omit_path: bool,
    cwd_pushed: bool,
    cwd_done: bool,
}

impl RemoveDirOpData {
    pub fn new(path: ServerPath, sub_dir: String) -> Option<Self> {
        let mut full_path = path.clone();
        if !full_path.add_segment(&sub_dir) {
            return None;
        }
        Some(RemoveDirOpData {
            path,
            sub_dir,
            full_path,
            omit_path: true,
            cwd_pushed: false,
            cwd_done: false,
        })
    }
}

pub fn send(
    op: &mut RemoveDirOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
) -> OpOutcome {
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
    session
        .dir_cache
        .invalidate_file(&session.server_key, &op.path, &op.sub_dir);
    session
        .path_cache
        .invalidate_path(&session.server_key, &op.path, &op.sub_dir);
    let cmd = if op.omit_path {
        format!("RMD {}", op.sub_dir)
    } else {
        format!("RMD {}", op.full_path.get_path())
    };
    if !session.send_command(host, &cmd, false, true) {
        return OpOutcome::Error(ResultFlags::ERROR);
    }
    OpOutcome::WouldBlock
}

pub fn parse_reply(
    op: &mut RemoveDirOpData,
    session: &mut SessionState,
    _host: &mut dyn EngineHost,
    reply: &Reply,
) -> OpOutcome {
    let code = reply.code_class();
    if code != 2 && code != 3 {
        return OpOutcome::Error(ResultFlags::ERROR);
    }
    session
        .dir_cache
        .remove_dir(&session.server_key, &op.path, &op.sub_dir);
    session.notifier.send(Notification::DirectoryListing {
        path: op.path.clone(),
        modified: true,
        failed: false,
    });
    OpOutcome::Ok
}

pub fn sub_result(
    op: &mut RemoveDirOpData,
    session: &mut SessionState,
    _host: &mut dyn EngineHost,
    prev: ResultFlags,
) -> OpOutcome {
    op.cwd_done = true;
    if prev.is_err() {
        op.omit_path = false;
    } else {
        op.path = session.current_path.clone();
    }
    OpOutcome::Continue
}
