/*
 * chmod.rs
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

//! Permission change: CWD, then SITE CHMOD.

use crate::path::ServerPath;

use super::super::engine::{EngineHost, SessionState};
use super::super::reply::Reply;
use super::super::ResultFlags;
use super::{OpData, OpOutcome};

#[derive(Debug)]
pub struct ChmodOpData {
    path: ServerPath,
    file: String,
    permission: String,
    use_absolute: bool,
    cwd_pushed: bool,
    cwd_done: bool,
}

impl ChmodOpData {
    pub fn new(path: ServerPath, file: String, permission: String) -> Self {
        ChmodOpData {
            path,
            file,
            permission,
            use_absolute: false,
            cwd_pushed: false,
            cwd_done: false,
        }
    }
}

pub fn send(op: &mut ChmodOpData, session: &mut SessionState, host: &mut dyn EngineHost) -> OpOutcome {
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
    let name = op.path.format_filename(&op.file, !op.use_absolute);
    let cmd = format!("SITE CHMOD {} {}", op.permission, name);
    if !session.send_command(host, &cmd, false, true) {
        return OpOutcome::Error(ResultFlags::ERROR);
    }
    OpOutcome::WouldBlock
}

pub fn parse_reply(
    op: &mut ChmodOpData,
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
        .update_file(&session.server_key, &op.path, &op.file, false, None);
    OpOutcome::Ok
}

pub fn sub_result(
    op: &mut ChmodOpData,
    _session: &mut SessionState,
    _host: &mut dyn EngineHost,
    prev: ResultFlags,
) -> OpOutcome {
    op.cwd_done = true;
    if prev.is_err() {
        op.use_absolute = true;
    }
    OpOutcome::Continue
}
