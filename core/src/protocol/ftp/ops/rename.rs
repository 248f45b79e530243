/*
 * rename.rs
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

//! Rename: CWD to the source directory, RNFR, RNTO. The target is given
//! absolutely whenever the directories differ.

use crate::notify::Notification;
use crate::path::ServerPath;

use super::super::engine::{EngineHost, SessionState};
use super::super::reply::Reply;
use super::super::ResultFlags;
use super::{OpData, OpOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenameState {
    Rnfr,
    Rnto,
}

#[derive(Debug)]
pub struct RenameOpData {
    state: RenameState,
    from_path: ServerPath,
    from_file: String,
    to_path: ServerPath,
    to_file: String,
    use_absolute: bool,
    cwd_pushed: bool,
    cwd_done: bool,
}

impl RenameOpData {
    pub fn new(from_path: ServerPath, from_file: String, to_path: ServerPath, to_file: String) -> Self {
        RenameOpData {
            state: RenameState::Rnfr,
            from_path,
            from_file,
            to_path,
            to_file,
            use_absolute: false,
            cwd_pushed: false,
            cwd_done: false,
        }
    }
}

pub fn send(op: &mut RenameOpData, session: &mut SessionState, host: &mut dyn EngineHost) -> OpOutcome {
    if !op.cwd_done {
        if op.cwd_pushed {
            return OpOutcome::WouldBlock;
        }
        op.cwd_pushed = true;
        return OpOutcome::Push(Box::new(OpData::Cwd(super::CwdOpData::new(
            op.from_path.clone(),
            String::new(),
            false,
            false,
        ))));
    }
    match op.state {
        RenameState::Rnfr => {
            let name = op.from_path.format_filename(&op.from_file, !op.use_absolute);
            if !session.send_command(host, &format!("RNFR {}", name), false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        RenameState::Rnto => {
            session
                .dir_cache
                .invalidate_file(&session.server_key, &op.from_path, &op.from_file);
            session
                .dir_cache
                .invalidate_file(&session.server_key, &op.to_path, &op.to_file);
            session
                .path_cache
                .invalidate_path(&session.server_key, &op.from_path, &op.from_file);
            session
                .path_cache
                .invalidate_path(&session.server_key, &op.to_path, &op.to_file);
            let omit = !op.use_absolute && op.from_path == op.to_path;
            let name = op.to_path.format_filename(&op.to_file, omit);
            if !session.send_command(host, &format!("RNTO {}", name), false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
    }
}

pub fn parse_reply(
    op: &mut RenameOpData,
    session: &mut SessionState,
    _host: &mut dyn EngineHost,
    reply: &Reply,
) -> OpOutcome {
    let code = reply.code_class();
    if code != 2 && code != 3 {
        return OpOutcome::Error(ResultFlags::ERROR);
    }
    match op.state {
        RenameState::Rnfr => {
            op.state = RenameState::Rnto;
            OpOutcome::Continue
        }
        RenameState::Rnto => {
            session.dir_cache.rename(
                &session.server_key,
                &op.from_path,
                &op.from_file,
                &op.to_path,
                &op.to_file,
            );
            session.notifier.send(Notification::DirectoryListing {
                path: op.from_path.clone(),
                modified: true,
                failed: false,
            });
            if op.from_path != op.to_path {
                session.notifier.send(Notification::DirectoryListing {
                    path: op.to_path.clone(),
                    modified: true,
                    failed: false,
                });
            }
            OpOutcome::Ok
        }
    }
}

pub fn sub_result(
    op: &mut RenameOpData,
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
