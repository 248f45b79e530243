/*
 * rawcommand.rs
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

//! A user-supplied command, sent verbatim. Its side effects are unknown, so
//! every cache for this server is dropped first.

use crate::path::ServerPath;

use super::super::engine::{EngineHost, SessionState};
use super::super::reply::Reply;
use super::super::ResultFlags;
use super::OpOutcome;

#[derive(Debug)]
pub struct RawCommandOpData {
    command: String,
}

impl RawCommandOpData {
    pub fn new(command: String) -> Self {
        RawCommandOpData { command }
    }
}

pub fn send(
    op: &mut RawCommandOpData,
    session: &mut SessionState,
    host: &mut dyn EngineHost,
) -> OpOutcome {
    session.dir_cache.invalidate_server(&session.server_key);
    session.path_cache.invalidate_server(&session.server_key);
    session.current_path = ServerPath::empty();
    session.last_type_binary = None;
    let cmd = op.command.clone();
    if !session.send_command(host, &cmd, false, false) {
        return OpOutcome::Error(ResultFlags::ERROR);
    }
    OpOutcome::WouldBlock
}

pub fn parse_reply(
    _op: &mut RawCommandOpData,
    _session: &mut SessionState,
    _host: &mut dyn EngineHost,
    reply: &Reply,
) -> OpOutcome {
    let code = reply.code_class();
    if code == 2 || code == 3 {
        OpOutcome::Ok
    } else {
        OpOutcome::Error(ResultFlags::ERROR)
    }
}
