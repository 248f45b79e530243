/*
 * list.rs
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

//! Directory listing: CWD (with symlink discovery), then MLSD or LIST over
//! the data channel. The listing bytes themselves go to the external parser;
//! here we refresh the cache marker and notify the UI.

use log::debug;

use crate::path::ServerPath;

use super::super::capabilities::{Capability, TriState};
use super::super::engine::{EngineHost, SessionState, TransferCtl};
use super::super::reply::Reply;
use super::super::transfer::{TransferEndReason, TransferMode};
use super::super::ResultFlags;
use super::{OpData, OpOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    WaitCwd,
    WaitTransfer,
}

#[derive(Debug)]
pub struct ListOpData {
    state: ListState,
    path: ServerPath,
    sub_dir: String,
    cwd_pushed: bool,
    transfer_pushed: bool,
    tried_nlst: bool,
}

impl ListOpData {
    pub fn new(path: ServerPath, sub_dir: String) -> Self {
        ListOpData {
            state: ListState::WaitCwd,
            path,
            sub_dir,
            cwd_pushed: false,
            transfer_pushed: false,
            tried_nlst: false,
        }
    }
}

pub fn send(op: &mut ListOpData, session: &mut SessionState, _host: &mut dyn EngineHost) -> OpOutcome {
    match op.state {
        ListState::WaitCwd => {
            if op.cwd_pushed {
                return OpOutcome::WouldBlock;
            }
            op.cwd_pushed = true;
            OpOutcome::Push(Box::new(OpData::Cwd(super::CwdOpData::new(
                op.path.clone(),
                op.sub_dir.clone(),
                true,
                false,
            ))))
        }
        ListState::WaitTransfer => {
            if op.transfer_pushed {
                return OpOutcome::WouldBlock;
            }
            op.transfer_pushed = true;
            let cmd = if session.caps.get(&session.server_key, Capability::MlsdCommand)
                == TriState::Yes
            {
                "MLSD"
            } else if op.tried_nlst {
                "NLST"
            } else {
                "LIST"
            };
            // Listings travel in text mode.
            session.transfer_ctl = TransferCtl {
                command_sent: false,
                end_reason: TransferEndReason::Successful,
                resume_offset: 0,
                binary: false,
                mode: TransferMode::List,
            };
            let raw = super::RawTransferOpData::new(cmd.to_string(), session);
            OpOutcome::Push(Box::new(OpData::RawTransfer(raw)))
        }
    }
}

pub fn parse_reply(
    _op: &mut ListOpData,
    _session: &mut SessionState,
    _host: &mut dyn EngineHost,
    reply: &Reply,
) -> OpOutcome {
    debug!("unexpected reply during list: {}", reply.text());
    OpOutcome::Error(ResultFlags::ERROR | ResultFlags::INTERNAL)
}

pub fn sub_result(
    op: &mut ListOpData,
    session: &mut SessionState,
    _host: &mut dyn EngineHost,
    prev: ResultFlags,
) -> OpOutcome {
    match op.state {
        ListState::WaitCwd => {
            if prev.is_err() {
                return OpOutcome::Error(prev);
            }
            op.state = ListState::WaitTransfer;
            OpOutcome::Continue
        }
        ListState::WaitTransfer => {
            // A server that rejects LIST outright may still honour NLST.
            if prev.is_err()
                && !op.tried_nlst
                && session.transfer_ctl.end_reason
                    == TransferEndReason::TransferCommandFailureImmediate
                && session.caps.get(&session.server_key, Capability::MlsdCommand)
                    != TriState::Yes
            {
                op.tried_nlst = true;
                op.transfer_pushed = false;
                return OpOutcome::Continue;
            }
            let path = session.current_path.clone();
            if prev.is_ok() {
                // The shell feeds the collected bytes to the listing parser;
                // here the directory is marked fresh.
                session.dir_cache.store(&session.server_key, &path, Vec::new());
                session
                    .notifier
                    .send(crate::notify::Notification::DirectoryListing {
                        path,
                        modified: false,
                        failed: false,
                    });
                OpOutcome::Ok
            } else {
                session
                    .notifier
                    .send(crate::notify::Notification::DirectoryListing {
                        path,
                        modified: false,
                        failed: true,
                    });
                OpOutcome::Error(prev)
            }
        }
    }
}
