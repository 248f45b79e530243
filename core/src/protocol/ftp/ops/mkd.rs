/*
 * mkd.rs
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

//! Directory creation: walk up until a CWD succeeds, then MKD and CWD the
//! missing segments one by one. If any part fails, fall back to a single
//! MKD with the absolute path.

use crate::notify::Notification;
use crate::path::ServerPath;

use super::super::engine::{EngineHost, SessionState};
use super::super::reply::Reply;
use super::super::ResultFlags;
use super::OpOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MkdirState {
    FindParent,
    MkdSub,
    CwdSub,
    TryFull,
}

#[derive(Debug)]
pub struct MkdirOpData {
    state: MkdirState,
    path: ServerPath,
    /// Existing directory we walk from (shrinks while probing).
    work: ServerPath,
    /// Segments still to create, deepest last.
    to_create: Vec<String>,
    tried_full: bool,
}

impl MkdirOpData {
    pub fn new(path: ServerPath) -> Self {
        let mut to_create = Vec::new();
        let mut work = path.clone();
        if let Some(seg) = work.last_segment() {
            to_create.push(seg.to_string());
        }
        work = work.parent();
        MkdirOpData {
            state: MkdirState::FindParent,
            path,
            work,
            to_create,
            tried_full: false,
        }
    }

    fn next_segment(&self) -> Option<&str> {
        self.to_create.last().map(String::as_str)
    }
}

pub fn send(op: &mut MkdirOpData, session: &mut SessionState, host: &mut dyn EngineHost) -> OpOutcome {
    match op.state {
        MkdirState::FindParent => {
            if op.work.is_empty() {
                op.state = MkdirState::TryFull;
                return OpOutcome::Continue;
            }
            let cmd = format!("CWD {}", op.work.get_path());
            if !session.send_command(host, &cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        MkdirState::MkdSub => {
            let seg = match op.next_segment() {
                Some(s) => s.to_string(),
                None => return OpOutcome::Ok,
            };
            let cmd = format!("MKD {}", seg);
            if !session.send_command(host, &cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        MkdirState::CwdSub => {
            let seg = match op.next_segment() {
                Some(s) => s.to_string(),
                None => return OpOutcome::Ok,
            };
            let cmd = format!("CWD {}", seg);
            if !session.send_command(host, &cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        MkdirState::TryFull => {
            if op.tried_full {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            op.tried_full = true;
            let cmd = format!("MKD {}", op.path.get_path());
            if !session.send_command(host, &cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
    }
}

pub fn parse_reply(
    op: &mut MkdirOpData,
    session: &mut SessionState,
    _host: &mut dyn EngineHost,
    reply: &Reply,
) -> OpOutcome {
    let ok = matches!(reply.code_class(), 2 | 3);
    match op.state {
        MkdirState::FindParent => {
            if ok {
                session.current_path = op.work.clone();
                op.state = MkdirState::MkdSub;
                return OpOutcome::Continue;
            }
            if op.work.has_parent() {
                if let Some(seg) = op.work.last_segment() {
                    op.to_create.push(seg.to_string());
                }
                op.work = op.work.parent();
                return OpOutcome::Continue;
            }
            op.state = MkdirState::TryFull;
            OpOutcome::Continue
        }
        MkdirState::MkdSub => {
            if !ok {
                op.state = MkdirState::TryFull;
                return OpOutcome::Continue;
            }
            let seg = op.next_segment().unwrap_or("").to_string();
            session.dir_cache.update_file(
                &session.server_key,
                &session.current_path,
                &seg,
                true,
                None,
            );
            session.notifier.send(Notification::DirectoryListing {
                path: session.current_path.clone(),
                modified: true,
                failed: false,
            });
            if op.to_create.len() == 1 {
                op.to_create.pop();
                return OpOutcome::Ok;
            }
            op.state = MkdirState::CwdSub;
            OpOutcome::Continue
        }
        MkdirState::CwdSub => {
            if !ok {
                op.state = MkdirState::TryFull;
                return OpOutcome::Continue;
            }
            let seg = op.to_create.pop().unwrap_or_default();
            session.current_path = session.current_path.change_path(&seg);
            op.state = MkdirState::MkdSub;
            OpOutcome::Continue
        }
        MkdirState::TryFull => {
            if ok {
                session.notifier.send(Notification::DirectoryListing {
                    path: op.path.parent(),
                    modified: true,
                    failed: false,
                });
                OpOutcome::Ok
            } else {
                OpOutcome::Error(ResultFlags::ERROR)
            }
        }
    }
}
