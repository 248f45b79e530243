/*
 * mod.rs
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

//! Operation frames. Each high- or low-level FTP operation is one tagged
//! variant carrying its own state machine; the dispatcher pattern-matches
//! instead of downcasting. Frames are owned by the engine's stack and only
//! ever touched from the event queue's thread.

pub mod chmod;
pub mod cwd;
pub mod delete;
pub mod filetransfer;
pub mod list;
pub mod logon;
pub mod mkd;
pub mod rawcommand;
pub mod rawtransfer;
pub mod removedir;
pub mod rename;

use super::engine::{EngineHost, SessionState};
use super::reply::Reply;
use super::ResultFlags;

pub use chmod::ChmodOpData;
pub use cwd::CwdOpData;
pub use delete::DeleteOpData;
pub use filetransfer::FileTransferOpData;
pub use list::ListOpData;
pub use logon::LogonOpData;
pub use mkd::MkdirOpData;
pub use rawcommand::RawCommandOpData;
pub use rawtransfer::RawTransferOpData;
pub use removedir::RemoveDirOpData;
pub use rename::RenameOpData;

/// What an op's `send`/`parse_reply`/`sub_result` tells the dispatcher.
#[derive(Debug)]
pub enum OpOutcome {
    /// Frame finished; pop it and deliver success to the parent.
    Ok,
    /// State advanced without waiting; call `send` on the top frame.
    Continue,
    /// A command (or request) is in flight; wait for the next event.
    WouldBlock,
    /// Push a child frame, then drive it.
    Push(Box<OpData>),
    /// Frame failed; pop it and deliver the flags to the parent.
    Error(ResultFlags),
}

/// One frame of the operation stack.
#[derive(Debug)]
pub enum OpData {
    Logon(LogonOpData),
    Cwd(CwdOpData),
    List(ListOpData),
    FileTransfer(FileTransferOpData),
    RawTransfer(RawTransferOpData),
    Mkdir(MkdirOpData),
    Delete(DeleteOpData),
    RemoveDir(RemoveDirOpData),
    Rename(RenameOpData),
    Chmod(ChmodOpData),
    RawCommand(RawCommandOpData),
}

impl OpData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OpData::Logon(_) => "connect",
            OpData::Cwd(_) => "cwd",
            OpData::List(_) => "list",
            OpData::FileTransfer(_) => "transfer",
            OpData::RawTransfer(_) => "rawtransfer",
            OpData::Mkdir(_) => "mkdir",
            OpData::Delete(_) => "delete",
            OpData::RemoveDir(_) => "removedir",
            OpData::Rename(_) => "rename",
            OpData::Chmod(_) => "chmod",
            OpData::RawCommand(_) => "raw",
        }
    }

    /// True while this frame stalls the dispatcher for a user decision.
    /// Only ever true on the top frame.
    pub fn waiting_async(&self) -> bool {
        match self {
            OpData::Logon(op) => op.wait_async,
            OpData::FileTransfer(op) => op.wait_async,
            _ => false,
        }
    }

    pub fn send(&mut self, session: &mut SessionState, host: &mut dyn EngineHost) -> OpOutcome {
        match self {
            OpData::Logon(op) => logon::send(op, session, host),
            OpData::Cwd(op) => cwd::send(op, session, host),
            OpData::List(op) => list::send(op, session, host),
            OpData::FileTransfer(op) => filetransfer::send(op, session, host),
            OpData::RawTransfer(op) => rawtransfer::send(op, session, host),
            OpData::Mkdir(op) => mkd::send(op, session, host),
            OpData::Delete(op) => delete::send(op, session, host),
            OpData::RemoveDir(op) => removedir::send(op, session, host),
            OpData::Rename(op) => rename::send(op, session, host),
            OpData::Chmod(op) => chmod::send(op, session, host),
            OpData::RawCommand(op) => rawcommand::send(op, session, host),
        }
    }

    pub fn parse_reply(
        &mut self,
        session: &mut SessionState,
        host: &mut dyn EngineHost,
        reply: &Reply,
    ) -> OpOutcome {
        match self {
            OpData::Logon(op) => logon::parse_reply(op, session, host, reply),
            OpData::Cwd(op) => cwd::parse_reply(op, session, host, reply),
            OpData::List(op) => list::parse_reply(op, session, host, reply),
            OpData::FileTransfer(op) => filetransfer::parse_reply(op, session, host, reply),
            OpData::RawTransfer(op) => rawtransfer::parse_reply(op, session, host, reply),
            OpData::Mkdir(op) => mkd::parse_reply(op, session, host, reply),
            OpData::Delete(op) => delete::parse_reply(op, session, host, reply),
            OpData::RemoveDir(op) => removedir::parse_reply(op, session, host, reply),
            OpData::Rename(op) => rename::parse_reply(op, session, host, reply),
            OpData::Chmod(op) => chmod::parse_reply(op, session, host, reply),
            OpData::RawCommand(op) => rawcommand::parse_reply(op, session, host, reply),
        }
    }

    /// Deliver a completed child's result. Ops without children treat this
    /// as an internal error.
    pub fn sub_result(
        &mut self,
        session: &mut SessionState,
        host: &mut dyn EngineHost,
        prev: ResultFlags,
    ) -> OpOutcome {
        match self {
            OpData::List(op) => list::sub_result(op, session, host, prev),
            OpData::FileTransfer(op) => filetransfer::sub_result(op, session, host, prev),
            OpData::Delete(op) => delete::sub_result(op, session, host, prev),
            OpData::RemoveDir(op) => removedir::sub_result(op, session, host, prev),
            OpData::Rename(op) => rename::sub_result(op, session, host, prev),
            OpData::Chmod(op) => chmod::sub_result(op, session, host, prev),
            _ => {
                log::warn!("sub result delivered to {} frame", self.kind_name());
                OpOutcome::Error(ResultFlags::ERROR | ResultFlags::INTERNAL)
            }
        }
    }
}
