/*
 * cwd.rs
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

//! Change the session working directory: CWD/PWD walk with path-cache
//! compaction, optional MKD fallback (uploads into directories that do not
//! exist yet), and symlink discovery through PWD confirmation.

use std::collections::VecDeque;

use crate::path::ServerPath;

use super::super::engine::{EngineHost, SessionState};
use super::super::reply::Reply;
use super::super::ResultFlags;
use super::OpOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CwdState {
    Init,
    /// Initial PWD when no target was given and the cwd is unknown.
    Pwd,
    Cwd,
    MkdFallback,
    PwdConfirm,
}

/// One planned CWD.
#[derive(Debug)]
struct Step {
    arg: String,
    /// Where we expect to land (used when PWD cannot be parsed).
    expected: ServerPath,
    /// (parent, segment) to record in the path cache on confirmation.
    cache_key: Option<(ServerPath, String)>,
}

#[derive(Debug)]
pub struct CwdOpData {
    state: CwdState,
    path: ServerPath,
    sub_dir: String,
    pub try_mkd_on_fail: bool,
    link_discovery: bool,
    tried_mkd: bool,
    steps: VecDeque<Step>,
    current: Option<Step>,
}

impl CwdOpData {
    pub fn new(path: ServerPath, sub_dir: String, link_discovery: bool, try_mkd_on_fail: bool) -> Self {
        CwdOpData {
            state: CwdState::Init,
            path,
            sub_dir,
            try_mkd_on_fail,
            link_discovery,
            tried_mkd: false,
            steps: VecDeque::new(),
            current: None,
        }
    }
}

pub fn send(op: &mut CwdOpData, session: &mut SessionState, host: &mut dyn EngineHost) -> OpOutcome {
    match op.state {
        CwdState::Init => match plan(op, session) {
            Plan::Done => OpOutcome::Ok,
            Plan::NeedPwd => {
                op.state = CwdState::Pwd;
                if !session.send_command(host, "PWD", false, true) {
                    return OpOutcome::Error(ResultFlags::ERROR);
                }
                OpOutcome::WouldBlock
            }
            Plan::Walk => {
                op.state = CwdState::Cwd;
                OpOutcome::Continue
            }
            Plan::Invalid => OpOutcome::Error(ResultFlags::ERROR),
        },
        CwdState::Cwd => {
            if op.current.is_none() {
                op.current = op.steps.pop_front();
            }
            let step = match &op.current {
                Some(s) => s,
                None => return OpOutcome::Ok,
            };
            let cmd = if step.arg == ".." {
                "CDUP".to_string()
            } else {
                format!("CWD {}", step.arg)
            };
            if !session.send_command(host, &cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        CwdState::MkdFallback => {
            let step = match &op.current {
                Some(s) => s,
                None => return OpOutcome::Error(ResultFlags::ERROR | ResultFlags::INTERNAL),
            };
            let cmd = format!("MKD {}", step.arg);
            if !session.send_command(host, &cmd, false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        CwdState::PwdConfirm => {
            if !session.send_command(host, "PWD", false, true) {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            OpOutcome::WouldBlock
        }
        CwdState::Pwd => OpOutcome::WouldBlock,
    }
}

pub fn parse_reply(
    op: &mut CwdOpData,
    session: &mut SessionState,
    _host: &mut dyn EngineHost,
    reply: &Reply,
) -> OpOutcome {
    let code = reply.code_class();
    match op.state {
        CwdState::Pwd => {
            if code != 2 {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            match parse_pwd_reply(reply.text()) {
                Some(p) => {
                    session.current_path =
                        ServerPath::parse(&p, session.server.server_type);
                    OpOutcome::Ok
                }
                None => {
                    session.notifier.error("Failed to parse returned path");
                    OpOutcome::Error(ResultFlags::ERROR)
                }
            }
        }
        CwdState::Cwd => {
            if code == 2 || code == 3 {
                op.state = CwdState::PwdConfirm;
                return OpOutcome::Continue;
            }
            if op.try_mkd_on_fail && !op.tried_mkd {
                op.tried_mkd = true;
                op.state = CwdState::MkdFallback;
                return OpOutcome::Continue;
            }
            OpOutcome::Error(ResultFlags::ERROR)
        }
        CwdState::MkdFallback => {
            if code == 2 {
                // Retry the CWD that failed.
                op.state = CwdState::Cwd;
                OpOutcome::Continue
            } else {
                OpOutcome::Error(ResultFlags::ERROR)
            }
        }
        CwdState::PwdConfirm => {
            if code != 2 {
                return OpOutcome::Error(ResultFlags::ERROR);
            }
            let step = match op.current.take() {
                Some(s) => s,
                None => return OpOutcome::Error(ResultFlags::ERROR | ResultFlags::INTERNAL),
            };
            let actual = parse_pwd_reply(reply.text())
                .map(|p| ServerPath::parse(&p, session.server.server_type))
                .filter(|p| !p.is_empty());
            let landed = match actual {
                Some(p) => p,
                None => {
                    if step.expected.is_empty() {
                        session.notifier.error("Failed to parse returned path");
                        return OpOutcome::Error(ResultFlags::ERROR);
                    }
                    step.expected.clone()
                }
            };
            session.current_path = landed.clone();
            if let Some((parent, segment)) = &step.cache_key {
                // Confirmed mapping; a differing PWD records the symlink
                // target when discovery is on.
                if landed == step.expected || op.link_discovery {
                    session
                        .path_cache
                        .store(&session.server_key, parent, segment, landed.clone());
                }
            }
            if op.steps.is_empty() {
                OpOutcome::Ok
            } else {
                op.state = CwdState::Cwd;
                OpOutcome::Continue
            }
        }
        CwdState::Init => OpOutcome::Error(ResultFlags::ERROR | ResultFlags::INTERNAL),
    }
}

enum Plan {
    Done,
    NeedPwd,
    Walk,
    Invalid,
}

/// Turn (path, sub_dir) into the list of CWDs, consulting the path cache to
/// jump straight to known resolutions.
fn plan(op: &mut CwdOpData, session: &mut SessionState) -> Plan {
    let base = if op.path.is_empty() {
        session.current_path.clone()
    } else {
        op.path.clone()
    };

    if op.sub_dir.is_empty() {
        if base.is_empty() {
            return if session.current_path.is_empty() {
                Plan::NeedPwd
            } else {
                Plan::Done
            };
        }
        if base == session.current_path {
            return Plan::Done;
        }
        op.steps.push_back(Step {
            arg: base.get_path(),
            expected: base,
            cache_key: None,
        });
        return Plan::Walk;
    }

    if base.is_empty() {
        return Plan::Invalid;
    }

    if !op.path.is_empty() && op.path != session.current_path {
        op.steps.push_back(Step {
            arg: op.path.get_path(),
            expected: op.path.clone(),
            cache_key: None,
        });
    }

    let mut parent = base;
    for segment in op.sub_dir.split('/').filter(|s| !s.is_empty()) {
        match session
            .path_cache
            .lookup(&session.server_key, &parent, segment)
            .cloned()
        {
            Some(resolved) => {
                if resolved != session.current_path {
                    op.steps.push_back(Step {
                        arg: resolved.get_path(),
                        expected: resolved.clone(),
                        cache_key: None,
                    });
                }
                parent = resolved;
            }
            None => {
                let expected = parent.change_path(segment);
                // ".." becomes CDUP; nothing worth caching for it.
                let cache_key = if segment == ".." {
                    None
                } else {
                    Some((parent.clone(), segment.to_string()))
                };
                op.steps.push_back(Step {
                    arg: segment.to_string(),
                    expected: expected.clone(),
                    cache_key,
                });
                parent = expected;
            }
        }
    }

    if op.steps.is_empty() {
        Plan::Done
    } else {
        Plan::Walk
    }
}

/// Extract the quoted path from a 257 reply. Doubled quotes inside the path
/// stand for a literal quote.
pub fn parse_pwd_reply(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let rest = &text[start + 1..];
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
                continue;
            }
            return Some(out);
        }
        out.push(c);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwd_reply_basic() {
        assert_eq!(
            parse_pwd_reply("257 \"/home/user\" is current directory."),
            Some("/home/user".to_string())
        );
    }

    #[test]
    fn pwd_reply_doubled_quotes() {
        assert_eq!(
            parse_pwd_reply("257 \"/odd\"\"name\" created"),
            Some("/odd\"name".to_string())
        );
    }

    #[test]
    fn pwd_reply_unterminated() {
        assert_eq!(parse_pwd_reply("257 \"/never-closed"), None);
        assert_eq!(parse_pwd_reply("257 no quotes at all"), None);
    }
}
