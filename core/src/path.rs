/*
 * path.rs
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

//! Typed server-side paths. FTP servers disagree on path syntax, so a path is
//! a list of segments plus a format discriminant; formatting and relative
//! traversal go through here instead of string concatenation at call sites.

use std::fmt;

/// Path syntax family of the remote server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Autodetect from the first absolute path we see (PWD at logon).
    Default,
    Unix,
    /// Drive letter plus backslash separators (e.g. `C:\dir\sub`).
    Dos,
    /// `DEV:[DIR.SUB]` style.
    Vms,
    /// `'QUAL.QUAL.QUAL'` datasets.
    Mvs,
}

/// A remote path: ordered segments plus syntax kind. An empty path means
/// "unknown"; operations that cannot produce a valid path return one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPath {
    kind: PathKind,
    /// Drive (`C:`) or device (`DEV:`) prefix for Dos/Vms, empty otherwise.
    prefix: String,
    segments: Vec<String>,
    /// False only for the empty (unknown) path.
    valid: bool,
}

impl ServerPath {
    /// The empty (unknown) path.
    pub fn empty() -> Self {
        ServerPath {
            kind: PathKind::Default,
            prefix: String::new(),
            segments: Vec::new(),
            valid: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.valid
    }

    pub fn kind(&self) -> PathKind {
        self.kind
    }

    /// Parse an absolute path string. `kind` Default autodetects: a leading
    /// drive letter selects Dos, `[`/`:`+`[` selects Vms, quotes select Mvs,
    /// everything else Unix.
    pub fn parse(s: &str, kind: PathKind) -> Self {
        let s = s.trim();
        if s.is_empty() {
            return ServerPath::empty();
        }
        let kind = if kind == PathKind::Default {
            detect_kind(s)
        } else {
            kind
        };
        match kind {
            PathKind::Unix | PathKind::Default => parse_unix(s),
            PathKind::Dos => parse_dos(s),
            PathKind::Vms => parse_vms(s),
            PathKind::Mvs => parse_mvs(s),
        }
    }

    /// Format the full path as the server expects it.
    pub fn get_path(&self) -> String {
        if !self.valid {
            return String::new();
        }
        match self.kind {
            PathKind::Unix | PathKind::Default => {
                if self.segments.is_empty() {
                    "/".to_string()
                } else {
                    format!("/{}", self.segments.join("/"))
                }
            }
            PathKind::Dos => {
                if self.segments.is_empty() {
                    format!("{}\\", self.prefix)
                } else {
                    format!("{}\\{}", self.prefix, self.segments.join("\\"))
                }
            }
            PathKind::Vms => format!("{}[{}]", self.prefix, self.segments.join(".")),
            PathKind::Mvs => format!("'{}'", self.segments.join(".")),
        }
    }

    /// Format `name` for use in a command. With `omit_path` only the name is
    /// produced (we already CWD'd there); otherwise the full path. Returns an
    /// empty string if a path is needed but unknown.
    pub fn format_filename(&self, name: &str, omit_path: bool) -> String {
        if name.is_empty() {
            return String::new();
        }
        if omit_path {
            return name.to_string();
        }
        if !self.valid {
            return String::new();
        }
        match self.kind {
            PathKind::Unix | PathKind::Default => {
                if self.segments.is_empty() {
                    format!("/{}", name)
                } else {
                    format!("/{}/{}", self.segments.join("/"), name)
                }
            }
            PathKind::Dos => format!("{}\\{}", self.get_path_no_trail(), name),
            PathKind::Vms => format!("{}{}", self.get_path(), name),
            PathKind::Mvs => format!("'{}.{}'", self.segments.join("."), name),
        }
    }

    fn get_path_no_trail(&self) -> String {
        let p = self.get_path();
        p.strip_suffix('\\').map(str::to_string).unwrap_or(p)
    }

    /// Apply a relative path. `..` pops a segment (Unix/Dos only), absolute
    /// input replaces the whole path. Returns the empty path on failure.
    pub fn change_path(&self, relative: &str) -> ServerPath {
        let relative = relative.trim();
        if relative.is_empty() {
            return self.clone();
        }
        if is_absolute(relative, self.kind) {
            let parsed = ServerPath::parse(relative, self.kind);
            return parsed;
        }
        if !self.valid {
            return ServerPath::empty();
        }
        let mut out = self.clone();
        let sep = match self.kind {
            PathKind::Dos => '\\',
            _ => '/',
        };
        for seg in relative.split(sep) {
            match seg {
                "" | "." => continue,
                ".." => {
                    if out.segments.pop().is_none() {
                        return ServerPath::empty();
                    }
                }
                s => out.segments.push(s.to_string()),
            }
        }
        out
    }

    /// Append one literal segment. Fails (false) on separators in `segment`.
    pub fn add_segment(&mut self, segment: &str) -> bool {
        if segment.is_empty() || segment.contains('/') || segment.contains('\\') {
            return false;
        }
        if !self.valid {
            return false;
        }
        self.segments.push(segment.to_string());
        true
    }

    /// Parent directory, or the empty path at the root.
    pub fn parent(&self) -> ServerPath {
        if !self.valid || self.segments.is_empty() {
            return ServerPath::empty();
        }
        let mut out = self.clone();
        out.segments.pop();
        out
    }

    pub fn has_parent(&self) -> bool {
        self.valid && !self.segments.is_empty()
    }

    pub fn last_segment(&self) -> Option<&str> {
        if self.valid {
            self.segments.last().map(String::as_str)
        } else {
            None
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True if `other` equals this path or lies below it.
    pub fn contains(&self, other: &ServerPath) -> bool {
        self.valid
            && other.valid
            && self.kind == other.kind
            && self.prefix == other.prefix
            && other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }
}

impl fmt::Display for ServerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_path())
    }
}

fn detect_kind(s: &str) -> PathKind {
    let bytes = s.as_bytes();
    if s.starts_with('\'') && s.ends_with('\'') && s.len() > 2 {
        PathKind::Mvs
    } else if s.contains('[') && s.contains(']') {
        PathKind::Vms
    } else if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        PathKind::Dos
    } else {
        PathKind::Unix
    }
}

fn is_absolute(s: &str, kind: PathKind) -> bool {
    match kind {
        PathKind::Dos => {
            let b = s.as_bytes();
            s.starts_with('\\') || (b.len() >= 2 && b[1] == b':' && b[0].is_ascii_alphabetic())
        }
        PathKind::Vms => s.contains('['),
        PathKind::Mvs => s.starts_with('\''),
        _ => s.starts_with('/'),
    }
}

fn parse_unix(s: &str) -> ServerPath {
    if !s.starts_with('/') {
        return ServerPath::empty();
    }
    let segments = s
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .map(str::to_string)
        .collect();
    ServerPath {
        kind: PathKind::Unix,
        prefix: String::new(),
        segments,
        valid: true,
    }
}

fn parse_dos(s: &str) -> ServerPath {
    let bytes = s.as_bytes();
    if bytes.len() < 2 || bytes[1] != b':' || !bytes[0].is_ascii_alphabetic() {
        return ServerPath::empty();
    }
    let prefix = s[..2].to_uppercase();
    let rest = &s[2..];
    let segments = rest
        .split(['\\', '/'])
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    ServerPath {
        kind: PathKind::Dos,
        prefix,
        segments,
        valid: true,
    }
}

fn parse_vms(s: &str) -> ServerPath {
    let open = match s.find('[') {
        Some(i) => i,
        None => return ServerPath::empty(),
    };
    let close = match s.rfind(']') {
        Some(i) if i > open => i,
        _ => return ServerPath::empty(),
    };
    let prefix = s[..open].to_string();
    let segments = s[open + 1..close]
        .split('.')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    ServerPath {
        kind: PathKind::Vms,
        prefix,
        segments,
        valid: true,
    }
}

fn parse_mvs(s: &str) -> ServerPath {
    let inner = s.trim_matches('\'');
    if inner.is_empty() {
        return ServerPath::empty();
    }
    let segments = inner
        .split('.')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    ServerPath {
        kind: PathKind::Mvs,
        prefix: String::new(),
        segments,
        valid: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_roundtrip() {
        let p = ServerPath::parse("/home/user/dir", PathKind::Default);
        assert_eq!(p.kind(), PathKind::Unix);
        assert_eq!(p.get_path(), "/home/user/dir");
        assert_eq!(p.format_filename("f.txt", false), "/home/user/dir/f.txt");
        assert_eq!(p.format_filename("f.txt", true), "f.txt");
    }

    #[test]
    fn unix_root() {
        let p = ServerPath::parse("/", PathKind::Default);
        assert_eq!(p.get_path(), "/");
        assert_eq!(p.format_filename("a", false), "/a");
        assert!(!p.has_parent());
    }

    #[test]
    fn dos_detection_and_format() {
        let p = ServerPath::parse("c:\\temp\\sub", PathKind::Default);
        assert_eq!(p.kind(), PathKind::Dos);
        assert_eq!(p.get_path(), "C:\\temp\\sub");
        assert_eq!(p.format_filename("x", false), "C:\\temp\\sub\\x");
    }

    #[test]
    fn vms_format() {
        let p = ServerPath::parse("DISK0:[USER.SRC]", PathKind::Default);
        assert_eq!(p.kind(), PathKind::Vms);
        assert_eq!(p.get_path(), "DISK0:[USER.SRC]");
    }

    #[test]
    fn mvs_format() {
        let p = ServerPath::parse("'SYS1.PROC'", PathKind::Default);
        assert_eq!(p.get_path(), "'SYS1.PROC'");
        assert_eq!(p.format_filename("MEM", false), "'SYS1.PROC.MEM'");
    }

    #[test]
    fn change_path_relative() {
        let p = ServerPath::parse("/a/b", PathKind::Default);
        assert_eq!(p.change_path("c/d").get_path(), "/a/b/c/d");
        assert_eq!(p.change_path("../x").get_path(), "/a/x");
        assert_eq!(p.change_path("/abs").get_path(), "/abs");
        assert!(p.change_path("../../..").is_empty());
    }

    #[test]
    fn parent_and_contains() {
        let p = ServerPath::parse("/a/b/c", PathKind::Default);
        assert_eq!(p.parent().get_path(), "/a/b");
        let top = ServerPath::parse("/a", PathKind::Default);
        assert!(top.contains(&p));
        assert!(!p.contains(&top));
    }

    #[test]
    fn add_segment_rejects_separators() {
        let mut p = ServerPath::parse("/a", PathKind::Default);
        assert!(!p.add_segment("b/c"));
        assert!(p.add_segment("b"));
        assert_eq!(p.get_path(), "/a/b");
    }

    #[test]
    fn empty_path_formats_empty() {
        let p = ServerPath::empty();
        assert_eq!(p.get_path(), "");
        assert_eq!(p.format_filename("f", false), "");
        assert!(p.change_path("x").is_empty());
    }
}
