/*
 * reply.rs
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

//! Push parser turning control-socket bytes into logical FTP replies.
//!
//! Lines are delimited by CR, LF, or NUL in any combination; empty fragments
//! are discarded. A reply is a single line `DDD text` (or a line of at most
//! three bytes), or a multi-line block opened by `DDD-` and closed by the
//! first later line starting with the same `DDD` plus a space.

use super::EncodingMode;
use log::warn;

/// Longest logical line we keep; the excess of an overlong line is dropped.
pub const MAX_LINE_LEN: usize = 4096;

/// Initial receive-buffer capacity.
pub const RECV_BUFFER_SIZE: usize = 8192;

/// A completed reply: all its lines, last one being the response proper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
}

impl Reply {
    pub fn single(line: impl Into<String>) -> Self {
        Reply {
            lines: vec![line.into()],
        }
    }

    /// The response line (the final line of a multi-line block).
    pub fn text(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }

    /// First digit of the response, 0 if it does not start with a digit.
    pub fn code_class(&self) -> u8 {
        let t = self.text().as_bytes();
        match t.first() {
            Some(c @ b'0'..=b'9') => c - b'0',
            _ => 0,
        }
    }

    /// Full three-digit code, 0 if the line does not start with one.
    pub fn code(&self) -> u32 {
        let t = self.text().as_bytes();
        if t.len() >= 3 && t[..3].iter().all(u8::is_ascii_digit) {
            (u32::from(t[0] - b'0')) * 100 + (u32::from(t[1] - b'0')) * 10 + u32::from(t[2] - b'0')
        } else {
            0
        }
    }

    /// Text after "DDD " (empty if the line is only a code).
    pub fn tail(&self) -> &str {
        let t = self.text();
        if t.len() > 4 {
            &t[4..]
        } else {
            ""
        }
    }

    pub fn is_preliminary(&self) -> bool {
        self.code_class() == 1
    }
}

/// Events produced while feeding bytes to the reader.
#[derive(Debug)]
pub enum ReaderEvent {
    /// One logical line, delivered before reply assembly (challenge
    /// accumulation and FEAT parsing hook on these).
    Line(String),
    /// A completed single- or multi-line reply.
    Reply(Reply),
}

/// Charset conversion failed for a received line.
#[derive(Debug)]
pub struct ConversionError;

impl std::fmt::Display for ConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to convert server reply to the session charset")
    }
}

impl std::error::Error for ConversionError {}

/// Stateful reply reader. Feed raw socket bytes with [`ReplyReader::receive`].
pub struct ReplyReader {
    /// Partial line carried between reads.
    partial: Vec<u8>,
    /// Set while the current partial line already overflowed MAX_LINE_LEN.
    overlong: bool,
    /// `"DDD "` prefix that terminates the open multi-line reply.
    multiline_code: Option<String>,
    multiline_lines: Vec<String>,
}

impl Default for ReplyReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyReader {
    pub fn new() -> Self {
        ReplyReader {
            partial: Vec::with_capacity(RECV_BUFFER_SIZE),
            overlong: false,
            multiline_code: None,
            multiline_lines: Vec::new(),
        }
    }

    /// True while a multi-line reply is open.
    pub fn in_multiline(&self) -> bool {
        self.multiline_code.is_some()
    }

    /// Feed received bytes; returns the events they complete. A charset
    /// conversion failure aborts immediately (reader state is reset).
    pub fn receive(
        &mut self,
        data: &[u8],
        encoding: EncodingMode,
        utf8_active: bool,
    ) -> Result<Vec<ReaderEvent>, ConversionError> {
        let mut events = Vec::new();
        for &b in data {
            if b == b'\r' || b == b'\n' || b == 0 {
                if self.partial.is_empty() {
                    continue;
                }
                let raw = std::mem::take(&mut self.partial);
                self.overlong = false;
                let line = match decode_line(&raw, encoding, utf8_active) {
                    Some(l) => l,
                    None => {
                        self.reset();
                        return Err(ConversionError);
                    }
                };
                events.push(ReaderEvent::Line(line.clone()));
                if let Some(reply) = self.assemble(line) {
                    events.push(ReaderEvent::Reply(reply));
                }
            } else if self.partial.len() < MAX_LINE_LEN {
                self.partial.push(b);
            } else if !self.overlong {
                self.overlong = true;
                warn!("reply line exceeds {} bytes, truncating", MAX_LINE_LEN);
            }
        }
        Ok(events)
    }

    /// Drop any buffered state (connection reset).
    pub fn reset(&mut self) {
        self.partial.clear();
        self.overlong = false;
        self.multiline_code = None;
        self.multiline_lines.clear();
    }

    fn assemble(&mut self, line: String) -> Option<Reply> {
        if let Some(code) = &self.multiline_code {
            if line.len() >= 4 && line.starts_with(code.as_str()) {
                self.multiline_code = None;
                let mut lines = std::mem::take(&mut self.multiline_lines);
                lines.push(line);
                return Some(Reply { lines });
            }
            self.multiline_lines.push(line);
            return None;
        }
        let b = line.as_bytes();
        if b.len() > 3 && b[3] == b'-' && b[..3].iter().all(u8::is_ascii_digit) {
            let mut code = line[..3].to_string();
            code.push(' ');
            self.multiline_code = Some(code);
            self.multiline_lines.push(line);
            return None;
        }
        Some(Reply { lines: vec![line] })
    }
}

/// Decode one raw line per the session encoding. UTF-8 is strict once forced
/// or negotiated; auto mode falls back to Latin-1, which cannot fail.
fn decode_line(raw: &[u8], encoding: EncodingMode, utf8_active: bool) -> Option<String> {
    match encoding {
        EncodingMode::ForceUtf8 => String::from_utf8(raw.to_vec()).ok(),
        EncodingMode::Force8Bit => Some(latin1_to_string(raw)),
        EncodingMode::Auto => {
            if utf8_active {
                String::from_utf8(raw.to_vec()).ok()
            } else {
                match std::str::from_utf8(raw) {
                    Ok(s) => Some(s.to_string()),
                    Err(_) => Some(latin1_to_string(raw)),
                }
            }
        }
    }
}

/// Encode an outgoing command per the session encoding. Returns None when a
/// character cannot be represented (the op aborts with an error).
pub fn encode_command(cmd: &str, encoding: EncodingMode, utf8_active: bool) -> Option<Vec<u8>> {
    let utf8 = match encoding {
        EncodingMode::ForceUtf8 => true,
        EncodingMode::Force8Bit => false,
        EncodingMode::Auto => utf8_active || cmd.is_ascii(),
    };
    if utf8 {
        Some(cmd.as_bytes().to_vec())
    } else {
        string_to_latin1(cmd)
    }
}

fn latin1_to_string(raw: &[u8]) -> String {
    raw.iter().map(|&b| b as char).collect()
}

fn string_to_latin1(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    for c in s.chars() {
        let v = c as u32;
        if v > 0xff {
            return None;
        }
        out.push(v as u8);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(reader: &mut ReplyReader, data: &[u8]) -> Vec<ReaderEvent> {
        reader.receive(data, EncodingMode::Auto, false).unwrap()
    }

    fn replies(events: Vec<ReaderEvent>) -> Vec<Reply> {
        events
            .into_iter()
            .filter_map(|e| match e {
                ReaderEvent::Reply(r) => Some(r),
                ReaderEvent::Line(_) => None,
            })
            .collect()
    }

    #[test]
    fn line_framing_ignores_delimiter_runs() {
        let mut r = ReplyReader::new();
        let events = feed(&mut r, b"\r\n\r\n200 ok\r\r\n\n\0220 hi\n");
        let rs = replies(events);
        assert_eq!(rs.len(), 2);
        assert_eq!(rs[0].text(), "200 ok");
        assert_eq!(rs[1].text(), "220 hi");
    }

    #[test]
    fn line_split_across_reads() {
        let mut r = ReplyReader::new();
        assert!(replies(feed(&mut r, b"200 o")).is_empty());
        let rs = replies(feed(&mut r, b"k\r\n"));
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].text(), "200 ok");
    }

    #[test]
    fn multiline_closes_on_same_code_only() {
        let mut r = ReplyReader::new();
        let rs = replies(feed(
            &mut r,
            b"211-Features\r\n UTF8\r\n212 red herring\r\n211 End\r\n",
        ));
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].lines.len(), 4);
        assert_eq!(rs[0].text(), "211 End");
        assert_eq!(rs[0].code(), 211);
    }

    #[test]
    fn multiline_ignores_inner_dash_lines() {
        let mut r = ReplyReader::new();
        let rs = replies(feed(&mut r, b"230-Welcome\r\n230-more\r\n230 done\r\n"));
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].text(), "230 done");
    }

    #[test]
    fn short_line_is_a_reply() {
        let mut r = ReplyReader::new();
        let rs = replies(feed(&mut r, b"ok\r\n"));
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].code_class(), 0);
        assert_eq!(rs[0].code(), 0);
    }

    #[test]
    fn code_parsing() {
        let reply = Reply::single("350 Restarting at 1024");
        assert_eq!(reply.code(), 350);
        assert_eq!(reply.code_class(), 3);
        assert_eq!(reply.tail(), "Restarting at 1024");
    }

    #[test]
    fn overlong_line_truncated() {
        let mut r = ReplyReader::new();
        let mut data = b"200 ".to_vec();
        data.extend(std::iter::repeat(b'x').take(MAX_LINE_LEN + 100));
        data.extend_from_slice(b"\r\n");
        let rs = replies(feed(&mut r, &data));
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].text().len(), MAX_LINE_LEN);
        // Reader keeps working afterwards.
        let rs = replies(feed(&mut r, b"226 done\r\n"));
        assert_eq!(rs[0].code(), 226);
    }

    #[test]
    fn strict_utf8_conversion_failure() {
        let mut r = ReplyReader::new();
        let err = r.receive(b"200 \xff\xfe\r\n", EncodingMode::ForceUtf8, false);
        assert!(err.is_err());
    }

    #[test]
    fn auto_mode_falls_back_to_latin1() {
        let mut r = ReplyReader::new();
        let rs = replies(
            r.receive(b"200 caf\xe9\r\n", EncodingMode::Auto, false)
                .unwrap(),
        );
        assert_eq!(rs[0].text(), "200 caf\u{e9}");
    }

    #[test]
    fn encode_command_latin1() {
        assert_eq!(
            encode_command("CWD caf\u{e9}", EncodingMode::Force8Bit, false),
            Some(b"CWD caf\xe9".to_vec())
        );
        assert_eq!(encode_command("CWD \u{4e16}", EncodingMode::Force8Bit, false), None);
        assert_eq!(
            encode_command("CWD \u{4e16}", EncodingMode::Auto, true),
            Some("CWD \u{4e16}".as_bytes().to_vec())
        );
    }
}
