/*
 * transfer.rs
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

//! Data-channel side of a transfer: the io worker that moves bytes between
//! the local file and the data socket, and the outcome vocabulary the control
//! channel joins with its own replies.
//!
//! The engine never touches these sockets directly; it only learns the
//! [`TransferEndReason`] through a `TransferEnd` event.

use std::io;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Why the data channel finished, independent of the control reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEndReason {
    /// Not finished yet (initial value on the owning op).
    None,
    Successful,
    Timeout,
    /// The transfer command itself was rejected after bytes had flowed.
    TransferCommandFailure,
    /// The transfer command was rejected before any bytes flowed; the file
    /// itself is refused, retrying is pointless.
    TransferCommandFailureImmediate,
    /// The data connection failed mid-transfer.
    TransferFailure,
    /// Local I/O failed (disk full, permission); critical.
    TransferFailureCritical,
    /// A command before the transfer command failed (TYPE, PASV, REST).
    PreTransferCommandFailure,
    /// The resume-capability probe got no data.
    FailedResumeTest,
    Failure,
}

impl TransferEndReason {
    pub fn is_failure(self) -> bool {
        !matches!(self, TransferEndReason::None | TransferEndReason::Successful)
    }
}

/// What the data channel is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Directory listing into memory.
    List,
    Download,
    Upload,
    /// One-byte probe for resume-past-limit support.
    ResumeTest,
}

/// File pump for one transfer. Reads or writes the local file through
/// tokio's blocking pool and applies ASCII line-ending conversion when the
/// transfer is not binary.
pub struct IoWorker {
    file: File,
    writing: bool,
    binary: bool,
    /// Carry a CR seen at a chunk boundary (download conversion).
    pending_cr: bool,
}

impl IoWorker {
    /// Wrap an already-opened local file. `writing` is the local direction
    /// (true for downloads).
    pub fn create(file: std::fs::File, writing: bool, binary: bool) -> Self {
        IoWorker {
            file: File::from_std(file),
            writing,
            binary,
            pending_cr: false,
        }
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    /// Write bytes received from the wire to the file (download direction).
    pub async fn write_wire(&mut self, data: &[u8]) -> io::Result<()> {
        debug_assert!(self.writing);
        if self.binary {
            self.file.write_all(data).await
        } else {
            let converted = self.from_wire_ascii(data);
            self.file.write_all(&converted).await
        }
    }

    /// Read the next chunk to send on the wire (upload direction). Returns
    /// None at EOF.
    pub async fn read_wire(&mut self, chunk: &mut Vec<u8>) -> io::Result<Option<Vec<u8>>> {
        debug_assert!(!self.writing);
        chunk.resize(64 * 1024, 0);
        let n = self.file.read(chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        let raw = &chunk[..n];
        if self.binary {
            Ok(Some(raw.to_vec()))
        } else {
            Ok(Some(to_wire_ascii(raw)))
        }
    }

    pub async fn finish(&mut self) -> io::Result<()> {
        if self.writing {
            self.file.flush().await?;
            self.file.sync_all().await?;
        }
        Ok(())
    }

    fn from_wire_ascii(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 1);
        for &b in data {
            if self.pending_cr {
                self.pending_cr = false;
                if b == b'\n' {
                    out.push(b'\n');
                    continue;
                }
                out.push(b'\r');
            }
            if b == b'\r' {
                self.pending_cr = true;
            } else {
                out.push(b);
            }
        }
        out
    }
}

/// LF to CRLF for the wire; lone CRs pass through.
fn to_wire_ascii(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    let mut prev = 0u8;
    for &b in data {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// Drive a download: wire -> file. Returns bytes received.
pub async fn pump_download<S>(stream: &mut S, worker: &mut IoWorker) -> io::Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            worker.finish().await.map_err(local_write_error)?;
            return Ok(total);
        }
        worker
            .write_wire(&buf[..n])
            .await
            .map_err(local_write_error)?;
        total += n as u64;
    }
}

/// Drive an upload: file -> wire. Returns bytes sent.
pub async fn pump_upload<S>(stream: &mut S, worker: &mut IoWorker) -> io::Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let mut chunk = Vec::new();
    let mut total = 0u64;
    while let Some(data) = worker.read_wire(&mut chunk).await? {
        stream.write_all(&data).await?;
        total += data.len() as u64;
    }
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(total)
}

/// Collect a listing into memory. Returns the raw bytes.
pub async fn pump_list<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Read and discard; success needs at least one byte (the probe RETRs from
/// `remote_size - 1`).
pub async fn pump_resume_test<S>(stream: &mut S) -> io::Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 512];
    let mut total = 0u64;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
    }
}

fn local_write_error(e: io::Error) -> io::Error {
    io::Error::new(io::ErrorKind::WriteZero, e)
}

/// True if an io error from a pump means the *local* side failed.
pub fn is_local_failure(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WriteZero
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_upload_conversion() {
        assert_eq!(to_wire_ascii(b"a\nb\n"), b"a\r\nb\r\n");
        assert_eq!(to_wire_ascii(b"a\r\nb"), b"a\r\nb");
        assert_eq!(to_wire_ascii(b"\n"), b"\r\n");
    }

    #[tokio::test]
    async fn ascii_download_conversion_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let file = std::fs::File::create(&path).unwrap();
        let mut w = IoWorker::create(file, true, false);
        // CRLF split across two chunks must still become one LF.
        w.write_wire(b"line1\r").await.unwrap();
        w.write_wire(b"\nline2\r\n").await.unwrap();
        w.finish().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"line1\nline2\n");
    }

    #[tokio::test]
    async fn binary_download_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = std::fs::File::create(&path).unwrap();
        let mut w = IoWorker::create(file, true, true);
        w.write_wire(b"\r\n\x00\xff").await.unwrap();
        w.finish().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"\r\n\x00\xff");
    }

    #[tokio::test]
    async fn upload_reads_converted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        std::fs::write(&path, b"x\ny\n").unwrap();
        let file = std::fs::File::open(&path).unwrap();
        let mut w = IoWorker::create(file, false, false);
        let mut chunk = Vec::new();
        let data = w.read_wire(&mut chunk).await.unwrap().unwrap();
        assert_eq!(data, b"x\r\ny\r\n");
        assert!(w.read_wire(&mut chunk).await.unwrap().is_none());
    }
}
