/*
 * ftp_integration.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration test for the FTP session: runs a scripted server on a
 * loopback socket and drives a full logon, a passive-mode listing, and a
 * download through the real async shell, including the data channel and
 * the local io worker.
 *
 * Run with:
 *   cargo test -p traghetto_core --test ftp_integration -- --nocapture
 */

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use traghetto_core::options::Options;
use traghetto_core::path::{PathKind, ServerPath};
use traghetto_core::protocol::ftp::session::FtpSession;
use traghetto_core::protocol::ftp::ServerDescriptor;

struct ScriptedServer {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl ScriptedServer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.expect("control accept");
        let (r, w) = stream.into_split();
        ScriptedServer {
            reader: BufReader::new(r),
            writer: w,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .expect("control write");
    }

    /// Read one command and assert its prefix.
    async fn expect(&mut self, prefix: &str) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("control read");
        let line = line.trim_end().to_string();
        assert!(
            line.starts_with(prefix),
            "expected command starting with {:?}, got {:?}",
            prefix,
            line
        );
        line
    }
}

async fn open_data_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("data bind");
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn serve_data(listener: TcpListener, payload: &[u8]) {
    let (mut stream, _) = listener.accept().await.expect("data accept");
    stream.write_all(payload).await.expect("data write");
    stream.shutdown().await.expect("data shutdown");
    drop(stream);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn logon_list_and_download() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let mut ctl = ScriptedServer::accept(&listener).await;
        ctl.send("220 Scripted FTP ready").await;
        ctl.expect("USER alice").await;
        ctl.send("331 Password required").await;
        ctl.expect("PASS secret").await;
        ctl.send("230 Logged in").await;
        ctl.expect("SYST").await;
        ctl.send("215 UNIX Type: L8").await;
        ctl.expect("FEAT").await;
        ctl.send("211-Features").await;
        ctl.send(" SIZE").await;
        ctl.send("211 End").await;

        // Listing: PWD first (cwd unknown), then TYPE A, EPSV, LIST.
        ctl.expect("PWD").await;
        ctl.send("257 \"/\" is current directory").await;
        ctl.expect("TYPE A").await;
        ctl.send("200 Type set to A").await;
        let (data, dport) = open_data_port().await;
        ctl.expect("EPSV").await;
        ctl.send(&format!("229 Entering Extended Passive Mode (|||{}|)", dport))
            .await;
        ctl.expect("LIST").await;
        ctl.send("150 Opening data connection").await;
        serve_data(data, b"-rw-r--r-- 1 u u 5 Jan 01 12:00 hello.txt\r\n").await;
        ctl.send("226 Transfer complete").await;

        // Download of hello.txt: TYPE I, EPSV, RETR.
        ctl.expect("TYPE I").await;
        ctl.send("200 Type set to I").await;
        let (data, dport) = open_data_port().await;
        ctl.expect("EPSV").await;
        ctl.send(&format!("229 Entering Extended Passive Mode (|||{}|)", dport))
            .await;
        ctl.expect("RETR hello.txt").await;
        ctl.send("150 Sending").await;
        serve_data(data, b"hello").await;
        ctl.send("226 Done").await;
    });

    let mut server = ServerDescriptor::new("127.0.0.1", port, "alice");
    server.password = Some("secret".to_string());
    let (session, mut notifications, connected) = FtpSession::start(server, Options::default());
    tokio::spawn(async move { while notifications.recv().await.is_some() {} });

    let logon = connected.await.expect("session task alive");
    assert!(logon.is_ok(), "logon failed: {}", logon);

    let listing = session
        .list(ServerPath::empty(), "")
        .await
        .expect("listing failed");
    assert!(String::from_utf8_lossy(&listing).contains("hello.txt"));

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("hello.txt");
    let local_str = local.to_str().unwrap().to_string();
    let root = ServerPath::parse("/", PathKind::Unix);
    let result = session.download(&local_str, root, "hello.txt", true).await;
    assert!(result.is_ok(), "download failed: {}", result);
    assert_eq!(std::fs::read(&local).unwrap(), b"hello");

    session.disconnect();
    server_task.await.expect("server script completed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_retr_is_reported_and_session_survives() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let mut ctl = ScriptedServer::accept(&listener).await;
        ctl.send("220 ready").await;
        ctl.expect("USER alice").await;
        ctl.send("331 pw").await;
        ctl.expect("PASS secret").await;
        ctl.send("230 in").await;
        ctl.expect("SYST").await;
        ctl.send("215 UNIX").await;
        ctl.expect("FEAT").await;
        ctl.send("502 no features").await;

        // The download attempt: CWD refused, so the engine probes with
        // absolute paths before the transfer, which the server also rejects.
        ctl.expect("CWD /").await;
        ctl.send("550 refused").await;
        ctl.expect("SIZE /gone.bin").await;
        ctl.send("550 SIZE not allowed").await;
        ctl.expect("MDTM /gone.bin").await;
        ctl.send("550 no").await;
        ctl.expect("TYPE I").await;
        ctl.send("200 ok").await;
        let (data, dport) = open_data_port().await;
        ctl.expect("EPSV").await;
        ctl.send(&format!("229 ok (|||{}|)", dport)).await;
        ctl.expect("RETR /gone.bin").await;
        ctl.send("550 No such file").await;
        drop(data);

        // Session stays usable.
        ctl.expect("PWD").await;
        ctl.send("257 \"/\"").await;
    });

    let mut server = ServerDescriptor::new("127.0.0.1", port, "alice");
    server.password = Some("secret".to_string());
    let mut options = Options::default();
    options.preserve_timestamps = true;
    let (session, mut notifications, connected) = FtpSession::start(server, options);
    tokio::spawn(async move { while notifications.recv().await.is_some() {} });
    assert!(connected.await.expect("task alive").is_ok());

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("gone.bin");
    let local_str = local.to_str().unwrap().to_string();
    let root = ServerPath::parse("/", PathKind::Unix);
    let result = session.download(&local_str, root, "gone.bin", true).await;
    assert!(result.is_err());
    // The empty local file was cleaned up again.
    assert!(!local.exists());

    let flags = session.change_dir(ServerPath::empty(), "").await;
    assert!(flags.is_ok());
    session.disconnect();
    server_task.await.expect("server script completed");
}
