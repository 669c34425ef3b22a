// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The connection state machine: one TCP session to the master, driven
//! from a single non-blocking task with no locks and no reentrancy.

pub mod changelog;
pub mod downloader;

use std::{
    future::Future,
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{info, warn};

use crate::{
    connection::downloader::{Downloading, FileId},
    net::{
        codec::{self, HEADER_LEN},
        output_queue::OutputQueue,
        packet::Packet,
        types,
    },
    stats::ProtoCounters,
};

/// A connect attempt in progress, polled manually so it can live across
/// multiple `tokio::select!` loop iterations without being recreated.
type ConnectFuture = Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>>;

/// What the connection is doing right now. Mirrors the original's
/// `mode` field; state-specific buffers live in [`InputFrame`] instead
/// of a C union.
pub enum ConnectionMode {
    /// No socket, waiting for the reconnect timer.
    Free,
    /// `connect()` issued, awaiting completion.
    Connecting(ConnectFuture),
    /// Connected, reading the 8-byte frame header.
    Header,
    /// Connected, reading a framed payload.
    Data,
    /// Torn down; the supervisor will recycle this connection to `Free`.
    Kill,
}

impl std::fmt::Debug for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionMode::Free => "Free",
            ConnectionMode::Connecting(_) => "Connecting",
            ConnectionMode::Header => "Header",
            ConnectionMode::Data => "Data",
            ConnectionMode::Kill => "Kill",
        };
        f.write_str(name)
    }
}

/// The partially-read input frame, tagged by what we expect next.
enum InputFrame {
    Header {
        buf: [u8; HEADER_LEN],
        filled: usize,
    },
    Data {
        packet_type: u32,
        buf: Vec<u8>,
        filled: usize,
    },
}

impl InputFrame {
    fn new_header() -> Self {
        InputFrame::Header {
            buf: [0u8; HEADER_LEN],
            filled: 0,
        }
    }
}

/// One TCP session to the master, plus everything needed to resume a
/// file download or change-log append across reconnects.
pub struct Connection {
    pub mode: ConnectionMode,
    stream: Option<TcpStream>,

    bind_ip: Option<IpAddr>,
    master_host: String,
    master_port: u16,
    master_addr: Option<SocketAddr>,
    address_resolved: bool,

    input: InputFrame,
    output_queue: OutputQueue,

    last_read_time: Instant,
    last_write_time: Instant,
    timeout: Duration,

    pub(crate) downloading: Option<Downloading>,
    pub(crate) pending_start: Option<FileId>,
    pub(crate) old_master_mode: bool,
    pub(crate) back_logs_number: u32,

    pub(crate) log_file: Option<std::fs::File>,

    pub stats: ProtoCounters,
}

impl Connection {
    pub fn new(
        master_host: String,
        master_port: u16,
        bind_ip: Option<IpAddr>,
        timeout: Duration,
        back_logs_number: u32,
    ) -> Self {
        let now = Instant::now();
        Connection {
            mode: ConnectionMode::Free,
            stream: None,
            bind_ip,
            master_host,
            master_port,
            master_addr: None,
            address_resolved: false,
            input: InputFrame::new_header(),
            output_queue: OutputQueue::new(),
            last_read_time: now,
            last_write_time: now,
            timeout,
            downloading: None,
            pending_start: None,
            old_master_mode: false,
            back_logs_number,
            log_file: None,
            stats: ProtoCounters::default(),
        }
    }

    /// Clears the cached master address so the next connect attempt
    /// re-resolves the hostname. Exposed for a future SIGHUP handler;
    /// no signal is wired to it yet.
    pub fn reload(&mut self) {
        self.address_resolved = false;
    }

    fn queue_packet(&mut self, packet_type: u32, payload: &[u8]) {
        self.output_queue.push_back(Packet::new(packet_type, payload));
    }

    /// Begins a new connection attempt if currently `Free`. Resolves the
    /// master hostname once and caches it, matching the original's
    /// `masteraddrvalid` flag.
    pub fn begin_connect(&mut self) -> Result<()> {
        if !matches!(self.mode, ConnectionMode::Free) {
            return Ok(());
        }

        let addr = if self.address_resolved {
            self.master_addr.context("address marked resolved but absent")?
        } else {
            let addr = resolve_master_addr(&self.master_host, self.master_port)?;
            self.master_addr = Some(addr);
            self.address_resolved = true;
            addr
        };

        let bind_ip = self.bind_ip;
        let fut: ConnectFuture = Box::pin(async move {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if let Some(ip) = bind_ip {
                socket.bind(SocketAddr::new(ip, 0))?;
            }
            socket.connect(addr).await
        });

        self.mode = ConnectionMode::Connecting(fut);
        Ok(())
    }

    /// Drives whichever I/O the current mode calls for. This is the
    /// only place that borrows `&mut self` across an `.await` inside
    /// the supervisor's `select!`; every branch has exactly one
    /// suspend point before any irreversible mutation, so losing the
    /// race against another `select!` arm never corrupts state.
    pub async fn io_tick(&mut self) -> Result<()> {
        match &mut self.mode {
            ConnectionMode::Free | ConnectionMode::Kill => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            ConnectionMode::Connecting(_) => self.drive_connect().await,
            ConnectionMode::Header | ConnectionMode::Data => self.drive_io().await,
        }
    }

    async fn drive_connect(&mut self) -> Result<()> {
        let ConnectionMode::Connecting(fut) = &mut self.mode else {
            bail!("drive_connect called outside Connecting mode");
        };
        let result = fut.as_mut().await;
        match result {
            Ok(stream) => {
                self.stream = Some(stream);
                self.on_connected()?;
            }
            Err(e) => {
                warn!(error = %e, "connect to master failed");
                self.mode = ConnectionMode::Kill;
            }
        }
        Ok(())
    }

    fn on_connected(&mut self) -> Result<()> {
        let now = Instant::now();
        self.mode = ConnectionMode::Header;
        self.input = InputFrame::new_header();
        self.output_queue = OutputQueue::new();
        self.last_read_time = now;
        self.last_write_time = now;
        self.send_register();
        self.request_download(FileId::Metadata);
        Ok(())
    }

    fn send_register(&mut self) {
        let timeout_secs = self.timeout.as_secs().min(u64::from(u16::MAX)) as u16;
        let payload = codec::register_payload(timeout_secs);
        self.queue_packet(types::MLTOMA_REGISTER, &payload);
    }

    async fn drive_io(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_ref() else {
            bail!("drive_io called without an active stream");
        };

        let want_write = !self.output_queue.is_empty();
        let interest = if want_write {
            tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE
        } else {
            tokio::io::Interest::READABLE
        };

        let ready = stream.ready(interest).await?;

        if ready.is_writable() {
            let stream = self.stream.as_ref().context("stream dropped mid-tick")?;
            match self.output_queue.drain_once(stream) {
                Ok(n) if n > 0 => {
                    self.last_write_time = Instant::now();
                    self.stats.bytes_out += n as u64;
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!(error = %e, "write error, killing connection");
                    self.mode = ConnectionMode::Kill;
                    return Ok(());
                }
            }
        }

        if ready.is_readable() {
            self.read_available()?;
        }

        Ok(())
    }

    fn read_available(&mut self) -> Result<()> {
        loop {
            let stream = self.stream.as_ref().context("stream dropped mid-read")?;
            let (buf, filled_ref): (&mut [u8], &mut usize) = match &mut self.input {
                InputFrame::Header { buf, filled } => (buf.as_mut_slice(), filled),
                InputFrame::Data { buf, filled, .. } => (buf.as_mut_slice(), filled),
            };
            match stream.try_read(&mut buf[*filled_ref..]) {
                Ok(0) => {
                    info!("master closed the connection");
                    self.mode = ConnectionMode::Kill;
                    return Ok(());
                }
                Ok(n) => {
                    *filled_ref += n;
                    self.last_read_time = Instant::now();
                    self.stats.bytes_in += n as u64;
                    if *filled_ref == buf.len() {
                        self.on_frame_filled()?;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "read error, killing connection");
                    self.mode = ConnectionMode::Kill;
                    return Ok(());
                }
            }
        }
    }

    fn on_frame_filled(&mut self) -> Result<()> {
        match &mut self.input {
            InputFrame::Header { buf, .. } => {
                let (packet_type, length) = codec::decode_header(buf)?;
                if length == 0 {
                    self.input = InputFrame::new_header();
                    self.dispatch_packet(packet_type, &[])
                } else {
                    self.input = InputFrame::Data {
                        packet_type,
                        buf: vec![0u8; length as usize],
                        filled: 0,
                    };
                    Ok(())
                }
            }
            InputFrame::Data { packet_type, buf, .. } => {
                let packet_type = *packet_type;
                let payload = std::mem::take(buf);
                self.input = InputFrame::new_header();
                self.dispatch_packet(packet_type, &payload)
            }
        }
    }

    fn dispatch_packet(&mut self, packet_type: u32, payload: &[u8]) -> Result<()> {
        match packet_type {
            types::ANTOAN_NOP => Ok(()),
            types::MATOML_METACHANGES_LOG => self.changelog_record(payload),
            types::MATOML_DOWNLOAD_START => self.handle_download_start(payload),
            types::MATOML_DOWNLOAD_DATA => self.handle_download_data(payload),
            other => {
                warn!(packet_type = other, "unknown packet type, killing connection");
                self.mode = ConnectionMode::Kill;
                Ok(())
            }
        }
    }

    /// Checks read/keep-alive timeouts; called once per supervisor tick
    /// outside the `select!` race, never inside `io_tick`.
    pub fn check_timeouts(&mut self) {
        if matches!(self.mode, ConnectionMode::Free | ConnectionMode::Kill) {
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.last_read_time) > self.timeout {
            warn!("master read timeout, killing connection");
            self.mode = ConnectionMode::Kill;
            return;
        }
        if now.duration_since(self.last_write_time) > self.timeout / 2
            && self.output_queue.is_empty()
        {
            self.queue_packet(types::ANTOAN_NOP, &[]);
            self.stats.nops_sent += 1;
        }
    }

    /// Tears the session down and returns the connection to `Free`.
    /// Mirrors the original's `masterconn_beforeclose`: old-master mode
    /// is latched if we were mid-chained-download when killed.
    pub fn finish_kill(&mut self) {
        if self.downloading.is_some() {
            self.old_master_mode = self.downloading_was_chained();
        }
        self.abort_download();
        self.stream = None;
        self.input = InputFrame::new_header();
        self.output_queue = OutputQueue::new();
        self.stats.connection_kills += 1;
        self.mode = ConnectionMode::Free;
    }

    fn downloading_was_chained(&self) -> bool {
        self.downloading
            .as_ref()
            .is_some_and(|dl| dl.file_id.is_chained_step())
    }
}

fn resolve_master_addr(host: &str, port: u16) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no addresses found for {host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_test_connection() -> Connection {
        Connection::new(
            "localhost".to_string(),
            9419,
            None,
            Duration::from_secs(10),
            50,
        )
    }

    #[test]
    fn fresh_connection_starts_free() {
        let conn = new_test_connection();
        assert!(matches!(conn.mode, ConnectionMode::Free));
    }

    #[test]
    fn reload_clears_resolved_address() {
        let mut conn = new_test_connection();
        conn.address_resolved = true;
        conn.master_addr = Some("127.0.0.1:9419".parse().expect("valid addr"));
        conn.reload();
        assert!(!conn.address_resolved);
    }

    #[test]
    fn finish_kill_returns_connection_to_free_and_counts_it() {
        let mut conn = new_test_connection();
        conn.mode = ConnectionMode::Header;
        conn.finish_kill();
        assert!(matches!(conn.mode, ConnectionMode::Free));
        assert_eq!(conn.stats.connection_kills, 1);
    }
}
