//! Per-transfer session engine.
//!
//! One session runs one transfer end to end: it owns an ephemeral UDP
//! endpoint bound for this transfer alone, negotiates options, drives the
//! stop-and-wait block loop, and terminates on completion, retry exhaustion
//! or a fatal error. Nothing a session does can affect another session.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::buffer_pool::RECV_BUFFER_SIZE;
use crate::error::{Result, TftpError};
use crate::packet::{self, Packet};
use crate::storage::{ReadFn, StorageError, WriteFn};
use crate::{Direction, ErrorCode, TransferMode, BLOCK_SIZE};

/// The parsed initial request, as handed over by the dispatcher.
#[derive(Debug, Clone)]
pub(crate) struct TransferRequest {
    pub direction: Direction,
    pub filename: String,
    pub mode: TransferMode,
    pub options: Vec<(String, String)>,
}

/// Snapshot of the server settings a session runs under. Taken by the
/// dispatcher at scheduling time, so setter writes during a transfer never
/// affect sessions already in flight.
#[derive(Clone)]
pub(crate) struct SessionConfig {
    pub read_cb: Arc<ReadFn>,
    pub write_cb: Arc<WriteFn>,
    pub max_transfer_size: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub audit_enabled: bool,
}

/// A unit of work for the session worker pool.
pub(crate) struct SessionJob {
    pub request: TransferRequest,
    pub client: SocketAddr,
    pub path: PathBuf,
    pub config: SessionConfig,
}

/// Outcome of a receive attempt on the session endpoint.
enum Incoming {
    Pkt(Packet),
    Timeout,
}

/// Outcome of waiting for a specific ACK.
enum AckOutcome {
    Acked,
    PeerError,
    RetriesExhausted,
}

struct Session {
    socket: UdpSocket,
    client: SocketAddr,
    path: PathBuf,
    config: SessionConfig,
    filename: String,
    request_options: Vec<(String, String)>,
    /// Per-block receive timeout; a valid client `timeout` option overrides
    /// the configured default.
    timeout: Duration,
    bytes_transferred: usize,
    expected_tsize: Option<usize>,
}

/// Run one transfer to completion. Entry point for pool workers; never
/// returns an error to the caller — failures end the session and are logged
/// here.
pub(crate) async fn run(job: SessionJob) {
    let client = job.client;
    let direction = job.request.direction;
    let filename = job.request.filename.clone();

    match Session::bind(job).await {
        Ok(mut session) => {
            let started = Instant::now();
            let result = match direction {
                Direction::Read => session.handle_read().await,
                Direction::Write => session.handle_write().await,
            };
            match result {
                Ok(()) => {
                    debug!(
                        %client,
                        filename,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "session finished"
                    );
                }
                Err(e) => {
                    // IO or decode failure mid-transfer: terminate without a
                    // reply, the peer is gone or speaking garbage.
                    warn!(%client, filename, error = %e, "session terminated");
                    if session.config.audit_enabled {
                        AuditLogger::transfer_failed(client, &filename, &e.to_string(), 0);
                    }
                }
            }
        }
        Err(e) => {
            error!(%client, filename, error = %e, "failed to open session endpoint");
        }
    }
}

impl Session {
    /// Bind a fresh ephemeral endpoint for this transfer (RFC 1350: the
    /// server side of a transfer uses a new TID).
    async fn bind(job: SessionJob) -> Result<Session> {
        let local: SocketAddr = match job.client {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        let timeout = job.config.timeout;
        Ok(Session {
            socket,
            client: job.client,
            path: job.path,
            filename: job.request.filename,
            request_options: job.request.options,
            timeout,
            config: job.config,
            bytes_transferred: 0,
            expected_tsize: None,
        })
    }

    /// RFC 2347 option negotiation: accept-or-omit, echoing only recognized
    /// options with values clamped to server policy.
    fn negotiate(&mut self, options: &[(String, String)]) -> Vec<(String, String)> {
        let mut echoed = Vec::new();
        for (name, value) in options {
            match name.as_str() {
                "blksize" => {
                    // RFC 2348 range check; the block loop itself stays at
                    // 512 regardless of what is echoed.
                    let accepted = value
                        .parse::<u32>()
                        .map(|v| (8..=65464).contains(&v))
                        .unwrap_or(false);
                    let reply = if accepted {
                        value.clone()
                    } else {
                        warn!(client = %self.client, blksize = %value, "invalid blksize, replying 512");
                        "512".to_string()
                    };
                    echoed.push(("blksize".to_string(), reply));
                }
                "timeout" => match value.parse::<u64>() {
                    Ok(v) if (1..=255).contains(&v) => {
                        self.timeout = Duration::from_secs(v);
                        echoed.push(("timeout".to_string(), value.clone()));
                    }
                    _ => {
                        warn!(client = %self.client, timeout = %value, "invalid timeout, replying 6");
                        self.timeout = Duration::from_secs(6);
                        echoed.push(("timeout".to_string(), "6".to_string()));
                    }
                },
                "tsize" => {
                    // Advisory; echoed verbatim. Never used to terminate a
                    // transfer - only a short final block does that.
                    if let Ok(v) = value.parse::<u64>() {
                        self.expected_tsize = Some(v as usize);
                    }
                    echoed.push(("tsize".to_string(), value.clone()));
                }
                other => {
                    debug!(client = %self.client, option = other, "ignoring unrecognized option");
                }
            }
        }
        echoed
    }

    /// Serve a read request: storage -> DATA blocks -> client.
    async fn handle_read(&mut self) -> Result<()> {
        let started = Instant::now();

        let read_cb = self.config.read_cb.clone();
        let path = self.path.clone();
        let read_result = tokio::task::spawn_blocking(move || read_cb(&path))
            .await
            .map_err(|e| TftpError::Tftp(format!("storage task failed: {}", e)))?;

        let data = match read_result {
            Ok(data) => data,
            Err(StorageError::NotFound) => {
                info!(client = %self.client, filename = %self.filename, "file not found");
                if self.config.audit_enabled {
                    AuditLogger::request_denied(self.client, &self.filename, "file not found");
                }
                self.send_error(ErrorCode::FileNotFound, "File not found").await;
                return Ok(());
            }
            Err(StorageError::Denied(reason)) => {
                warn!(client = %self.client, filename = %self.filename, reason, "read denied");
                if self.config.audit_enabled {
                    AuditLogger::request_denied(self.client, &self.filename, &reason);
                }
                self.send_error(ErrorCode::AccessViolation, "Access denied").await;
                return Ok(());
            }
        };

        if data.len() > self.config.max_transfer_size {
            warn!(
                client = %self.client,
                filename = %self.filename,
                size = data.len(),
                max = self.config.max_transfer_size,
                "file exceeds transfer size cap"
            );
            if self.config.audit_enabled {
                AuditLogger::size_limit_exceeded(
                    self.client,
                    &self.filename,
                    data.len() as u64,
                    self.config.max_transfer_size as u64,
                );
            }
            self.send_error(ErrorCode::DiskFull, "File size too large").await;
            return Ok(());
        }

        let requested = self.request_options.clone();
        let echoed = self.negotiate(&requested);
        if !echoed.is_empty() {
            let oack = packet::encode(&Packet::Oack { options: echoed })?;
            self.send(&oack).await?;
            match self.await_ack(0, &oack).await? {
                AckOutcome::Acked => {}
                AckOutcome::PeerError | AckOutcome::RetriesExhausted => {
                    debug!(client = %self.client, "aborted during option negotiation");
                    return Ok(());
                }
            }
        }

        // Stop-and-wait block loop. An exact multiple of 512 bytes ends with
        // a zero-length DATA block, so the loop body always runs at least
        // once and only a short block terminates it.
        let mut offset = 0usize;
        let mut block: u16 = 1;
        let mut blocks_sent: u32 = 0;
        loop {
            let chunk_len = std::cmp::min(BLOCK_SIZE, data.len() - offset);
            let payload = data[offset..offset + chunk_len].to_vec();
            let data_packet = packet::encode(&Packet::Data { block, payload })?;
            self.send(&data_packet).await?;

            match self.await_ack(block, &data_packet).await? {
                AckOutcome::Acked => {}
                AckOutcome::PeerError => {
                    if self.config.audit_enabled {
                        AuditLogger::transfer_failed(
                            self.client,
                            &self.filename,
                            "peer aborted with error packet",
                            block,
                        );
                    }
                    return Ok(());
                }
                AckOutcome::RetriesExhausted => {
                    warn!(client = %self.client, block, "retransmission budget exhausted");
                    if self.config.audit_enabled {
                        AuditLogger::transfer_failed(
                            self.client,
                            &self.filename,
                            "timeout waiting for ACK",
                            block,
                        );
                    }
                    return Ok(());
                }
            }

            offset += chunk_len;
            self.bytes_transferred += chunk_len;
            blocks_sent += 1;
            if chunk_len < BLOCK_SIZE {
                break;
            }
            block = block.wrapping_add(1);
        }

        info!(
            client = %self.client,
            filename = %self.filename,
            bytes = self.bytes_transferred,
            blocks = blocks_sent,
            "read transfer complete"
        );
        if self.config.audit_enabled {
            AuditLogger::transfer_completed(
                self.client,
                &self.filename,
                self.bytes_transferred as u64,
                blocks_sent,
                started.elapsed().as_millis() as u64,
            );
        }
        Ok(())
    }

    /// Serve a write request: client DATA blocks -> buffer -> storage.
    async fn handle_write(&mut self) -> Result<()> {
        let started = Instant::now();

        let requested = self.request_options.clone();
        let echoed = self.negotiate(&requested);
        let first_reply = if echoed.is_empty() {
            packet::encode(&Packet::ack(0))?
        } else {
            packet::encode(&Packet::Oack { options: echoed })?
        };
        self.send(&first_reply).await?;
        let mut last_reply = first_reply;

        // Pre-allocate from the advisory tsize, bounded by the cap so a lying
        // client cannot reserve arbitrary memory.
        let mut buffer = Vec::with_capacity(
            self.expected_tsize
                .unwrap_or(0)
                .min(self.config.max_transfer_size),
        );
        let mut expected: u16 = 1;
        let mut blocks_received: u32 = 0;
        let mut retries_left = self.config.max_retries;

        loop {
            match self.recv_from_client().await? {
                Incoming::Timeout => {
                    if retries_left == 0 {
                        warn!(client = %self.client, block = expected, "timed out waiting for DATA");
                        if self.config.audit_enabled {
                            AuditLogger::transfer_failed(
                                self.client,
                                &self.filename,
                                "timeout waiting for DATA",
                                expected,
                            );
                        }
                        return Ok(());
                    }
                    retries_left -= 1;
                    self.send(&last_reply).await?;
                }
                Incoming::Pkt(Packet::Data { block, payload }) if block == expected => {
                    retries_left = self.config.max_retries;
                    self.bytes_transferred += payload.len();
                    if self.bytes_transferred > self.config.max_transfer_size {
                        warn!(
                            client = %self.client,
                            received = self.bytes_transferred,
                            max = self.config.max_transfer_size,
                            "upload exceeds transfer size cap"
                        );
                        if self.config.audit_enabled {
                            AuditLogger::size_limit_exceeded(
                                self.client,
                                &self.filename,
                                self.bytes_transferred as u64,
                                self.config.max_transfer_size as u64,
                            );
                        }
                        self.send_error(ErrorCode::DiskFull, "File size too large").await;
                        return Ok(());
                    }

                    let is_final = payload.len() < BLOCK_SIZE;
                    buffer.extend_from_slice(&payload);
                    blocks_received += 1;

                    let ack = packet::encode(&Packet::ack(block))?;
                    self.send(&ack).await?;
                    last_reply = ack;

                    if is_final {
                        return self.commit_write(buffer, blocks_received, started).await;
                    }
                    expected = expected.wrapping_add(1);
                }
                Incoming::Pkt(Packet::Data { block, .. }) => {
                    // Duplicate or out-of-window block; the peer retransmits
                    // on its own timer.
                    debug!(client = %self.client, block, expected, "ignoring out-of-sequence DATA");
                }
                Incoming::Pkt(Packet::Error { code, message }) => {
                    info!(client = %self.client, code = ?code, message, "peer aborted transfer");
                    if self.config.audit_enabled {
                        AuditLogger::transfer_failed(
                            self.client,
                            &self.filename,
                            "peer aborted with error packet",
                            expected,
                        );
                    }
                    return Ok(());
                }
                Incoming::Pkt(other) => {
                    warn!(client = %self.client, opcode = ?other.opcode(), "unexpected packet during write");
                    self.send_error(ErrorCode::IllegalOperation, "Expected DATA packet").await;
                    return Ok(());
                }
            }
        }
    }

    async fn commit_write(
        &mut self,
        buffer: Vec<u8>,
        blocks_received: u32,
        started: Instant,
    ) -> Result<()> {
        let write_cb = self.config.write_cb.clone();
        let path = self.path.clone();
        let data_len = buffer.len();
        let write_result = tokio::task::spawn_blocking(move || write_cb(&path, &buffer))
            .await
            .map_err(|e| TftpError::Tftp(format!("storage task failed: {}", e)))?;

        match write_result {
            Ok(()) => {
                info!(
                    client = %self.client,
                    filename = %self.filename,
                    bytes = data_len,
                    blocks = blocks_received,
                    "write transfer complete"
                );
                if self.config.audit_enabled {
                    AuditLogger::transfer_completed(
                        self.client,
                        &self.filename,
                        data_len as u64,
                        blocks_received,
                        started.elapsed().as_millis() as u64,
                    );
                }
            }
            Err(e) => {
                error!(client = %self.client, filename = %self.filename, error = %e, "file write failed");
                if self.config.audit_enabled {
                    AuditLogger::transfer_failed(
                        self.client,
                        &self.filename,
                        &e.to_string(),
                        blocks_received as u16,
                    );
                }
                self.send_error(ErrorCode::AccessViolation, "File write failed").await;
            }
        }
        Ok(())
    }

    /// Wait for `ACK(expected)`, retransmitting `resend` on timeout until the
    /// per-packet retry budget runs out. Duplicate or out-of-order ACKs are
    /// ignored without a state change.
    async fn await_ack(&mut self, expected: u16, resend: &[u8]) -> Result<AckOutcome> {
        let mut retries_left = self.config.max_retries;
        loop {
            match self.recv_from_client().await? {
                Incoming::Pkt(Packet::Ack { block }) if block == expected => {
                    return Ok(AckOutcome::Acked);
                }
                Incoming::Pkt(Packet::Ack { block }) => {
                    debug!(client = %self.client, block, expected, "ignoring duplicate ACK");
                }
                Incoming::Pkt(Packet::Error { code, message }) => {
                    info!(client = %self.client, code = ?code, message, "peer aborted transfer");
                    return Ok(AckOutcome::PeerError);
                }
                Incoming::Pkt(other) => {
                    debug!(client = %self.client, opcode = ?other.opcode(), "ignoring unexpected packet");
                }
                Incoming::Timeout => {
                    if retries_left == 0 {
                        return Ok(AckOutcome::RetriesExhausted);
                    }
                    retries_left -= 1;
                    debug!(client = %self.client, expected, "retransmitting after timeout");
                    self.send(resend).await?;
                }
            }
        }
    }

    /// Receive the next packet from the session's client.
    ///
    /// Packets from any other TID are answered with
    /// `Error(UnknownTransferId)` directed at that sender and do not consume
    /// the session's state; the wait continues until the deadline. A
    /// malformed packet from the client is a fatal session error (the caller
    /// terminates without replying).
    async fn recv_from_client(&self) -> Result<Incoming> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Incoming::Timeout);
            }
            let (len, from) = match timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Err(_) => return Ok(Incoming::Timeout),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(received)) => received,
            };

            if from != self.client {
                warn!(client = %self.client, stranger = %from, "packet from unexpected TID");
                if self.config.audit_enabled {
                    AuditLogger::unknown_transfer_id(self.client, from);
                }
                self.send_error_to(from, ErrorCode::UnknownTransferId, "Unknown transfer ID")
                    .await;
                continue;
            }

            return packet::decode(&buf[..len]).map(Incoming::Pkt).map_err(|e| {
                warn!(client = %self.client, error = %e, "malformed packet from peer");
                e
            });
        }
    }

    /// Send a datagram to the client, retrying transient failures. Partial
    /// sends are treated as failures.
    async fn send(&self, data: &[u8]) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.socket.send_to(data, self.client).await {
                Ok(n) if n == data.len() => return Ok(()),
                Ok(n) => {
                    warn!(client = %self.client, sent = n, expected = data.len(), "partial send");
                }
                Err(e) => {
                    warn!(client = %self.client, error = %e, "send failed");
                }
            }
            attempt += 1;
            if attempt >= self.config.max_retries {
                return Err(TftpError::Tftp("send failed after retries".to_string()));
            }
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Best-effort error reply to the session's client. Error packets are a
    /// courtesy and are never retransmitted.
    async fn send_error(&self, code: ErrorCode, message: &str) {
        self.send_error_to(self.client, code, message).await;
    }

    async fn send_error_to(&self, target: SocketAddr, code: ErrorCode, message: &str) {
        match packet::encode(&Packet::error(code, message)) {
            Ok(data) => {
                if let Err(e) = self.socket.send_to(&data, target).await {
                    debug!(%target, error = %e, "error packet send failed");
                }
            }
            Err(e) => debug!(error = %e, "error packet encode failed"),
        }
    }
}
