//! Dispatcher and public server API.
//!
//! The server owns the well-known endpoint. A single receive loop parses each
//! initial request, applies path safety, and schedules a session onto the
//! worker pool; all further traffic for a transfer flows through the
//! session's own ephemeral endpoint. Runtime-tunable settings live behind a
//! reader-writer lock: sessions snapshot them at scheduling time, external
//! setters write.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::buffer_pool::{BufferPool, RECV_BUFFER_SIZE};
use crate::config::TftpConfig;
use crate::error::{Result, TftpError};
use crate::packet::{self, Packet};
use crate::path;
use crate::session::{SessionConfig, SessionJob, TransferRequest};
use crate::storage::{callbacks_for, FsStorage, ReadFn, Storage, StorageError, WriteFn};
use crate::validation;
use crate::worker_pool::{effective_worker_count, PoolHandle, WorkerPool};
use crate::{Direction, ErrorCode, DEFAULT_MAX_TRANSFER_SIZE, DEFAULT_TIMEOUT_SECS, MAX_RETRIES, RETRY_DELAY};

/// How often the dispatcher wakes to observe the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Runtime-tunable settings shared with the dispatcher.
struct Settings {
    read_cb: Arc<ReadFn>,
    write_cb: Arc<WriteFn>,
    secure_mode: bool,
    max_transfer_size: usize,
    timeout: Duration,
    max_retries: u32,
    audit_enabled: bool,
}

pub struct TftpServer {
    root_dir: PathBuf,
    bind_addr: SocketAddr,
    worker_count: usize,
    running: Arc<AtomicBool>,
    settings: Arc<RwLock<Settings>>,
    socket: Option<Arc<UdpSocket>>,
    dispatcher: Option<JoinHandle<()>>,
    pool: Option<WorkerPool>,
}

impl TftpServer {
    /// Create a server serving `root_dir` on `port` (all interfaces).
    /// Arguments are validated at [`start`](Self::start).
    pub fn new(root_dir: impl Into<PathBuf>, port: u16) -> Self {
        let (read_cb, write_cb) = callbacks_for(Arc::new(FsStorage));
        TftpServer {
            root_dir: root_dir.into(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            worker_count: 0,
            running: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(RwLock::new(Settings {
                read_cb,
                write_cb,
                secure_mode: true,
                max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
                timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
                max_retries: MAX_RETRIES,
                audit_enabled: false,
            })),
            socket: None,
            dispatcher: None,
            pool: None,
        }
    }

    /// Build a server from a validated configuration.
    pub fn from_config(config: &TftpConfig) -> Self {
        let mut server = TftpServer::new(config.root_dir.clone(), config.bind_addr.port());
        server.bind_addr = config.bind_addr;
        server.worker_count = config.worker_count;
        {
            let mut settings = server.write_settings();
            settings.secure_mode = config.secure_mode;
            settings.max_transfer_size = config.max_transfer_size;
            settings.timeout = Duration::from_secs(config.timeout_seconds);
            settings.max_retries = config.max_retries;
            settings.audit_enabled = config.logging.audit_enabled;
        }
        server
    }

    /// Override the bind address (the constructor binds all interfaces).
    pub fn set_bind_addr(&mut self, addr: SocketAddr) {
        self.bind_addr = addr;
    }

    /// Replace the storage read operation.
    pub fn set_read_callback<F>(&mut self, callback: F)
    where
        F: Fn(&Path) -> std::result::Result<Vec<u8>, StorageError> + Send + Sync + 'static,
    {
        self.write_settings().read_cb = Arc::new(callback);
    }

    /// Replace the storage write operation.
    pub fn set_write_callback<F>(&mut self, callback: F)
    where
        F: Fn(&Path, &[u8]) -> std::result::Result<(), StorageError> + Send + Sync + 'static,
    {
        self.write_settings().write_cb = Arc::new(callback);
    }

    /// Replace both storage operations with a [`Storage`] implementation.
    pub fn set_storage(&mut self, storage: Arc<dyn Storage>) {
        let (read_cb, write_cb) = callbacks_for(storage);
        let mut settings = self.write_settings();
        settings.read_cb = read_cb;
        settings.write_cb = write_cb;
    }

    /// Enable or disable the path-safety containment check (default: on).
    pub fn set_secure_mode(&mut self, secure: bool) {
        self.write_settings().secure_mode = secure;
    }

    /// Cap the per-transfer payload (512 B ..= 1 GiB).
    pub fn set_max_transfer_size(&mut self, size: usize) -> Result<()> {
        validation::validate_transfer_size(size)?;
        self.write_settings().max_transfer_size = size;
        Ok(())
    }

    /// Set the per-block timeout in seconds (1 ..= 3600).
    pub fn set_timeout(&mut self, seconds: u64) -> Result<()> {
        validation::validate_timeout(seconds)?;
        self.write_settings().timeout = Duration::from_secs(seconds);
        Ok(())
    }

    /// Set the session worker count (0 selects the hardware parallelism).
    pub fn set_worker_count(&mut self, count: usize) -> Result<()> {
        if count > 64 {
            return Err(TftpError::Validation(
                "worker count must be 0 (auto) or at most 64".to_string(),
            ));
        }
        self.worker_count = count;
        Ok(())
    }

    /// Emit structured audit events for security-relevant operations.
    pub fn set_audit_enabled(&mut self, enabled: bool) {
        self.write_settings().audit_enabled = enabled;
    }

    /// Bind the well-known endpoint and start serving. Returns an error on
    /// invalid arguments or bind failure; calling a running server is a
    /// no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            info!("TFTP server is already running");
            return Ok(());
        }

        validation::validate_root_dir(&self.root_dir.to_string_lossy())?;
        validation::validate_port(self.bind_addr.port())?;
        match std::fs::metadata(&self.root_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(TftpError::Validation(
                    "root_dir must be a directory".to_string(),
                ));
            }
            Err(e) => {
                return Err(TftpError::Validation(format!(
                    "root_dir is not accessible: {}",
                    e
                )));
            }
        }

        let socket = Arc::new(bind_udp(self.bind_addr)?);
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, root = %self.root_dir.display(), "TFTP server listening");

        let pool = WorkerPool::spawn(effective_worker_count(self.worker_count));
        self.running.store(true, Ordering::Release);

        let dispatcher = tokio::spawn(dispatcher_loop(
            socket.clone(),
            self.running.clone(),
            self.settings.clone(),
            self.root_dir.clone(),
            pool.handle(),
        ));

        if self.read_settings().audit_enabled {
            AuditLogger::server_started(&local_addr.to_string(), &self.root_dir.to_string_lossy());
        }

        self.socket = Some(socket);
        self.pool = Some(pool);
        self.dispatcher = Some(dispatcher);
        Ok(())
    }

    /// Stop the server: the dispatcher exits on its next poll, the pool
    /// refuses new sessions and in-flight transfers finish naturally.
    /// Idempotent.
    pub async fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);

        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                warn!(error = %e, "dispatcher join failed");
            }
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown().await;
        }
        self.socket = None;

        if was_running {
            if self.read_settings().audit_enabled {
                AuditLogger::server_shutdown("stop requested");
            }
            info!("TFTP server stopped");
        }
    }

    /// True iff the running flag is set, the main endpoint is open, and the
    /// dispatcher task is live.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.socket.is_some()
            && self.dispatcher.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Address of the main endpoint while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn read_settings(&self) -> std::sync::RwLockReadGuard<'_, Settings> {
        self.settings.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write_settings(&self) -> std::sync::RwLockWriteGuard<'_, Settings> {
        self.settings.write().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Drop for TftpServer {
    fn drop(&mut self) {
        // Signal the dispatcher even when the owner forgot to stop(); the
        // spawned tasks hold their own Arcs and wind down on the next poll.
        self.running.store(false, Ordering::Release);
    }
}

/// Bind a UDP socket with address reuse enabled before binding.
fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| TftpError::Tftp(format!("failed to bind {}: {}", addr, e)))?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// The dispatcher: receive, decode, gatekeep, schedule. Never writes to the
/// main endpoint except to answer a rejected first packet.
async fn dispatcher_loop(
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    settings: Arc<RwLock<Settings>>,
    root_dir: PathBuf,
    pool: PoolHandle,
) {
    let buffers = BufferPool::new();

    while running.load(Ordering::Acquire) {
        let mut buf = buffers.acquire().await;
        buf.resize(RECV_BUFFER_SIZE, 0);

        let received = tokio::time::timeout(POLL_INTERVAL, socket.recv_from(&mut buf[..])).await;
        match received {
            Err(_) => {
                // Poll tick; loop around and re-check the running flag.
            }
            Ok(Err(e)) => {
                error!(error = %e, "error receiving on main endpoint");
            }
            Ok(Ok((len, client))) => {
                handle_datagram(&socket, &settings, &root_dir, &pool, &buf[..len], client).await;
            }
        }
        buffers.release(buf).await;
    }

    debug!("dispatcher loop exited");
}

async fn handle_datagram(
    socket: &UdpSocket,
    settings: &RwLock<Settings>,
    root_dir: &Path,
    pool: &PoolHandle,
    datagram: &[u8],
    client: SocketAddr,
) {
    let packet = match packet::decode(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            // Undecodable datagram: log and stay silent, a malformed peer
            // gets no reply.
            debug!(%client, error = %e, "undecodable datagram on main endpoint");
            return;
        }
    };

    let (direction, filename, mode, options) = match packet {
        Packet::Request {
            direction,
            filename,
            mode,
            options,
        } => (direction, filename, mode, options),
        other => {
            // Stray DATA/ACK/ERROR/OACK: no session is fabricated for it.
            warn!(%client, opcode = ?other.opcode(), "non-request packet on main endpoint");
            send_error_on(socket, client, ErrorCode::IllegalOperation, "Illegal TFTP operation")
                .await;
            return;
        }
    };

    let (secure_mode, audit_enabled, session_config) = {
        let guard = settings.read().unwrap_or_else(|poison| poison.into_inner());
        (
            guard.secure_mode,
            guard.audit_enabled,
            SessionConfig {
                read_cb: guard.read_cb.clone(),
                write_cb: guard.write_cb.clone(),
                max_transfer_size: guard.max_transfer_size,
                timeout: guard.timeout,
                max_retries: guard.max_retries,
                retry_delay: RETRY_DELAY,
                audit_enabled: guard.audit_enabled,
            },
        )
    };

    if audit_enabled {
        let options_json = serde_json::Value::Object(
            options
                .iter()
                .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
                .collect(),
        );
        match direction {
            Direction::Read => {
                AuditLogger::read_request(client, &filename, mode.as_str(), options_json)
            }
            Direction::Write => {
                AuditLogger::write_request(client, &filename, mode.as_str(), options_json)
            }
        }
    }

    let path = if secure_mode {
        match path::resolve_secure(root_dir, &filename) {
            Ok(path) => path,
            Err(e) => {
                warn!(%client, filename, error = %e, "request rejected by path safety");
                if audit_enabled {
                    if filename.contains("..") {
                        AuditLogger::path_traversal_attempt(client, &filename);
                    } else {
                        AuditLogger::request_denied(client, &filename, &e.to_string());
                    }
                }
                send_error_on(socket, client, ErrorCode::AccessViolation, "Access denied").await;
                return;
            }
        }
    } else {
        path::resolve_unchecked(root_dir, &filename)
    };

    debug!(%client, filename, direction = ?direction, "scheduling session");
    let job = SessionJob {
        request: TransferRequest {
            direction,
            filename,
            mode,
            options,
        },
        client,
        path,
        config: session_config,
    };
    if !pool.submit(job) {
        warn!(%client, "session dropped, worker pool unavailable");
    }
}

/// Best-effort error reply from the main endpoint.
async fn send_error_on(socket: &UdpSocket, target: SocketAddr, code: ErrorCode, message: &str) {
    match packet::encode(&Packet::error(code, message)) {
        Ok(data) => {
            if let Err(e) = socket.send_to(&data, target).await {
                debug!(%target, error = %e, "error reply send failed");
            }
        }
        Err(e) => debug!(error = %e, "error reply encode failed"),
    }
}
