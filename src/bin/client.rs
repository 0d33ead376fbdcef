//! kestrel-tftp-client: stop-and-wait TFTP client for validating the server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use kestrel_tftp::packet::{self, Packet};
use kestrel_tftp::validation;
use kestrel_tftp::{Direction, TransferMode, BLOCK_SIZE, MAX_PACKET_SIZE, MAX_RETRIES};

#[derive(Parser, Debug)]
#[command(name = "kestrel-tftp-client", about = "Stop-and-wait TFTP client")]
struct Cli {
    /// TFTP server address (e.g. 192.168.1.10:69)
    #[arg(short, long)]
    server: String,

    /// Download a file from the server
    #[arg(short, long, conflicts_with = "put")]
    get: Option<String>,

    /// Upload a file to the server
    #[arg(short, long, conflicts_with = "get")]
    put: Option<PathBuf>,

    /// Local file path (destination for get, remote name for put)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Transfer mode (octet or netascii)
    #[arg(short, long, default_value = "octet")]
    mode: String,

    /// Per-block timeout in seconds
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    /// Skip the tsize option on uploads
    #[arg(long)]
    no_tsize: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    let server_addr = resolve_server(&cli.server).await?;
    let mode = TransferMode::from_str(&cli.mode)?;

    let client = Client {
        server_addr,
        mode,
        timeout: Duration::from_secs(cli.timeout),
    };

    if let Some(remote) = cli.get {
        let local = cli.file.unwrap_or_else(|| PathBuf::from(&remote));
        info!("downloading {} from {} to {}", remote, server_addr, local.display());
        client.get(&remote, &local).await?;
        info!("download complete");
    } else if let Some(local) = cli.put {
        let remote = cli
            .file
            .as_deref()
            .and_then(|p| p.to_str())
            .map(str::to_string)
            .or_else(|| local.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .context("cannot derive a remote name for upload")?;
        info!("uploading {} to {} as {}", local.display(), server_addr, remote);
        client.put(&local, &remote, !cli.no_tsize).await?;
        info!("upload complete");
    } else {
        bail!("specify either --get or --put");
    }

    Ok(())
}

/// Accept `ip:port` directly, or validate and resolve `hostname:port`.
async fn resolve_server(server: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let (host, port) = server
        .rsplit_once(':')
        .context("invalid server address, expected host:port")?;
    let port: u16 = port.parse().context("invalid port")?;
    validation::validate_port(port)?;
    validation::validate_host(host)?;
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .context("host did not resolve to an address")
}

struct Client {
    server_addr: SocketAddr,
    mode: TransferMode,
    timeout: Duration,
}

impl Client {
    async fn bind(&self) -> anyhow::Result<UdpSocket> {
        let local: SocketAddr = if self.server_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        Ok(UdpSocket::bind(local).await?)
    }

    /// Download `remote` into `local` (RRQ).
    async fn get(&self, remote: &str, local: &std::path::Path) -> anyhow::Result<()> {
        let socket = self.bind().await?;
        let request = packet::encode(&Packet::Request {
            direction: Direction::Read,
            filename: remote.to_string(),
            mode: self.mode,
            options: vec![],
        })?;
        socket.send_to(&request, self.server_addr).await?;
        debug!("sent RRQ to {}", self.server_addr);

        let mut server_tid: Option<SocketAddr> = None;
        let mut expected_block: u16 = 1;
        let mut contents: Vec<u8> = Vec::new();
        let mut buf = [0u8; MAX_PACKET_SIZE + 1];

        loop {
            let (len, from) = match timeout(self.timeout, socket.recv_from(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => bail!("timeout waiting for DATA block {}", expected_block),
            };

            // The first reply pins the server's transfer ID
            match server_tid {
                None => {
                    server_tid = Some(from);
                    debug!("server TID: {}", from);
                }
                Some(tid) if tid != from => {
                    warn!("ignoring packet from unexpected source {}", from);
                    continue;
                }
                Some(_) => {}
            }
            let tid = server_tid.context("server TID must be pinned")?;

            match packet::decode(&buf[..len])? {
                Packet::Data { block, payload } => {
                    if block != expected_block {
                        debug!("ignoring out-of-sequence block {}", block);
                        continue;
                    }
                    contents.extend_from_slice(&payload);
                    let ack = packet::encode(&Packet::ack(block))?;
                    socket.send_to(&ack, tid).await?;
                    debug!("received block {} ({} bytes)", block, payload.len());
                    if payload.len() < BLOCK_SIZE {
                        break;
                    }
                    expected_block = expected_block.wrapping_add(1);
                }
                Packet::Oack { options } => {
                    debug!("received OACK {:?}, acknowledging", options);
                    let ack = packet::encode(&Packet::ack(0))?;
                    socket.send_to(&ack, tid).await?;
                }
                Packet::Error { code, message } => {
                    bail!("server error {:?}: {}", code, message);
                }
                other => bail!("unexpected packet: {:?}", other.opcode()),
            }
        }

        tokio::fs::write(local, &contents).await?;
        info!("received {} bytes", contents.len());
        Ok(())
    }

    /// Upload `local` as `remote` (WRQ).
    async fn put(&self, local: &std::path::Path, remote: &str, send_tsize: bool) -> anyhow::Result<()> {
        let contents = tokio::fs::read(local).await?;
        let socket = self.bind().await?;

        let options = if send_tsize {
            vec![("tsize".to_string(), contents.len().to_string())]
        } else {
            vec![]
        };
        let request = packet::encode(&Packet::Request {
            direction: Direction::Write,
            filename: remote.to_string(),
            mode: self.mode,
            options,
        })?;
        socket.send_to(&request, self.server_addr).await?;
        debug!("sent WRQ to {}", self.server_addr);

        // The server answers from its session endpoint with OACK or ACK(0)
        let mut buf = [0u8; MAX_PACKET_SIZE + 1];
        let (len, server_tid) = match timeout(self.timeout, socket.recv_from(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => bail!("timeout waiting for transfer to open"),
        };
        match packet::decode(&buf[..len])? {
            Packet::Ack { block: 0 } => debug!("server ready (ACK 0)"),
            Packet::Oack { options } => debug!("server ready (OACK {:?})", options),
            Packet::Error { code, message } => bail!("server error {:?}: {}", code, message),
            other => bail!("unexpected packet: {:?}", other.opcode()),
        }

        let mut block: u16 = 1;
        let mut offset = 0usize;
        loop {
            let chunk_len = std::cmp::min(BLOCK_SIZE, contents.len() - offset);
            let payload = contents[offset..offset + chunk_len].to_vec();
            let data_packet = packet::encode(&Packet::Data { block, payload })?;

            let mut retries = 0;
            loop {
                socket.send_to(&data_packet, server_tid).await?;
                match timeout(self.timeout, socket.recv_from(&mut buf)).await {
                    Ok(result) => {
                        let (len, from) = result?;
                        if from != server_tid {
                            warn!("ignoring packet from unexpected source {}", from);
                            continue;
                        }
                        match packet::decode(&buf[..len])? {
                            Packet::Ack { block: acked } if acked == block => break,
                            Packet::Ack { block: acked } => {
                                debug!("ignoring duplicate ACK {}", acked);
                            }
                            Packet::Error { code, message } => {
                                bail!("server error {:?}: {}", code, message);
                            }
                            other => bail!("unexpected packet: {:?}", other.opcode()),
                        }
                    }
                    Err(_) => {
                        retries += 1;
                        if retries >= MAX_RETRIES {
                            bail!("no ACK for block {} after {} attempts", block, MAX_RETRIES);
                        }
                        warn!("timeout waiting for ACK {}, retrying ({}/{})", block, retries, MAX_RETRIES);
                    }
                }
            }

            offset += chunk_len;
            debug!("sent block {} ({} bytes)", block, chunk_len);
            if chunk_len < BLOCK_SIZE {
                break;
            }
            block = block.wrapping_add(1);
        }

        info!("sent {} bytes", contents.len());
        Ok(())
    }
}
