//! TFTP server and per-transfer connections.
//!
//! The listening socket only dispatches requests. Each accepted read
//! request opens a fresh socket; its port is the server transfer id and
//! the first packet sent from it is either the initial DATA block or an
//! OACK when options were negotiated.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::Result;

use super::packet::{
    build_dgram, data_packet, err_packet, parse_dgram, Packet, ERR_ILL, ERR_UNDEF, ERR_UNKNWN_TID,
};
use super::service::{TftpReadService, TftpRequest, TftpResponse};

/// Per-block retransmit timeout.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(4);
/// Number of retransmissions before a transfer is abandoned.
const MAX_RETRIES: u32 = 4;
/// Default block size when none is negotiated (RFC 1350).
const DEFAULT_BLKSIZE: u16 = 512;

/// TFTP server bound to a UDP port, dispatching read requests to a
/// service.
pub struct TftpServer {
    socket: Arc<UdpSocket>,
    service: Arc<dyn TftpReadService>,
}

impl TftpServer {
    /// Bind the main server socket.
    pub async fn bind(addr: SocketAddr, service: Arc<dyn TftpReadService>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("TFTP server listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            service,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve requests until the task is cancelled.
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            self.handle_dgram(&buf[..len], peer).await;
        }
    }

    async fn handle_dgram(&self, dgram: &[u8], peer: SocketAddr) {
        let packet = match parse_dgram(dgram) {
            Ok(packet) => packet,
            Err(e) => {
                // invalid datagram - ignore it
                info!("Received invalid TFTP datagram from {}: {}", peer, e);
                return;
            }
        };
        match packet {
            Packet::ReadRequest(request) => {
                info!("TFTP read request from {}", peer);
                self.handle_rrq(request, peer).await;
            }
            Packet::WriteRequest(_) => {
                info!("TFTP write request not supported");
                self.send_error(peer, ERR_UNDEF, "WRQ not supported").await;
            }
            _ => {
                info!("Ignoring non-request packet from {}", peer);
            }
        }
    }

    async fn handle_rrq(&self, request: super::packet::RequestPacket, peer: SocketAddr) {
        if request.mode != "octet" {
            warn!("TFTP mode not supported: {}", request.mode);
            self.send_error(peer, ERR_UNDEF, "mode not supported").await;
            return;
        }
        let blksize = request.blksize();
        let tftp_request = TftpRequest {
            peer,
            packet: request,
        };
        match self.service.handle_read_request(&tftp_request).await {
            TftpResponse::Accept(reader) => {
                info!("TFTP read request accepted");
                if let Err(e) = spawn_transfer(peer, reader, blksize).await {
                    warn!("Could not start TFTP transfer to {}: {}", peer, e);
                    self.send_error(peer, ERR_UNDEF, "transfer setup failed").await;
                }
            }
            TftpResponse::Reject { code, message } => {
                info!("TFTP read request rejected: {}", message);
                self.send_error(peer, code, message).await;
            }
            TftpResponse::Ignore => {
                debug!("TFTP read request ignored");
            }
        }
    }

    async fn send_error(&self, peer: SocketAddr, code: u16, message: impl Into<String>) {
        if let Ok(dgram) = build_dgram(&err_packet(code, message)) {
            let _ = self.socket.send_to(&dgram, peer).await;
        }
    }
}

/// Open the transfer socket and run the transfer in the background.
async fn spawn_transfer(
    peer: SocketAddr,
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    blksize: Option<u16>,
) -> Result<()> {
    let bind_addr: SocketAddr = if peer.is_ipv4() {
        "0.0.0.0:0".parse().expect("constant address")
    } else {
        "[::]:0".parse().expect("constant address")
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    debug!(
        "TFTP transfer to {} using local port {}",
        peer,
        socket.local_addr()?.port()
    );
    let mut connection = Connection::new(socket, peer, reader, blksize);
    tokio::spawn(async move {
        if let Err(e) = connection.run().await {
            info!("TFTP transfer to {} ended with error: {}", peer, e);
        }
    });
    Ok(())
}

/// A transfer from the point of view of the server.
struct Connection {
    socket: UdpSocket,
    peer: SocketAddr,
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    blksize: usize,
    oack: Option<Packet>,
    // block number we are waiting for in the next ACK
    blk_no: u16,
    last_blk_no: Option<u16>,
    last_buf_len: Option<usize>,
    sent_first_data: bool,
    dup_ack: bool,
}

enum Step {
    Continue,
    Done,
}

impl Connection {
    fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
        blksize: Option<u16>,
    ) -> Self {
        let oack = blksize.map(|blksize| {
            debug!("Using TFTP blksize of {}", blksize);
            let mut options = std::collections::BTreeMap::new();
            options.insert("blksize".to_string(), blksize.to_string());
            Packet::Oack { options }
        });
        Self {
            socket,
            peer,
            reader,
            blksize: blksize.unwrap_or(DEFAULT_BLKSIZE) as usize,
            oack,
            // when an OACK is sent first, the client acknowledges block 0
            blk_no: 0,
            last_blk_no: None,
            last_buf_len: None,
            sent_first_data: false,
            dup_ack: false,
        }
    }

    async fn run(&mut self) -> Result<()> {
        let mut last_dgram = match self.next_dgram().await? {
            Some(dgram) => dgram,
            None => return Ok(()),
        };
        self.socket.send_to(&last_dgram, self.peer).await?;

        let mut retry_count: u32 = 0;
        let mut buf = vec![0u8; 65536];
        loop {
            let received =
                tokio::time::timeout(TRANSFER_TIMEOUT, self.socket.recv_from(&mut buf)).await;
            let (len, from) = match received {
                Ok(result) => result?,
                Err(_elapsed) => {
                    retry_count += 1;
                    info!(
                        "Timeout has expired with current retry count {}",
                        retry_count
                    );
                    if retry_count >= MAX_RETRIES {
                        return Ok(());
                    }
                    self.socket.send_to(&last_dgram, self.peer).await?;
                    continue;
                }
            };
            if from != self.peer {
                info!("Datagram received with wrong TID");
                let dgram = build_dgram(&err_packet(ERR_UNKNWN_TID, "Unknown TID"))?;
                let _ = self.socket.send_to(&dgram, from).await;
                continue;
            }
            retry_count = 0;
            let packet = match parse_dgram(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    info!("Received an invalid datagram: {}", e);
                    self.send_error(ERR_UNDEF, "Invalid datagram").await;
                    return Ok(());
                }
            };
            match packet {
                Packet::Error { .. } => {
                    info!("Received an error packet");
                    return Ok(());
                }
                Packet::Ack { block_no } => match self.handle_ack(block_no, &mut last_dgram).await? {
                    Step::Continue => {}
                    Step::Done => return Ok(()),
                },
                other => {
                    info!("Received an unexpected packet - {:?}", packet_kind(&other));
                    self.send_error(ERR_ILL, "Illegal TFTP operation").await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_ack(&mut self, block_no: u16, last_dgram: &mut Vec<u8>) -> Result<Step> {
        if block_no == self.blk_no {
            self.last_blk_no = Some(block_no);
            self.dup_ack = false;
            match self.next_dgram().await? {
                Some(dgram) => {
                    *last_dgram = dgram;
                    self.socket.send_to(last_dgram, self.peer).await?;
                    Ok(Step::Continue)
                }
                None => Ok(Step::Done),
            }
        } else if Some(block_no) == self.last_blk_no {
            if !self.dup_ack {
                self.dup_ack = true;
                self.socket.send_to(last_dgram, self.peer).await?;
            }
            Ok(Step::Continue)
        } else {
            self.send_error(ERR_ILL, "Illegal block number").await;
            Ok(Step::Done)
        }
    }

    /// Produce the next datagram to send, or `None` when the transfer is
    /// complete.
    async fn next_dgram(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(oack) = self.oack.take() {
            return Ok(Some(build_dgram(&oack)?));
        }
        let buf = self.read_block().await?;
        let finished = buf.is_empty()
            && self.sent_first_data
            && self.last_buf_len.map(|len| len != self.blksize).unwrap_or(true);
        if finished {
            // the last block was shorter than blksize, the client got it all
            return Ok(None);
        }
        self.last_buf_len = Some(buf.len());
        self.sent_first_data = true;
        self.blk_no = self.blk_no.wrapping_add(1);
        Ok(Some(build_dgram(&data_packet(self.blk_no, buf))?))
    }

    async fn read_block(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.blksize];
        let mut filled = 0;
        while filled < self.blksize {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn send_error(&self, code: u16, message: &str) {
        if let Ok(dgram) = build_dgram(&err_packet(code, message)) {
            let _ = self.socket.send_to(&dgram, self.peer).await;
        }
    }
}

fn packet_kind(packet: &Packet) -> &'static str {
    match packet {
        Packet::ReadRequest(_) => "RRQ",
        Packet::WriteRequest(_) => "WRQ",
        Packet::Data { .. } => "DATA",
        Packet::Ack { .. } => "ACK",
        Packet::Error { .. } => "ERROR",
        Packet::Oack { .. } => "OACK",
    }
}
