//! TFTP server implementation.
//!
//! Read-only TFTP (RFC 1350) with the blksize option (RFC 2347/2348).
//! The main socket answers requests; each accepted read request opens a
//! dedicated socket whose port becomes the server transfer id.

pub mod packet;
pub mod server;
pub mod service;

pub use packet::{Packet, PacketError, RequestPacket};
pub use server::TftpServer;
pub use service::{TftpFileService, TftpNullService, TftpReadService, TftpRequest, TftpResponse};
