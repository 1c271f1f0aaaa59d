//! TFTP read services.
//!
//! A read service answers TFTP read requests (RRQ). The response is a
//! value: accept with a readable stream, reject with an error code and
//! message, or silently ignore.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use super::packet::{RequestPacket, ERR_FNF};

/// A read request as seen by a service.
#[derive(Debug, Clone)]
pub struct TftpRequest {
    /// Address of the client.
    pub peer: SocketAddr,
    /// The RRQ packet sent by the client.
    pub packet: RequestPacket,
}

/// Outcome of a read request.
pub enum TftpResponse {
    /// Serve the content of this stream to the client.
    Accept(Box<dyn AsyncRead + Send + Sync + Unpin>),
    /// Send an error packet to the client.
    Reject { code: u16, message: String },
    /// Silently drop the request.
    Ignore,
}

impl TftpResponse {
    pub fn reject(code: u16, message: impl Into<String>) -> Self {
        TftpResponse::Reject {
            code,
            message: message.into(),
        }
    }
}

/// A TFTP read service handles TFTP read requests (RRQ).
#[async_trait]
pub trait TftpReadService: Send + Sync {
    async fn handle_read_request(&self, request: &TftpRequest) -> TftpResponse;
}

/// A read service that always rejects the requests.
pub struct TftpNullService {
    pub code: u16,
    pub message: String,
}

impl TftpNullService {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ERR_FNF,
            message: message.into(),
        }
    }
}

impl Default for TftpNullService {
    fn default() -> Self {
        Self::new("File not found")
    }
}

#[async_trait]
impl TftpReadService for TftpNullService {
    async fn handle_read_request(&self, _request: &TftpRequest) -> TftpResponse {
        TftpResponse::reject(self.code, self.message.clone())
    }
}

/// A read service that serves files under a path.
///
/// Leading path separators of the requested filename are stripped and any
/// request that references a parent directory is rejected, so a request
/// for `bar/../../foo.txt` never escapes the served tree.
pub struct TftpFileService {
    root: PathBuf,
}

impl TftpFileService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a requested filename to a path under the root, or `None`
    /// when the request escapes it.
    pub fn resolve(&self, filename: &str) -> Option<PathBuf> {
        let stripped = filename.trim_start_matches('/');
        let relative = Path::new(stripped);
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(resolved)
    }
}

#[async_trait]
impl TftpReadService for TftpFileService {
    async fn handle_read_request(&self, request: &TftpRequest) -> TftpResponse {
        let Some(path) = self.resolve(&request.packet.filename) else {
            return TftpResponse::reject(ERR_FNF, "Invalid filename");
        };
        match tokio::fs::File::open(&path).await {
            Ok(file) => TftpResponse::Accept(Box::new(file)),
            Err(_) => TftpResponse::reject(ERR_FNF, "File not found"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(filename: &str) -> TftpRequest {
        TftpRequest {
            peer: "127.0.0.1:5000".parse().unwrap(),
            packet: RequestPacket {
                filename: filename.to_string(),
                mode: "octet".to_string(),
                options: BTreeMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_null_service_rejects() {
        let service = TftpNullService::default();
        match service.handle_read_request(&request("foo")).await {
            TftpResponse::Reject { code, .. } => assert_eq!(code, ERR_FNF),
            _ => panic!("expected a rejection"),
        }
    }

    #[tokio::test]
    async fn test_file_service_serves_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo.txt"), b"content").unwrap();
        let service = TftpFileService::new(dir.path());
        match service.handle_read_request(&request("/foo.txt")).await {
            TftpResponse::Accept(_) => {}
            _ => panic!("expected an accept"),
        }
        match service.handle_read_request(&request("missing.txt")).await {
            TftpResponse::Reject { code, .. } => assert_eq!(code, ERR_FNF),
            _ => panic!("expected a rejection"),
        }
    }

    #[tokio::test]
    async fn test_file_service_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let service = TftpFileService::new(dir.path());
        match service.handle_read_request(&request("bar/../../etc/passwd")).await {
            TftpResponse::Reject { .. } => {}
            _ => panic!("expected a rejection"),
        }
    }
}
