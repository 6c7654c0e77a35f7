use sha2::{Digest, Sha256};
use std::fmt;

/// Stable on-disk namespace for a remote MCP server, derived as
/// `hex(SHA-256(remoteURL))`. Two equal URLs always produce the same id and
/// therefore the same config directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(remote_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(remote_url.as_bytes());
        let digest = hasher.finalize();
        Self(hex_encode(&digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
