use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use zeroize::Zeroize;

use crate::error::CtrlError;

/// Marks a configuration blob as present and complete.
pub const SETUP_MAGIC: u32 = 0xAA45_29BA;

/// Size of the serialized blob: magic, base id, key, ip, port, plus two
/// bytes of padding to round the layout to a multiple of four.
const BLOB_LEN: usize = 4 + 16 + 16 + 4 + 2 + 2;

/// Persisted base configuration, produced by the provisioning flow and
/// consumed by the session.
#[derive(Clone)]
pub struct Config {
    pub base_id: [u8; 16],
    pub key: [u8; 16],
    pub server_ip: [u8; 4],
    pub server_port: u16,
}

impl Config {
    /// Load from the little-endian binary layout. A wrong magic means the
    /// device was never provisioned (or the blob is stale).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CtrlError> {
        let raw = std::fs::read(path)?;
        Self::from_bytes(&raw)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, CtrlError> {
        if raw.len() < BLOB_LEN {
            return Err(invalid("configuration blob too short"));
        }
        let magic = u32::from_le_bytes(raw[0..4].try_into().expect("4 bytes"));
        if magic != SETUP_MAGIC {
            return Err(invalid("configuration magic mismatch"));
        }
        let mut base_id = [0u8; 16];
        base_id.copy_from_slice(&raw[4..20]);
        let mut key = [0u8; 16];
        key.copy_from_slice(&raw[20..36]);
        let mut server_ip = [0u8; 4];
        server_ip.copy_from_slice(&raw[36..40]);
        let server_port = u16::from_le_bytes(raw[40..42].try_into().expect("2 bytes"));
        Ok(Self { base_id, key, server_ip, server_port })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CtrlError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOB_LEN);
        out.extend_from_slice(&SETUP_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.base_id);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.server_ip);
        out.extend_from_slice(&self.server_port.to_le_bytes());
        out.extend_from_slice(&[0u8; 2]);
        out
    }

    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.server_ip), self.server_port))
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

fn invalid(what: &str) -> CtrlError {
    CtrlError::Io(io::Error::new(io::ErrorKind::InvalidData, what.to_string()))
}
