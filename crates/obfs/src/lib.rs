//! SSR obfuscation and protocol plugins
//!
//! Two plugin slots wrap the stream cipher: the *protocol* slot frames
//! plaintext before encryption (integrity, padding, user auth) and the
//! *obfs* slot disguises ciphertext after encryption (HTTP or TLS
//! camouflage). Both slots implement the same capability trait; every
//! operation defaults to pass-through so an absent transform
//! short-circuits the pipeline.
//!
//! Plugin names are resolved to a variant once at startup
//! ([`ProtocolKind`] / [`ObfsKind`]); nothing string-dispatches per
//! packet.

use std::cell::RefCell;
use std::rc::Rc;

use rand::RngCore;
use thiserror::Error;

mod auth_aes128;
mod http;
mod legacy;
mod plain;
mod tls;

pub use auth_aes128::AuthAes128;
pub use http::HttpObfs;
pub use legacy::{AuthSha1, AuthSha1V2, AuthSha1V4, AuthSimple, VerifySimple};
pub use plain::PlainPlugin;
pub use tls::Tls12TicketAuth;

use ssrlocal_crypto::digest::HashKind;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfsError {
    #[error("rolling receive buffer overflow")]
    RecvOverflow,

    #[error("frame length {0} out of range")]
    BadLength(usize),

    #[error("frame HMAC mismatch")]
    HmacMismatch,

    #[error("frame checksum mismatch")]
    ChecksumMismatch,

    #[error("malformed obfs handshake")]
    BadHandshake,
}

pub type Result<T> = std::result::Result<T, ObfsError>;

/// Everything a plugin instance needs to know about its session,
/// installed once at tunnel construction.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    /// Plugin-specific parameter string from the configuration.
    pub param: String,
    /// Egress IV of the stream cipher (auth chunks key off it).
    pub iv: Vec<u8>,
    /// Stream cipher key.
    pub key: Vec<u8>,
    /// Length of the SSR address header at the front of the stream.
    pub head_len: usize,
    pub tcp_mss: usize,
    pub buffer_size: usize,
    /// Combined per-packet overhead of both plugin slots.
    pub overhead: usize,
    /// Shared mutable state for the plugin family, owned by the
    /// environment.
    pub global: Option<Rc<RefCell<PluginGlobal>>>,
}

impl ServerInfo {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            tcp_mss: 1452,
            buffer_size: ssrlocal_core::SSR_BUFF_SIZE,
            ..Default::default()
        }
    }
}

/// Shared state of the auth_* protocol family.
#[derive(Debug, Clone)]
pub struct AuthGlobal {
    pub client_id: [u8; 8],
    pub connection_id: u32,
}

impl AuthGlobal {
    pub fn new() -> Self {
        let mut client_id = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut client_id);
        Self {
            client_id,
            connection_id: rand::rngs::OsRng.next_u32() & 0xFFFFFF,
        }
    }

    /// Advance to the next connection id. Past 0xFF000000 the whole
    /// identity rolls over to a fresh random one.
    pub fn bump(&mut self) {
        self.connection_id = self.connection_id.wrapping_add(1);
        if self.connection_id > 0xFF00_0000 {
            rand::rngs::OsRng.fill_bytes(&mut self.client_id);
            self.connection_id = rand::rngs::OsRng.next_u32() & 0xFFFFFF;
        }
    }
}

impl Default for AuthGlobal {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state of tls1.2_ticket_auth: the fake TLS session id.
#[derive(Debug, Clone)]
pub struct TlsGlobal {
    pub client_id: [u8; 32],
}

impl TlsGlobal {
    pub fn new() -> Self {
        let mut client_id = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut client_id);
        Self { client_id }
    }
}

impl Default for TlsGlobal {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-family shared global, held by the environment and handed to
/// plugin instances through [`ServerInfo`].
#[derive(Debug, Clone)]
pub enum PluginGlobal {
    Auth(AuthGlobal),
    Tls(TlsGlobal),
}

impl PluginGlobal {
    pub fn as_auth_mut(&mut self) -> &mut AuthGlobal {
        match self {
            PluginGlobal::Auth(g) => g,
            PluginGlobal::Tls(_) => unreachable!("auth plugin wired to tls global"),
        }
    }

    pub fn as_tls(&self) -> &TlsGlobal {
        match self {
            PluginGlobal::Tls(g) => g,
            PluginGlobal::Auth(_) => unreachable!("tls plugin wired to auth global"),
        }
    }
}

/// Polymorphic transform capability shared by the protocol and obfs
/// slots. Every operation is optional; defaults pass data through
/// untouched.
pub trait Plugin {
    fn set_server_info(&mut self, info: ServerInfo);

    /// Maximum bytes this transform adds per packet.
    fn overhead(&self) -> usize {
        0
    }

    /// Protocol-layer framing applied before stream encryption.
    fn client_pre_encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    /// Inverse of `client_pre_encrypt`.
    fn client_post_decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    /// Obfs-layer framing applied after stream encryption.
    fn client_encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    /// Inverse of `client_encode`. The boolean asks the caller to
    /// immediately send an empty-payload `client_encode` result back
    /// upstream (obfs handshake feedback).
    fn client_decode(&mut self, data: &[u8]) -> Result<(Vec<u8>, bool)> {
        Ok((data.to_vec(), false))
    }
}

/// Length of the SSR address header at the front of `data`:
/// 7 for IPv4, 19 for IPv6, `4 + len` for hostnames, else `def`.
pub fn get_head_size(data: &[u8], def: usize) -> usize {
    if data.len() < 2 {
        return def;
    }
    match data[0] & 0x7 {
        1 => 7,
        4 => 19,
        3 => 4 + data[1] as usize,
        _ => def,
    }
}

/// Protocol-slot plugin names, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Origin,
    VerifySimple,
    AuthSimple,
    AuthSha1,
    AuthSha1V2,
    AuthSha1V4,
    AuthAes128Md5,
    AuthAes128Sha1,
}

impl ProtocolKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "origin" => ProtocolKind::Origin,
            "verify_simple" => ProtocolKind::VerifySimple,
            "auth_simple" => ProtocolKind::AuthSimple,
            "auth_sha1" => ProtocolKind::AuthSha1,
            "auth_sha1_v2" => ProtocolKind::AuthSha1V2,
            "auth_sha1_v4" => ProtocolKind::AuthSha1V4,
            "auth_aes128_md5" => ProtocolKind::AuthAes128Md5,
            "auth_aes128_sha1" => ProtocolKind::AuthAes128Sha1,
            _ => return None,
        })
    }

    /// Family-wide shared state, created once per process.
    pub fn init_global(&self) -> Option<Rc<RefCell<PluginGlobal>>> {
        match self {
            ProtocolKind::Origin | ProtocolKind::VerifySimple => None,
            _ => Some(Rc::new(RefCell::new(PluginGlobal::Auth(AuthGlobal::new())))),
        }
    }

    /// Fresh plugin instance with empty local state.
    pub fn new_plugin(&self) -> Box<dyn Plugin> {
        match self {
            ProtocolKind::Origin => Box::new(PlainPlugin::new()),
            ProtocolKind::VerifySimple => Box::new(VerifySimple::new()),
            ProtocolKind::AuthSimple => Box::new(AuthSimple::new()),
            ProtocolKind::AuthSha1 => Box::new(AuthSha1::new()),
            ProtocolKind::AuthSha1V2 => Box::new(AuthSha1V2::new()),
            ProtocolKind::AuthSha1V4 => Box::new(AuthSha1V4::new()),
            ProtocolKind::AuthAes128Md5 => Box::new(AuthAes128::new(HashKind::Md5)),
            ProtocolKind::AuthAes128Sha1 => Box::new(AuthAes128::new(HashKind::Sha1)),
        }
    }
}

/// Obfs-slot plugin names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfsKind {
    Plain,
    HttpSimple,
    HttpPost,
    Tls12TicketAuth,
}

impl ObfsKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "plain" => ObfsKind::Plain,
            "http_simple" => ObfsKind::HttpSimple,
            "http_post" => ObfsKind::HttpPost,
            "tls1.2_ticket_auth" => ObfsKind::Tls12TicketAuth,
            _ => return None,
        })
    }

    pub fn init_global(&self) -> Option<Rc<RefCell<PluginGlobal>>> {
        match self {
            ObfsKind::Tls12TicketAuth => {
                Some(Rc::new(RefCell::new(PluginGlobal::Tls(TlsGlobal::new()))))
            }
            _ => None,
        }
    }

    pub fn new_plugin(&self) -> Box<dyn Plugin> {
        match self {
            ObfsKind::Plain => Box::new(PlainPlugin::new()),
            ObfsKind::HttpSimple => Box::new(HttpObfs::new(false)),
            ObfsKind::HttpPost => Box::new(HttpObfs::new(true)),
            ObfsKind::Tls12TicketAuth => Box::new(Tls12TicketAuth::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_name_resolution() {
        assert_eq!(
            ProtocolKind::from_name("auth_aes128_sha1"),
            Some(ProtocolKind::AuthAes128Sha1)
        );
        assert_eq!(ProtocolKind::from_name("origin"), Some(ProtocolKind::Origin));
        assert_eq!(ProtocolKind::from_name("bogus"), None);
        assert_eq!(
            ObfsKind::from_name("tls1.2_ticket_auth"),
            Some(ObfsKind::Tls12TicketAuth)
        );
        assert_eq!(ObfsKind::from_name("bogus"), None);
    }

    #[test]
    fn test_get_head_size() {
        assert_eq!(get_head_size(&[0x01, 0, 0, 0], 30), 7);
        assert_eq!(get_head_size(&[0x04, 0, 0, 0], 30), 19);
        assert_eq!(get_head_size(&[0x03, 11, b'e'], 30), 15);
        assert_eq!(get_head_size(&[0x07, 0], 30), 30);
        assert_eq!(get_head_size(&[], 30), 30);
    }

    #[test]
    fn test_auth_global_wraps_identity() {
        let mut global = AuthGlobal::new();
        global.connection_id = 0xFF00_0000;
        let old_id = global.client_id;
        global.bump();
        // Crossing the ceiling re-randomises the identity.
        assert!(global.connection_id <= 0xFFFFFF);
        // client_id is 8 random bytes; collision chance is negligible.
        assert_ne!(global.client_id, old_id);
    }

    #[test]
    fn test_auth_global_normal_bump() {
        let mut global = AuthGlobal::new();
        global.connection_id = 41;
        global.bump();
        assert_eq!(global.connection_id, 42);
    }
}
