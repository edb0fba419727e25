//! Stream-cipher layer
//!
//! Symmetric encrypt/decrypt for the tunnel body. The key is derived
//! from the password EVP-style; each direction owns a context whose IV
//! is generated fresh (egress, prepended to the first payload) or
//! consumed from the stream (ingress, checked against a replay cache).

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::{ChaCha20, ChaCha20Legacy};
use rand::RngCore;
use rc4::consts::U16;
use rc4::{KeyInit, Rc4};
use thiserror::Error;

use crate::digest::{bytes_to_key, md5};

/// Ingress IVs remembered for replay detection.
const IV_CACHE_CAP: usize = 256;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("unknown cipher method: {0}")]
    UnknownMethod(String),

    #[error("invalid key or IV length")]
    InvalidKey,

    #[error("repeated initialization vector")]
    RepeatedIv,
}

/// Supported stream ciphers and their key/IV geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    None,
    Rc4,
    Rc4Md5,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    ChaCha20,
    ChaCha20Ietf,
}

impl CipherKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "none" => CipherKind::None,
            "rc4" => CipherKind::Rc4,
            "rc4-md5" => CipherKind::Rc4Md5,
            "aes-128-cfb" => CipherKind::Aes128Cfb,
            "aes-192-cfb" => CipherKind::Aes192Cfb,
            "aes-256-cfb" => CipherKind::Aes256Cfb,
            "chacha20" => CipherKind::ChaCha20,
            "chacha20-ietf" => CipherKind::ChaCha20Ietf,
            _ => return None,
        })
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherKind::None | CipherKind::Rc4 | CipherKind::Rc4Md5 | CipherKind::Aes128Cfb => 16,
            CipherKind::Aes192Cfb => 24,
            CipherKind::Aes256Cfb | CipherKind::ChaCha20 | CipherKind::ChaCha20Ietf => 32,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            CipherKind::None | CipherKind::Rc4 => 0,
            CipherKind::ChaCha20 => 8,
            CipherKind::ChaCha20Ietf => 12,
            CipherKind::Rc4Md5 | CipherKind::Aes128Cfb | CipherKind::Aes192Cfb
            | CipherKind::Aes256Cfb => 16,
        }
    }
}

/// Process-wide cipher state: the key schedule and the IV replay cache.
#[derive(Debug)]
pub struct CipherEnv {
    kind: CipherKind,
    key: Vec<u8>,
    iv_cache: RefCell<IvCache>,
}

impl CipherEnv {
    pub fn new(password: &str, method: &str) -> Result<Self, CipherError> {
        let kind = CipherKind::from_name(method)
            .ok_or_else(|| CipherError::UnknownMethod(method.to_string()))?;
        Ok(Self {
            kind,
            key: bytes_to_key(password.as_bytes(), kind.key_len()),
            iv_cache: RefCell::new(IvCache::new(IV_CACHE_CAP)),
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv_len(&self) -> usize {
        self.kind.iv_len()
    }

    /// Record an ingress IV; `false` means it was seen before.
    fn register_iv(&self, iv: &[u8]) -> bool {
        self.iv_cache.borrow_mut().insert(iv)
    }
}

#[derive(Debug)]
struct IvCache {
    seen: HashSet<Vec<u8>>,
    order: VecDeque<Vec<u8>>,
    cap: usize,
}

impl IvCache {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn insert(&mut self, iv: &[u8]) -> bool {
        if iv.is_empty() {
            return true;
        }
        if !self.seen.insert(iv.to_vec()) {
            return false;
        }
        self.order.push_back(iv.to_vec());
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

enum CipherImpl {
    Rc4(Rc4<U16>),
    Aes128Enc(BufEncryptor<Aes128>),
    Aes128Dec(BufDecryptor<Aes128>),
    Aes192Enc(BufEncryptor<Aes192>),
    Aes192Dec(BufDecryptor<Aes192>),
    Aes256Enc(BufEncryptor<Aes256>),
    Aes256Dec(BufDecryptor<Aes256>),
    ChaCha20Legacy(ChaCha20Legacy),
    ChaCha20Ietf(ChaCha20),
}

impl CipherImpl {
    fn new(
        kind: CipherKind,
        key: &[u8],
        iv: &[u8],
        encrypt: bool,
    ) -> Result<Option<Self>, CipherError> {
        let cipher = match kind {
            CipherKind::None => return Ok(None),
            CipherKind::Rc4 => Self::Rc4(Rc4::new_from_slice(key).map_err(|_| CipherError::InvalidKey)?),
            CipherKind::Rc4Md5 => {
                // Effective RC4 key is MD5(key ∥ iv).
                let mut seed = Vec::with_capacity(key.len() + iv.len());
                seed.extend_from_slice(key);
                seed.extend_from_slice(iv);
                Self::Rc4(Rc4::new_from_slice(&md5(&seed)).map_err(|_| CipherError::InvalidKey)?)
            }
            CipherKind::Aes128Cfb => {
                if encrypt {
                    Self::Aes128Enc(
                        BufEncryptor::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKey)?,
                    )
                } else {
                    Self::Aes128Dec(
                        BufDecryptor::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKey)?,
                    )
                }
            }
            CipherKind::Aes192Cfb => {
                if encrypt {
                    Self::Aes192Enc(
                        BufEncryptor::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKey)?,
                    )
                } else {
                    Self::Aes192Dec(
                        BufDecryptor::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKey)?,
                    )
                }
            }
            CipherKind::Aes256Cfb => {
                if encrypt {
                    Self::Aes256Enc(
                        BufEncryptor::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKey)?,
                    )
                } else {
                    Self::Aes256Dec(
                        BufDecryptor::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKey)?,
                    )
                }
            }
            CipherKind::ChaCha20 => Self::ChaCha20Legacy(
                ChaCha20Legacy::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKey)?,
            ),
            CipherKind::ChaCha20Ietf => Self::ChaCha20Ietf(
                ChaCha20::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKey)?,
            ),
        };
        Ok(Some(cipher))
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CipherImpl::Rc4(c) => rc4::StreamCipher::apply_keystream(c, data),
            CipherImpl::Aes128Enc(c) => c.encrypt(data),
            CipherImpl::Aes128Dec(c) => c.decrypt(data),
            CipherImpl::Aes192Enc(c) => c.encrypt(data),
            CipherImpl::Aes192Dec(c) => c.decrypt(data),
            CipherImpl::Aes256Enc(c) => c.encrypt(data),
            CipherImpl::Aes256Dec(c) => c.decrypt(data),
            CipherImpl::ChaCha20Legacy(c) => c.apply_keystream(data),
            CipherImpl::ChaCha20Ietf(c) => c.apply_keystream(data),
        }
    }
}

/// One direction of a tunnel's symmetric transform.
pub struct CipherCtx {
    env: Rc<CipherEnv>,
    encrypt: bool,
    iv: Vec<u8>,
    /// Ingress IV bytes collected so far (first packet may fragment).
    pending_iv: Vec<u8>,
    cipher: Option<CipherImpl>,
    started: bool,
}

impl CipherCtx {
    /// Egress context. The IV is generated immediately so the framing
    /// plugins can key their auth chunks with it; it is prepended to
    /// the first encrypted payload.
    pub fn new_encrypt(env: Rc<CipherEnv>) -> Self {
        let mut iv = vec![0u8; env.iv_len()];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        Self {
            env,
            encrypt: true,
            iv,
            pending_iv: Vec::new(),
            cipher: None,
            started: false,
        }
    }

    /// Ingress context; the IV arrives as the first bytes of the
    /// stream.
    pub fn new_decrypt(env: Rc<CipherEnv>) -> Self {
        Self {
            env,
            encrypt: false,
            iv: Vec::new(),
            pending_iv: Vec::new(),
            cipher: None,
            started: false,
        }
    }

    /// The egress IV handed to the framing plugins.
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Encrypt in place; the first call prepends the IV.
    pub fn encrypt(&mut self, data: &mut Vec<u8>) -> Result<(), CipherError> {
        debug_assert!(self.encrypt);
        if self.env.kind() == CipherKind::None {
            return Ok(());
        }
        let first = !self.started;
        if first {
            self.cipher = CipherImpl::new(self.env.kind(), self.env.key(), &self.iv, true)?;
            self.started = true;
        }
        if let Some(cipher) = &mut self.cipher {
            cipher.apply(data);
        }
        if first && !self.iv.is_empty() {
            let mut out = Vec::with_capacity(self.iv.len() + data.len());
            out.extend_from_slice(&self.iv);
            out.append(data);
            *data = out;
        }
        Ok(())
    }

    /// Decrypt in place; the first `iv_len` stream bytes are taken as
    /// the IV (across fragmented reads) and replay-checked.
    pub fn decrypt(&mut self, data: &mut Vec<u8>) -> Result<(), CipherError> {
        debug_assert!(!self.encrypt);
        if self.env.kind() == CipherKind::None {
            return Ok(());
        }
        if !self.started {
            let iv_len = self.env.iv_len();
            let need = iv_len - self.pending_iv.len();
            let take = need.min(data.len());
            self.pending_iv.extend_from_slice(&data[..take]);
            data.drain(..take);
            if self.pending_iv.len() < iv_len {
                return Ok(()); // still waiting for the rest of the IV
            }
            if !self.env.register_iv(&self.pending_iv) {
                return Err(CipherError::RepeatedIv);
            }
            self.iv = std::mem::take(&mut self.pending_iv);
            self.cipher = CipherImpl::new(self.env.kind(), self.env.key(), &self.iv, false)?;
            self.started = true;
        }
        if let Some(cipher) = &mut self.cipher {
            cipher.apply(data);
        }
        Ok(())
    }
}
