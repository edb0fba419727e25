//! Legacy SSR protocol framings
//!
//! The pre-AES family: CRC32- and Adler32-sealed chunks with one-byte
//! (or escaped three-byte) padding markers. Layouts differ per
//! generation in header order and checksum, so each plugin keeps its
//! own pack/unpack pair; the receive loops share the same shape as the
//! auth_aes128 one (length window, rolling buffer, clear-on-failure).

use std::time::{SystemTime, UNIX_EPOCH};

use ssrlocal_core::Buffer;
use ssrlocal_crypto::digest::{check_adler32, check_crc32, crc32, fill_adler32, fill_crc32, hmac_sha1};
use ssrlocal_crypto::Xorshift128Plus;

use crate::auth_aes128::RECV_BUFFER_CAP;
use crate::{get_head_size, ObfsError, Plugin, Result, ServerInfo};

const PACK_UNIT_SIZE: usize = 2000;

/// Truncated HMAC-SHA1 length used by the auth_sha1 generations.
const HMAC_SHA1_TRUNC: usize = 10;

fn utc_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Pull the shared client/connection identity, bumping the
/// connection id.
fn bump_global(info: &ServerInfo) -> ([u8; 8], u32) {
    match &info.global {
        Some(global) => {
            let mut global = global.borrow_mut();
            let auth = global.as_auth_mut();
            auth.bump();
            (auth.client_id, auth.connection_id)
        }
        None => ([0u8; 8], 0),
    }
}

/// Common local state of the legacy plugins.
struct LegacyState {
    info: ServerInfo,
    rng: Xorshift128Plus,
    has_sent_header: bool,
    recv_buffer: Buffer,
}

impl LegacyState {
    fn new() -> Self {
        Self {
            info: ServerInfo::default(),
            rng: Xorshift128Plus::new(),
            has_sent_header: false,
            recv_buffer: Buffer::with_capacity(RECV_BUFFER_CAP),
        }
    }

    fn rng_fill(&mut self, out: &mut [u8]) {
        for byte in out.iter_mut() {
            *byte = self.rng.next() as u8;
        }
    }

    fn ingest(&mut self, data: &[u8]) -> Result<()> {
        if self.recv_buffer.len() + data.len() > RECV_BUFFER_CAP {
            self.recv_buffer.clear();
            return Err(ObfsError::RecvOverflow);
        }
        self.recv_buffer.concat(data);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// verify_simple
// ---------------------------------------------------------------------------

/// CRC32-sealed chunks, no client identity.
pub struct VerifySimple {
    state: LegacyState,
}

impl VerifySimple {
    pub fn new() -> Self {
        Self {
            state: LegacyState::new(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(seed: [u64; 2]) -> Self {
        let mut plugin = Self::new();
        plugin.state.rng = Xorshift128Plus::from_seed(seed);
        plugin
    }

    fn pack_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = (self.state.rng.next() & 0xF) as usize + 1;
        let out_size = rand_len + data.len() + 6;
        let mut chunk = vec![0u8; out_size - 4];
        chunk[0] = (out_size >> 8) as u8;
        chunk[1] = out_size as u8;
        chunk[2] = rand_len as u8;
        self.state.rng_fill(&mut chunk[3..2 + rand_len]);
        chunk[2 + rand_len..].copy_from_slice(data);
        fill_crc32(&mut chunk);
        out.extend_from_slice(&chunk);
    }
}

impl Default for VerifySimple {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for VerifySimple {
    fn set_server_info(&mut self, info: ServerInfo) {
        self.state.info = info;
    }

    fn client_pre_encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 64);
        let mut rest = data;
        while rest.len() > PACK_UNIT_SIZE {
            self.pack_data(&rest[..PACK_UNIT_SIZE], &mut out);
            rest = &rest[PACK_UNIT_SIZE..];
        }
        if !rest.is_empty() {
            self.pack_data(rest, &mut out);
        }
        Ok(out)
    }

    fn client_post_decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.state.ingest(data)?;
        let mut out = Vec::new();
        loop {
            let buf = self.state.recv_buffer.as_slice();
            if buf.len() <= 2 {
                break;
            }
            let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if !(7..8192).contains(&length) {
                self.state.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }
            if length > buf.len() {
                break;
            }
            if !check_crc32(&buf[..length]) {
                self.state.recv_buffer.clear();
                return Err(ObfsError::ChecksumMismatch);
            }
            let pos = 2 + buf[2] as usize;
            if pos + 4 > length {
                self.state.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }
            out.extend_from_slice(&buf[pos..length - 4]);
            self.state.recv_buffer.drain_front(length);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// auth_simple
// ---------------------------------------------------------------------------

/// verify_simple plus a first-chunk client identity prefix.
pub struct AuthSimple {
    state: LegacyState,
}

impl AuthSimple {
    pub fn new() -> Self {
        Self {
            state: LegacyState::new(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(seed: [u64; 2]) -> Self {
        let mut plugin = Self::new();
        plugin.state.rng = Xorshift128Plus::from_seed(seed);
        plugin
    }

    fn pack_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = (self.state.rng.next() & 0xF) as usize + 1;
        let out_size = rand_len + data.len() + 6;
        let mut chunk = vec![0u8; out_size - 4];
        chunk[0] = (out_size >> 8) as u8;
        chunk[1] = out_size as u8;
        chunk[2] = rand_len as u8;
        self.state.rng_fill(&mut chunk[3..2 + rand_len]);
        chunk[2 + rand_len..].copy_from_slice(data);
        fill_crc32(&mut chunk);
        out.extend_from_slice(&chunk);
    }

    fn pack_auth_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = (self.state.rng.next() & 0xF) as usize + 1;
        let out_size = rand_len + data.len() + 6 + 12;
        let mut chunk = vec![0u8; out_size - 4];
        chunk[0] = (out_size >> 8) as u8;
        chunk[1] = out_size as u8;
        chunk[2] = rand_len as u8;
        self.state.rng_fill(&mut chunk[3..2 + rand_len]);
        let (client_id, connection_id) = bump_global(&self.state.info);
        let base = 2 + rand_len;
        chunk[base..base + 4].copy_from_slice(&utc_now().to_le_bytes());
        chunk[base + 4..base + 8].copy_from_slice(&client_id[..4]);
        chunk[base + 8..base + 12].copy_from_slice(&connection_id.to_le_bytes());
        chunk[base + 12..].copy_from_slice(data);
        fill_crc32(&mut chunk);
        out.extend_from_slice(&chunk);
    }
}

impl Default for AuthSimple {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for AuthSimple {
    fn set_server_info(&mut self, info: ServerInfo) {
        self.state.info = info;
    }

    fn client_pre_encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 128);
        let mut rest = data;
        if !rest.is_empty() && !self.state.has_sent_header {
            let head_size = get_head_size(rest, 30).min(rest.len());
            let head = rest[..head_size].to_vec();
            self.pack_auth_data(&head, &mut out);
            rest = &rest[head_size..];
            self.state.has_sent_header = true;
        }
        while rest.len() > PACK_UNIT_SIZE {
            self.pack_data(&rest[..PACK_UNIT_SIZE], &mut out);
            rest = &rest[PACK_UNIT_SIZE..];
        }
        if !rest.is_empty() {
            self.pack_data(rest, &mut out);
        }
        Ok(out)
    }

    fn client_post_decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.state.ingest(data)?;
        let mut out = Vec::new();
        loop {
            let buf = self.state.recv_buffer.as_slice();
            if buf.len() <= 2 {
                break;
            }
            let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if !(7..8192).contains(&length) {
                self.state.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }
            if length > buf.len() {
                break;
            }
            if !check_crc32(&buf[..length]) {
                self.state.recv_buffer.clear();
                return Err(ObfsError::ChecksumMismatch);
            }
            let pos = 2 + buf[2] as usize;
            if pos + 4 > length {
                self.state.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }
            out.extend_from_slice(&buf[pos..length - 4]);
            self.state.recv_buffer.drain_front(length);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// auth_sha1
// ---------------------------------------------------------------------------

/// Adler32-sealed chunks; auth chunk sealed by truncated HMAC-SHA1
/// keyed with iv ∥ key.
pub struct AuthSha1 {
    state: LegacyState,
}

impl AuthSha1 {
    pub fn new() -> Self {
        Self {
            state: LegacyState::new(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(seed: [u64; 2]) -> Self {
        let mut plugin = Self::new();
        plugin.state.rng = Xorshift128Plus::from_seed(seed);
        plugin
    }

    fn pack_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = (self.state.rng.next() & 0xF) as usize + 1;
        let out_size = rand_len + data.len() + 6;
        let mut chunk = vec![0u8; out_size - 4];
        chunk[0] = (out_size >> 8) as u8;
        chunk[1] = out_size as u8;
        chunk[2] = rand_len as u8;
        self.state.rng_fill(&mut chunk[3..2 + rand_len]);
        chunk[2 + rand_len..].copy_from_slice(data);
        fill_adler32(&mut chunk);
        out.extend_from_slice(&chunk);
    }

    fn pack_auth_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = (self.state.rng.next() & 0x7F) as usize + 1;
        let data_offset = rand_len + 4 + 2;
        let out_size = data_offset + data.len() + 12 + HMAC_SHA1_TRUNC;
        let mut chunk = vec![0u8; out_size];
        chunk[..4].copy_from_slice(&crc32(&self.state.info.key).to_le_bytes());
        chunk[4] = (out_size >> 8) as u8;
        chunk[5] = out_size as u8;
        chunk[6] = rand_len as u8;
        self.state.rng_fill(&mut chunk[7..6 + rand_len]);
        let (client_id, connection_id) = bump_global(&self.state.info);
        chunk[data_offset..data_offset + 4].copy_from_slice(&utc_now().to_le_bytes());
        chunk[data_offset + 4..data_offset + 8].copy_from_slice(&client_id[..4]);
        chunk[data_offset + 8..data_offset + 12].copy_from_slice(&connection_id.to_le_bytes());
        chunk[data_offset + 12..data_offset + 12 + data.len()].copy_from_slice(data);
        let mut hmac_key = self.state.info.iv.clone();
        hmac_key.extend_from_slice(&self.state.info.key);
        let tag = hmac_sha1(&hmac_key, &chunk[..out_size - HMAC_SHA1_TRUNC]);
        chunk[out_size - HMAC_SHA1_TRUNC..].copy_from_slice(&tag[..HMAC_SHA1_TRUNC]);
        out.extend_from_slice(&chunk);
    }
}

impl Default for AuthSha1 {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for AuthSha1 {
    fn set_server_info(&mut self, info: ServerInfo) {
        self.state.info = info;
    }

    fn client_pre_encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 256);
        let mut rest = data;
        if !rest.is_empty() && !self.state.has_sent_header {
            let head_size = get_head_size(rest, 30).min(rest.len());
            let head = rest[..head_size].to_vec();
            self.pack_auth_data(&head, &mut out);
            rest = &rest[head_size..];
            self.state.has_sent_header = true;
        }
        while rest.len() > PACK_UNIT_SIZE {
            self.pack_data(&rest[..PACK_UNIT_SIZE], &mut out);
            rest = &rest[PACK_UNIT_SIZE..];
        }
        if !rest.is_empty() {
            self.pack_data(rest, &mut out);
        }
        Ok(out)
    }

    fn client_post_decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.state.ingest(data)?;
        let mut out = Vec::new();
        loop {
            let buf = self.state.recv_buffer.as_slice();
            if buf.len() <= 2 {
                break;
            }
            let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if !(7..8192).contains(&length) {
                self.state.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }
            if length > buf.len() {
                break;
            }
            if !check_adler32(&buf[..length]) {
                self.state.recv_buffer.clear();
                return Err(ObfsError::ChecksumMismatch);
            }
            let pos = buf[2] as usize + 2;
            if pos + 4 > length {
                self.state.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }
            out.extend_from_slice(&buf[pos..length - 4]);
            self.state.recv_buffer.drain_front(length);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// auth_sha1_v2
// ---------------------------------------------------------------------------

/// auth_sha1 with size-scaled padding and an escaped padding marker.
pub struct AuthSha1V2 {
    state: LegacyState,
}

impl AuthSha1V2 {
    pub fn new() -> Self {
        Self {
            state: LegacyState::new(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(seed: [u64; 2]) -> Self {
        let mut plugin = Self::new();
        plugin.state.rng = Xorshift128Plus::from_seed(seed);
        plugin
    }

    fn draw_rand_len(&mut self, data_len: usize) -> usize {
        let draw = if data_len > 1300 {
            0
        } else if data_len > 400 {
            self.state.rng.next() & 0x7F
        } else {
            self.state.rng.next() & 0x3FF
        };
        draw as usize + 1
    }

    fn pack_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = self.draw_rand_len(data.len());
        let out_size = rand_len + data.len() + 6;
        let mut chunk = vec![0u8; out_size - 4];
        chunk[0] = (out_size >> 8) as u8;
        chunk[1] = out_size as u8;
        self.state.rng_fill(&mut chunk[2..2 + rand_len]);
        if rand_len < 128 {
            chunk[2] = rand_len as u8;
        } else {
            chunk[2] = 0xFF;
            chunk[3] = (rand_len >> 8) as u8;
            chunk[4] = rand_len as u8;
        }
        chunk[2 + rand_len..].copy_from_slice(data);
        fill_adler32(&mut chunk);
        out.extend_from_slice(&chunk);
    }

    fn pack_auth_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = self.draw_rand_len(data.len());
        let data_offset = rand_len + 4 + 2;
        let out_size = data_offset + data.len() + 12 + HMAC_SHA1_TRUNC;
        let mut chunk = vec![0u8; out_size];

        let mut crc_salt = b"auth_sha1_v2".to_vec();
        crc_salt.extend_from_slice(&self.state.info.key);
        chunk[..4].copy_from_slice(&crc32(&crc_salt).to_le_bytes());
        chunk[4] = (out_size >> 8) as u8;
        chunk[5] = out_size as u8;
        self.state.rng_fill(&mut chunk[6..6 + rand_len]);
        if rand_len < 128 {
            chunk[6] = rand_len as u8;
        } else {
            chunk[6] = 0xFF;
            chunk[7] = (rand_len >> 8) as u8;
            chunk[8] = rand_len as u8;
        }
        let (client_id, connection_id) = bump_global(&self.state.info);
        chunk[data_offset..data_offset + 8].copy_from_slice(&client_id);
        chunk[data_offset + 8..data_offset + 12].copy_from_slice(&connection_id.to_le_bytes());
        chunk[data_offset + 12..data_offset + 12 + data.len()].copy_from_slice(data);
        let mut hmac_key = self.state.info.iv.clone();
        hmac_key.extend_from_slice(&self.state.info.key);
        let tag = hmac_sha1(&hmac_key, &chunk[..out_size - HMAC_SHA1_TRUNC]);
        chunk[out_size - HMAC_SHA1_TRUNC..].copy_from_slice(&tag[..HMAC_SHA1_TRUNC]);
        out.extend_from_slice(&chunk);
    }
}

impl Default for AuthSha1V2 {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for AuthSha1V2 {
    fn set_server_info(&mut self, info: ServerInfo) {
        self.state.info = info;
    }

    fn client_pre_encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 512);
        let mut rest = data;
        if !rest.is_empty() && !self.state.has_sent_header {
            let head_size = get_head_size(rest, 30).min(rest.len());
            let head = rest[..head_size].to_vec();
            self.pack_auth_data(&head, &mut out);
            rest = &rest[head_size..];
            self.state.has_sent_header = true;
        }
        while rest.len() > PACK_UNIT_SIZE {
            self.pack_data(&rest[..PACK_UNIT_SIZE], &mut out);
            rest = &rest[PACK_UNIT_SIZE..];
        }
        if !rest.is_empty() {
            self.pack_data(rest, &mut out);
        }
        Ok(out)
    }

    fn client_post_decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.state.ingest(data)?;
        let mut out = Vec::new();
        loop {
            let buf = self.state.recv_buffer.as_slice();
            if buf.len() <= 2 {
                break;
            }
            let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if !(7..8192).contains(&length) {
                self.state.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }
            if length > buf.len() {
                break;
            }
            if !check_adler32(&buf[..length]) {
                self.state.recv_buffer.clear();
                return Err(ObfsError::ChecksumMismatch);
            }
            let pos = if buf[2] < 255 {
                buf[2] as usize + 2
            } else {
                ((buf[3] as usize) << 8 | buf[4] as usize) + 2
            };
            if pos + 4 > length {
                self.state.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }
            out.extend_from_slice(&buf[pos..length - 4]);
            self.state.recv_buffer.drain_front(length);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// auth_sha1_v4
// ---------------------------------------------------------------------------

/// v2 with a CRC16 guard over the length bytes so a corrupted length
/// cannot desynchronise the stream.
pub struct AuthSha1V4 {
    state: LegacyState,
}

impl AuthSha1V4 {
    pub fn new() -> Self {
        Self {
            state: LegacyState::new(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(seed: [u64; 2]) -> Self {
        let mut plugin = Self::new();
        plugin.state.rng = Xorshift128Plus::from_seed(seed);
        plugin
    }

    fn draw_rand_len(&mut self, data_len: usize) -> usize {
        let draw = if data_len > 1300 {
            0
        } else if data_len > 400 {
            self.state.rng.next() & 0x7F
        } else {
            self.state.rng.next() & 0x3FF
        };
        draw as usize + 1
    }

    fn pack_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = self.draw_rand_len(data.len());
        let out_size = rand_len + data.len() + 8;
        let mut chunk = vec![0u8; out_size - 4];
        chunk[0] = (out_size >> 8) as u8;
        chunk[1] = out_size as u8;
        let crc = crc32(&chunk[..2]);
        chunk[2] = crc as u8;
        chunk[3] = (crc >> 8) as u8;
        self.state.rng_fill(&mut chunk[4..4 + rand_len]);
        if rand_len < 128 {
            chunk[4] = rand_len as u8;
        } else {
            chunk[4] = 0xFF;
            chunk[5] = (rand_len >> 8) as u8;
            chunk[6] = rand_len as u8;
        }
        chunk[4 + rand_len..].copy_from_slice(data);
        fill_adler32(&mut chunk);
        out.extend_from_slice(&chunk);
    }

    fn pack_auth_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = self.draw_rand_len(data.len());
        let data_offset = rand_len + 4 + 2;
        let out_size = data_offset + data.len() + 12 + HMAC_SHA1_TRUNC;
        let mut chunk = vec![0u8; out_size];
        chunk[0] = (out_size >> 8) as u8;
        chunk[1] = out_size as u8;
        let mut crc_salt = chunk[..2].to_vec();
        crc_salt.extend_from_slice(b"auth_sha1_v4");
        crc_salt.extend_from_slice(&self.state.info.key);
        chunk[2..6].copy_from_slice(&crc32(&crc_salt).to_le_bytes());
        self.state.rng_fill(&mut chunk[6..6 + rand_len]);
        if rand_len < 128 {
            chunk[6] = rand_len as u8;
        } else {
            chunk[6] = 0xFF;
            chunk[7] = (rand_len >> 8) as u8;
            chunk[8] = rand_len as u8;
        }
        let (client_id, connection_id) = bump_global(&self.state.info);
        chunk[data_offset..data_offset + 4].copy_from_slice(&utc_now().to_le_bytes());
        chunk[data_offset + 4..data_offset + 8].copy_from_slice(&client_id[..4]);
        chunk[data_offset + 8..data_offset + 12].copy_from_slice(&connection_id.to_le_bytes());
        chunk[data_offset + 12..data_offset + 12 + data.len()].copy_from_slice(data);
        let mut hmac_key = self.state.info.iv.clone();
        hmac_key.extend_from_slice(&self.state.info.key);
        let tag = hmac_sha1(&hmac_key, &chunk[..out_size - HMAC_SHA1_TRUNC]);
        chunk[out_size - HMAC_SHA1_TRUNC..].copy_from_slice(&tag[..HMAC_SHA1_TRUNC]);
        out.extend_from_slice(&chunk);
    }
}

impl Default for AuthSha1V4 {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for AuthSha1V4 {
    fn set_server_info(&mut self, info: ServerInfo) {
        self.state.info = info;
    }

    fn client_pre_encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 512);
        let mut rest = data;
        if !rest.is_empty() && !self.state.has_sent_header {
            let head_size = get_head_size(rest, 30).min(rest.len());
            let head = rest[..head_size].to_vec();
            self.pack_auth_data(&head, &mut out);
            rest = &rest[head_size..];
            self.state.has_sent_header = true;
        }
        while rest.len() > PACK_UNIT_SIZE {
            self.pack_data(&rest[..PACK_UNIT_SIZE], &mut out);
            rest = &rest[PACK_UNIT_SIZE..];
        }
        if !rest.is_empty() {
            self.pack_data(rest, &mut out);
        }
        Ok(out)
    }

    fn client_post_decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.state.ingest(data)?;
        let mut out = Vec::new();
        loop {
            let buf = self.state.recv_buffer.as_slice();
            if buf.len() <= 4 {
                break;
            }
            let crc = crc32(&buf[..2]);
            if ((buf[3] as u32) << 8 | buf[2] as u32) != (crc & 0xFFFF) {
                self.state.recv_buffer.clear();
                return Err(ObfsError::ChecksumMismatch);
            }
            let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if !(7..8192).contains(&length) {
                self.state.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }
            if length > buf.len() {
                break;
            }
            if !check_adler32(&buf[..length]) {
                self.state.recv_buffer.clear();
                return Err(ObfsError::ChecksumMismatch);
            }
            let pos = if buf[4] < 255 {
                buf[4] as usize + 4
            } else {
                ((buf[5] as usize) << 8 | buf[6] as usize) + 4
            };
            if pos + 4 > length {
                self.state.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }
            out.extend_from_slice(&buf[pos..length - 4]);
            self.state.recv_buffer.drain_front(length);
        }
        Ok(out)
    }
}
