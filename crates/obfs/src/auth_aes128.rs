//! auth_aes128_sha1 / auth_aes128_md5 protocol framing
//!
//! Every chunk is length-prefixed (little-endian), padded with a
//! random-length filler and sealed by two truncated HMACs keyed with
//! `user_key ∥ packet counter`: a 2-byte tag over the length bytes and
//! a 4-byte tag over the rest of the chunk. The first chunk carries an
//! AES-encrypted auth block identifying the user and connection.
//! The two variants differ only in digest (MD5 vs SHA1) and salt.

use std::time::{SystemTime, UNIX_EPOCH};

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use ssrlocal_core::Buffer;
use ssrlocal_crypto::digest::{bytes_to_key, HashKind};
use ssrlocal_crypto::Xorshift128Plus;

use crate::{ObfsError, Plugin, Result, ServerInfo};

/// Rolling receive buffer hard cap shared by every framing plugin.
pub(crate) const RECV_BUFFER_CAP: usize = 16384;

/// Payload bytes per non-initial chunk.
const PACK_UNIT_SIZE: usize = 2000;

/// Auth chunk carries at most this much payload.
const AUTH_HEAD_MAX: usize = 1200;

pub struct AuthAes128 {
    hash: HashKind,
    salt: &'static str,
    info: ServerInfo,
    rng: Xorshift128Plus,
    has_sent_header: bool,
    recv_buffer: Buffer,
    recv_id: u32,
    pack_id: u32,
    user_key: Vec<u8>,
    uid: [u8; 4],
    last_data_len: usize,
}

impl AuthAes128 {
    pub fn new(hash: HashKind) -> Self {
        Self {
            hash,
            salt: match hash {
                HashKind::Md5 => "auth_aes128_md5",
                HashKind::Sha1 => "auth_aes128_sha1",
            },
            info: ServerInfo::default(),
            rng: Xorshift128Plus::new(),
            has_sent_header: false,
            recv_buffer: Buffer::with_capacity(RECV_BUFFER_CAP),
            recv_id: 1,
            pack_id: 1,
            user_key: Vec::new(),
            uid: [0u8; 4],
            last_data_len: 0,
        }
    }

    /// Deterministic padding lengths for the framing tests.
    #[cfg(test)]
    pub fn with_seed(hash: HashKind, seed: [u64; 2]) -> Self {
        let mut plugin = Self::new(hash);
        plugin.rng = Xorshift128Plus::from_seed(seed);
        plugin
    }

    /// `protocol_param` of the form `"uid:key"` selects a per-user
    /// identity; otherwise the uid is random and the server key
    /// doubles as the user key.
    fn derive_user_key(&mut self) {
        if let Some((uid_str, key_str)) = self.info.param.split_once(':') {
            let uid: u32 = uid_str.trim().parse().unwrap_or(0);
            self.uid = uid.to_le_bytes();
            self.user_key = self.hash.digest(key_str.as_bytes());
        } else {
            let mut uid = [0u8; 4];
            self.rng_fill(&mut uid);
            self.uid = uid;
            self.user_key = self.info.key.clone();
        }
    }

    fn rng_fill(&mut self, out: &mut [u8]) {
        for byte in out.iter_mut() {
            *byte = self.rng.next() as u8;
        }
    }

    fn chunk_key(&self, counter: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.user_key.len() + 4);
        key.extend_from_slice(&self.user_key);
        key.extend_from_slice(&counter.to_le_bytes());
        key
    }

    /// Padding tier: big payloads get little or no filler.
    fn rand_len(&mut self, data_len: usize, full_len: usize) -> usize {
        if data_len > 1300 || self.last_data_len > 1300 || full_len >= self.info.buffer_size {
            return 0;
        }
        let draw = self.rng.next();
        if data_len > 1100 {
            (draw & 0x7F) as usize
        } else if data_len > 900 {
            (draw & 0xFF) as usize
        } else if data_len > 400 {
            (draw & 0x1FF) as usize
        } else {
            (draw & 0x3FF) as usize
        }
    }

    fn pack_data(&mut self, data: &[u8], full_len: usize, out: &mut Vec<u8>) {
        let rand_len = self.rand_len(data.len(), full_len) + 1;
        let out_size = rand_len + data.len() + 8;
        let mut chunk = vec![0u8; out_size];

        chunk[0] = out_size as u8;
        chunk[1] = (out_size >> 8) as u8;

        let key = self.chunk_key(self.pack_id);
        let hmac2 = self.hash.hmac(&key, &chunk[..2]);
        chunk[2..4].copy_from_slice(&hmac2[..2]);

        self.rng_fill(&mut chunk[4..4 + rand_len]);
        if rand_len < 128 {
            chunk[4] = rand_len as u8;
        } else {
            chunk[4] = 0xFF;
            chunk[5] = rand_len as u8;
            chunk[6] = (rand_len >> 8) as u8;
        }
        chunk[4 + rand_len..4 + rand_len + data.len()].copy_from_slice(data);
        self.pack_id = self.pack_id.wrapping_add(1);

        let hmac4 = self.hash.hmac(&key, &chunk[..out_size - 4]);
        chunk[out_size - 4..].copy_from_slice(&hmac4[..4]);

        out.extend_from_slice(&chunk);
    }

    fn pack_auth_data(&mut self, data: &[u8], out: &mut Vec<u8>) {
        let rand_len = if data.len() > 400 {
            (self.rng.next() & 0x1FF) as usize
        } else {
            (self.rng.next() & 0x3FF) as usize
        };
        let data_offset = rand_len + 16 + 4 + 4 + 7;
        let out_size = data_offset + data.len() + 4;
        let mut chunk = vec![0u8; out_size];

        // Header HMACs are keyed with iv ∥ key.
        let mut header_key = Vec::with_capacity(self.info.iv.len() + self.info.key.len());
        header_key.extend_from_slice(&self.info.iv);
        header_key.extend_from_slice(&self.info.key);

        self.rng_fill(&mut chunk[data_offset - rand_len..data_offset]);

        let (client_id, connection_id) = match &self.info.global {
            Some(global) => {
                let mut global = global.borrow_mut();
                let auth = global.as_auth_mut();
                auth.bump();
                let mut id = [0u8; 4];
                id.copy_from_slice(&auth.client_id[..4]);
                (id, auth.connection_id)
            }
            None => ([0u8; 4], 0),
        };

        let utc = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let mut block = [0u8; 16];
        block[..4].copy_from_slice(&utc.to_le_bytes());
        block[4..8].copy_from_slice(&client_id);
        block[8..12].copy_from_slice(&connection_id.to_le_bytes());
        block[12..14].copy_from_slice(&(out_size as u16).to_le_bytes());
        block[14..16].copy_from_slice(&(rand_len as u16).to_le_bytes());

        // enc_key = EVP_BytesToKey(base64(user_key) ∥ salt), 16 bytes.
        // AES-128-CBC with a zero IV over a single block degenerates
        // to one raw block encryption.
        let mut key_material = BASE64.encode(&self.user_key).into_bytes();
        key_material.extend_from_slice(self.salt.as_bytes());
        let enc_key = bytes_to_key(&key_material, 16);
        let aes = Aes128::new_from_slice(&enc_key).expect("derived key is 16 bytes");
        let mut enc_block = aes::Block::from(block);
        aes.encrypt_block(&mut enc_block);

        let mut auth_block = [0u8; 24];
        auth_block[..4].copy_from_slice(&self.uid);
        auth_block[4..20].copy_from_slice(&enc_block);
        let tag = self.hash.hmac(&header_key, &auth_block[..20]);
        auth_block[20..24].copy_from_slice(&tag[..4]);

        chunk[0] = self.rng.next() as u8;
        let head_tag = self.hash.hmac(&header_key, &chunk[..1]);
        chunk[1..7].copy_from_slice(&head_tag[..6]);
        chunk[7..31].copy_from_slice(&auth_block);
        chunk[data_offset..data_offset + data.len()].copy_from_slice(data);

        let trailer = self.hash.hmac(&self.user_key, &chunk[..out_size - 4]);
        chunk[out_size - 4..].copy_from_slice(&trailer[..4]);

        out.extend_from_slice(&chunk);
    }
}

impl Plugin for AuthAes128 {
    fn set_server_info(&mut self, info: ServerInfo) {
        self.info = info;
        self.derive_user_key();
    }

    fn overhead(&self) -> usize {
        9
    }

    fn client_pre_encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let full_len = data.len();
        let mut out = Vec::with_capacity(data.len() + 1024);
        let mut rest = data;

        if !rest.is_empty() && !self.has_sent_header {
            let head_size = AUTH_HEAD_MAX.min(rest.len());
            let head = rest[..head_size].to_vec();
            self.pack_auth_data(&head, &mut out);
            rest = &rest[head_size..];
            self.has_sent_header = true;
        }
        while rest.len() > PACK_UNIT_SIZE {
            self.pack_data(&rest[..PACK_UNIT_SIZE], full_len, &mut out);
            rest = &rest[PACK_UNIT_SIZE..];
        }
        if !rest.is_empty() {
            self.pack_data(rest, full_len, &mut out);
        }
        self.last_data_len = full_len;
        Ok(out)
    }

    fn client_post_decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.recv_buffer.len() + data.len() > RECV_BUFFER_CAP {
            self.recv_buffer.clear();
            return Err(ObfsError::RecvOverflow);
        }
        self.recv_buffer.concat(data);

        let hash = self.hash;
        let mut out = Vec::new();
        loop {
            if self.recv_buffer.len() <= 4 {
                break;
            }
            let key = self.chunk_key(self.recv_id);
            let buf = self.recv_buffer.as_slice();

            let hmac2 = hash.hmac(&key, &buf[..2]);
            if hmac2[..2] != buf[2..4] {
                self.recv_buffer.clear();
                return Err(ObfsError::HmacMismatch);
            }

            let length = u16::from_le_bytes([buf[0], buf[1]]) as usize;
            if !(8..8192).contains(&length) {
                self.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }
            if length > buf.len() {
                break; // need more data
            }

            let hmac4 = hash.hmac(&key, &buf[..length - 4]);
            if hmac4[..4] != buf[length - 4..length] {
                self.recv_buffer.clear();
                return Err(ObfsError::HmacMismatch);
            }

            let pos = if buf[4] < 255 {
                buf[4] as usize + 4
            } else {
                u16::from_le_bytes([buf[5], buf[6]]) as usize + 4
            };
            if pos + 4 > length {
                self.recv_buffer.clear();
                return Err(ObfsError::BadLength(length));
            }

            self.recv_id = self.recv_id.wrapping_add(1);
            out.extend_from_slice(&buf[pos..length - 4]);
            self.recv_buffer.drain_front(length);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthGlobal, PluginGlobal};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn server_info() -> ServerInfo {
        let mut info = ServerInfo::new("203.0.113.1", 8388);
        info.key = vec![0x11; 32];
        info.iv = vec![0x22; 16];
        info.global = Some(Rc::new(RefCell::new(PluginGlobal::Auth(AuthGlobal::new()))));
        info
    }

    /// Sender framed as data-only (auth chunk already out) and a fresh
    /// receiver, both on the default user key.
    fn data_pair(hash: HashKind) -> (AuthAes128, AuthAes128) {
        let mut sender = AuthAes128::with_seed(hash, [7, 9]);
        sender.set_server_info(server_info());
        sender.has_sent_header = true;
        let mut receiver = AuthAes128::with_seed(hash, [5, 3]);
        receiver.set_server_info(server_info());
        (sender, receiver)
    }

    #[test]
    fn test_data_chunk_roundtrip_various_chunkings() {
        let writes: &[&[u8]] = &[b"hello world", &[0xAB; 1500], b"x", &[0u8; 4000]];
        for hash in [HashKind::Sha1, HashKind::Md5] {
            for feed in [1usize, 3, 7, 64, 4096] {
                let (mut sender, mut receiver) = data_pair(hash);
                let mut wire = Vec::new();
                for write in writes {
                    wire.extend_from_slice(&sender.client_pre_encrypt(write).unwrap());
                }
                let mut plain = Vec::new();
                for piece in wire.chunks(feed) {
                    plain.extend_from_slice(&receiver.client_post_decrypt(piece).unwrap());
                }
                assert_eq!(plain, writes.concat(), "hash {:?} feed {}", hash, feed);
            }
        }
    }

    #[test]
    fn test_counters_increment_per_chunk() {
        let (mut sender, mut receiver) = data_pair(HashKind::Sha1);
        assert_eq!(sender.pack_id, 1);
        let w1 = sender.client_pre_encrypt(b"one").unwrap();
        assert_eq!(sender.pack_id, 2);
        let w2 = sender.client_pre_encrypt(b"two").unwrap();
        assert_eq!(sender.pack_id, 3);

        assert_eq!(receiver.recv_id, 1);
        receiver.client_post_decrypt(&w1).unwrap();
        assert_eq!(receiver.recv_id, 2);
        receiver.client_post_decrypt(&w2).unwrap();
        assert_eq!(receiver.recv_id, 3);
    }

    #[test]
    fn test_auth_chunk_does_not_consume_pack_id() {
        let mut sender = AuthAes128::with_seed(HashKind::Sha1, [7, 9]);
        sender.set_server_info(server_info());
        sender.client_pre_encrypt(b"head").unwrap();
        assert!(sender.has_sent_header);
        assert_eq!(sender.pack_id, 1);
    }

    #[test]
    fn test_single_bit_tamper_detected_everywhere() {
        let (mut sender, _) = data_pair(HashKind::Sha1);
        let wire = sender.client_pre_encrypt(b"sensitive payload").unwrap();

        for bit in 0..wire.len() * 8 {
            let mut tampered = wire.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            let mut receiver = AuthAes128::with_seed(HashKind::Sha1, [5, 3]);
            receiver.set_server_info(server_info());
            assert!(
                receiver.client_post_decrypt(&tampered).is_err(),
                "bit {} not detected",
                bit
            );
            // Verification failure clears the rolling buffer.
            assert_eq!(receiver.recv_buffer.len(), 0);
        }
    }

    #[test]
    fn test_recv_buffer_cap() {
        let (_, mut receiver) = data_pair(HashKind::Sha1);
        let garbage = vec![0u8; RECV_BUFFER_CAP + 1];
        assert!(matches!(
            receiver.client_post_decrypt(&garbage),
            Err(ObfsError::RecvOverflow)
        ));
        assert_eq!(receiver.recv_buffer.len(), 0);
    }

    #[test]
    fn test_auth_chunk_layout() {
        let mut sender = AuthAes128::with_seed(HashKind::Sha1, [7, 9]);
        sender.set_server_info(server_info());
        let wire = sender
            .client_pre_encrypt(b"\x01\xC0\x00\x02\x01\x00\x50")
            .unwrap();
        // [rand1][hmac6][uid4][aes16][hmac4][padding][payload][hmac4]
        assert!(wire.len() >= 31 + 7 + 4);
        // hmac6 over the first random byte, keyed iv ∥ key.
        let mut header_key = vec![0x22; 16];
        header_key.extend_from_slice(&[0x11; 32]);
        let tag = HashKind::Sha1.hmac(&header_key, &wire[..1]);
        assert_eq!(&wire[1..7], &tag[..6]);
        // Trailing hmac4 over everything else, keyed user_key.
        let trailer = HashKind::Sha1.hmac(&sender.user_key, &wire[..wire.len() - 4]);
        assert_eq!(&wire[wire.len() - 4..], &trailer[..4]);
    }

    #[test]
    fn test_uid_key_param() {
        let mut info = server_info();
        info.param = "10086:secret-user-key".to_string();
        let mut plugin = AuthAes128::new(HashKind::Sha1);
        plugin.set_server_info(info);
        assert_eq!(plugin.uid, 10086u32.to_le_bytes());
        assert_eq!(
            plugin.user_key,
            HashKind::Sha1.digest(b"secret-user-key").to_vec()
        );
    }

    #[test]
    fn test_default_user_key_is_server_key() {
        let mut plugin = AuthAes128::new(HashKind::Md5);
        plugin.set_server_info(server_info());
        assert_eq!(plugin.user_key, vec![0x11; 32]);
    }

    #[test]
    fn test_big_write_splits_into_units() {
        let (mut sender, mut receiver) = data_pair(HashKind::Md5);
        let payload = vec![0x5A; 5000];
        let wire = sender.client_pre_encrypt(&payload).unwrap();
        // 5000 bytes → 2000 + 2000 + 1000: three data chunks.
        assert_eq!(sender.pack_id, 4);
        let plain = receiver.client_post_decrypt(&wire).unwrap();
        assert_eq!(plain, payload);
        assert_eq!(receiver.recv_id, 4);
    }
}
