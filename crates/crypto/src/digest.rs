//! Digest, HMAC and checksum helpers
//!
//! The SSR framings key their HMACs with ad-hoc byte strings
//! (key ∥ counter, iv ∥ key) and truncate the tags, so everything here
//! works on plain slices. Checksums are stored little-endian on the
//! wire.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

/// Digest used by a framing plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Md5,
    Sha1,
}

impl HashKind {
    pub fn digest_len(self) -> usize {
        match self {
            HashKind::Md5 => 16,
            HashKind::Sha1 => 20,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Md5 => md5(data).to_vec(),
            HashKind::Sha1 => sha1(data).to_vec(),
        }
    }

    pub fn hmac(self, key: &[u8], msg: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Md5 => hmac_md5(key, msg).to_vec(),
            HashKind::Sha1 => hmac_sha1(key, msg).to_vec(),
        }
    }
}

pub fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

pub fn hmac_md5(key: &[u8], msg: &[u8]) -> [u8; 16] {
    let mut mac = Hmac::<Md5>::new_from_slice(key).expect("HMAC takes keys of any length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

pub fn hmac_sha1(key: &[u8], msg: &[u8]) -> [u8; 20] {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC takes keys of any length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// OpenSSL `EVP_BytesToKey` with MD5 and no salt: the chain
/// `D1 = MD5(pass)`, `Dn = MD5(Dn-1 ∥ pass)`, concatenated and
/// truncated to `key_len`.
pub fn bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut last: Option<[u8; 16]> = None;
    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(prev) = &last {
            hasher.update(prev);
        }
        hasher.update(password);
        let digest: [u8; 16] = hasher.finalize().into();
        key.extend_from_slice(&digest);
        last = Some(digest);
    }
    key.truncate(key_len);
    key
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

pub fn adler32(data: &[u8]) -> u32 {
    adler::adler32_slice(data)
}

/// Append the little-endian CRC32 of `data` to it.
pub fn fill_crc32(data: &mut Vec<u8>) {
    let sum = crc32(data);
    data.extend_from_slice(&sum.to_le_bytes());
}

/// Verify a chunk whose last 4 bytes are the little-endian CRC32 of
/// everything before them.
pub fn check_crc32(chunk: &[u8]) -> bool {
    if chunk.len() < 4 {
        return false;
    }
    let (body, tail) = chunk.split_at(chunk.len() - 4);
    crc32(body).to_le_bytes() == tail
}

/// Append the little-endian Adler-32 of `data` to it.
pub fn fill_adler32(data: &mut Vec<u8>) {
    let sum = adler32(data);
    data.extend_from_slice(&sum.to_le_bytes());
}

/// Verify a chunk whose last 4 bytes are the little-endian Adler-32 of
/// everything before them.
pub fn check_adler32(chunk: &[u8]) -> bool {
    if chunk.len() < 4 {
        return false;
    }
    let (body, tail) = chunk.split_at(chunk.len() - 4);
    adler32(body).to_le_bytes() == tail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_vector() {
        // RFC 1321 test suite: MD5("abc")
        assert_eq!(
            md5(b"abc"),
            [
                0x90, 0x01, 0x50, 0x98, 0x3c, 0xd2, 0x4f, 0xb0, 0xd6, 0x96, 0x3f, 0x7d, 0x28,
                0xe1, 0x7f, 0x72
            ]
        );
    }

    #[test]
    fn test_sha1_known_vector() {
        // FIPS 180-1 appendix A: SHA1("abc")
        assert_eq!(
            sha1(b"abc"),
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
    }

    #[test]
    fn test_bytes_to_key_lengths() {
        for len in [16usize, 24, 32] {
            let key = bytes_to_key(b"password", len);
            assert_eq!(key.len(), len);
        }
        // First 16 bytes are MD5(password) regardless of total length.
        let short = bytes_to_key(b"password", 16);
        let long = bytes_to_key(b"password", 32);
        assert_eq!(&long[..16], short.as_slice());
        assert_eq!(short, md5(b"password").to_vec());
    }

    #[test]
    fn test_hmac_keys_differ() {
        let a = hmac_sha1(b"key-a", b"msg");
        let b = hmac_sha1(b"key-b", b"msg");
        assert_ne!(a, b);
    }

    #[test]
    fn test_crc32_fill_and_check() {
        let mut data = b"some framed chunk".to_vec();
        fill_crc32(&mut data);
        assert!(check_crc32(&data));
        data[3] ^= 0x01;
        assert!(!check_crc32(&data));
    }

    #[test]
    fn test_adler32_fill_and_check() {
        let mut data = b"another chunk".to_vec();
        fill_adler32(&mut data);
        assert!(check_adler32(&data));
        let last = data.len() - 1;
        data[last] ^= 0x80;
        assert!(!check_adler32(&data));
    }

    #[test]
    fn test_check_short_input() {
        assert!(!check_crc32(&[1, 2, 3]));
        assert!(!check_adler32(&[]));
    }
}
