//! tls1.2_ticket_auth obfuscation
//!
//! Performs a fake TLS 1.2 handshake: a ClientHello whose 32-byte
//! random authenticates the client (truncated HMAC keyed with
//! key ∥ client_id), a session id equal to the shared client id, and a
//! fake session ticket. Payload written before the ServerHello arrives
//! is buffered and flushed with the ChangeCipherSpec + Finished
//! records; steady state wraps everything in application-data records.

use std::time::{SystemTime, UNIX_EPOCH};

use ssrlocal_crypto::digest::hmac_sha1;
use ssrlocal_crypto::Xorshift128Plus;

use crate::auth_aes128::RECV_BUFFER_CAP;
use crate::{ObfsError, Plugin, Result, ServerInfo};

/// Payload bytes per application-data record.
const RECORD_UNIT: usize = 2048;

/// Truncated HMAC length inside the hello/finished randoms.
const HMAC_TRUNC: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    /// Nothing sent yet.
    Init,
    /// ClientHello out, waiting for the ServerHello.
    HelloSent,
    /// ServerHello verified; the next encode emits CCS + Finished.
    FinishPending,
    /// Handshake complete, plain record framing.
    Established,
}

pub struct Tls12TicketAuth {
    info: ServerInfo,
    rng: Xorshift128Plus,
    handshake: Handshake,
    send_buffer: Vec<u8>,
    recv_buffer: Vec<u8>,
}

impl Tls12TicketAuth {
    pub fn new() -> Self {
        Self {
            info: ServerInfo::default(),
            rng: Xorshift128Plus::new(),
            handshake: Handshake::Init,
            send_buffer: Vec::new(),
            recv_buffer: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(seed: [u64; 2]) -> Self {
        let mut plugin = Self::new();
        plugin.rng = Xorshift128Plus::from_seed(seed);
        plugin
    }

    fn client_id(&self) -> [u8; 32] {
        match &self.info.global {
            Some(global) => global.borrow().as_tls().client_id,
            None => [0u8; 32],
        }
    }

    fn hmac_key(&self) -> Vec<u8> {
        let mut key = self.info.key.clone();
        key.extend_from_slice(&self.client_id());
        key
    }

    fn rng_fill(&mut self, out: &mut [u8]) {
        for byte in out.iter_mut() {
            *byte = self.rng.next() as u8;
        }
    }

    /// 32-byte client random: utc ∥ 18 random ∥ 10-byte HMAC.
    fn auth_random(&mut self) -> [u8; 32] {
        let mut random = [0u8; 32];
        let utc = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        random[..4].copy_from_slice(&utc.to_be_bytes());
        let mut filler = [0u8; 18];
        self.rng_fill(&mut filler);
        random[4..22].copy_from_slice(&filler);
        let tag = hmac_sha1(&self.hmac_key(), &random[..22]);
        random[22..32].copy_from_slice(&tag[..HMAC_TRUNC]);
        random
    }

    fn sni_host(&self) -> String {
        if self.info.param.is_empty() {
            self.info.host.clone()
        } else {
            self.info.param.clone()
        }
    }

    fn build_client_hello(&mut self) -> Vec<u8> {
        let random = self.auth_random();
        let client_id = self.client_id();
        let host = self.sni_host();

        let mut body = Vec::with_capacity(256);
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&random);
        body.push(32);
        body.extend_from_slice(&client_id);
        // Cipher suites a 2023-era browser would offer.
        let suites: &[u8] = &[
            0xc0, 0x2b, 0xc0, 0x2f, 0xc0, 0x2c, 0xc0, 0x30, 0xcc, 0xa9, 0xcc, 0xa8, 0xc0, 0x13,
            0xc0, 0x14, 0x00, 0x9c, 0x00, 0x9d, 0x00, 0x2f, 0x00, 0x35,
        ];
        body.extend_from_slice(&(suites.len() as u16).to_be_bytes());
        body.extend_from_slice(suites);
        body.extend_from_slice(&[0x01, 0x00]); // null compression only

        let mut exts = Vec::with_capacity(192);
        // server_name
        let name = host.as_bytes();
        let mut sni = Vec::with_capacity(name.len() + 5);
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni.push(0x00);
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);
        exts.extend_from_slice(&[0x00, 0x00]);
        exts.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        exts.extend_from_slice(&sni);
        // extended_master_secret
        exts.extend_from_slice(&[0x00, 0x17, 0x00, 0x00]);
        // session_ticket: a fake ticket of plausible random length
        let ticket_len = (self.rng.next() as usize % 164) * 2 + 64;
        let mut ticket = vec![0u8; ticket_len];
        self.rng_fill(&mut ticket);
        exts.extend_from_slice(&[0x00, 0x23]);
        exts.extend_from_slice(&(ticket_len as u16).to_be_bytes());
        exts.extend_from_slice(&ticket);
        // ec_point_formats: uncompressed
        exts.extend_from_slice(&[0x00, 0x0b, 0x00, 0x02, 0x01, 0x00]);
        // supported_groups: x25519, secp256r1, secp384r1
        exts.extend_from_slice(&[
            0x00, 0x0a, 0x00, 0x08, 0x00, 0x06, 0x00, 0x1d, 0x00, 0x17, 0x00, 0x18,
        ]);
        // signature_algorithms
        exts.extend_from_slice(&[
            0x00, 0x0d, 0x00, 0x0a, 0x00, 0x08, 0x04, 0x01, 0x04, 0x03, 0x05, 0x01, 0x05, 0x03,
        ]);

        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hello = Vec::with_capacity(body.len() + 9);
        hello.extend_from_slice(&[0x16, 0x03, 0x01]);
        hello.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        hello.push(0x01);
        hello.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hello.extend_from_slice(&body);
        hello
    }

    /// ChangeCipherSpec + a Finished-shaped record whose tail
    /// authenticates the sender.
    fn build_finish(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(43);
        out.extend_from_slice(&[0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);
        out.extend_from_slice(&[0x16, 0x03, 0x03, 0x00, 0x20]);
        let mut filler = [0u8; 22];
        self.rng_fill(&mut filler);
        out.extend_from_slice(&filler);
        let tag = hmac_sha1(&self.hmac_key(), &out);
        out.extend_from_slice(&tag[..HMAC_TRUNC]);
        out
    }

    fn wrap_records(&mut self, data: &[u8], out: &mut Vec<u8>) {
        for chunk in data.chunks(RECORD_UNIT) {
            out.extend_from_slice(&[0x17, 0x03, 0x03]);
            out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            out.extend_from_slice(chunk);
        }
    }
}

impl Default for Tls12TicketAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for Tls12TicketAuth {
    fn set_server_info(&mut self, info: ServerInfo) {
        self.info = info;
    }

    fn overhead(&self) -> usize {
        5
    }

    fn client_encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self.handshake {
            Handshake::Established => {
                let mut out = Vec::with_capacity(data.len() + 16);
                self.wrap_records(data, &mut out);
                Ok(out)
            }
            Handshake::Init => {
                self.send_buffer.extend_from_slice(data);
                self.handshake = Handshake::HelloSent;
                Ok(self.build_client_hello())
            }
            Handshake::HelloSent => {
                // Nothing can go out until the server answers.
                self.send_buffer.extend_from_slice(data);
                Ok(Vec::new())
            }
            Handshake::FinishPending => {
                self.send_buffer.extend_from_slice(data);
                let mut out = self.build_finish();
                let buffered = std::mem::take(&mut self.send_buffer);
                self.wrap_records(&buffered, &mut out);
                self.handshake = Handshake::Established;
                Ok(out)
            }
        }
    }

    fn client_decode(&mut self, data: &[u8]) -> Result<(Vec<u8>, bool)> {
        if self.recv_buffer.len() + data.len() > RECV_BUFFER_CAP {
            self.recv_buffer.clear();
            return Err(ObfsError::RecvOverflow);
        }
        self.recv_buffer.extend_from_slice(data);

        match self.handshake {
            Handshake::HelloSent => {
                // ServerHello: record header(5) + handshake header(4)
                // + version(2) + random(32).
                if self.recv_buffer.len() < 43 {
                    return Ok((Vec::new(), false));
                }
                if self.recv_buffer[0] != 0x16 {
                    self.recv_buffer.clear();
                    return Err(ObfsError::BadHandshake);
                }
                let random = &self.recv_buffer[11..43];
                let tag = hmac_sha1(&self.hmac_key(), &random[..22]);
                if random[22..32] != tag[..HMAC_TRUNC] {
                    self.recv_buffer.clear();
                    return Err(ObfsError::BadHandshake);
                }
                // Drop the whole server handshake flight.
                self.recv_buffer.clear();
                self.handshake = Handshake::FinishPending;
                Ok((Vec::new(), true))
            }
            Handshake::Established | Handshake::FinishPending => {
                let mut out = Vec::new();
                loop {
                    if self.recv_buffer.len() < 5 {
                        break;
                    }
                    if self.recv_buffer[0] != 0x17
                        || self.recv_buffer[1] != 0x03
                        || self.recv_buffer[2] != 0x03
                    {
                        self.recv_buffer.clear();
                        return Err(ObfsError::BadHandshake);
                    }
                    let len =
                        u16::from_be_bytes([self.recv_buffer[3], self.recv_buffer[4]]) as usize;
                    if self.recv_buffer.len() < 5 + len {
                        break;
                    }
                    out.extend_from_slice(&self.recv_buffer[5..5 + len]);
                    self.recv_buffer.drain(..5 + len);
                }
                Ok((out, false))
            }
            Handshake::Init => {
                self.recv_buffer.clear();
                Err(ObfsError::BadHandshake)
            }
        }
    }
}
