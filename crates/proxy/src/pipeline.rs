//! Tunnel cipher pipeline
//!
//! Composes the protocol plugin, the stream cipher and the obfs plugin
//! into the egress transform `pre_encrypt → encrypt → encode` and its
//! ingress inverse `decode → decrypt → post_decrypt`. The decode stage
//! may produce a feedback buffer that belongs on the *upstream* socket
//! (obfs handshake progress), never downstream.

use ssrlocal_core::{ProxyError, Result};
use ssrlocal_crypto::CipherCtx;
use ssrlocal_obfs::Plugin;

pub struct TunnelCipher {
    enc: CipherCtx,
    dec: CipherCtx,
    protocol: Box<dyn Plugin>,
    obfs: Box<dyn Plugin>,
}

impl TunnelCipher {
    pub(crate) fn from_parts(
        enc: CipherCtx,
        dec: CipherCtx,
        protocol: Box<dyn Plugin>,
        obfs: Box<dyn Plugin>,
    ) -> Self {
        Self {
            enc,
            dec,
            protocol,
            obfs,
        }
    }

    /// Client-to-upstream transform. An empty result means the obfs
    /// layer buffered the payload (mid-handshake) and the caller must
    /// pause reading that side until feedback arrives.
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut buf = self
            .protocol
            .client_pre_encrypt(data)
            .map_err(|_| ProxyError::InvalidPassword)?;
        self.enc
            .encrypt(&mut buf)
            .map_err(|_| ProxyError::InvalidPassword)?;
        self.obfs
            .client_encode(&buf)
            .map_err(|_| ProxyError::InvalidPassword)
    }

    /// Upstream-to-client transform. Returns the plaintext plus an
    /// optional feedback buffer the caller MUST write back upstream.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let (mut buf, needs_sendback) = self
            .obfs
            .client_decode(data)
            .map_err(|_| ProxyError::ClientDecode)?;

        let feedback = if needs_sendback {
            debug_assert!(buf.is_empty());
            Some(
                self.obfs
                    .client_encode(&[])
                    .map_err(|_| ProxyError::ClientDecode)?,
            )
        } else {
            None
        };

        if !buf.is_empty() {
            self.dec
                .decrypt(&mut buf)
                .map_err(|_| ProxyError::InvalidPassword)?;
        }
        let out = self
            .protocol
            .client_post_decrypt(&buf)
            .map_err(|_| ProxyError::ClientPostDecrypt)?;
        Ok((out, feedback))
    }
}
