//! http_simple / http_post obfuscation
//!
//! Disguises the first egress packet as a browser HTTP request: the
//! leading ciphertext bytes are percent-hex-encoded into the request
//! path and the remainder follows the blank line. Ingress strips the
//! server's fake response headers through the first CRLF-CRLF.

use ssrlocal_crypto::Xorshift128Plus;

use crate::auth_aes128::RECV_BUFFER_CAP;
use crate::{ObfsError, Plugin, Result, ServerInfo};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; WOW64; rv:109.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.5 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 16_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148",
];

pub struct HttpObfs {
    post: bool,
    info: ServerInfo,
    rng: Xorshift128Plus,
    has_sent_header: bool,
    has_recv_header: bool,
    recv_buffer: Vec<u8>,
}

impl HttpObfs {
    pub fn new(post: bool) -> Self {
        Self {
            post,
            info: ServerInfo::default(),
            rng: Xorshift128Plus::new(),
            has_sent_header: false,
            has_recv_header: false,
            recv_buffer: Vec::new(),
        }
    }

    /// The Host header value: the obfs parameter if set (a comma
    /// separated pool to pick from), otherwise the real server host.
    /// Port 80 is omitted the way browsers omit it.
    fn host_header(&mut self) -> String {
        let host = if self.info.param.is_empty() {
            self.info.host.clone()
        } else {
            let pool: Vec<&str> = self.info.param.split(',').collect();
            pool[(self.rng.next() as usize) % pool.len()].trim().to_string()
        };
        if self.info.port == 80 {
            host
        } else {
            format!("{}:{}", host, self.info.port)
        }
    }

    fn build_request(&mut self, head: &[u8], body: &[u8]) -> Vec<u8> {
        let path: String = head.iter().map(|b| format!("%{:02x}", b)).collect();
        let host = self.host_header();
        let ua = USER_AGENTS[(self.rng.next() as usize) % USER_AGENTS.len()];
        let verb = if self.post { "POST" } else { "GET" };
        let extra = if self.post {
            format!(
                "Content-Type: multipart/form-data; boundary=----WebKitFormBoundary{:016x}\r\n",
                self.rng.next()
            )
        } else {
            String::new()
        };
        let mut out = format!(
            "{verb} /{path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             User-Agent: {ua}\r\n\
             Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n\
             Accept-Language: en-US,en;q=0.8\r\n\
             Accept-Encoding: gzip, deflate\r\n\
             {extra}DNT: 1\r\n\
             Connection: keep-alive\r\n\r\n"
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }
}

impl Plugin for HttpObfs {
    fn set_server_info(&mut self, info: ServerInfo) {
        self.info = info;
    }

    fn client_encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.has_sent_header {
            return Ok(data.to_vec());
        }
        let head_size = (self.info.iv.len() + self.info.head_len).min(data.len());
        let (head, body) = data.split_at(head_size);
        self.has_sent_header = true;
        Ok(self.build_request(head, body))
    }

    fn client_decode(&mut self, data: &[u8]) -> Result<(Vec<u8>, bool)> {
        if self.has_recv_header {
            return Ok((data.to_vec(), false));
        }
        if self.recv_buffer.len() + data.len() > RECV_BUFFER_CAP {
            self.recv_buffer.clear();
            return Err(ObfsError::RecvOverflow);
        }
        self.recv_buffer.extend_from_slice(data);
        match self
            .recv_buffer
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        {
            Some(pos) => {
                let out = self.recv_buffer[pos + 4..].to_vec();
                self.recv_buffer.clear();
                self.has_recv_header = true;
                Ok((out, false))
            }
            None => Ok((Vec::new(), false)), // headers still incomplete
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_info() -> ServerInfo {
        let mut info = ServerInfo::new("203.0.113.1", 8388);
        info.iv = vec![0u8; 16];
        info.head_len = 7;
        info
    }

    #[test]
    fn test_first_packet_wrapped_in_get() {
        let mut obfs = HttpObfs::new(false);
        obfs.set_server_info(server_info());
        let payload: Vec<u8> = (0u8..64).collect();
        let wire = obfs.client_encode(&payload).unwrap();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("GET /%00%01%02"));
        assert!(text.contains("Host: 203.0.113.1:8388\r\n"));
        assert!(text.contains("\r\n\r\n"));
        // head = iv_len(16) + head_len(7) = 23 bytes into the URL,
        // remainder raw after the blank line.
        let blank = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        assert_eq!(&wire[blank + 4..], &payload[23..]);
    }

    #[test]
    fn test_second_packet_passes_through() {
        let mut obfs = HttpObfs::new(false);
        obfs.set_server_info(server_info());
        obfs.client_encode(b"first").unwrap();
        assert_eq!(obfs.client_encode(b"second").unwrap(), b"second");
    }

    #[test]
    fn test_post_variant_has_boundary() {
        let mut obfs = HttpObfs::new(true);
        obfs.set_server_info(server_info());
        let wire = obfs.client_encode(b"data").unwrap();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("POST /"));
        assert!(text.contains("multipart/form-data; boundary=----WebKitFormBoundary"));
    }

    #[test]
    fn test_obfs_param_overrides_host() {
        let mut info = server_info();
        info.param = "cdn.example.org".to_string();
        let mut obfs = HttpObfs::new(false);
        obfs.set_server_info(info);
        let wire = obfs.client_encode(b"x").unwrap();
        assert!(String::from_utf8_lossy(&wire).contains("Host: cdn.example.org:8388\r\n"));
    }

    #[test]
    fn test_port_80_omitted() {
        let mut info = server_info();
        info.port = 80;
        let mut obfs = HttpObfs::new(false);
        obfs.set_server_info(info);
        let wire = obfs.client_encode(b"x").unwrap();
        assert!(String::from_utf8_lossy(&wire).contains("Host: 203.0.113.1\r\n"));
    }

    #[test]
    fn test_decode_strips_response_headers() {
        let mut obfs = HttpObfs::new(false);
        obfs.set_server_info(server_info());
        // Headers split across reads: nothing comes out until the
        // blank line lands.
        let (out, sendback) = obfs.client_decode(b"HTTP/1.1 200 OK\r\nServer: ngin").unwrap();
        assert!(out.is_empty());
        assert!(!sendback);
        let (out, _) = obfs.client_decode(b"x\r\n\r\n\x01\x02\x03").unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        // Steady state is pass-through.
        let (out, _) = obfs.client_decode(b"more").unwrap();
        assert_eq!(out, b"more");
    }

    #[test]
    fn test_decode_header_flood_errors() {
        let mut obfs = HttpObfs::new(false);
        obfs.set_server_info(server_info());
        let flood = vec![b'A'; RECV_BUFFER_CAP + 1];
        assert!(matches!(
            obfs.client_decode(&flood),
            Err(ObfsError::RecvOverflow)
        ));
    }

    #[test]
    fn test_whole_payload_shorter_than_head() {
        let mut obfs = HttpObfs::new(false);
        obfs.set_server_info(server_info());
        let wire = obfs.client_encode(b"tiny").unwrap();
        let blank = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        // Everything fit in the URL; nothing after the headers.
        assert_eq!(blank + 4, wire.len());
    }
}
