//! Identity plugin for the `origin` protocol and `plain` obfs slots.

use crate::{Plugin, ServerInfo};

pub struct PlainPlugin {
    _info: Option<ServerInfo>,
}

impl PlainPlugin {
    pub fn new() -> Self {
        Self { _info: None }
    }
}

impl Default for PlainPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for PlainPlugin {
    fn set_server_info(&mut self, info: ServerInfo) {
        self._info = Some(info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let mut plugin = PlainPlugin::new();
        plugin.set_server_info(ServerInfo::new("example.org", 8388));
        assert_eq!(plugin.client_pre_encrypt(b"data").unwrap(), b"data");
        assert_eq!(plugin.client_post_decrypt(b"data").unwrap(), b"data");
        assert_eq!(plugin.client_encode(b"data").unwrap(), b"data");
        let (out, sendback) = plugin.client_decode(b"data").unwrap();
        assert_eq!(out, b"data");
        assert!(!sendback);
        assert_eq!(plugin.overhead(), 0);
    }
}
