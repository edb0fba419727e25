//! Process-wide environment
//!
//! One object per process: the configuration, the cipher environment,
//! the plugin variants resolved from their configured names, the
//! per-family plugin globals, and the set of live sessions so a forced
//! shutdown can cancel every active tunnel. Everything lives on the
//! single loop thread behind `Rc`/`RefCell`; no locks.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tokio::task::AbortHandle;
use tracing::{debug, info};

use ssrlocal_core::{Config, ProxyError, Result};
use ssrlocal_crypto::{CipherCtx, CipherEnv};
use ssrlocal_obfs::{get_head_size, ObfsKind, PluginGlobal, ProtocolKind, ServerInfo};

use crate::pipeline::TunnelCipher;
use crate::resolver::{Resolver, SystemResolver};

pub struct Environment {
    config: Config,
    cipher_env: Rc<CipherEnv>,
    protocol_kind: ProtocolKind,
    obfs_kind: ObfsKind,
    protocol_global: Option<Rc<RefCell<PluginGlobal>>>,
    obfs_global: Option<Rc<RefCell<PluginGlobal>>>,
    resolver: Rc<dyn Resolver>,
    tunnels: RefCell<HashMap<u64, AbortHandle>>,
    next_tunnel_id: Cell<u64>,
}

impl Environment {
    pub fn new(config: Config) -> Result<Rc<Self>> {
        Self::with_resolver(config, Rc::new(SystemResolver))
    }

    pub fn with_resolver(config: Config, resolver: Rc<dyn Resolver>) -> Result<Rc<Self>> {
        let cipher_env = Rc::new(
            CipherEnv::new(&config.password, &config.method)
                .map_err(|e| ProxyError::Config(e.to_string()))?,
        );
        let protocol_kind = ProtocolKind::from_name(&config.protocol).ok_or_else(|| {
            ProxyError::Config(format!("unknown protocol plugin: {}", config.protocol))
        })?;
        let obfs_kind = ObfsKind::from_name(&config.obfs)
            .ok_or_else(|| ProxyError::Config(format!("unknown obfs plugin: {}", config.obfs)))?;
        let protocol_global = protocol_kind.init_global();
        let obfs_global = obfs_kind.init_global();
        info!(
            "environment ready: method={} protocol={} obfs={}",
            config.method, config.protocol, config.obfs
        );
        Ok(Rc::new(Self {
            config,
            cipher_env,
            protocol_kind,
            obfs_kind,
            protocol_global,
            obfs_global,
            resolver,
            tunnels: RefCell::new(HashMap::new()),
            next_tunnel_id: Cell::new(1),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolver(&self) -> Rc<dyn Resolver> {
        self.resolver.clone()
    }

    /// Build the per-session cipher pipeline, bound to the initial
    /// address package (its head length feeds the obfs camouflage).
    pub fn create_tunnel_cipher(&self, init_pkg: &[u8]) -> TunnelCipher {
        let enc = CipherCtx::new_encrypt(self.cipher_env.clone());
        let dec = CipherCtx::new_decrypt(self.cipher_env.clone());

        let mut info = ServerInfo::new(&self.config.remote_host, self.config.remote_port);
        info.iv = enc.iv().to_vec();
        info.key = self.cipher_env.key().to_vec();
        info.head_len = get_head_size(init_pkg, 30);

        let mut obfs = self.obfs_kind.new_plugin();
        let mut obfs_info = info.clone();
        obfs_info.param = self.config.obfs_param.clone();
        obfs_info.global = self.obfs_global.clone();
        obfs.set_server_info(obfs_info);

        let mut protocol = self.protocol_kind.new_plugin();
        let mut proto_info = info;
        proto_info.param = self.config.protocol_param.clone();
        proto_info.global = self.protocol_global.clone();
        proto_info.overhead = protocol.overhead() + obfs.overhead();
        protocol.set_server_info(proto_info);

        TunnelCipher::from_parts(enc, dec, protocol, obfs)
    }

    /// Register a new session in the live set. The returned guard
    /// removes the entry exactly once when dropped.
    pub fn register_session(self: &Rc<Self>) -> SessionGuard {
        let id = self.next_tunnel_id.get();
        self.next_tunnel_id.set(id + 1);
        SessionGuard {
            env: self.clone(),
            id,
        }
    }

    /// Attach the task handle so a forced shutdown can cancel it.
    pub fn attach_session(&self, id: u64, handle: AbortHandle) {
        self.tunnels.borrow_mut().insert(id, handle);
    }

    fn deregister_session(&self, id: u64) {
        if self.tunnels.borrow_mut().remove(&id).is_some() {
            debug!("session {} deregistered", id);
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.tunnels.borrow().len()
    }

    /// Forced shutdown: cancel every live tunnel.
    pub fn shutdown_all(&self) {
        let handles: Vec<AbortHandle> = self.tunnels.borrow_mut().drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            info!("cancelling {} active sessions", handles.len());
        }
        for handle in handles {
            handle.abort();
        }
    }
}

/// Live-set registration; dropping deregisters exactly once, whether
/// the session ended normally, failed, or was aborted mid-flight.
pub struct SessionGuard {
    env: Rc<Environment>,
    id: u64,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.env.deregister_session(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.remote_host = "203.0.113.9".to_string();
        config.remote_port = 8388;
        config.password = "pw".to_string();
        config.method = "aes-128-cfb".to_string();
        config.protocol = "auth_aes128_sha1".to_string();
        config.obfs = "http_simple".to_string();
        config
    }

    #[test]
    fn test_unknown_plugin_rejected() {
        let mut config = test_config();
        config.protocol = "auth_mystery".to_string();
        assert!(matches!(
            Environment::new(config).map(|_| ()),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut config = test_config();
        config.method = "rot13".to_string();
        assert!(Environment::new(config).is_err());
    }

    #[test]
    fn test_guard_deregisters_once() {
        let env = Environment::new(test_config()).unwrap();
        let guard = env.register_session();
        let id = guard.id();
        // No handle attached yet; the set is empty but the id is
        // reserved.
        assert_eq!(env.active_sessions(), 0);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let task = tokio::spawn(async {});
            env.attach_session(id, task.abort_handle());
            assert_eq!(env.active_sessions(), 1);
            drop(guard);
            assert_eq!(env.active_sessions(), 0);
            let _ = task.await;
        });
    }

    #[test]
    fn test_cipher_head_len_follows_package() {
        let env = Environment::new(test_config()).unwrap();
        // IPv4 package: head 7; hostname package: 4 + len.
        let _ = env.create_tunnel_cipher(b"\x01\xC0\x00\x02\x01\x00\x50");
        let _ = env.create_tunnel_cipher(b"\x03\x0bexample.com\x01\xbb");
    }
}
