//! Accept loop
//!
//! Binds the local SOCKS5 endpoint and hands every accepted client to
//! a fresh session task on the loop-local scheduler. Each session is
//! registered in the environment's live set so a forced shutdown can
//! reach it.

use std::net::SocketAddr;
use std::rc::Rc;

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use ssrlocal_core::Result;

use crate::env::Environment;
use crate::session::Session;

pub struct ProxyServer {
    env: Rc<Environment>,
    listener: TcpListener,
}

impl ProxyServer {
    /// Bind the configured listen endpoint.
    pub async fn bind(env: Rc<Environment>) -> Result<Self> {
        let addr = format!(
            "{}:{}",
            env.config().listen_host,
            env.config().listen_port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("SOCKS5 proxy listening on {}", listener.local_addr()?);
        Ok(Self { env, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept forever. Must run inside a `LocalSet`.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {}", peer);
                    let session = Session::new(self.env.clone(), stream, peer.to_string());
                    let guard = self.env.register_session();
                    let id = guard.id();
                    let handle = tokio::task::spawn_local(async move {
                        let _guard = guard;
                        session.run().await;
                    });
                    self.env.attach_session(id, handle.abort_handle());
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }
}
