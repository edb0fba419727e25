//! Per-session state machine
//!
//! Drives one client connection through the SOCKS5 handshake, the
//! upstream connect and initial-packet send, then the bidirectional
//! proxy phase. Handshake reads are discrete (one read, fully written
//! out before the next) because they share the fixed per-socket
//! buffer; the proxy phase runs both directions concurrently with
//! back-pressure falling out of each direction's sequential
//! read-transform-write loop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use std::cell::RefCell;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use ssrlocal_core::socks5::{
    self, AuthMethods, Command, ParseStatus, Parser, REPLY_AUTH_NONE, REPLY_AUTH_UNACCEPTABLE,
    REPLY_CONNECTION_REFUSED, REPLY_HOST_UNREACHABLE,
};
use ssrlocal_core::{Buffer, ProxyError, Result, SSR_BUFF_SIZE};

use crate::env::Environment;
use crate::pipeline::TunnelCipher;
use crate::socket::{IoState, SocketCtx};

/// Listener auth policy: unauthenticated clients are accepted,
/// username/password is not implemented.
const ALLOW_AUTH_NONE: bool = true;
const ALLOW_AUTH_PASSWD: bool = false;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshake,
    HandshakeAuth,
    ReqStart,
    ReqParse,
    ReqUdpAssoc,
    ReqLookup,
    ReqConnect,
    SsrAuthSent,
    ProxyStart,
    Proxy,
    Kill,
    Dead,
}

/// What the handshake phase resolved to.
enum NextPhase {
    /// Both sockets ready; enter the proxy loops.
    Proxy,
    /// Session over (kill reply sent, or client closed a UDP-ASSOC
    /// wait); nothing left to do.
    Closed,
}

pub struct Session<S> {
    env: Rc<Environment>,
    state: SessionState,
    parser: Parser,
    incoming: SocketCtx<S>,
    outgoing: Option<SocketCtx<TcpStream>>,
    cipher: Option<TunnelCipher>,
    init_pkg: Buffer,
    connect_target: Option<SocketAddr>,
    /// Random identifier for log correlation.
    session_id: [u8; 8],
    peer: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin + 'static> Session<S> {
    pub fn new(env: Rc<Environment>, stream: S, peer: impl Into<String>) -> Self {
        let idle = Duration::from_millis(env.config().idle_timeout);
        let session_id = {
            let mut id = [0u8; 8];
            rand::Rng::fill(&mut rand::thread_rng(), &mut id);
            id
        };
        Self {
            env,
            state: SessionState::Handshake,
            parser: Parser::new(),
            incoming: SocketCtx::new(stream, idle),
            outgoing: None,
            cipher: None,
            init_pkg: Buffer::default(),
            connect_target: None,
            session_id,
            peer: peer.into(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion. All fatal paths converge here:
    /// sockets close when the session drops.
    pub async fn run(mut self) {
        debug!(
            "session {} from {}",
            hex::encode(&self.session_id[..4]),
            self.peer
        );
        match self.drive_handshake().await {
            Ok(NextPhase::Proxy) => {
                let sid = hex::encode(&self.session_id[..4]);
                match self.proxy_phase().await {
                    Ok(()) | Err(ProxyError::Eof) => debug!("session {} finished", sid),
                    Err(ProxyError::Timeout) => debug!("session {} idle timeout", sid),
                    Err(e) => warn!("session {} failed: {}", sid, e),
                }
            }
            Ok(NextPhase::Closed) => {
                debug!("session {} closed", hex::encode(&self.session_id[..4]));
                self.shutdown();
            }
            Err(e) => {
                let sid = hex::encode(&self.session_id[..4]);
                match &e {
                    ProxyError::Eof | ProxyError::Timeout => {
                        debug!("session {} ended: {}", sid, e)
                    }
                    _ => warn!("session {} error: {}", sid, e),
                }
                self.shutdown();
            }
        }
    }

    /// The single shutdown routine: mark and drop both sockets. An
    /// in-flight DNS or connect future was already cancelled by
    /// leaving the state handler.
    fn shutdown(&mut self) {
        self.incoming.close();
        if let Some(outgoing) = &mut self.outgoing {
            outgoing.close();
        }
        self.state = SessionState::Dead;
    }

    async fn drive_handshake(&mut self) -> Result<NextPhase> {
        loop {
            match self.state {
                SessionState::Handshake => self.do_handshake().await?,
                SessionState::HandshakeAuth => return Err(ProxyError::AuthNotImplemented),
                SessionState::ReqStart => self.do_req_start(),
                SessionState::ReqParse => self.do_req_parse().await?,
                SessionState::ReqUdpAssoc => {
                    self.do_req_udp_assoc().await?;
                    return Ok(NextPhase::Closed);
                }
                SessionState::ReqLookup => self.do_req_lookup().await?,
                SessionState::ReqConnect => self.do_req_connect().await?,
                SessionState::SsrAuthSent => self.do_ssr_auth_sent().await?,
                SessionState::ProxyStart => {
                    self.state = SessionState::Proxy;
                    return Ok(NextPhase::Proxy);
                }
                SessionState::Kill => return Ok(NextPhase::Closed),
                SessionState::Proxy | SessionState::Dead => unreachable!("terminal state"),
            }
        }
    }

    /// Feed one discrete read through the parser; junk after a
    /// terminal status is fatal.
    fn parse_step(&mut self, n: usize) -> Result<ParseStatus> {
        let (status, consumed) = self.parser.parse(&self.incoming.data()[..n])?;
        self.incoming.rdstate = IoState::Stop;
        if status != ParseStatus::NeedMore && consumed != n {
            return Err(ProxyError::TrailingJunk(n - consumed));
        }
        Ok(status)
    }

    async fn do_handshake(&mut self) -> Result<()> {
        debug_assert_eq!(self.incoming.wrstate, IoState::Stop);
        let n = self.incoming.read().await?;
        match self.parse_step(n)? {
            ParseStatus::NeedMore => Ok(()), // stay in Handshake
            ParseStatus::AuthSelect => {
                let methods = self.parser.auth_methods();
                if methods.contains(AuthMethods::NONE) && ALLOW_AUTH_NONE {
                    self.incoming.write(&REPLY_AUTH_NONE).await?;
                    self.state = SessionState::ReqStart;
                    Ok(())
                } else if methods.contains(AuthMethods::PASSWORD) && ALLOW_AUTH_PASSWD {
                    self.state = SessionState::HandshakeAuth;
                    Ok(())
                } else {
                    let _ = self.incoming.write(&REPLY_AUTH_UNACCEPTABLE).await;
                    self.state = SessionState::Kill;
                    Ok(())
                }
            }
            ParseStatus::ExecCmd => Err(ProxyError::UnsupportedCommand),
        }
    }

    /// The auth reply write has completed; re-arm the request read.
    fn do_req_start(&mut self) {
        debug_assert_eq!(self.incoming.rdstate, IoState::Stop);
        debug_assert_eq!(self.incoming.wrstate, IoState::Done);
        self.incoming.wrstate = IoState::Stop;
        self.state = SessionState::ReqParse;
    }

    async fn do_req_parse(&mut self) -> Result<()> {
        debug_assert_eq!(self.incoming.wrstate, IoState::Stop);
        debug_assert!(self.outgoing.is_none());
        let n = self.incoming.read().await?;
        match self.parse_step(n)? {
            ParseStatus::NeedMore => return Ok(()), // stay in ReqParse
            ParseStatus::AuthSelect => return Err(ProxyError::UnsupportedCommand),
            ParseStatus::ExecCmd => {}
        }

        match self.parser.command() {
            Some(Command::UdpAssociate) => {
                let config = self.env.config();
                let addr: IpAddr = config
                    .listen_host
                    .parse()
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                let reply = socks5::build_udp_assoc_reply(config.udp, addr, config.listen_port);
                self.incoming.write(&reply).await?;
                self.incoming.wrstate = IoState::Stop;
                self.state = SessionState::ReqUdpAssoc;
                Ok(())
            }
            Some(Command::TcpBind) => {
                warn!(
                    "session {}: BIND requests are not supported",
                    hex::encode(&self.session_id[..4])
                );
                Err(ProxyError::UnsupportedCommand)
            }
            Some(Command::TcpConnect) => {
                debug!(
                    "session {}: CONNECT {}:{}",
                    hex::encode(&self.session_id[..4]),
                    self.parser.dest_host(),
                    self.parser.dest_port()
                );
                self.init_pkg = socks5::initial_address_package(&self.parser);
                self.cipher = Some(self.env.create_tunnel_cipher(self.init_pkg.as_slice()));

                let config = self.env.config();
                if let Ok(ip) = config.remote_host.parse::<IpAddr>() {
                    self.connect_target = Some(SocketAddr::new(ip, config.remote_port));
                    self.state = SessionState::ReqConnect;
                } else {
                    self.state = SessionState::ReqLookup;
                }
                Ok(())
            }
            None => Err(ProxyError::UnsupportedCommand),
        }
    }

    /// UDP relaying is not implemented; hold the control connection
    /// open and watch for the client to go away.
    async fn do_req_udp_assoc(&mut self) -> Result<()> {
        loop {
            match self.incoming.read().await {
                Ok(_) => {
                    // Stray bytes on the control connection are
                    // ignored.
                    self.incoming.rdstate = IoState::Stop;
                }
                Err(ProxyError::Eof) | Err(ProxyError::Io(_)) => {
                    info!(
                        "session {}: UDP ASSOCIATE ended by client",
                        hex::encode(&self.session_id[..4])
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn do_req_lookup(&mut self) -> Result<()> {
        let host = self.env.config().remote_host.clone();
        let resolver = self.env.resolver();
        match resolver.resolve(&host).await {
            Ok(addrs) if !addrs.is_empty() => {
                // First answer wins; the requested port is stamped
                // into the resolved address.
                let port = self.parser.dest_port();
                self.connect_target = Some(SocketAddr::new(addrs[0], port));
                self.state = SessionState::ReqConnect;
                Ok(())
            }
            Ok(_) | Err(_) => {
                warn!(
                    "session {}: lookup failed for \"{}\"",
                    hex::encode(&self.session_id[..4]),
                    host
                );
                let _ = self.incoming.write(&REPLY_HOST_UNREACHABLE).await;
                self.state = SessionState::Kill;
                Ok(())
            }
        }
    }

    async fn do_req_connect(&mut self) -> Result<()> {
        debug_assert_eq!(self.incoming.rdstate, IoState::Stop);
        debug_assert_eq!(self.incoming.wrstate, IoState::Stop);
        let target = self.connect_target.expect("connect target set");
        let idle = self.incoming.idle_timeout();

        let stream = match timeout(idle, TcpStream::connect(target)).await {
            Err(_) => return Err(ProxyError::Timeout),
            Ok(Err(e)) => {
                warn!(
                    "session {}: upstream connect {} failed: {}",
                    hex::encode(&self.session_id[..4]),
                    target,
                    e
                );
                let _ = self.incoming.write(&REPLY_CONNECTION_REFUSED).await;
                self.state = SessionState::Kill;
                return Ok(());
            }
            Ok(Ok(stream)) => stream,
        };
        info!(
            "session {} established to {}",
            hex::encode(&self.session_id[..4]),
            target
        );

        let mut outgoing = SocketCtx::new(stream, idle);
        let cipher = self.cipher.as_mut().expect("cipher created at req_parse");
        let wire = cipher.encrypt(self.init_pkg.as_slice())?;
        outgoing.write(&wire).await?;
        self.outgoing = Some(outgoing);
        self.state = SessionState::SsrAuthSent;
        Ok(())
    }

    /// The encrypted address package is out; tell the client the
    /// tunnel is up, echoing the plaintext package bytes.
    async fn do_ssr_auth_sent(&mut self) -> Result<()> {
        let outgoing = self.outgoing.as_mut().expect("outgoing connected");
        debug_assert_eq!(outgoing.wrstate, IoState::Done);
        outgoing.wrstate = IoState::Stop;

        let mut reply = Vec::with_capacity(3 + self.init_pkg.len());
        reply.extend_from_slice(&[0x05, 0x00, 0x00]);
        reply.extend_from_slice(self.init_pkg.as_slice());
        self.incoming.write(&reply).await?;
        self.incoming.wrstate = IoState::Stop;
        self.state = SessionState::ProxyStart;
        Ok(())
    }

    /// Steady-state piping. Each direction is a sequential
    /// read-transform-write loop, so a side is never re-read while its
    /// produced write is still in flight.
    async fn proxy_phase(mut self) -> Result<()> {
        let idle = self.incoming.idle_timeout();
        let client = self.incoming.into_stream().ok_or(ProxyError::Eof)?;
        let remote = self
            .outgoing
            .take()
            .and_then(SocketCtx::into_stream)
            .ok_or(ProxyError::Eof)?;
        let cipher = Rc::new(RefCell::new(
            self.cipher.take().expect("cipher created at req_parse"),
        ));

        let (client_rd, client_wr) = tokio::io::split(client);
        let (remote_rd, remote_wr) = tokio::io::split(remote);
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();

        let up = uplink(client_rd, remote_wr, cipher.clone(), feedback_rx, idle);
        let down = downlink(remote_rd, client_wr, cipher, feedback_tx, idle);
        // The first error tears down both directions: the losing
        // future is dropped and its halves closed with it.
        tokio::try_join!(up, down).map(|_| ())
    }
}

/// Client → upstream. Encodes every read and forwards it; an empty
/// encode result means the obfs layer is mid-handshake and buffered
/// the payload, so reading pauses until the downlink signals feedback.
async fn uplink<R, W>(
    mut rd: ReadHalf<R>,
    mut wr: WriteHalf<W>,
    cipher: Rc<RefCell<TunnelCipher>>,
    mut feedback: mpsc::UnboundedReceiver<Vec<u8>>,
    idle: Duration,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite,
    W: AsyncRead + AsyncWrite,
{
    let mut parked = false;
    let mut buf = vec![0u8; SSR_BUFF_SIZE];
    loop {
        tokio::select! {
            biased;
            fb = feedback.recv() => {
                match fb {
                    Some(bytes) => {
                        wr.write_all(&bytes).await?;
                        parked = false;
                    }
                    // Downlink gone; its error ends the join.
                    None => return Ok(()),
                }
            }
            result = timeout(idle, rd.read(&mut buf)), if !parked => {
                let n = result.map_err(|_| ProxyError::Timeout)??;
                if n == 0 {
                    return Err(ProxyError::Eof);
                }
                let wire = cipher.borrow_mut().encrypt(&buf[..n])?;
                if wire.is_empty() {
                    parked = true;
                } else {
                    wr.write_all(&wire).await?;
                }
            }
        }
    }
}

/// Upstream → client. Decodes every read; feedback buffers go back to
/// the upstream socket through the uplink (which also resumes a parked
/// client read).
async fn downlink<R, W>(
    mut rd: ReadHalf<R>,
    mut wr: WriteHalf<W>,
    cipher: Rc<RefCell<TunnelCipher>>,
    feedback: mpsc::UnboundedSender<Vec<u8>>,
    idle: Duration,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite,
    W: AsyncRead + AsyncWrite,
{
    let mut buf = vec![0u8; SSR_BUFF_SIZE];
    loop {
        let n = timeout(idle, rd.read(&mut buf))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        if n == 0 {
            return Err(ProxyError::Eof);
        }
        let (plain, fb) = cipher.borrow_mut().decrypt(&buf[..n])?;
        if let Some(bytes) = fb {
            // Upstream handshake progress; route it to the uplink.
            let _ = feedback.send(bytes);
        }
        if !plain.is_empty() {
            wr.write_all(&plain).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll, Waker};

    use ssrlocal_crypto::{CipherCtx, CipherEnv};
    use ssrlocal_obfs::PlainPlugin;

    fn identity_cipher() -> TunnelCipher {
        let env = Rc::new(CipherEnv::new("pw", "none").unwrap());
        TunnelCipher::from_parts(
            CipherCtx::new_encrypt(env.clone()),
            CipherCtx::new_decrypt(env),
            Box::new(PlainPlugin::new()),
            Box::new(PlainPlugin::new()),
        )
    }

    #[derive(Default)]
    struct WriterState {
        release: bool,
        in_flight: bool,
        written: Vec<u8>,
        waker: Option<Waker>,
    }

    /// Write double that stays pending until released, recording that
    /// a write is in flight.
    struct StallWriter {
        state: Rc<RefCell<WriterState>>,
    }

    impl AsyncWrite for StallWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let mut state = self.state.borrow_mut();
            if state.release {
                state.in_flight = false;
                state.written.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            } else {
                state.in_flight = true;
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncRead for StallWriter {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    /// Read double that panics if polled while the paired writer has a
    /// write in flight — the back-pressure invariant made observable.
    struct CountingReader {
        chunks: VecDeque<Vec<u8>>,
        reads: Rc<Cell<usize>>,
        writer_state: Rc<RefCell<WriterState>>,
    }

    impl AsyncRead for CountingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            assert!(
                !self.writer_state.borrow().in_flight,
                "read issued while an A-sourced write is in flight"
            );
            match self.chunks.pop_front() {
                Some(chunk) => {
                    self.reads.set(self.reads.get() + 1);
                    buf.put_slice(&chunk);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Pending,
            }
        }
    }

    impl AsyncWrite for CountingReader {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_uplink_backpressure() {
        let reads = Rc::new(Cell::new(0usize));
        let writer_state = Rc::new(RefCell::new(WriterState::default()));

        let reader = CountingReader {
            chunks: VecDeque::from(vec![b"first".to_vec(), b"second".to_vec()]),
            reads: reads.clone(),
            writer_state: writer_state.clone(),
        };
        let writer = StallWriter {
            state: writer_state.clone(),
        };

        let (rd, _) = tokio::io::split(reader);
        let (_, wr) = tokio::io::split(writer);
        let cipher = Rc::new(RefCell::new(identity_cipher()));
        let (_fb_tx, fb_rx) = mpsc::unbounded_channel();

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let task = tokio::task::spawn_local(uplink::<CountingReader, StallWriter>(
                    rd,
                    wr,
                    cipher,
                    fb_rx,
                    Duration::from_secs(5),
                ));

                // Let the loop read once and stall on the write.
                for _ in 0..8 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(reads.get(), 1);
                assert!(writer_state.borrow().in_flight);

                // Release the write; the second read may now proceed.
                {
                    let mut state = writer_state.borrow_mut();
                    state.release = true;
                    if let Some(waker) = state.waker.take() {
                        waker.wake();
                    }
                }
                for _ in 0..8 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(reads.get(), 2);
                assert_eq!(writer_state.borrow().written, b"firstsecond");

                task.abort();
                let _ = task.await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_downlink_routes_feedback_upstream() {
        // An obfs that requests sendback on the first decode.
        struct HandshakeObfs {
            shook: bool,
        }
        impl ssrlocal_obfs::Plugin for HandshakeObfs {
            fn set_server_info(&mut self, _info: ssrlocal_obfs::ServerInfo) {}
            fn client_encode(&mut self, data: &[u8]) -> ssrlocal_obfs::Result<Vec<u8>> {
                if data.is_empty() && self.shook {
                    Ok(b"FINISH".to_vec())
                } else {
                    Ok(data.to_vec())
                }
            }
            fn client_decode(&mut self, data: &[u8]) -> ssrlocal_obfs::Result<(Vec<u8>, bool)> {
                if self.shook {
                    Ok((data.to_vec(), false))
                } else {
                    self.shook = true;
                    Ok((Vec::new(), true))
                }
            }
        }

        let env = Rc::new(CipherEnv::new("pw", "none").unwrap());
        let cipher = Rc::new(RefCell::new(TunnelCipher::from_parts(
            CipherCtx::new_encrypt(env.clone()),
            CipherCtx::new_decrypt(env),
            Box::new(PlainPlugin::new()),
            Box::new(HandshakeObfs { shook: false }),
        )));

        let (remote_side, mut remote_peer) = tokio::io::duplex(1024);
        let (client_side, mut client_peer) = tokio::io::duplex(1024);
        let (remote_rd, _remote_wr) = tokio::io::split(remote_side);
        let (_client_rd, client_wr) = tokio::io::split(client_side);
        let (fb_tx, mut fb_rx) = mpsc::unbounded_channel();

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let task = tokio::task::spawn_local(downlink::<_, _>(
                    remote_rd,
                    client_wr,
                    cipher,
                    fb_tx,
                    Duration::from_secs(5),
                ));

                // First server packet triggers feedback, not payload.
                remote_peer.write_all(b"server-hello").await.unwrap();
                let fb = fb_rx.recv().await.unwrap();
                assert_eq!(fb, b"FINISH");

                // Second packet flows to the client.
                remote_peer.write_all(b"payload").await.unwrap();
                let mut out = [0u8; 7];
                client_peer.read_exact(&mut out).await.unwrap();
                assert_eq!(&out, b"payload");

                task.abort();
                let _ = task.await;
            })
            .await;
    }
}
