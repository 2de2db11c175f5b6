use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dmsg_core::{DmsgError, PublicKey, SESSION_HANDSHAKE_TIMEOUT};
use dmsg_crypto::{Decryptor, Encryptor, HandshakePattern, Keypair, Noise, NonceWindow, Transport};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{HandshakeError, Result, SessionError};
use crate::frame::{read_raw_frame, write_raw_frame};
use crate::lifecycle::Lifecycle;
use crate::mux::{Mux, SubStream};
use crate::object::SignedObject;

/// First frame read from a sub-stream.
#[derive(Debug)]
pub enum Inbound {
    /// Empty frame: a keep-alive probe to be echoed.
    Probe,
    Object(SignedObject),
}

/// The encrypted, multiplexed link between a client and a relay.
///
/// The TCP connection carries a yamux multiplexer. Each sub-stream opens with
/// one signed object encrypted under the session's Noise IK ciphers; objects
/// from different sub-streams may be decrypted out of order, so incoming
/// nonces are checked against a sliding window instead of a counter.
pub struct SessionCommon {
    local_pk: PublicKey,
    remote_pk: PublicKey,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    mux: Mux,
    encryptor: Mutex<Encryptor>,
    /// `None` once closed, so reads fail instead of blocking.
    decryptor: Mutex<Option<(Decryptor, NonceWindow)>>,
    life: Lifecycle,
    cancel: CancellationToken,
}

impl SessionCommon {
    /// Client side: IK initiator towards the relay `remote_pk`.
    pub async fn init_client(
        keypair: &Keypair,
        mut conn: TcpStream,
        remote_pk: PublicKey,
        cancel: CancellationToken,
    ) -> std::result::Result<Self, HandshakeError> {
        let transport = tokio::time::timeout(
            SESSION_HANDSHAKE_TIMEOUT,
            initiator_handshake(keypair, &mut conn, remote_pk),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)??;
        Ok(Self::from_transport(keypair, conn, transport, yamux::Mode::Client, cancel))
    }

    /// Server side: IK responder, learns the client's key from the handshake.
    pub async fn init_server(
        keypair: &Keypair,
        conn: TcpStream,
        cancel: CancellationToken,
    ) -> std::result::Result<Self, HandshakeError> {
        let (conn, transport) =
            tokio::time::timeout(SESSION_HANDSHAKE_TIMEOUT, responder_handshake(keypair, conn))
                .await
                .map_err(|_| HandshakeError::Timeout)??;
        Ok(Self::from_transport(keypair, conn, transport, yamux::Mode::Server, cancel))
    }

    fn from_transport(
        keypair: &Keypair,
        conn: TcpStream,
        transport: Transport,
        mode: yamux::Mode,
        cancel: CancellationToken,
    ) -> Self {
        let local_addr = conn.local_addr().ok();
        let remote_addr = conn.peer_addr().ok();
        debug!(
            remote_pk = %transport.remote_pk,
            remote_addr = ?remote_addr,
            "Session established"
        );
        Self {
            local_pk: keypair.public_key(),
            remote_pk: transport.remote_pk,
            local_addr,
            remote_addr,
            mux: Mux::new(conn, mode, cancel.clone()),
            encryptor: Mutex::new(transport.encryptor),
            decryptor: Mutex::new(Some((transport.decryptor, NonceWindow::new()))),
            life: Lifecycle::new(),
            cancel,
        }
    }

    pub fn local_pk(&self) -> PublicKey {
        self.local_pk
    }

    pub fn remote_pk(&self) -> PublicKey {
        self.remote_pk
    }

    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_tcp_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        !self.life.is_open() || self.cancel.is_cancelled()
    }

    /// Resolves once the session is closed locally or the connection dies.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DmsgError::SessionClosed.into());
        }
        Ok(())
    }

    pub async fn open_sub_stream(&self) -> Result<SubStream> {
        self.ensure_open()?;
        Ok(self.mux.open().await?)
    }

    pub async fn accept_sub_stream(&self) -> Result<SubStream> {
        self.ensure_open()?;
        Ok(self.mux.accept().await?)
    }

    /// Encrypt `obj` with the session cipher and write it as one frame.
    pub async fn write_object<W>(&self, w: &mut W, obj: &SignedObject) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.ensure_open()?;
        let frame = self.encryptor.lock().encrypt(obj.as_bytes())?;
        if frame.len() > u16::MAX as usize {
            return Err(SessionError::ObjectTooLarge(obj.len()));
        }
        write_raw_frame(w, &frame).await?;
        Ok(())
    }

    pub async fn read_inbound<R>(&self, r: &mut R) -> Result<Inbound>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_open()?;
        let frame = read_raw_frame(r).await?;
        if frame.is_empty() {
            return Ok(Inbound::Probe);
        }
        let mut guard = self.decryptor.lock();
        let (decryptor, window) = guard.as_mut().ok_or(DmsgError::SessionClosed)?;
        let plain = decryptor.decrypt_windowed(window, &frame)?;
        trace!(remote_pk = %self.remote_pk, len = plain.len(), "Read session object");
        Ok(Inbound::Object(SignedObject::from_bytes(plain)))
    }

    pub async fn read_object<R>(&self, r: &mut R) -> Result<SignedObject>
    where
        R: AsyncRead + Unpin,
    {
        match self.read_inbound(r).await? {
            Inbound::Object(obj) => Ok(obj),
            Inbound::Probe => Err(SessionError::UnexpectedProbe),
        }
    }

    /// Round trip of an empty probe frame over a fresh sub-stream.
    pub async fn ping(&self) -> Result<Duration> {
        let mut stream = self.open_sub_stream().await?;
        let start = Instant::now();
        write_raw_frame(&mut stream, &[]).await?;
        let echo = read_raw_frame(&mut stream).await?;
        let rtt = start.elapsed();
        if !echo.is_empty() {
            return Err(SessionError::UnexpectedProbe);
        }
        let _ = stream.shutdown().await;
        Ok(rtt)
    }

    /// Echo a probe received on `stream` and close it.
    pub async fn answer_probe(&self, mut stream: SubStream) -> Result<()> {
        write_raw_frame(&mut stream, &[]).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Idempotent. Returns true for the call that actually closed the session.
    pub fn close(&self) -> bool {
        if !self.life.begin_close() {
            return false;
        }
        self.decryptor.lock().take();
        self.mux.close();
        self.cancel.cancel();
        self.life.finish_close();
        debug!(remote_pk = %self.remote_pk, "Session closed");
        true
    }
}

impl std::fmt::Debug for SessionCommon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCommon")
            .field("local_pk", &self.local_pk)
            .field("remote_pk", &self.remote_pk)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn initiator_handshake(
    keypair: &Keypair,
    conn: &mut TcpStream,
    remote_pk: PublicKey,
) -> std::result::Result<Transport, HandshakeError> {
    let mut noise = Noise::new(HandshakePattern::IK, keypair, Some(remote_pk), true)?;
    write_raw_frame(conn, &noise.write_message(&[])?).await?;
    // Read unbuffered: the relay may start multiplexing right after its reply.
    let reply = read_raw_frame(conn).await?;
    noise.read_message(&reply)?;
    Ok(noise.into_transport()?)
}

async fn responder_handshake(
    keypair: &Keypair,
    conn: TcpStream,
) -> std::result::Result<(TcpStream, Transport), HandshakeError> {
    let mut noise = Noise::new(HandshakePattern::IK, keypair, None, false)?;
    let mut reader = BufReader::new(conn);
    let msg = read_raw_frame(&mut reader).await?;
    // The initiator sends nothing else until it has our reply.
    if !reader.buffer().is_empty() {
        return Err(DmsgError::SessionHandshakeExtraBytes.into());
    }
    let mut conn = reader.into_inner();
    noise.read_message(&msg)?;
    write_raw_frame(&mut conn, &noise.write_message(&[])?).await?;
    Ok((conn, noise.into_transport()?))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dmsg_crypto::{sign_data, Keypair};
    use tokio::net::TcpListener;

    use super::*;

    async fn connected() -> (SessionCommon, SessionCommon, Keypair, Keypair) {
        dmsg_logging::try_init_for_tests();
        let client_kp = Keypair::generate();
        let server_kp = Keypair::generate();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = {
            let kp = server_kp.clone();
            tokio::spawn(async move {
                let (conn, _) = listener.accept().await.unwrap();
                SessionCommon::init_server(&kp, conn, CancellationToken::new())
                    .await
                    .unwrap()
            })
        };
        let conn = TcpStream::connect(addr).await.unwrap();
        let client = SessionCommon::init_client(
            &client_kp,
            conn,
            server_kp.public_key(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (client, server.await.unwrap(), client_kp, server_kp)
    }

    fn object(kp: &Keypair, body: &[u8]) -> SignedObject {
        let mut raw = sign_data(kp, body).to_vec();
        raw.extend_from_slice(body);
        SignedObject::from_bytes(raw)
    }

    #[tokio::test]
    async fn test_handshake_learns_client_key() {
        let (client, server, client_kp, server_kp) = connected().await;
        assert_eq!(client.remote_pk(), server_kp.public_key());
        assert_eq!(server.remote_pk(), client_kp.public_key());
        assert_eq!(client.local_tcp_addr(), server.remote_tcp_addr());
    }

    #[tokio::test]
    async fn test_objects_over_sub_streams() {
        let (client, server, client_kp, _) = connected().await;
        let first = object(&client_kp, b"first");
        let second = object(&client_kp, b"second");

        let mut s1 = client.open_sub_stream().await.unwrap();
        let mut s2 = client.open_sub_stream().await.unwrap();
        client.write_object(&mut s1, &first).await.unwrap();
        client.write_object(&mut s2, &second).await.unwrap();

        let mut got = Vec::new();
        for _ in 0..2 {
            let mut sub = server.accept_sub_stream().await.unwrap();
            got.push(server.read_object(&mut sub).await.unwrap());
        }
        got.sort_by_key(|o| o.len());
        assert_eq!(got, vec![first, second]);
    }

    #[tokio::test]
    async fn test_ping() {
        let (client, server, _, _) = connected().await;
        let server = Arc::new(server);
        let responder = {
            let server = server.clone();
            tokio::spawn(async move {
                let mut sub = server.accept_sub_stream().await.unwrap();
                assert!(matches!(
                    server.read_inbound(&mut sub).await.unwrap(),
                    Inbound::Probe
                ));
                server.answer_probe(sub).await.unwrap();
            })
        };
        client.ping().await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_io() {
        let (client, server, _, _) = connected().await;
        assert!(client.close());
        assert!(!client.close());
        assert!(client.is_closed());
        assert!(matches!(
            client.open_sub_stream().await,
            Err(SessionError::Protocol(DmsgError::SessionClosed))
        ));

        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_extra_handshake_bytes_rejected() {
        let client_kp = Keypair::generate();
        let server_kp = Keypair::generate();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_pk = server_kp.public_key();
        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            SessionCommon::init_server(&server_kp, conn, CancellationToken::new()).await
        });

        let mut noise = Noise::new(HandshakePattern::IK, &client_kp, Some(server_pk), true).unwrap();
        let msg = noise.write_message(&[]).unwrap();
        let mut wire = (msg.len() as u16).to_be_bytes().to_vec();
        wire.extend_from_slice(&msg);
        wire.extend_from_slice(b"junk");
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&wire).await.unwrap();

        assert!(matches!(
            server.await.unwrap(),
            Err(HandshakeError::Protocol(DmsgError::SessionHandshakeExtraBytes))
        ));
    }
}
