//! Length-prefixed framing
//!
//! Every frame is `length (u16 BE) || body`. Handshake messages and signed
//! objects are sent as single frames; stream data is split into encrypted
//! frames of at most [`MAX_FRAME_SIZE`] bytes by [`NoiseStream`].

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BufMut, BytesMut};
use dmsg_crypto::{Decryptor, Encryptor, Transport, FRAME_OVERHEAD};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const LEN_PREFIX: usize = 2;

/// Largest encrypted stream frame on the wire, prefix included.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Largest plaintext carried by one stream frame.
pub const MAX_FRAME_PAYLOAD: usize = MAX_FRAME_SIZE - LEN_PREFIX - FRAME_OVERHEAD;

pub async fn write_raw_frame<W>(w: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(body.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u16 length")
    })?;
    let mut buf = Vec::with_capacity(LEN_PREFIX + body.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(body);
    w.write_all(&buf).await?;
    w.flush().await
}

pub async fn read_raw_frame<R>(r: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = r.read_u16().await? as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

fn invalid_data<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Byte stream encrypted with the transport ciphers of a finished handshake.
pub struct NoiseStream<S> {
    inner: S,
    encryptor: Encryptor,
    decryptor: Decryptor,
    /// Raw bytes read from `inner`, not yet a complete frame.
    rbuf: BytesMut,
    /// Decrypted bytes not yet handed to the reader.
    plain: BytesMut,
    /// Encoded frames not yet accepted by `inner`.
    wbuf: BytesMut,
    eof: bool,
}

impl<S> NoiseStream<S> {
    pub fn new(inner: S, transport: Transport) -> Self {
        Self {
            inner,
            encryptor: transport.encryptor,
            decryptor: transport.decryptor,
            rbuf: BytesMut::new(),
            plain: BytesMut::new(),
            wbuf: BytesMut::new(),
            eof: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Split one complete frame off `rbuf`, if buffered.
    fn take_frame(&mut self) -> io::Result<Option<BytesMut>> {
        if self.rbuf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.rbuf[0], self.rbuf[1]]) as usize;
        if len < FRAME_OVERHEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("stream frame of {len} bytes is too short"),
            ));
        }
        if self.rbuf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        self.rbuf.advance(LEN_PREFIX);
        Ok(Some(self.rbuf.split_to(len)))
    }
}

impl<S: AsyncWrite + Unpin> NoiseStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.wbuf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.wbuf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.wbuf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for NoiseStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if !this.plain.is_empty() {
                let n = this.plain.len().min(buf.remaining());
                buf.put_slice(&this.plain.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if let Some(frame) = this.take_frame()? {
                let plain = this.decryptor.decrypt(&frame).map_err(invalid_data)?;
                this.plain.extend_from_slice(&plain);
                continue;
            }
            if this.eof {
                if this.rbuf.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }

            let mut chunk = [0u8; MAX_FRAME_SIZE];
            let mut read = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read))?;
            if read.filled().is_empty() {
                this.eof = true;
            } else {
                this.rbuf.extend_from_slice(read.filled());
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for NoiseStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = data.len().min(MAX_FRAME_PAYLOAD);
        let frame = this
            .encryptor
            .encrypt(&data[..n])
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        this.wbuf.reserve(LEN_PREFIX + frame.len());
        this.wbuf.put_u16(frame.len() as u16);
        this.wbuf.extend_from_slice(&frame);

        // The frame is ours now; a pending drain finishes on the next call.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use dmsg_crypto::{HandshakePattern, Keypair, Noise};
    use tokio::io::duplex;

    use super::*;

    fn transports() -> (Transport, Transport) {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut init = Noise::new(HandshakePattern::KK, &a, Some(b.public_key()), true).unwrap();
        let mut resp = Noise::new(HandshakePattern::KK, &b, Some(a.public_key()), false).unwrap();
        resp.read_message(&init.write_message(&[]).unwrap()).unwrap();
        init.read_message(&resp.write_message(&[]).unwrap()).unwrap();
        (init.into_transport().unwrap(), resp.into_transport().unwrap())
    }

    #[tokio::test]
    async fn test_raw_frame() {
        let (mut a, mut b) = duplex(1024);
        write_raw_frame(&mut a, b"hello").await.unwrap();
        write_raw_frame(&mut a, b"").await.unwrap();
        assert_eq!(read_raw_frame(&mut b).await.unwrap(), b"hello");
        assert!(read_raw_frame(&mut b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_raw_frame_too_large() {
        let (mut a, _b) = duplex(1024);
        let err = write_raw_frame(&mut a, &vec![0u8; 70_000]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_noise_stream_splits_large_writes() {
        let (ta, tb) = transports();
        let (a, b) = duplex(64 * 1024);
        let mut a = NoiseStream::new(a, ta);
        let mut b = NoiseStream::new(b, tb);

        let payload: Vec<u8> = (0..3 * MAX_FRAME_PAYLOAD + 17).map(|i| i as u8).collect();
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                a.write_all(&payload).await.unwrap();
                a.shutdown().await.unwrap();
            })
        };

        let mut got = Vec::new();
        b.read_to_end(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_noise_stream_rejects_tampering() {
        let (mut ta, tb) = transports();
        let (mut a, b) = duplex(1024);
        let mut b = NoiseStream::new(b, tb);

        let mut frame = ta.encryptor.encrypt(b"secret").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 1;
        write_raw_frame(&mut a, &frame).await.unwrap();

        let mut buf = [0u8; 16];
        let err = b.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_noise_stream_truncated_frame() {
        let (_, tb) = transports();
        let (mut a, b) = duplex(1024);
        let mut b = NoiseStream::new(b, tb);

        a.write_all(&[0, 40, 1, 2, 3]).await.unwrap();
        drop(a);

        let mut buf = [0u8; 16];
        let err = b.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
