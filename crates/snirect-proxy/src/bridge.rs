use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const COPY_CHUNK_SIZE: usize = 16 * 1024;

/// Pipes bytes between the two sides until both directions have seen EOF.
///
/// When one direction ends, the opposite side gets a write-shutdown
/// (half-close) so protocols that use FIN as end-of-stream keep working;
/// the loop only exits once both directions are done. Returns the byte
/// counts (client->origin, origin->client).
pub(crate) async fn bridge<C, O>(client: &mut C, origin: &mut O) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = [0u8; COPY_CHUNK_SIZE];
    let mut origin_buf = [0u8; COPY_CHUNK_SIZE];
    let mut from_client = 0u64;
    let mut from_origin = 0u64;
    let mut client_done = false;
    let mut origin_done = false;

    loop {
        if client_done && origin_done {
            return Ok((from_client, from_origin));
        }

        tokio::select! {
            read = client.read(&mut client_buf), if !client_done => {
                let read = read?;
                if read == 0 {
                    client_done = true;
                    shutdown_quietly(origin).await;
                } else {
                    origin.write_all(&client_buf[..read]).await?;
                    from_client += read as u64;
                }
            }
            read = origin.read(&mut origin_buf), if !origin_done => {
                let read = read?;
                if read == 0 {
                    origin_done = true;
                    shutdown_quietly(client).await;
                } else {
                    client.write_all(&origin_buf[..read]).await?;
                    from_origin += read as u64;
                }
            }
        }
    }
}

/// A peer that resets instead of closing cleanly would surface its error
/// again on the next read; shutdown failures carry no extra signal.
async fn shutdown_quietly<S: AsyncWrite + Unpin>(stream: &mut S) {
    let _ = stream.shutdown().await;
}

/// Replays bytes that were read past the request head before handing the
/// socket to the next protocol layer (the TLS acceptor or the raw tunnel).
pub(crate) struct Rewind<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> Rewind<S> {
    pub(crate) fn new(prefix: Vec<u8>, inner: S) -> Rewind<S> {
        Rewind {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let available = &this.prefix[this.offset..];
            let take = available.len().min(buf.remaining());
            buf.put_slice(&available[..take]);
            this.offset += take;
            if this.offset == this.prefix.len() {
                this.prefix = Vec::new();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
