//! Streaming compression wrapper for the tunnel byte pipe.
//!
//! Sits between the tunnel and the mux when compression is enabled:
//! writes go through a zstd encoder (flushed at every mux flush so
//! interactive traffic is not held back), reads through a decoder that
//! accepts multiple frames.
use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf, ReadHalf, WriteHalf};

pub struct CompressedStream<S> {
    reader: ZstdDecoder<BufReader<ReadHalf<S>>>,
    writer: ZstdEncoder<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> CompressedStream<S> {
    pub fn new(io: S) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let mut reader = ZstdDecoder::new(BufReader::new(read_half));
        reader.multiple_members(true);
        Self {
            reader,
            writer: ZstdEncoder::new(write_half),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for CompressedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for CompressedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}
