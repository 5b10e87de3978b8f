use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// 单次预读上限，避免探测阶段被灌入过多数据
const MAX_SNIFF_BUFFER: usize = 16 * 1024;

/// 可录制、可回放的连接包装
///
/// 两个正交开关：
/// - 录制：从底层读到的字节同时追加进内部缓冲
/// - 回放偏移：偏移小于缓冲长度时优先从缓冲读
///
/// `start_recording` → 读若干字节 → `rewind` → 全部读出，得到的字节序列
/// 与直接读底层流完全一致，每个字节恰好一次。探测阶段写操作会被拒绝，
/// 防止探测代码在交接前误发数据。
#[derive(Debug)]
pub struct SniffingConn<S> {
    inner: S,
    buf: Vec<u8>,
    offset: usize,
    recording: bool,
    detecting: bool,
}

impl<S> SniffingConn<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            offset: 0,
            recording: false,
            detecting: true,
        }
    }

    /// 开始录制；已回放完的缓冲被清空
    pub fn start_recording(&mut self) {
        if self.offset >= self.buf.len() {
            self.buf.clear();
        }
        self.offset = 0;
        self.recording = true;
    }

    /// 回到缓冲起点，下次读取从头回放
    pub fn rewind(&mut self) {
        self.offset = 0;
    }

    /// 停止录制；缓冲读完后直接读底层流
    pub fn stop_recording(&mut self) {
        self.recording = false;
        if self.offset >= self.buf.len() {
            self.buf.clear();
            self.offset = 0;
        }
    }

    /// 结束探测阶段，允许写入
    pub fn finish_detect(&mut self) {
        self.detecting = false;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// 已录制的全部字节
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// 尚未回放的字节数
    pub fn pending(&self) -> usize {
        self.buf.len().saturating_sub(self.offset)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: AsyncRead + Unpin> SniffingConn<S> {
    /// 录制模式下从底层多读一块数据，返回新增字节数（0 表示 EOF 或缓冲已满）
    ///
    /// 读取后偏移停在缓冲末尾，调用方解析完 `buffered()` 后应 `rewind()`。
    pub async fn read_more(&mut self) -> io::Result<usize> {
        if !self.recording {
            self.start_recording();
        }
        if self.buf.len() >= MAX_SNIFF_BUFFER {
            return Ok(0);
        }
        self.offset = self.buf.len();
        let mut chunk = [0u8; 4096];
        let want = (MAX_SNIFF_BUFFER - self.buf.len()).min(chunk.len());
        self.read(&mut chunk[..want]).await
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffingConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.offset < this.buf.len() {
            let available = &this.buf[this.offset..];
            let n = available.len().min(out.remaining());
            out.put_slice(&available[..n]);
            this.offset += n;
            if !this.recording && this.offset >= this.buf.len() {
                this.buf.clear();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }

        let before = out.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, out) {
            Poll::Ready(Ok(())) => {
                if this.recording {
                    let fresh = &out.filled()[before..];
                    this.buf.extend_from_slice(fresh);
                    this.offset = this.buf.len();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffingConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.detecting {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "探测阶段禁止写入",
            )));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_rewind_replays_exactly_once() {
        let (mut peer, local) = duplex(1024);
        peer.write_all(b"hello world").await.unwrap();

        let mut conn = SniffingConn::new(local);
        conn.start_recording();

        let mut first = [0u8; 11];
        conn.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"hello world");

        conn.rewind();
        let mut second = [0u8; 11];
        conn.read_exact(&mut second).await.unwrap();
        assert_eq!(&second, b"hello world");

        conn.stop_recording();
        peer.write_all(b"!tail").await.unwrap();
        drop(peer);

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"!tail");
    }

    #[tokio::test]
    async fn test_partial_replay_then_live() {
        let (mut peer, local) = duplex(1024);
        peer.write_all(b"abcdef").await.unwrap();

        let mut conn = SniffingConn::new(local);
        conn.start_recording();
        let n = conn.read_more().await.unwrap();
        assert_eq!(n, 6);
        assert_eq!(conn.buffered(), b"abcdef");

        conn.rewind();
        conn.stop_recording();
        peer.write_all(b"ghi").await.unwrap();
        drop(peer);

        let mut all = Vec::new();
        conn.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"abcdefghi");
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn test_small_reader_buffers() {
        let (mut peer, local) = duplex(1024);
        peer.write_all(b"0123456789").await.unwrap();
        drop(peer);

        let mut conn = SniffingConn::new(local);
        conn.start_recording();
        let mut sink = Vec::new();
        conn.read_to_end(&mut sink).await.unwrap();
        conn.rewind();

        let mut out = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = conn.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"0123456789");
    }

    #[tokio::test]
    async fn test_write_rejected_while_detecting() {
        let (_peer, local) = duplex(64);
        let mut conn = SniffingConn::new(local);

        let err = conn.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        conn.finish_detect();
        conn.write_all(b"x").await.unwrap();
    }
}
