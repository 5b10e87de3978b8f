//! AEAD 分帧加密流
//!
//! 每个逻辑帧由两段独立封装的密文组成：
//!
//! ```text
//! seal(len: u16) || seal(payload[len])
//! 2 + 16 字节      len + 16 字节
//! ```
//!
//! 密钥和两个方向的初始 nonce 都由共享密码经 HKDF-SHA256 派生，nonce 按小端
//! 计数器递增，不在线路上传输。解密失败对连接是致命的，之后的读取一律报错。

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{GatewayError, Result};

pub const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 12;
/// 单帧最大明文长度
pub const MAX_PAYLOAD: usize = 0xFFFF - TAG_LEN;
const KDF_SALT: &[u8] = b"smart-gateway stream cipher";

/// 连接中的角色，决定读写各用哪一路 nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// 由密码派生出的密钥材料
#[derive(Clone)]
pub struct CipherKey {
    key: [u8; 32],
    client_nonce: [u8; NONCE_LEN],
    server_nonce: [u8; NONCE_LEN],
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

impl CipherKey {
    pub fn derive(password: &str) -> Result<Self> {
        if password.is_empty() {
            return Err(GatewayError::config("加密密码不能为空"));
        }
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), password.as_bytes());
        let mut key = [0u8; 32];
        let mut client_nonce = [0u8; NONCE_LEN];
        let mut server_nonce = [0u8; NONCE_LEN];
        for (info, out) in [
            (&b"key"[..], &mut key[..]),
            (&b"client nonce"[..], &mut client_nonce[..]),
            (&b"server nonce"[..], &mut server_nonce[..]),
        ] {
            hk.expand(info, out)
                .map_err(|_| GatewayError::config("HKDF 输出长度非法"))?;
        }
        Ok(Self {
            key,
            client_nonce,
            server_nonce,
        })
    }
}

/// 96 位小端计数器 nonce
#[derive(Debug, Clone)]
struct NonceSeq([u8; NONCE_LEN]);

impl NonceSeq {
    fn next(&mut self) -> Nonce {
        let current = Nonce::clone_from_slice(&self.0);
        for byte in self.0.iter_mut() {
            let (v, carry) = byte.overflowing_add(1);
            *byte = v;
            if !carry {
                break;
            }
        }
        current
    }
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    Length,
    Payload(usize),
    Broken,
}

pub struct StreamCipher<S> {
    inner: S,
    aead: ChaCha20Poly1305,
    read_nonce: NonceSeq,
    write_nonce: NonceSeq,
    read_state: ReadState,
    /// 尚未凑够一段密文的输入
    sealed: Vec<u8>,
    plain: Vec<u8>,
    plain_pos: usize,
    /// 已封装、尚未写出的密文
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> StreamCipher<S> {
    pub fn new(inner: S, key: &CipherKey, role: Role) -> Self {
        let (read_seed, write_seed) = match role {
            Role::Client => (key.server_nonce, key.client_nonce),
            Role::Server => (key.client_nonce, key.server_nonce),
        };
        Self {
            inner,
            aead: ChaCha20Poly1305::new(Key::from_slice(&key.key)),
            read_nonce: NonceSeq(read_seed),
            write_nonce: NonceSeq(write_seed),
            read_state: ReadState::Length,
            sealed: Vec::new(),
            plain: Vec::new(),
            plain_pos: 0,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// 取回底层流，未处理的缓冲全部丢弃
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn seal_frame(&mut self, chunk: &[u8]) -> io::Result<()> {
        let len = (chunk.len() as u16).to_be_bytes();
        let sealed_len = self
            .aead
            .encrypt(&self.write_nonce.next(), &len[..])
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "加密失败"))?;
        let sealed_payload = self
            .aead
            .encrypt(&self.write_nonce.next(), chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "加密失败"))?;
        self.pending.extend_from_slice(&sealed_len);
        self.pending.extend_from_slice(&sealed_payload);
        Ok(())
    }

    fn open(&mut self, need: usize) -> io::Result<Vec<u8>> {
        let nonce = self.read_nonce.next();
        let result = self.aead.decrypt(&nonce, &self.sealed[..need]);
        self.sealed.drain(..need);
        result.map_err(|_| {
            self.read_state = ReadState::Broken;
            GatewayError::DecryptionFailure.into()
        })
    }
}

impl<S: AsyncWrite + Unpin> StreamCipher<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for StreamCipher<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.plain_pos < this.plain.len() {
                let available = &this.plain[this.plain_pos..];
                let n = available.len().min(out.remaining());
                out.put_slice(&available[..n]);
                this.plain_pos += n;
                return Poll::Ready(Ok(()));
            }

            let need = match this.read_state {
                ReadState::Length => 2 + TAG_LEN,
                ReadState::Payload(len) => len + TAG_LEN,
                ReadState::Broken => {
                    return Poll::Ready(Err(GatewayError::DecryptionFailure.into()));
                }
            };

            while this.sealed.len() < need {
                let mut chunk = [0u8; 4096];
                let mut buf = ReadBuf::new(&mut chunk);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut buf))?;
                let filled = buf.filled();
                if filled.is_empty() {
                    if this.sealed.is_empty() && matches!(this.read_state, ReadState::Length) {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "密文帧被截断",
                    )));
                }
                this.sealed.extend_from_slice(filled);
            }

            let opened = this.open(need)?;
            match this.read_state {
                ReadState::Length => {
                    let len = u16::from_be_bytes([opened[0], opened[1]]) as usize;
                    if len == 0 || len > MAX_PAYLOAD {
                        this.read_state = ReadState::Broken;
                        return Poll::Ready(Err(GatewayError::DecryptionFailure.into()));
                    }
                    this.read_state = ReadState::Payload(len);
                }
                ReadState::Payload(_) => {
                    this.plain = opened;
                    this.plain_pos = 0;
                    this.read_state = ReadState::Length;
                }
                ReadState::Broken => unreachable!("broken state returns early"),
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for StreamCipher<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        for chunk in buf.chunks(MAX_PAYLOAD) {
            this.seal_frame(chunk)?;
        }
        // 数据已被接收，尽量写出；剩余部分由下一次 write/flush 推进
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
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
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn key(password: &str) -> CipherKey {
        CipherKey::derive(password).unwrap()
    }

    #[test]
    fn test_nonce_counter_carries() {
        let mut seq = NonceSeq([0xff, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let first = seq.next();
        assert_eq!(first.as_slice()[0], 0xff);
        assert_eq!(seq.0[..3], [0, 0, 1]);
    }

    #[tokio::test]
    async fn test_round_trip_both_directions() {
        let k = key("shared-secret");
        let (a, b) = duplex(64 * 1024);
        let mut client = StreamCipher::new(a, &k, Role::Client);
        let mut server = StreamCipher::new(b, &k, Role::Server);

        // 超过单帧上限，触发分帧
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.flush().await.unwrap();
            client
        });

        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        let mut client = writer.await.unwrap();
        server.write_all(b"pong").await.unwrap();
        server.flush().await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[tokio::test]
    async fn test_small_reads_across_frame() {
        let k = key("shared-secret");
        let (a, mut raw) = duplex(4096);
        let mut client = StreamCipher::new(a, &k, Role::Client);
        client.write_all(b"hello world").await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire.len(), 2 + TAG_LEN + 11 + TAG_LEN);

        let mut server = StreamCipher::new(&wire[..], &k, Role::Server);
        let mut out = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = server.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_tampered_frame_is_fatal() {
        let k = key("shared-secret");
        let (a, mut raw) = duplex(4096);
        let mut client = StreamCipher::new(a, &k, Role::Client);
        client.write_all(b"attack at dawn").await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let mut server = StreamCipher::new(&wire[..], &k, Role::Server);
        let mut out = [0u8; 64];
        let err = server.read(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // 之后的读取同样失败
        assert!(server.read(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_password_fails() {
        let (a, mut raw) = duplex(4096);
        let mut client = StreamCipher::new(a, &key("password-one"), Role::Client);
        client.write_all(b"data").await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        let mut server = StreamCipher::new(&wire[..], &key("password-two"), Role::Server);
        let mut out = [0u8; 8];
        assert_eq!(
            server.read(&mut out).await.unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let k = key("shared-secret");
        let (a, mut raw) = duplex(4096);
        let mut client = StreamCipher::new(a, &k, Role::Client);
        client.write_all(b"data").await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        wire.truncate(wire.len() - 2);

        let mut server = StreamCipher::new(&wire[..], &k, Role::Server);
        let mut out = [0u8; 8];
        assert_eq!(
            server.read(&mut out).await.unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(CipherKey::derive("").is_err());
    }
}
