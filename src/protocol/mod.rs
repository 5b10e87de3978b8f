//! 私有隧道协议：自定义定长头协议与 Trojan 兼容协议
//!
//! 服务端 `unwrap` 读取并校验协议头，得到目标地址；客户端 `wrap` 返回一个
//! 在第一次写入时才发送协议头的流。

pub mod trojan;
pub mod tunnel;

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::{GatewayError, Result};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// 目标地址，按 ATYP 分三种
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl TargetAddr {
    /// IP 字面量解析为对应的 IP 变体，其余视为域名
    pub fn from_host_port(host: &str, port: u16) -> Self {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => TargetAddr::Ipv4(v4, port),
            Ok(IpAddr::V6(v6)) => TargetAddr::Ipv6(v6, port),
            Err(_) => TargetAddr::Domain(host.to_ascii_lowercase(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ipv4(_, port) | TargetAddr::Ipv6(_, port) | TargetAddr::Domain(_, port) => {
                *port
            }
        }
    }

    /// 域名目标返回域名，IP 目标返回 None
    pub fn domain(&self) -> Option<&str> {
        match self {
            TargetAddr::Domain(domain, _) => Some(domain),
            _ => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            TargetAddr::Ipv4(ip, _) => Some(IpAddr::V4(*ip)),
            TargetAddr::Ipv6(ip, _) => Some(IpAddr::V6(*ip)),
            TargetAddr::Domain(..) => None,
        }
    }

    /// 主机部分的文本形式（不带端口、不带方括号）
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip, _) => ip.to_string(),
            TargetAddr::Ipv6(ip, _) => ip.to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    /// 写入 `ATYP | ADDR | PORT`（SOCKS5 / Trojan 共用）
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            TargetAddr::Ipv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Ipv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                if domain.is_empty() || domain.len() > 255 {
                    return Err(GatewayError::malformed(format!("域名长度非法: {}", domain.len())));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(())
    }

    /// 读取 `ADDR | PORT`，ATYP 已由调用方读出
    pub async fn read_from<R>(reader: &mut R, atyp: u8) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let target = match atyp {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                reader.read_exact(&mut addr).await?;
                TargetAddr::Ipv4(Ipv4Addr::from(addr), reader.read_u16().await?)
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                reader.read_exact(&mut addr).await?;
                TargetAddr::Ipv6(Ipv6Addr::from(addr), reader.read_u16().await?)
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                if len == 0 {
                    return Err(GatewayError::malformed("空域名"));
                }
                let mut domain = vec![0u8; len];
                reader.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| GatewayError::malformed("域名不是合法 UTF-8"))?;
                TargetAddr::Domain(domain.to_ascii_lowercase(), reader.read_u16().await?)
            }
            other => {
                return Err(GatewayError::malformed(format!("不支持的地址类型: {}", other)));
            }
        };
        Ok(target)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            TargetAddr::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// 隧道协议种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelProtocol {
    /// 0x80 开头的定长头私有协议
    Custom,
    /// Trojan 兼容协议
    Trojan,
}

impl TunnelProtocol {
    /// 协议头的首字节能否属于本协议；两种协议的首字节集合互不相交
    pub fn accepts_first_byte(self, byte: u8) -> bool {
        match self {
            TunnelProtocol::Custom => byte == tunnel::CMD_PRIVATE,
            TunnelProtocol::Trojan => byte.is_ascii_hexdigit(),
        }
    }
}

impl FromStr for TunnelProtocol {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "custom" | "private" => Ok(TunnelProtocol::Custom),
            "trojan" => Ok(TunnelProtocol::Trojan),
            other => Err(GatewayError::config(format!("未知隧道协议: {}", other))),
        }
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelProtocol::Custom => write!(f, "custom"),
            TunnelProtocol::Trojan => write!(f, "trojan"),
        }
    }
}

/// 某种隧道协议 + 共享密码
#[derive(Debug, Clone)]
pub struct TunnelCodec {
    protocol: TunnelProtocol,
    password: String,
    trojan_hash: String,
}

impl TunnelCodec {
    pub fn new(protocol: TunnelProtocol, password: &str) -> Self {
        Self {
            protocol,
            password: password.to_string(),
            trojan_hash: trojan::password_hash(password),
        }
    }

    pub fn protocol(&self) -> TunnelProtocol {
        self.protocol
    }

    /// 服务端：读取并校验协议头，返回目标地址
    ///
    /// 失败时不向对端写任何东西，由调用方决定关闭还是转给伪装站点。
    pub async fn unwrap<S>(&self, stream: &mut S) -> Result<TargetAddr>
    where
        S: AsyncRead + Unpin,
    {
        match self.protocol {
            TunnelProtocol::Custom => tunnel::read_header(stream, &self.password).await,
            TunnelProtocol::Trojan => trojan::read_header(stream, &self.trojan_hash).await,
        }
    }

    /// 客户端：包装连接，协议头在第一次写入时发出
    pub fn wrap<S>(&self, stream: S, target: &TargetAddr) -> Result<HeaderStream<S>> {
        let header = match self.protocol {
            TunnelProtocol::Custom => {
                tunnel::encode_header(&target.host(), target.port(), &self.password)?.to_vec()
            }
            TunnelProtocol::Trojan => trojan::encode_header(&self.trojan_hash, target)?,
        };
        Ok(HeaderStream::new(stream, header))
    }
}

#[derive(Debug)]
enum HeaderState {
    /// 协议头还没发
    Fresh(Vec<u8>),
    /// 正在发送 header + 首段负载
    Sending {
        bytes: Vec<u8>,
        written: usize,
        payload_len: usize,
    },
    Done,
}

/// 懒发送协议头的流：协议头与第一段负载合并为一次写入
#[derive(Debug)]
pub struct HeaderStream<S> {
    inner: S,
    state: HeaderState,
}

impl<S> HeaderStream<S> {
    pub fn new(inner: S, header: Vec<u8>) -> Self {
        Self {
            inner,
            state: HeaderState::Fresh(header),
        }
    }

    pub fn header_sent(&self) -> bool {
        matches!(self.state, HeaderState::Done)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> HeaderStream<S> {
    /// 推进协议头发送，完成后返回首段负载长度
    fn poll_send_header(&mut self, cx: &mut Context<'_>, payload: &[u8]) -> Poll<io::Result<usize>> {
        loop {
            match &mut self.state {
                HeaderState::Fresh(header) => {
                    let mut bytes = std::mem::take(header);
                    bytes.extend_from_slice(payload);
                    self.state = HeaderState::Sending {
                        bytes,
                        written: 0,
                        payload_len: payload.len(),
                    };
                }
                HeaderState::Sending {
                    bytes,
                    written,
                    payload_len,
                } => {
                    while *written < bytes.len() {
                        let n = match Pin::new(&mut self.inner).poll_write(cx, &bytes[*written..]) {
                            Poll::Ready(Ok(n)) => n,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => return Poll::Pending,
                        };
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                        }
                        *written += n;
                    }
                    let n = *payload_len;
                    self.state = HeaderState::Done;
                    return Poll::Ready(Ok(n));
                }
                HeaderState::Done => return Poll::Ready(Ok(0)),
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for HeaderStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HeaderStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if matches!(this.state, HeaderState::Done) {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        this.poll_send_header(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !matches!(this.state, HeaderState::Done) {
            match this.poll_send_header(cx, &[]) {
                Poll::Ready(Ok(_)) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn test_target_from_host_port() {
        assert_eq!(
            TargetAddr::from_host_port("1.2.3.4", 80),
            TargetAddr::Ipv4(Ipv4Addr::new(1, 2, 3, 4), 80)
        );
        assert_eq!(
            TargetAddr::from_host_port("[::1]", 443),
            TargetAddr::Ipv6(Ipv6Addr::LOCALHOST, 443)
        );
        assert_eq!(
            TargetAddr::from_host_port("WWeir.cc", 443),
            TargetAddr::Domain("wweir.cc".into(), 443)
        );
        assert_eq!(TargetAddr::Ipv6(Ipv6Addr::LOCALHOST, 8).to_string(), "[::1]:8");
    }

    #[tokio::test]
    async fn test_socks_addr_layout() {
        let target = TargetAddr::Domain("example.com".into(), 443);
        let mut buf = Vec::new();
        target.write_to(&mut buf).unwrap();
        assert_eq!(buf[0], ATYP_DOMAIN);
        assert_eq!(buf[1], 11);
        assert_eq!(&buf[buf.len() - 2..], &443u16.to_be_bytes());

        let mut reader = &buf[1..];
        let decoded = TargetAddr::read_from(&mut reader, buf[0]).await.unwrap();
        assert_eq!(decoded, target);
    }

    #[tokio::test]
    async fn test_unknown_atyp_rejected() {
        let mut reader: &[u8] = &[0, 0, 0, 0];
        let err = TargetAddr::read_from(&mut reader, 0x09).await.unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn test_first_byte_selects_one_protocol() {
        let trojan = trojan::encode_header(
            &trojan::password_hash("trojan-pass"),
            &TargetAddr::Domain("a.com".into(), 80),
        )
        .unwrap();
        let custom = tunnel::encode_header("a.com", 80, "trojan-pass").unwrap();

        assert!(TunnelProtocol::Trojan.accepts_first_byte(trojan[0]));
        assert!(!TunnelProtocol::Custom.accepts_first_byte(trojan[0]));
        assert!(TunnelProtocol::Custom.accepts_first_byte(custom[0]));
        assert!(!TunnelProtocol::Trojan.accepts_first_byte(custom[0]));
        assert!(!TunnelProtocol::Trojan.accepts_first_byte(b'G'));
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!("Trojan".parse::<TunnelProtocol>().unwrap(), TunnelProtocol::Trojan);
        assert_eq!("custom".parse::<TunnelProtocol>().unwrap(), TunnelProtocol::Custom);
        assert!("vmess".parse::<TunnelProtocol>().is_err());
    }

    #[tokio::test]
    async fn test_header_sent_lazily_with_first_payload() {
        let (client, mut server) = duplex(4096);
        let mut stream = HeaderStream::new(client, b"HDR".to_vec());
        assert!(!stream.header_sent());

        stream.write_all(b"payload").await.unwrap();
        assert!(stream.header_sent());
        stream.write_all(b"-more").await.unwrap();
        drop(stream);

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"HDRpayload-more");
    }

    #[tokio::test]
    async fn test_flush_sends_header_without_payload() {
        let (client, mut server) = duplex(64);
        let mut stream = HeaderStream::new(client, b"HDR".to_vec());
        stream.flush().await.unwrap();

        let mut got = [0u8; 3];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"HDR");
    }
}
