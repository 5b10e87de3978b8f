use log::{debug, info};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cipher::{CipherKey, Role, StreamCipher};
use crate::error::{GatewayError, Result};
use crate::protocol::{TargetAddr, TunnelCodec, TunnelProtocol};
use crate::resolver::Resolver;
use crate::socks5::{self, Socks5Config};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// 可双向读写、可跨任务移动的流
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

async fn connect_tcp(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(GatewayError::upstream(addr.to_string(), e)),
        Err(_) => return Err(GatewayError::upstream(addr.to_string(), "连接超时")),
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// 直连目标：域名经缓存解析后依次尝试每个地址
pub async fn dial_direct(
    target: &TargetAddr,
    resolver: &Resolver,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let ips = match target.ip() {
        Some(ip) => vec![ip],
        None => resolver.resolve(&target.host()).await?,
    };

    let mut last_err = None;
    for ip in ips {
        match connect_tcp(SocketAddr::new(ip, target.port()), connect_timeout).await {
            Ok(stream) => {
                debug!("直连 {} 成功 ({})", target, ip);
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| GatewayError::upstream(target.to_string(), "没有可用地址")))
}

#[derive(Debug, Clone)]
enum UpstreamKind {
    /// 私有隧道：TCP → 可选加密 → 协议头
    Tunnel {
        codec: TunnelCodec,
        key: Option<CipherKey>,
    },
    /// 第三方 SOCKS5 代理
    Socks5(Socks5Config),
}

/// 代理上游
#[derive(Debug, Clone)]
pub struct Upstream {
    server: SocketAddr,
    kind: UpstreamKind,
    connect_timeout: Duration,
}

impl Upstream {
    pub fn tunnel(
        server: SocketAddr,
        protocol: TunnelProtocol,
        password: &str,
        encrypt: bool,
    ) -> Result<Self> {
        let key = if encrypt {
            Some(CipherKey::derive(password)?)
        } else {
            None
        };
        Ok(Self {
            server,
            kind: UpstreamKind::Tunnel {
                codec: TunnelCodec::new(protocol, password),
                key,
            },
            connect_timeout: CONNECT_TIMEOUT,
        })
    }

    pub fn socks5(config: Socks5Config) -> Self {
        Self {
            server: config.addr,
            kind: UpstreamKind::Socks5(config),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// 经上游连接目标
    ///
    /// 隧道协议头懒发送，返回时可能尚未写出任何字节。
    pub async fn connect(&self, target: &TargetAddr) -> Result<BoxedStream> {
        let mut stream = connect_tcp(self.server, self.connect_timeout).await?;

        match &self.kind {
            UpstreamKind::Tunnel { codec, key } => {
                debug!("经 {} 隧道 ({}) 连接 {}", self.server, codec.protocol(), target);
                let stream: BoxedStream = match key {
                    Some(key) => {
                        let encrypted = StreamCipher::new(stream, key, Role::Client);
                        Box::new(codec.wrap(encrypted, target)?)
                    }
                    None => Box::new(codec.wrap(stream, target)?),
                };
                Ok(stream)
            }
            UpstreamKind::Socks5(config) => {
                socks5::connect(&mut stream, target, config).await?;
                info!("✅ 通过 SOCKS5 {} 连接到 {}", self.server, target);
                Ok(Box::new(stream))
            }
        }
    }
}
