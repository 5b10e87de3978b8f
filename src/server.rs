use anyhow::Result;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout, timeout_at, Instant};

use crate::cipher::{CipherKey, Role, StreamCipher};
use crate::error::GatewayError;
use crate::http::{parse_request, HttpParse, CONNECT_ESTABLISHED};
use crate::metrics::{ConnectionGuard, Metrics};
use crate::protocol::{TargetAddr, TunnelCodec, TunnelProtocol};
use crate::proxy::relay;
use crate::router::{Router, Verdict};
use crate::sniff::SniffingConn;
use crate::socks5::{self, Reply};
use crate::tls::{parse_sni, SniParse, CONTENT_TYPE_HANDSHAKE};
use crate::upstream::{dial_direct, AsyncStream, BoxedStream, Upstream};

/// 监听端口的用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// HTTP / TLS / 隧道协议共用，靠首包嗅探区分
    Sniff,
    /// 显式 SOCKS5
    Socks5,
}

/// 服务端角色：在嗅探端口上接受隧道连接
pub struct TunnelServer {
    codecs: Vec<TunnelCodec>,
    key: Option<CipherKey>,
    decoy: Option<SocketAddr>,
}

impl TunnelServer {
    pub fn new(protocols: &[TunnelProtocol], password: &str, encrypt: bool) -> crate::error::Result<Self> {
        let key = if encrypt {
            Some(CipherKey::derive(password)?)
        } else {
            None
        };
        Ok(Self {
            codecs: protocols.iter().map(|p| TunnelCodec::new(*p, password)).collect(),
            key,
            decoy: None,
        })
    }

    /// 所有协议都验证失败时，把原始字节转发给伪装站点
    pub fn with_decoy(mut self, decoy: Option<SocketAddr>) -> Self {
        self.decoy = decoy;
        self
    }
}

/// 嗅探结果
pub enum Session {
    /// HTTP / TLS：已录制的首包会原样回放给目标
    Sniffed { target: TargetAddr, stream: BoxedStream },
    /// HTTP CONNECT：请求头已消费，需要回 200
    Connect { target: TargetAddr, stream: BoxedStream },
    /// SOCKS5 握手尚未开始
    Socks5 { stream: BoxedStream },
    /// 隧道协议头已验证并消费
    Tunnel { target: TargetAddr, stream: BoxedStream },
    /// 无法识别，原样转发给伪装站点
    Decoy { addr: SocketAddr, stream: BoxedStream },
    /// 静默关闭
    Rejected,
}

impl Session {
    fn kind(&self) -> &'static str {
        match self {
            Session::Sniffed { .. } => "sniffed",
            Session::Connect { .. } => "connect",
            Session::Socks5 { .. } => "socks5",
            Session::Tunnel { .. } => "tunnel",
            Session::Decoy { .. } => "decoy",
            Session::Rejected => "rejected",
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Session::Sniffed { target, .. }
            | Session::Connect { target, .. }
            | Session::Tunnel { target, .. } => write!(f, "{}({})", self.kind(), target),
            Session::Decoy { addr, .. } => write!(f, "decoy({})", addr),
            _ => f.write_str(self.kind()),
        }
    }
}

/// 智能网关
pub struct Gateway {
    router: Arc<Router>,
    upstream: Option<Arc<Upstream>>,
    tunnel: Option<TunnelServer>,
    metrics: Metrics,
    semaphore: Arc<Semaphore>,
    max_connections: usize,
    handshake_timeout: Duration,
    connect_timeout: Duration,
}

impl Gateway {
    pub fn new(router: Arc<Router>, metrics: Metrics) -> Self {
        // 🚀 自适应最大连接数：每核心 500，上限 10000
        let max_connections = std::cmp::min(10000, num_cpus::get() * 500);
        Self {
            router,
            upstream: None,
            tunnel: None,
            metrics,
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_upstream(mut self, upstream: Option<Arc<Upstream>>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_tunnel_server(mut self, tunnel: Option<TunnelServer>) -> Self {
        self.tunnel = tunnel;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self.semaphore = Arc::new(Semaphore::new(self.max_connections));
        self
    }

    pub fn with_timeouts(mut self, handshake: Duration, connect: Duration) -> Self {
        self.handshake_timeout = handshake;
        self.connect_timeout = connect;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// 启动全部监听，直到收到关闭信号
    pub async fn run(
        self: Arc<Self>,
        sniff: &[SocketAddr],
        socks5: Option<SocketAddr>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut listeners = Vec::new();
        for addr in sniff {
            listeners.push((bind_listener(*addr)?, ListenerKind::Sniff));
        }
        if let Some(addr) = socks5 {
            listeners.push((bind_listener(addr)?, ListenerKind::Socks5));
        }

        info!("最大并发连接数: {}", self.max_connections);
        match &self.upstream {
            Some(upstream) => info!("代理上游: {}", upstream.server()),
            None => info!("未配置代理上游，代理流量将被拒绝"),
        }

        for (listener, kind) in listeners {
            tokio::spawn(Arc::clone(&self).accept_loop(listener, kind, shutdown.clone()));
        }

        // 后台任务：每分钟打印监控指标
        let metrics = self.metrics.clone();
        let mut metrics_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => metrics.print_summary(),
                    _ = metrics_shutdown.changed() => break,
                }
            }
        });

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("🛑 收到关闭信号，停止接受新连接");
        let wait_start = std::time::Instant::now();
        for _ in 0..30 {
            let active = self.metrics.active_connections();
            if active == 0 {
                info!("✅ 所有连接已关闭");
                break;
            }
            info!("⏳ 等待 {} 个活跃连接关闭...", active);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let remaining = self.metrics.active_connections();
        if remaining > 0 {
            warn!("⚠️  超时：仍有 {} 个连接未关闭，强制退出", remaining);
        }
        info!("⏱️  关闭耗时: {:?}", wait_start.elapsed());

        info!("📊 最终统计:");
        self.metrics.print_summary();
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, kind: ListenerKind, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("{:?} 监听停止", kind);
                        return;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer, kind).await,
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    async fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, kind: ListenerKind) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("获取连接许可失败: {}", e);
                return;
            }
        };
        debug!("接受来自 {} 的新连接 ({:?})", peer, kind);

        let gateway = Arc::clone(self);
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            // 持有许可直到连接处理完成
            let _permit = permit;
            let result = std::panic::AssertUnwindSafe(gateway.handle_connection(stream, kind))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("处理 {} 的连接时出错: {}", peer, e);
                    metrics.inc_failed_connections();
                }
                Err(panic_err) => {
                    error!("❌ 连接处理任务 panic: {:?}", panic_err);
                    metrics.inc_panicked_connections();
                    metrics.inc_failed_connections();
                }
            }
        });
    }

    async fn handle_connection(&self, stream: TcpStream, kind: ListenerKind) -> Result<()> {
        let _guard = ConnectionGuard::new(self.metrics.clone());
        let _ = stream.set_nodelay(true);
        match kind {
            ListenerKind::Sniff => self.handle_sniffed(stream).await,
            ListenerKind::Socks5 => self.handle_socks5(Box::new(stream)).await,
        }
    }

    /// 嗅探端口上的一条连接
    pub async fn handle_sniffed<S: AsyncStream + 'static>(&self, stream: S) -> Result<()> {
        let session = self.detect(SniffingConn::new(stream)).await?;
        debug!("嗅探结果: {:?}", session);

        match session {
            Session::Sniffed { target, stream } => self.forward(stream, &target).await,
            Session::Connect { target, mut stream } => {
                let Some(remote) = self.dial_routed(&target).await? else {
                    return Ok(());
                };
                stream.write_all(CONNECT_ESTABLISHED).await?;
                self.pipe(stream, remote, &target).await
            }
            Session::Socks5 { stream } => self.handle_socks5(stream).await,
            Session::Tunnel { target, stream } => {
                self.metrics.inc_tunnel_accepted();
                info!("🔐 隧道连接 → {}", target);
                let remote = dial_direct(&target, self.router.resolver(), self.connect_timeout).await?;
                self.pipe(stream, remote, &target).await
            }
            Session::Decoy { addr, stream } => {
                self.metrics.inc_decoy_relays();
                debug!("未识别的连接转发到伪装站点 {}", addr);
                let remote = timeout(self.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| GatewayError::upstream(addr.to_string(), "连接超时"))?
                    .map_err(|e| GatewayError::upstream(addr.to_string(), e))?;
                relay(stream, remote, &self.metrics).await?;
                Ok(())
            }
            Session::Rejected => Ok(()),
        }
    }

    /// SOCKS5 握手 → 路由 → 拨号 → 应答
    async fn handle_socks5(&self, mut stream: BoxedStream) -> Result<()> {
        let target = timeout(self.handshake_timeout, socks5::accept(&mut stream))
            .await
            .map_err(|_| handshake_timed_out())??;

        match self.dial_routed(&target).await {
            Ok(Some(remote)) => {
                socks5::send_reply(&mut stream, Reply::Succeeded).await?;
                self.pipe(stream, remote, &target).await
            }
            Ok(None) => {
                let _ = socks5::send_reply(&mut stream, Reply::NotAllowed).await;
                Ok(())
            }
            Err(e) => {
                let _ = socks5::send_reply(&mut stream, Reply::HostUnreachable).await;
                Err(e.into())
            }
        }
    }

    /// 首包嗅探：TLS SNI → HTTP Host → SOCKS5 → 隧道协议
    pub async fn detect<S: AsyncStream + 'static>(&self, mut conn: SniffingConn<S>) -> crate::error::Result<Session> {
        let deadline = Instant::now() + self.handshake_timeout;

        conn.start_recording();
        match timeout_at(deadline, conn.read_more()).await {
            Ok(Ok(n)) if n > 0 => {}
            Ok(Ok(_)) => return Ok(Session::Rejected),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(handshake_timed_out()),
        }

        loop {
            let data = conn.buffered();
            let need_more = if data[0] == CONTENT_TYPE_HANDSHAKE {
                match parse_sni(data) {
                    SniParse::Found(name) => {
                        replay(&mut conn);
                        return Ok(Session::Sniffed {
                            target: TargetAddr::from_host_port(&name, 443),
                            stream: Box::new(conn),
                        });
                    }
                    SniParse::Incomplete => true,
                    SniParse::NoSni | SniParse::NotTls => false,
                }
            } else {
                match parse_request(data) {
                    HttpParse::Request(request) => {
                        let target = TargetAddr::from_host_port(&request.host, request.port);
                        if request.connect {
                            // CONNECT 请求头不能发给目标
                            conn.rewind();
                            let mut header = vec![0u8; request.header_len];
                            conn.read_exact(&mut header).await?;
                            conn.stop_recording();
                            conn.finish_detect();
                            return Ok(Session::Connect { target, stream: Box::new(conn) });
                        }
                        replay(&mut conn);
                        return Ok(Session::Sniffed { target, stream: Box::new(conn) });
                    }
                    HttpParse::Incomplete => true,
                    HttpParse::NotHttp => false,
                }
            };

            if !need_more {
                break;
            }
            match timeout_at(deadline, conn.read_more()).await {
                Ok(Ok(n)) if n > 0 => {}
                _ => break,
            }
        }

        if looks_like_socks5_greeting(conn.buffered()) {
            replay(&mut conn);
            return Ok(Session::Socks5 { stream: Box::new(conn) });
        }

        self.accept_tunnel(conn).await
    }

    /// 按首个明文字节挑出协议，再读取并校验协议头
    ///
    /// 只尝试首字节对得上的协议，避免在定长头上干等不属于它的短首包。
    async fn accept_tunnel<S: AsyncStream + 'static>(&self, conn: SniffingConn<S>) -> crate::error::Result<Session> {
        let Some(tunnel) = &self.tunnel else {
            debug!("无法识别的协议，关闭连接");
            return Ok(Session::Rejected);
        };
        let deadline = Instant::now() + self.handshake_timeout;

        let (mut conn, first) = first_plain_byte(conn, tunnel.key.as_ref(), deadline).await;
        let candidates = tunnel
            .codecs
            .iter()
            .filter(|codec| first.is_some_and(|b| codec.protocol().accepts_first_byte(b)));

        for codec in candidates {
            conn.rewind();
            match &tunnel.key {
                Some(key) => {
                    let mut cipher = StreamCipher::new(conn, key, Role::Server);
                    match timeout_at(deadline, codec.unwrap(&mut cipher)).await {
                        Ok(Ok(target)) => {
                            cipher.get_mut().stop_recording();
                            cipher.get_mut().finish_detect();
                            return Ok(Session::Tunnel { target, stream: Box::new(cipher) });
                        }
                        Ok(Err(e)) => log_rejection(codec, &e),
                        Err(_) => debug!("{} 协议头读取超时", codec.protocol()),
                    }
                    conn = cipher.into_inner();
                }
                None => match timeout_at(deadline, codec.unwrap(&mut conn)).await {
                    Ok(Ok(target)) => {
                        conn.stop_recording();
                        conn.finish_detect();
                        return Ok(Session::Tunnel { target, stream: Box::new(conn) });
                    }
                    Ok(Err(e)) => log_rejection(codec, &e),
                    Err(_) => debug!("{} 协议头读取超时", codec.protocol()),
                },
            }
        }

        self.metrics.inc_tunnel_rejected();
        match tunnel.decoy {
            Some(addr) => {
                replay(&mut conn);
                Ok(Session::Decoy { addr, stream: Box::new(conn) })
            }
            None => Ok(Session::Rejected),
        }
    }

    /// 按路由结果拨号；拦截返回 None
    async fn dial_routed(&self, target: &TargetAddr) -> crate::error::Result<Option<BoxedStream>> {
        let verdict = self.router.route_target(target).await;
        let remote: BoxedStream = match verdict {
            Verdict::Block => {
                self.metrics.inc_blocked_routes();
                info!("🚫 拦截 {}", target);
                return Ok(None);
            }
            Verdict::Direct => {
                self.metrics.inc_direct_routes();
                debug!("直连 {}", target);
                Box::new(dial_direct(target, self.router.resolver(), self.connect_timeout).await?)
            }
            Verdict::Proxy => {
                self.metrics.inc_proxy_routes();
                debug!("代理 {}", target);
                match &self.upstream {
                    Some(upstream) => upstream.connect(target).await?,
                    None => {
                        return Err(GatewayError::upstream(target.to_string(), "未配置代理上游"));
                    }
                }
            }
        };
        Ok(Some(remote))
    }

    async fn forward(&self, stream: BoxedStream, target: &TargetAddr) -> Result<()> {
        match self.dial_routed(target).await {
            Ok(Some(remote)) => self.pipe(stream, remote, target).await,
            Ok(None) => Ok(()),
            Err(e) => {
                warn!("连接 {} 失败: {}", target, e);
                self.metrics.inc_failed_connections();
                Ok(())
            }
        }
    }

    async fn pipe<B: AsyncStream>(&self, client: BoxedStream, remote: B, target: &TargetAddr) -> Result<()> {
        let started = std::time::Instant::now();
        let (up, down) = relay(client, remote, &self.metrics).await?;
        debug!(
            "连接 {} 结束: 上行 {} 字节 | 下行 {} 字节 | 耗时 {:?}",
            target,
            up,
            down,
            started.elapsed()
        );
        Ok(())
    }
}

/// 回到录制起点，后续读取先回放已读字节，写入放行

/// 首个明文字节：不加密时直接看录制缓冲，加密时解出第一帧
///
/// 解密失败或超时返回 None；连接仍在录制，调用方 rewind 后可原样回放。
async fn first_plain_byte<S: AsyncStream>(
    mut conn: SniffingConn<S>,
    key: Option<&CipherKey>,
    deadline: Instant,
) -> (SniffingConn<S>, Option<u8>) {
    let Some(key) = key else {
        let first = conn.buffered().first().copied();
        return (conn, first);
    };

    conn.rewind();
    let mut cipher = StreamCipher::new(conn, key, Role::Server);
    let mut byte = [0u8; 1];
    let first = match timeout_at(deadline, cipher.read_exact(&mut byte)).await {
        Ok(Ok(_)) => Some(byte[0]),
        Ok(Err(e)) => {
            debug!("首帧解密失败: {}", e);
            None
        }
        Err(_) => None,
    };
    (cipher.into_inner(), first)
}

fn replay<S>(conn: &mut SniffingConn<S>) {
    conn.rewind();
    conn.stop_recording();
    conn.finish_detect();
}

/// `VER(5) | NMETHODS | METHODS`，客户端发完问候后会等应答，首包长度恰好吻合
fn looks_like_socks5_greeting(data: &[u8]) -> bool {
    data.len() >= 3 && data[0] == socks5::VERSION && data.len() == 2 + data[1] as usize
}

fn log_rejection(codec: &TunnelCodec, err: &GatewayError) {
    if err.is_rejection() {
        debug!("{} 协议验证失败: {}", codec.protocol(), err);
    } else {
        warn!("{} 协议头读取出错: {}", codec.protocol(), err);
    }
}

fn handshake_timed_out() -> GatewayError {
    GatewayError::Io(io::Error::new(io::ErrorKind::TimedOut, "握手超时"))
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    // ⚡ 大 backlog，高并发时减少 accept 排队
    socket.listen(4096)?;

    let listener = TcpListener::from_std(socket.into())?;
    info!("✅ 监听 {}", addr);
    Ok(listener)
}
