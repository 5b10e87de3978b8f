use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use log::{debug, error, info, warn};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;

use crate::domain::normalize_domain;
use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use crate::router::{Router, Verdict};

/// 代理域名合成记录的 TTL
pub const REDIRECT_TTL: u32 = 20;
const MAX_PACKET: usize = 4096;

#[derive(Debug, Clone)]
pub struct DnsSettings {
    pub upstreams: Vec<SocketAddr>,
    /// 代理域名的 A 记录指向这里（本网关的 HTTP/HTTPS 监听地址）
    pub redirect_ipv4: Option<Ipv4Addr>,
    pub redirect_ipv6: Option<Ipv6Addr>,
    pub timeout: Duration,
}

/// 按路由结果应答 DNS 查询
///
/// - 拦截：NXDOMAIN
/// - 代理：合成指向本网关的 A/AAAA 记录
/// - 直连：原样转发上游应答（含 TSIG 等附加记录，逐字节不变）
pub struct DnsResponder {
    router: Arc<Router>,
    settings: DnsSettings,
    current: AtomicUsize,
    metrics: Metrics,
}

impl DnsResponder {
    pub fn new(router: Arc<Router>, settings: DnsSettings, metrics: Metrics) -> Result<Self> {
        if settings.upstreams.is_empty() {
            return Err(GatewayError::config("至少需要一个 DNS 上游"));
        }
        Ok(Self {
            router,
            settings,
            current: AtomicUsize::new(0),
            metrics,
        })
    }

    /// 处理一个查询报文，返回应答报文；无法解析的报文返回错误，调用方直接丢弃
    pub async fn answer(&self, packet: &[u8]) -> Result<Vec<u8>> {
        self.metrics.inc_dns_queries();
        let request = Message::from_bytes(packet)
            .map_err(|e| GatewayError::malformed(format!("DNS 报文解析失败: {}", e)))?;

        let Some(query) = request.queries().first() else {
            return self.relay_or_servfail(&request, packet).await;
        };
        let domain = normalize_domain(&query.name().to_ascii()).into_owned();
        let qtype = query.query_type();

        match self.router.route(&domain).await {
            Verdict::Block => {
                debug!("DNS 拦截 {}", domain);
                self.metrics.inc_blocked_routes();
                encode(&reply_to(&request, ResponseCode::NXDomain))
            }
            Verdict::Proxy => match self.synthesize(&request, qtype) {
                Some(response) => {
                    debug!("DNS 代理 {} {:?} → 本地", domain, qtype);
                    encode(&response)
                }
                None => self.relay_or_servfail(&request, packet).await,
            },
            Verdict::Direct => self.relay_or_servfail(&request, packet).await,
        }
    }

    /// 代理域名的合成应答；无法合成时返回 None，走上游
    fn synthesize(&self, request: &Message, qtype: RecordType) -> Option<Message> {
        let query = request.queries().first()?;
        let rdata = match (qtype, self.settings.redirect_ipv4, self.settings.redirect_ipv6) {
            (RecordType::A, Some(v4), _) => RData::A(A(v4)),
            (RecordType::AAAA, _, Some(v6)) => RData::AAAA(AAAA(v6)),
            // 只配置了 IPv4 时 AAAA 给空应答，让客户端回落到 IPv4
            (RecordType::AAAA, Some(_), None) => {
                return Some(reply_to(request, ResponseCode::NoError));
            }
            _ => return None,
        };

        let mut response = reply_to(request, ResponseCode::NoError);
        response.add_answer(Record::from_rdata(query.name().clone(), REDIRECT_TTL, rdata));
        Some(response)
    }

    async fn relay_or_servfail(&self, request: &Message, packet: &[u8]) -> Result<Vec<u8>> {
        match self.exchange(packet).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("{}", e);
                self.metrics.inc_dns_failures();
                encode(&reply_to(request, ResponseCode::ServFail))
            }
        }
    }

    /// 当前上游重试一次，仍失败则切换到下一个上游再试
    async fn exchange(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let upstreams = &self.settings.upstreams;
        let index = self.current.load(Ordering::Relaxed) % upstreams.len();
        let current = upstreams[index];

        let mut last_err = None;
        for _ in 0..2 {
            match exchange_once(current, packet, self.settings.timeout).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!("DNS 上游 {} 查询失败: {}", current, e);
                    last_err = Some(e);
                }
            }
        }

        if upstreams.len() > 1 {
            let next_index = (index + 1) % upstreams.len();
            let _ = self
                .current
                .compare_exchange(index, next_index, Ordering::Relaxed, Ordering::Relaxed);
            let next = upstreams[next_index];
            warn!("DNS 上游 {} 持续失败，切换到 {}", current, next);
            match exchange_once(next, packet, self.settings.timeout).await {
                Ok(response) => return Ok(response),
                Err(e) => last_err = Some(e),
            }
        }

        Err(GatewayError::DnsUpstreamFailure(format!(
            "{}: {}",
            current,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// UDP 监听循环，处理并发数受 `workers` 限制
    pub async fn serve(
        self: Arc<Self>,
        listen: SocketAddr,
        workers: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let socket = Arc::new(UdpSocket::bind(listen).await?);
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        info!("🌐 DNS 应答器监听 {} (上游: {:?})", listen, self.settings.upstreams);

        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            error!("DNS 接收失败: {}", e);
                            continue;
                        }
                    };
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            debug!("DNS 工作者已满，丢弃来自 {} 的查询", peer);
                            continue;
                        }
                    };
                    let packet = buf[..len].to_vec();
                    let responder = Arc::clone(&self);
                    let socket = Arc::clone(&socket);
                    tokio::spawn(async move {
                        let _permit = permit;
                        match responder.answer(&packet).await {
                            Ok(response) => {
                                if let Err(e) = socket.send_to(&response, peer).await {
                                    debug!("DNS 应答 {} 失败: {}", peer, e);
                                }
                            }
                            Err(e) => debug!("丢弃来自 {} 的 DNS 报文: {}", peer, e),
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("🛑 DNS 应答器停止");
                    return Ok(());
                }
            }
        }
    }
}

pub(crate) async fn exchange_once(upstream: SocketAddr, packet: &[u8], limit: Duration) -> std::io::Result<Vec<u8>> {
    let bind: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(upstream).await?;
    socket.send(packet).await?;

    let mut buf = vec![0u8; MAX_PACKET];
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let len = match timeout(remaining, socket.recv(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "DNS 上游超时")),
        };
        // 事务 ID 不一致的报文丢弃继续等
        if len >= 2 && packet.len() >= 2 && buf[..2] == packet[..2] {
            buf.truncate(len);
            return Ok(buf);
        }
    }
}

fn reply_to(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.add_queries(request.queries().to_vec());
    response.set_response_code(code);
    response
}

fn encode(message: &Message) -> Result<Vec<u8>> {
    message
        .to_bytes()
        .map_err(|e| GatewayError::malformed(format!("DNS 报文编码失败: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;

    fn query(name: &str, qtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_message_type(MessageType::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
        msg.to_bytes().unwrap()
    }

    fn responder(upstreams: Vec<SocketAddr>) -> DnsResponder {
        let router = Router::new(&["ads.example.com"], &["direct.test"], &["**.google.com"]);
        DnsResponder::new(
            Arc::new(router),
            DnsSettings {
                upstreams,
                redirect_ipv4: Some(Ipv4Addr::new(192, 168, 1, 1)),
                redirect_ipv6: None,
                timeout: Duration::from_millis(200),
            },
            Metrics::new(),
        )
        .unwrap()
    }

    /// 只回一个固定应答的上游
    async fn fake_upstream() -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_bytes(&buf[..len]).unwrap();
            let mut response = reply_to(&request, ResponseCode::NoError);
            let name = request.queries()[0].name().clone();
            response.add_answer(Record::from_rdata(name, 300, RData::A(A(Ipv4Addr::new(1, 2, 3, 4)))));
            let bytes = response.to_bytes().unwrap();
            socket.send_to(&bytes, peer).await.unwrap();
            bytes
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_block_is_nxdomain() {
        let r = responder(vec!["127.0.0.1:9".parse().unwrap()]);
        let response = r.answer(&query("ads.example.com.", RecordType::A)).await.unwrap();
        let msg = Message::from_bytes(&response).unwrap();
        assert_eq!(msg.id(), 0x1234);
        assert_eq!(msg.response_code(), ResponseCode::NXDomain);
        assert!(msg.answers().is_empty());
    }

    #[tokio::test]
    async fn test_proxy_is_redirected() {
        let r = responder(vec!["127.0.0.1:9".parse().unwrap()]);
        let response = r.answer(&query("www.google.com.", RecordType::A)).await.unwrap();
        let msg = Message::from_bytes(&response).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::NoError);
        assert_eq!(msg.answers().len(), 1);
        let answer = &msg.answers()[0];
        assert_eq!(answer.ttl(), REDIRECT_TTL);
        assert_eq!(answer.data(), Some(&RData::A(A(Ipv4Addr::new(192, 168, 1, 1)))));

        // 没有 IPv6 重定向地址时 AAAA 为空应答
        let response = r.answer(&query("www.google.com.", RecordType::AAAA)).await.unwrap();
        let msg = Message::from_bytes(&response).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::NoError);
        assert!(msg.answers().is_empty());
    }

    #[tokio::test]
    async fn test_direct_is_relayed_byte_exact() {
        let (addr, upstream) = fake_upstream().await;
        let r = responder(vec![addr]);
        let response = r.answer(&query("direct.test.", RecordType::A)).await.unwrap();
        let sent = upstream.await.unwrap();
        assert_eq!(response, sent);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_servfail() {
        // 绑定后立即释放，保证端口上没有服务
        let port = {
            let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            s.local_addr().unwrap().port()
        };
        let r = responder(vec![SocketAddr::from(([127, 0, 0, 1], port))]);
        let response = r.answer(&query("direct.test.", RecordType::A)).await.unwrap();
        let msg = Message::from_bytes(&response).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::ServFail);
        assert_eq!(r.metrics.dns_failures(), 1);
    }

    #[tokio::test]
    async fn test_rotates_to_next_upstream() {
        let dead = {
            let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            s.local_addr().unwrap()
        };
        let (alive, upstream) = fake_upstream().await;
        let r = responder(vec![dead, alive]);

        let response = r.answer(&query("direct.test.", RecordType::A)).await.unwrap();
        assert_eq!(response, upstream.await.unwrap());
        assert_eq!(r.current.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_garbage_is_rejected() {
        let r = responder(vec!["127.0.0.1:9".parse().unwrap()]);
        assert!(r.answer(&[0x00]).await.is_err());
    }
}
