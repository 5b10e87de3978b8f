use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::dns::exchange_once;
use crate::error::{GatewayError, Result};

const DEFAULT_CAPACITY: usize = 1000;
const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// 带 LRU 缓存的域名解析
///
/// 用于直连拨号和 GeoIP 判定。配置了上游时直接向上游查询 A / AAAA；
/// 否则走操作系统的 resolver，此时如果本机的 resolver 指向本网关的
/// DNS 应答器，未知域名会再绕回路由一次。
pub struct Resolver {
    cache: Mutex<LruCache<String, (Vec<IpAddr>, Instant)>>,
    ttl: Duration,
    upstreams: Vec<SocketAddr>,
    query_timeout: Duration,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl Resolver {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
            upstreams: Vec::new(),
            query_timeout: Duration::from_secs(2),
        }
    }

    /// 改为直接向这些 DNS 上游查询
    pub fn with_upstreams(mut self, upstreams: Vec<SocketAddr>, query_timeout: Duration) -> Self {
        self.upstreams = upstreams;
        self.query_timeout = query_timeout;
        self
    }

    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        // 1. 检查缓存
        {
            let mut cache = self.cache.lock();
            if let Some((ips, at)) = cache.get(host) {
                if at.elapsed() < self.ttl {
                    debug!("DNS 缓存命中: {} -> {:?}", host, ips);
                    return Ok(ips.clone());
                }
            }
        }

        // 2. 执行查询
        debug!("DNS 查询: {}", host);
        let ips: Vec<IpAddr> = if self.upstreams.is_empty() {
            tokio::net::lookup_host((host, 0))
                .await?
                .map(|addr| addr.ip())
                .collect()
        } else {
            self.lookup_upstreams(host).await?
        };
        if ips.is_empty() {
            return Err(GatewayError::upstream(host, "DNS 查询返回空列表"));
        }

        // 3. 写入缓存
        self.cache.lock().put(host.to_string(), (ips.clone(), Instant::now()));
        Ok(ips)
    }

    async fn lookup_upstreams(&self, host: &str) -> Result<Vec<IpAddr>> {
        let (v4, v6) = tokio::join!(
            self.query(host, RecordType::A),
            self.query(host, RecordType::AAAA)
        );
        match (v4, v6) {
            (Err(e), Err(_)) => Err(e),
            (v4, v6) => {
                let mut ips = v4.unwrap_or_default();
                ips.extend(v6.unwrap_or_default());
                Ok(ips)
            }
        }
    }

    /// 依次尝试每个上游，取第一个收到的应答
    async fn query(&self, host: &str, qtype: RecordType) -> Result<Vec<IpAddr>> {
        let name = Name::from_ascii(format!("{}.", host))
            .map_err(|e| GatewayError::malformed(format!("非法域名 {}: {}", host, e)))?;
        let mut request = Message::new();
        request.set_id(rand::random());
        request.set_message_type(MessageType::Query);
        request.set_recursion_desired(true);
        request.add_query(Query::query(name, qtype));
        let packet = request
            .to_bytes()
            .map_err(|e| GatewayError::malformed(format!("DNS 报文编码失败: {}", e)))?;

        for upstream in &self.upstreams {
            let bytes = match exchange_once(*upstream, &packet, self.query_timeout).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("向 {} 查询 {} {:?} 失败: {}", upstream, host, qtype, e);
                    continue;
                }
            };
            let response = Message::from_bytes(&bytes)
                .map_err(|e| GatewayError::malformed(format!("DNS 应答无法解析: {}", e)))?;
            let ips = response
                .answers()
                .iter()
                .filter_map(|record| match record.data() {
                    Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                    Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                    _ => None,
                })
                .collect();
            return Ok(ips);
        }
        Err(GatewayError::DnsUpstreamFailure(format!("{} 的所有上游均无应答", host)))
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
