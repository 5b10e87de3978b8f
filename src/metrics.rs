use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 网关运行指标
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // 连接统计
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    failed_connections: AtomicU64,
    panicked_connections: AtomicU64,

    // 流量统计
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,

    // 路由统计
    direct_routes: AtomicU64,
    proxy_routes: AtomicU64,
    blocked_routes: AtomicU64,

    // 隧道服务端
    tunnel_accepted: AtomicU64,
    tunnel_rejected: AtomicU64,
    decoy_relays: AtomicU64,

    // DNS
    dns_queries: AtomicU64,
    dns_failures: AtomicU64,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.inner.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.inner.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                failed_connections: AtomicU64::new(0),
                panicked_connections: AtomicU64::new(0),
                bytes_up: AtomicU64::new(0),
                bytes_down: AtomicU64::new(0),
                direct_routes: AtomicU64::new(0),
                proxy_routes: AtomicU64::new(0),
                blocked_routes: AtomicU64::new(0),
                tunnel_accepted: AtomicU64::new(0),
                tunnel_rejected: AtomicU64::new(0),
                decoy_relays: AtomicU64::new(0),
                dns_queries: AtomicU64::new(0),
                dns_failures: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    counter!(inc_total_connections, total_connections, total_connections);
    counter!(inc_failed_connections, failed_connections, failed_connections);
    counter!(inc_panicked_connections, panicked_connections, panicked_connections);
    counter!(inc_direct_routes, direct_routes, direct_routes);
    counter!(inc_proxy_routes, proxy_routes, proxy_routes);
    counter!(inc_blocked_routes, blocked_routes, blocked_routes);
    counter!(inc_tunnel_accepted, tunnel_accepted, tunnel_accepted);
    counter!(inc_tunnel_rejected, tunnel_rejected, tunnel_rejected);
    counter!(inc_decoy_relays, decoy_relays, decoy_relays);
    counter!(inc_dns_queries, dns_queries, dns_queries);
    counter!(inc_dns_failures, dns_failures, dns_failures);

    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    /// 客户端 → 目标
    pub fn add_bytes_up(&self, bytes: u64) {
        self.inner.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    /// 目标 → 客户端
    pub fn add_bytes_down(&self, bytes: u64) {
        self.inner.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            failed_connections: self.failed_connections(),
            panicked_connections: self.panicked_connections(),
            bytes_up: self.inner.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.inner.bytes_down.load(Ordering::Relaxed),
            direct_routes: self.direct_routes(),
            proxy_routes: self.proxy_routes(),
            blocked_routes: self.blocked_routes(),
            tunnel_accepted: self.tunnel_accepted(),
            tunnel_rejected: self.tunnel_rejected(),
            decoy_relays: self.decoy_relays(),
            dns_queries: self.dns_queries(),
            dns_failures: self.dns_failures(),
            uptime: self.inner.start_time.elapsed(),
        }
    }

    pub fn print_summary(&self) {
        let s = self.snapshot();
        log::info!("=== 网关运行指标 ===");
        log::info!("运行时间: {:?}", s.uptime);
        log::info!(
            "连接: 总计 {} | 活跃 {} | 失败 {} | panic {}",
            s.total_connections,
            s.active_connections,
            s.failed_connections,
            s.panicked_connections
        );
        log::info!(
            "路由: 直连 {} | 代理 {} | 拦截 {}",
            s.direct_routes,
            s.proxy_routes,
            s.blocked_routes
        );
        log::info!(
            "隧道: 接受 {} | 拒绝 {} | 伪装转发 {}",
            s.tunnel_accepted,
            s.tunnel_rejected,
            s.decoy_relays
        );
        log::info!("DNS: 查询 {} | 失败 {}", s.dns_queries, s.dns_failures);
        log::info!(
            "流量: 上行 {} MB | 下行 {} MB",
            s.bytes_up / 1024 / 1024,
            s.bytes_down / 1024 / 1024
        );
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
    pub panicked_connections: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub direct_routes: u64,
    pub proxy_routes: u64,
    pub blocked_routes: u64,
    pub tunnel_accepted: u64,
    pub tunnel_rejected: u64,
    pub decoy_relays: u64,
    pub dns_queries: u64,
    pub dns_failures: u64,
    pub uptime: Duration,
}

/// RAII 风格的连接计数器
pub struct ConnectionGuard {
    metrics: Metrics,
}

impl ConnectionGuard {
    pub fn new(metrics: Metrics) -> Self {
        metrics.inc_total_connections();
        let active = metrics.inner.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("📊 新连接 | 总连接数: {} | 活跃连接: {}", metrics.total_connections(), active);
        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.metrics.inner.active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
        log::debug!("📊 连接关闭 | 活跃连接: {}", active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_tracks_active() {
        let metrics = Metrics::new();
        {
            let _a = ConnectionGuard::new(metrics.clone());
            let _b = ConnectionGuard::new(metrics.clone());
            assert_eq!(metrics.active_connections(), 2);
        }
        assert_eq!(metrics.active_connections(), 0);
        assert_eq!(metrics.total_connections(), 2);
    }

    #[test]
    fn test_snapshot() {
        let metrics = Metrics::new();
        metrics.inc_proxy_routes();
        metrics.inc_blocked_routes();
        metrics.inc_blocked_routes();
        metrics.add_bytes_up(10);
        metrics.add_bytes_down(20);

        let s = metrics.snapshot();
        assert_eq!(s.proxy_routes, 1);
        assert_eq!(s.blocked_routes, 2);
        assert_eq!((s.bytes_up, s.bytes_down), (10, 20));
        assert_eq!(s.direct_routes, 0);
    }
}
