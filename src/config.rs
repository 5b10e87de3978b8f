use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::{ClassifierSettings, ScoreWeights};
use crate::dns::DnsSettings;
use crate::error::{GatewayError, Result};
use crate::logger::LogSettings;
use crate::protocol::TunnelProtocol;
use crate::socks5::Socks5Config;
use crate::upstream::Upstream;

/// 隧道密码最小长度
pub const MIN_PASSWORD_LEN: usize = 8;

/// 配置文件（JSON）
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// 嗅探监听地址（HTTP / TLS / 隧道协议共用）
    #[serde(default = "default_sniff_listen")]
    pub sniff_listen: Vec<String>,
    /// 显式 SOCKS5 监听地址（可选）
    pub socks5_listen: Option<String>,
    /// 最大并发连接数（可选，默认按 CPU 核心数自适应）
    pub max_connections: Option<usize>,
    /// 握手阶段超时（秒）
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// 拨号超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub rules: RulesConfig,
    pub dns: Option<DnsConfig>,
    /// 客户端角色：代理流量的上游
    pub upstream: Option<UpstreamConfig>,
    /// 服务端角色：在嗅探端口上接受隧道连接
    pub tunnel_server: Option<TunnelServerConfig>,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub block: Vec<String>,
    pub direct: Vec<String>,
    pub proxy: Vec<String>,
    /// 视为本地的网段，命中则直连
    pub cidr: Vec<String>,
    /// MaxMind 国家库路径
    pub geoip_db: Option<PathBuf>,
    /// 视为本地的国家代码，例如 ["CN"]
    pub local_countries: Vec<String>,
    /// 学习规则持久化文件
    pub persist_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_listen")]
    pub listen: String,
    pub upstreams: Vec<String>,
    pub redirect_ipv4: Option<Ipv4Addr>,
    pub redirect_ipv6: Option<Ipv6Addr>,
    #[serde(default = "default_dns_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_dns_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// 上游地址，格式：ip:port 或 domain:port
    pub server: String,
    /// custom | trojan | socks5
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub password: Option<String>,
    /// 隧道是否套一层 AEAD 加密（socks5 忽略）
    #[serde(default = "default_true")]
    pub encrypt: bool,
    /// SOCKS5 用户名（可选）
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelServerConfig {
    pub password: String,
    #[serde(default = "default_tunnel_protocols")]
    pub protocols: Vec<String>,
    #[serde(default = "default_true")]
    pub encrypt: bool,
    /// 所有协议都不认识时转发到的伪装站点
    pub decoy: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub enabled: bool,
    pub probe_timeout_ms: u64,
    pub threshold: i32,
    pub rotate_secs: u64,
    pub weights: ScoreWeights,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_timeout_ms: 800,
            threshold: 0,
            rotate_secs: 3600,
            weights: ScoreWeights::default(),
        }
    }
}

impl ClassifierConfig {
    pub fn settings(&self) -> ClassifierSettings {
        ClassifierSettings {
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            threshold: self.threshold,
            weights: self.weights,
        }
    }

    pub fn rotate_interval(&self) -> Duration {
        Duration::from_secs(self.rotate_secs.max(1))
    }
}

fn default_sniff_listen() -> Vec<String> {
    vec!["0.0.0.0:80".to_string(), "0.0.0.0:443".to_string()]
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_dns_listen() -> String {
    "0.0.0.0:53".to_string()
}

fn default_dns_timeout_ms() -> u64 {
    2000
}

fn default_dns_workers() -> usize {
    64
}

fn default_protocol() -> String {
    "custom".to_string()
}

fn default_tunnel_protocols() -> Vec<String> {
    vec!["custom".to_string(), "trojan".to_string()]
}

fn default_true() -> bool {
    true
}

/// 解析 `ip:port` 或 `domain:port`
pub fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    addr.to_socket_addrs()
        .map_err(|e| GatewayError::config(format!("无法解析地址 {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| GatewayError::config(format!("地址 {} 没有解析结果", addr)))
}

fn check_password(role: &str, password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(GatewayError::config(format!(
            "{} 密码长度不能少于 {} 个字符",
            role, MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
        let config = Self::from_json(&content).context("解析配置文件失败")?;
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// 启动前检查
    pub fn validate(&self) -> Result<()> {
        if self.sniff_listen.is_empty() && self.socks5_listen.is_none() {
            return Err(GatewayError::config("至少需要一个监听地址"));
        }
        for addr in &self.sniff_listen {
            parse_listen(addr)?;
        }
        if let Some(addr) = &self.socks5_listen {
            parse_listen(addr)?;
        }

        if let Some(dns) = &self.dns {
            parse_listen(&dns.listen)?;
            if dns.upstreams.is_empty() {
                return Err(GatewayError::config("dns.upstreams 不能为空"));
            }
            for upstream in &dns.upstreams {
                parse_dns_upstream(upstream)?;
            }
        }

        if let Some(upstream) = &self.upstream {
            if upstream.protocol != "socks5" {
                upstream.protocol.parse::<TunnelProtocol>()?;
                let password = upstream
                    .password
                    .as_deref()
                    .ok_or_else(|| GatewayError::config("upstream.password 未配置"))?;
                check_password("upstream", password)?;
            }
        }

        if let Some(server) = &self.tunnel_server {
            check_password("tunnel_server", &server.password)?;
            if server.protocols.is_empty() {
                return Err(GatewayError::config("tunnel_server.protocols 不能为空"));
            }
            self.tunnel_protocols()?;
        }

        Ok(())
    }

    /// 自适应最大连接数：每核 500，上限 10000
    pub fn max_connections(&self) -> usize {
        self.max_connections
            .unwrap_or_else(|| (num_cpus::get() * 500).min(10000))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn sniff_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.sniff_listen.iter().map(|a| parse_listen(a)).collect()
    }

    pub fn socks5_addr(&self) -> Result<Option<SocketAddr>> {
        self.socks5_listen.as_deref().map(parse_listen).transpose()
    }

    /// 服务端按配置顺序尝试的协议
    pub fn tunnel_protocols(&self) -> Result<Vec<TunnelProtocol>> {
        match &self.tunnel_server {
            Some(server) => server.protocols.iter().map(|p| p.parse()).collect(),
            None => Ok(Vec::new()),
        }
    }

    pub fn decoy_addr(&self) -> Result<Option<SocketAddr>> {
        self.tunnel_server
            .as_ref()
            .and_then(|s| s.decoy.as_deref())
            .map(resolve_addr)
            .transpose()
    }

    pub fn build_upstream(&self) -> Result<Option<Upstream>> {
        let Some(cfg) = &self.upstream else {
            return Ok(None);
        };
        let server = resolve_addr(&cfg.server)?;

        let upstream = if cfg.protocol == "socks5" {
            Upstream::socks5(Socks5Config {
                addr: server,
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            })
        } else {
            let password = cfg
                .password
                .as_deref()
                .ok_or_else(|| GatewayError::config("upstream.password 未配置"))?;
            Upstream::tunnel(server, cfg.protocol.parse()?, password, cfg.encrypt)?
        };
        Ok(Some(upstream.with_connect_timeout(self.connect_timeout())))
    }

    pub fn dns_settings(&self) -> Result<Option<(SocketAddr, usize, DnsSettings)>> {
        let Some(dns) = &self.dns else {
            return Ok(None);
        };
        let upstreams = dns
            .upstreams
            .iter()
            .map(|u| parse_dns_upstream(u))
            .collect::<Result<Vec<_>>>()?;
        let settings = DnsSettings {
            upstreams,
            redirect_ipv4: dns.redirect_ipv4,
            redirect_ipv6: dns.redirect_ipv6,
            timeout: Duration::from_millis(dns.timeout_ms),
        };
        Ok(Some((parse_listen(&dns.listen)?, dns.workers, settings)))
    }
}

fn parse_listen(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| GatewayError::config(format!("无效的监听地址 {}: {}", addr, e)))
}

/// DNS 上游可省略端口，默认 53
fn parse_dns_upstream(addr: &str) -> Result<SocketAddr> {
    if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    addr.parse()
        .map_err(|e| GatewayError::config(format!("无效的 DNS 上游 {}: {}", addr, e)))
}
