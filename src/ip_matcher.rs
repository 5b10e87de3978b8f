use log::{debug, warn};
use std::collections::HashSet;
use std::net::IpAddr;

/// 一个 CIDR 网段，v4 地址按 u32、v6 地址按 u128 做掩码比较
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Network {
    V4 { network: u32, mask: u32 },
    V6 { network: u128, mask: u128 },
}

impl Network {
    fn parse(cidr: &str) -> Option<Self> {
        let (ip_str, prefix_str) = cidr.split_once('/')?;
        let prefix_len: u8 = match prefix_str.trim().parse() {
            Ok(len) => len,
            Err(_) => {
                warn!("无效的 CIDR 前缀长度: {}", cidr);
                return None;
            }
        };

        match ip_str.trim().parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) if prefix_len <= 32 => {
                let mask = if prefix_len == 0 { 0 } else { !0u32 << (32 - prefix_len) };
                Some(Network::V4 {
                    network: u32::from(ip) & mask,
                    mask,
                })
            }
            Ok(IpAddr::V6(ip)) if prefix_len <= 128 => {
                let mask = if prefix_len == 0 { 0 } else { !0u128 << (128 - prefix_len) };
                Some(Network::V6 {
                    network: u128::from(ip) & mask,
                    mask,
                })
            }
            Ok(_) => {
                warn!("CIDR 前缀长度越界: {}", cidr);
                None
            }
            Err(_) => {
                warn!("无效的 IP 地址: {}", ip_str);
                None
            }
        }
    }

    #[inline]
    fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Network::V4 { network, mask }, IpAddr::V4(v4)) => u32::from(v4) & mask == *network,
            (Network::V6 { network, mask }, IpAddr::V6(v6)) => u128::from(v6) & mask == *network,
            _ => false,
        }
    }
}

/// IP 匹配器，支持单个 IP 和 CIDR 网段
///
/// 路由时用来判断目标地址是否落在"本地"网段内（本地网段直连，无需探测）。
#[derive(Debug, Clone, Default)]
pub struct IpMatcher {
    exact_ips: HashSet<IpAddr>,
    networks: Vec<Network>,
}

impl IpMatcher {
    /// 模式可以是 `192.168.1.1`、`::1`、`10.0.0.0/8`、`2001:db8::/32`，
    /// 无法解析的模式记录警告后忽略
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for pattern in patterns {
            matcher.add(pattern.as_ref());
        }
        matcher
    }

    /// 添加一条模式，返回是否生效
    pub fn add(&mut self, pattern: &str) -> bool {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return false;
        }

        if pattern.contains('/') {
            match Network::parse(pattern) {
                Some(network) => {
                    debug!("添加本地网段: {}", pattern);
                    self.networks.push(network);
                    true
                }
                None => false,
            }
        } else {
            match pattern.parse::<IpAddr>() {
                Ok(ip) => {
                    self.exact_ips.insert(ip);
                    true
                }
                Err(_) => {
                    warn!("无效的 IP 地址: {}", pattern);
                    false
                }
            }
        }
    }

    #[inline]
    pub fn matches(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.exact_ips.contains(&ip) || self.networks.iter().any(|n| n.contains(ip))
    }

    /// 任意一个地址命中即可
    pub fn matches_any(&self, ips: &[IpAddr]) -> bool {
        ips.iter().any(|ip| self.matches(*ip))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.exact_ips.is_empty() && self.networks.is_empty()
    }
}
