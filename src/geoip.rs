use anyhow::{Context, Result};
use log::{debug, info};
use maxminddb::geoip2;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use crate::ip_matcher::IpMatcher;

/// 本地地址判定：CIDR 列表 + 可选的 MaxMind 国家库
///
/// 命中任一条件的地址视为"本地"，域名可以不经探测直接判定为直连。
pub struct GeoIpFilter {
    cidr: IpMatcher,
    countries: HashSet<String>,
    reader: Option<maxminddb::Reader<Vec<u8>>>,
}

impl GeoIpFilter {
    pub fn new(cidr: IpMatcher, countries: &[String]) -> Self {
        Self {
            cidr,
            countries: countries.iter().map(|c| c.trim().to_ascii_uppercase()).collect(),
            reader: None,
        }
    }

    /// 加载国家库（GeoLite2-Country.mmdb 格式）
    pub fn with_database<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = maxminddb::Reader::open_readfile(path)
            .with_context(|| format!("无法加载 GeoIP 数据库: {}", path.display()))?;
        info!("已加载 GeoIP 数据库: {}", path.display());
        self.reader = Some(reader);
        Ok(self)
    }

    /// 没有任何判定依据时不需要解析域名
    pub fn is_empty(&self) -> bool {
        self.cidr.is_empty() && (self.reader.is_none() || self.countries.is_empty())
    }

    /// 查询地址所属国家代码
    pub fn country_of(&self, ip: IpAddr) -> Option<String> {
        let reader = self.reader.as_ref()?;
        let record: geoip2::Country = reader.lookup(ip).ok()?;
        record
            .country
            .and_then(|c| c.iso_code)
            .map(|code| code.to_string())
    }

    pub fn is_local(&self, ip: IpAddr) -> bool {
        if self.cidr.matches(ip) {
            debug!("{} 命中本地网段", ip);
            return true;
        }
        if self.countries.is_empty() {
            return false;
        }
        match self.country_of(ip) {
            Some(code) if self.countries.contains(&code) => {
                debug!("{} 属于本地国家 {}", ip, code);
                true
            }
            _ => false,
        }
    }

    pub fn any_local(&self, ips: &[IpAddr]) -> bool {
        ips.iter().any(|ip| self.is_local(*ip))
    }
}
