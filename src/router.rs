use log::{debug, warn};
use std::sync::Arc;

use crate::classifier::{DomainClassifier, LearnedRules};
use crate::domain::{normalize_domain, RuleSet};
use crate::geoip::GeoIpFilter;
use crate::protocol::TargetAddr;
use crate::resolver::Resolver;

/// 路由结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Block,
    Direct,
    Proxy,
}

/// 按规则决定域名的去向
///
/// 判定顺序：拦截 → 直连 → 代理 → 学习规则 → GeoIP/CIDR → 主动探测。
/// 前面命中即返回，最后兜底直连。
pub struct Router {
    block: RuleSet,
    direct: RuleSet,
    proxy: RuleSet,
    learned: Arc<LearnedRules>,
    geoip: Option<GeoIpFilter>,
    resolver: Arc<Resolver>,
    classifier: Option<Arc<DomainClassifier>>,
}

impl Router {
    pub fn new<S: AsRef<str>>(block: &[S], direct: &[S], proxy: &[S]) -> Self {
        Self {
            block: RuleSet::new("block", block),
            direct: RuleSet::new("direct", direct),
            proxy: RuleSet::new("proxy", proxy),
            learned: Arc::new(LearnedRules::default()),
            geoip: None,
            resolver: Arc::new(Resolver::default()),
            classifier: None,
        }
    }

    pub fn with_geoip(mut self, geoip: GeoIpFilter) -> Self {
        if !geoip.is_empty() {
            self.geoip = Some(geoip);
        }
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// 分类器和路由共用同一份学习规则
    pub fn with_classifier(mut self, classifier: Arc<DomainClassifier>) -> Self {
        self.learned = Arc::clone(classifier.learned());
        self.classifier = Some(classifier);
        self
    }

    pub fn with_learned(mut self, learned: Arc<LearnedRules>) -> Self {
        self.learned = learned;
        self
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn learned(&self) -> &Arc<LearnedRules> {
        &self.learned
    }

    /// 只看规则树，不做任何网络操作
    pub fn static_verdict(&self, domain: &str) -> Option<Verdict> {
        if self.block.matches(domain) {
            Some(Verdict::Block)
        } else if self.direct.matches(domain) {
            Some(Verdict::Direct)
        } else if self.proxy.matches(domain) {
            Some(Verdict::Proxy)
        } else {
            self.learned.lookup(domain)
        }
    }

    pub async fn route(&self, domain: &str) -> Verdict {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Verdict::Direct;
        }

        if let Some(verdict) = self.static_verdict(&domain) {
            debug!("规则命中 {} → {:?}", domain, verdict);
            return verdict;
        }

        if let Some(geoip) = &self.geoip {
            match self.resolver.resolve(&domain).await {
                Ok(ips) if geoip.any_local(&ips) => {
                    debug!("{} 解析到本地地址 {:?}，直连", domain, ips);
                    return Verdict::Direct;
                }
                Ok(_) => {}
                Err(e) => debug!("GeoIP 判定时解析 {} 失败: {}", domain, e),
            }
        }

        match &self.classifier {
            Some(classifier) => match classifier.classify(&domain).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!("分类 {} 失败，按直连处理: {}", domain, e);
                    Verdict::Direct
                }
            },
            None => Verdict::Direct,
        }
    }

    /// 连接目标的路由；IP 字面量只看拦截规则
    pub async fn route_target(&self, target: &TargetAddr) -> Verdict {
        match target.domain() {
            Some(domain) => self.route(domain).await,
            None if self.block.matches(&target.host()) => Verdict::Block,
            None => Verdict::Direct,
        }
    }
}
