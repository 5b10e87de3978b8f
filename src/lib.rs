//! 智能分流网关
//!
//! 在 80/443 端口上嗅探 HTTP / TLS / 隧道协议，按规则树、GeoIP 和主动探测决定
//! 直连、代理或拦截；同时提供配套的 DNS 应答器和 SOCKS5 入口。

pub mod cipher;
pub mod classifier;
pub mod config;
pub mod dns;
pub mod domain;
pub mod error;
pub mod geoip;
pub mod http;
pub mod ip_matcher;
pub mod logger;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod resolver;
pub mod router;
pub mod server;
pub mod sniff;
pub mod socks5;
pub mod tls;
pub mod upstream;

pub use classifier::{DomainClassifier, LearnedRules, NetProber};
pub use config::Config;
pub use dns::{DnsResponder, DnsSettings};
pub use domain::{RuleSet, SuffixRuleTree};
pub use error::{GatewayError, Result};
pub use metrics::Metrics;
pub use protocol::{TargetAddr, TunnelCodec, TunnelProtocol};
pub use router::{Router, Verdict};
pub use server::{Gateway, TunnelServer};
pub use socks5::Socks5Config;
pub use upstream::Upstream;
