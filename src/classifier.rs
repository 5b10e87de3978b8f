//! 未知域名的主动探测分类
//!
//! 对没有命中任何静态规则的域名，并发做四次探测（80/443 × 直连/隧道），
//! 按权重打分后决定直连还是代理。结果写入两代轮换缓存和学习规则树，
//! 同一域名同时只会有一组探测在跑。

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::domain::{normalize_domain, RuleSet};
use crate::error::{GatewayError, Result};
use crate::protocol::TargetAddr;
use crate::router::Verdict;
use crate::tls::build_client_hello;
use crate::upstream::Upstream;

/// 探测经由的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeRoute {
    Direct,
    Tunnel,
}

/// 可达性探测
#[async_trait]
pub trait Prober: Send + Sync {
    /// 目标在该路径上是否可达；超时由调用方控制
    async fn probe(&self, domain: &str, port: u16, route: ProbeRoute) -> bool;
}

/// 各探测结果的得分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub direct_ok: i32,
    pub direct_fail: i32,
    pub tunnel_ok: i32,
    pub tunnel_fail: i32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            direct_ok: -2,
            direct_fail: 1,
            tunnel_ok: 1,
            tunnel_fail: -1,
        }
    }
}

impl ScoreWeights {
    fn score(&self, route: ProbeRoute, ok: bool) -> i32 {
        match (route, ok) {
            (ProbeRoute::Direct, true) => self.direct_ok,
            (ProbeRoute::Direct, false) => self.direct_fail,
            (ProbeRoute::Tunnel, true) => self.tunnel_ok,
            (ProbeRoute::Tunnel, false) => self.tunnel_fail,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    /// 单次探测超时
    pub probe_timeout: Duration,
    /// 得分严格大于阈值才走代理
    pub threshold: i32,
    pub weights: ScoreWeights,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(800),
            threshold: 0,
            weights: ScoreWeights::default(),
        }
    }
}

/// 学习到的直连 / 代理规则
pub struct LearnedRules {
    pub direct: RuleSet,
    pub proxy: RuleSet,
}

impl Default for LearnedRules {
    fn default() -> Self {
        Self {
            direct: RuleSet::empty("learned-direct"),
            proxy: RuleSet::empty("learned-proxy"),
        }
    }
}

impl LearnedRules {
    pub fn lookup(&self, domain: &str) -> Option<Verdict> {
        if self.proxy.matches(domain) {
            Some(Verdict::Proxy)
        } else if self.direct.matches(domain) {
            Some(Verdict::Direct)
        } else {
            None
        }
    }

    pub fn record(&self, domain: &str, verdict: Verdict) {
        match verdict {
            Verdict::Direct => {
                self.direct.append(domain);
            }
            Verdict::Proxy => {
                self.proxy.append(domain);
            }
            Verdict::Block => {}
        }
    }

    /// 读回持久化文件中的 `direct:<domain>` / `proxy:<domain>` 行
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> io::Result<usize> {
        let file = match std::fs::File::open(path.as_ref()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut loaded = 0;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let (verdict, domain) = match line.trim().split_once(':') {
                Some(("direct", domain)) => (Verdict::Direct, domain),
                Some(("proxy", domain)) => (Verdict::Proxy, domain),
                _ => continue,
            };
            if !domain.is_empty() {
                self.record(domain, verdict);
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}

/// 新判定的持久化回调
pub type PersistFn = Arc<dyn Fn(&str, Verdict) + Send + Sync>;

/// 把判定逐行追加到文件
pub fn file_persister(path: PathBuf) -> PersistFn {
    let lock = Mutex::new(());
    Arc::new(move |domain: &str, verdict: Verdict| {
        let tag = match verdict {
            Verdict::Direct => "direct",
            Verdict::Proxy => "proxy",
            Verdict::Block => return,
        };
        let _guard = lock.lock();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{}:{}", tag, domain));
        if let Err(e) = result {
            warn!("写入学习规则失败 {}: {}", path.display(), e);
        }
    })
}

#[derive(Default)]
struct Generations {
    current: HashMap<String, Verdict>,
    previous: HashMap<String, Verdict>,
}

/// 正在探测的域名 → 等待者
type InflightMap = DashMap<String, Vec<oneshot::Sender<Verdict>>>;

/// 领头任务被取消时清理 inflight 项，等待者随之收到 RecvError
struct InflightGuard<'a> {
    inflight: &'a InflightMap,
    domain: &'a str,
    active: bool,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.inflight.remove(self.domain);
        }
    }
}

pub struct DomainClassifier {
    prober: Arc<dyn Prober>,
    settings: ClassifierSettings,
    generations: RwLock<Generations>,
    inflight: InflightMap,
    learned: Arc<LearnedRules>,
    persist: Option<PersistFn>,
    probe_runs: AtomicU64,
}

impl DomainClassifier {
    pub fn new(prober: Arc<dyn Prober>, settings: ClassifierSettings, learned: Arc<LearnedRules>) -> Self {
        Self {
            prober,
            settings,
            generations: RwLock::new(Generations::default()),
            inflight: DashMap::new(),
            learned,
            persist: None,
            probe_runs: AtomicU64::new(0),
        }
    }

    pub fn with_persist(mut self, persist: PersistFn) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn learned(&self) -> &Arc<LearnedRules> {
        &self.learned
    }

    /// 已执行的探测组数
    pub fn probe_runs(&self) -> u64 {
        self.probe_runs.load(Ordering::Relaxed)
    }

    pub fn cached(&self, domain: &str) -> Option<Verdict> {
        {
            let gens = self.generations.read();
            if let Some(v) = gens.current.get(domain) {
                return Some(*v);
            }
            if !gens.previous.contains_key(domain) {
                return None;
            }
        }
        // 上一代命中：提升到当前代
        let mut gens = self.generations.write();
        let verdict = gens.previous.remove(domain)?;
        gens.current.insert(domain.to_string(), verdict);
        Some(verdict)
    }

    /// 当前代降为上一代，原上一代丢弃
    pub fn rotate(&self) {
        let mut gens = self.generations.write();
        let current = std::mem::take(&mut gens.current);
        let dropped = std::mem::replace(&mut gens.previous, current).len();
        debug!("分类缓存轮换，丢弃 {} 条", dropped);
    }

    pub fn len(&self) -> usize {
        let gens = self.generations.read();
        gens.current.len() + gens.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 判定域名走直连还是代理
    ///
    /// 并发调用同一未缓存域名时只有一个调用执行探测，其余等待它的结果；
    /// 等待超过探测预算时返回 `ProbeTimeout`。
    pub async fn classify(&self, domain: &str) -> Result<Verdict> {
        let domain = normalize_domain(domain).into_owned();
        if let Some(verdict) = self.cached(&domain) {
            return Ok(verdict);
        }

        let waiter = match self.inflight.entry(domain.clone()) {
            Entry::Occupied(mut entry) => {
                let (tx, rx) = oneshot::channel();
                entry.get_mut().push(tx);
                Some(rx)
            }
            Entry::Vacant(entry) => {
                // 领头者写缓存先于移除 inflight，这里再查一次避免重复探测
                if let Some(verdict) = self.cached(&domain) {
                    return Ok(verdict);
                }
                entry.insert(Vec::new());
                None
            }
        };

        if let Some(rx) = waiter {
            return match timeout(self.wait_budget(), rx).await {
                Ok(Ok(verdict)) => Ok(verdict),
                Ok(Err(_)) => Err(GatewayError::ProbeTimeout(format!("{} 的探测被取消", domain))),
                Err(_) => Err(GatewayError::ProbeTimeout(format!("等待 {} 的探测结果超时", domain))),
            };
        }

        let mut guard = InflightGuard {
            inflight: &self.inflight,
            domain: &domain,
            active: true,
        };

        let verdict = self.probe_and_score(&domain).await;
        self.store(&domain, verdict);

        guard.active = false;
        drop(guard);
        let waiters = self
            .inflight
            .remove(&domain)
            .map(|(_, waiters)| waiters)
            .unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(verdict);
        }
        Ok(verdict)
    }

    /// 四个探测并发，每个都受超时约束，所以整体也不会超过这个预算太多
    fn wait_budget(&self) -> Duration {
        self.settings.probe_timeout * 2 + Duration::from_millis(500)
    }

    async fn probe_and_score(&self, domain: &str) -> Verdict {
        let probe_timeout = self.settings.probe_timeout;
        let run = |port: u16, route: ProbeRoute| {
            let prober = Arc::clone(&self.prober);
            async move {
                match timeout(probe_timeout, prober.probe(domain, port, route)).await {
                    Ok(ok) => ok,
                    Err(_) => {
                        debug!("{}", GatewayError::ProbeTimeout(format!("{}:{} {:?}", domain, port, route)));
                        false
                    }
                }
            }
        };

        let (direct_80, direct_443, tunnel_80, tunnel_443) = tokio::join!(
            run(80, ProbeRoute::Direct),
            run(443, ProbeRoute::Direct),
            run(80, ProbeRoute::Tunnel),
            run(443, ProbeRoute::Tunnel),
        );
        self.probe_runs.fetch_add(1, Ordering::Relaxed);

        let w = &self.settings.weights;
        let score = w.score(ProbeRoute::Direct, direct_80)
            + w.score(ProbeRoute::Direct, direct_443)
            + w.score(ProbeRoute::Tunnel, tunnel_80)
            + w.score(ProbeRoute::Tunnel, tunnel_443);

        // 平局走直连
        let verdict = if score > self.settings.threshold {
            Verdict::Proxy
        } else {
            Verdict::Direct
        };
        info!(
            "🔎 域名分类 {} → {:?} (得分 {}, 阈值 {}, 直连 80/443: {}/{}, 隧道 80/443: {}/{})",
            domain, verdict, score, self.settings.threshold, direct_80, direct_443, tunnel_80, tunnel_443
        );
        verdict
    }

    fn store(&self, domain: &str, verdict: Verdict) {
        self.generations
            .write()
            .current
            .insert(domain.to_string(), verdict);
        self.learned.record(domain, verdict);
        if let Some(persist) = &self.persist {
            persist(domain, verdict);
        }
    }

    /// 按固定间隔轮换缓存，直到收到关闭信号
    pub fn spawn_rotation(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let classifier = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => classifier.rotate(),
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

/// 真实网络上的探测：80 端口发 HTTP TRACE，443 端口发 ClientHello
///
/// 对端有任何回应（包括 EOF 和 RST）都算可达，只有连不上或超时算不可达。
pub struct NetProber {
    tunnel: Option<Arc<Upstream>>,
}

impl NetProber {
    pub fn new(tunnel: Option<Arc<Upstream>>) -> Self {
        Self { tunnel }
    }

    fn request(domain: &str, port: u16) -> Vec<u8> {
        if port == 443 {
            build_client_hello(domain)
        } else {
            format!("TRACE / HTTP/1.1\r\nHost: {}\r\nUser-Agent: curl/8.0\r\n\r\n", domain).into_bytes()
        }
    }

    async fn exchange<S>(mut stream: S, request: &[u8]) -> bool
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        if stream.write_all(request).await.is_err() || stream.flush().await.is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        match stream.read(&mut byte).await {
            Ok(_) => true,
            Err(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            ),
        }
    }
}

#[async_trait]
impl Prober for NetProber {
    async fn probe(&self, domain: &str, port: u16, route: ProbeRoute) -> bool {
        let request = Self::request(domain, port);
        match route {
            ProbeRoute::Direct => match TcpStream::connect((domain, port)).await {
                Ok(stream) => Self::exchange(stream, &request).await,
                Err(e) => {
                    debug!("直连探测 {}:{} 失败: {}", domain, port, e);
                    false
                }
            },
            ProbeRoute::Tunnel => {
                let Some(upstream) = &self.tunnel else {
                    return false;
                };
                match upstream.connect(&TargetAddr::Domain(domain.to_string(), port)).await {
                    Ok(stream) => Self::exchange(stream, &request).await,
                    Err(e) => {
                        debug!("隧道探测 {}:{} 失败: {}", domain, port, e);
                        false
                    }
                }
            }
        }
    }
}
