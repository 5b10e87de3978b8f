use anyhow::{Context, Result};
use smart_gateway::classifier::file_persister;
use smart_gateway::config::Config;
use smart_gateway::geoip::GeoIpFilter;
use smart_gateway::ip_matcher::IpMatcher;
use smart_gateway::logger::init_logger;
use smart_gateway::resolver::Resolver;
use smart_gateway::{
    DnsResponder, DomainClassifier, Gateway, LearnedRules, Metrics, NetProber, Router,
    TunnelServer,
};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main(flavor = "multi_thread", worker_threads = 16)]
async fn main() -> Result<()> {
    // 读取配置文件路径（命令行参数或默认值）
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let config = Config::load(&config_path)?;

    init_logger(config.log.clone()).map_err(|e| anyhow::anyhow!("初始化日志系统失败: {}", e))?;

    log::info!("=== 智能网关启动 ===");
    log::info!("配置文件: {}", config_path);
    log::info!("日志级别: {:?} | 输出: {:?}", config.log.level, config.log.output);

    let rules = &config.rules;
    log::info!(
        "规则: 拦截 {} | 直连 {} | 代理 {} | 本地网段 {}",
        rules.block.len(),
        rules.direct.len(),
        rules.proxy.len(),
        rules.cidr.len()
    );

    // 学习规则：启动时从持久化文件读回
    let learned = Arc::new(LearnedRules::default());
    if let Some(path) = &rules.persist_file {
        let loaded = learned
            .load_file(path)
            .with_context(|| format!("无法读取学习规则: {}", path.display()))?;
        log::info!("从 {} 读回 {} 条学习规则", path.display(), loaded);
    }

    let mut geoip = GeoIpFilter::new(IpMatcher::new(&rules.cidr), &rules.local_countries);
    if let Some(path) = &rules.geoip_db {
        geoip = geoip.with_database(path)?;
    }

    let upstream = config.build_upstream()?.map(Arc::new);
    let dns_settings = config.dns_settings()?;

    // 配置了 DNS 上游时，网关自身的解析也直接问上游，避免经本机 resolver 绕回应答器
    let resolver = match &dns_settings {
        Some((_, _, settings)) => {
            Resolver::default().with_upstreams(settings.upstreams.clone(), settings.timeout)
        }
        None => Resolver::default(),
    };
    let resolver = Arc::new(resolver);

    let mut router = Router::new(&rules.block, &rules.direct, &rules.proxy)
        .with_geoip(geoip)
        .with_resolver(Arc::clone(&resolver))
        .with_learned(Arc::clone(&learned));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.classifier.enabled {
        let prober = Arc::new(NetProber::new(upstream.clone()));
        let mut classifier = DomainClassifier::new(prober, config.classifier.settings(), Arc::clone(&learned));
        if let Some(path) = &rules.persist_file {
            classifier = classifier.with_persist(file_persister(path.clone()));
        }
        let classifier = Arc::new(classifier);
        classifier.spawn_rotation(config.classifier.rotate_interval(), shutdown_rx.clone());
        router = router.with_classifier(classifier);
        log::info!(
            "域名分类器: 启用 (探测超时 {}ms, 阈值 {})",
            config.classifier.probe_timeout_ms,
            config.classifier.threshold
        );
    } else {
        log::info!("域名分类器: 关闭，未命中规则的域名一律直连");
    }

    let router = Arc::new(router);
    let metrics = Metrics::new();

    // DNS 应答器
    let dns_task = match dns_settings {
        Some((listen, workers, settings)) => {
            let responder = Arc::new(DnsResponder::new(Arc::clone(&router), settings, metrics.clone())?);
            Some(tokio::spawn(responder.serve(listen, workers, shutdown_rx.clone())))
        }
        None => {
            log::info!("未配置 DNS 应答器");
            None
        }
    };

    let tunnel = match &config.tunnel_server {
        Some(server) => {
            let protocols = config.tunnel_protocols()?;
            log::info!("隧道服务端: 协议 {:?} | 加密: {}", protocols, server.encrypt);
            Some(
                TunnelServer::new(&protocols, &server.password, server.encrypt)?
                    .with_decoy(config.decoy_addr()?),
            )
        }
        None => None,
    };

    let gateway = Arc::new(
        Gateway::new(router, metrics)
            .with_upstream(upstream)
            .with_tunnel_server(tunnel)
            .with_max_connections(config.max_connections())
            .with_timeouts(config.handshake_timeout(), config.connect_timeout()),
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("收到 Ctrl-C");
            let _ = shutdown_tx.send(true);
        }
    });

    log::info!("=== 网关准备就绪 ===");
    gateway
        .run(&config.sniff_addrs()?, config.socks5_addr()?, shutdown_rx)
        .await?;

    if let Some(task) = dns_task {
        match task.await {
            Ok(Err(e)) => log::error!("DNS 应答器异常退出: {}", e),
            Err(e) => log::error!("DNS 应答器任务失败: {}", e),
            Ok(Ok(())) => {}
        }
    }

    log::info!("=== 智能网关已退出 ===");
    Ok(())
}
