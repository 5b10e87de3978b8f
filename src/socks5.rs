use log::debug;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GatewayError, Result};
use crate::protocol::TargetAddr;

pub const VERSION: u8 = 0x05;
pub const CMD_CONNECT: u8 = 0x01;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

/// 单步握手超时
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// SOCKS5 应答码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
}

/// 第三方 SOCKS5 上游代理配置
#[derive(Debug, Clone)]
pub struct Socks5Config {
    /// SOCKS5 代理服务器地址
    pub addr: SocketAddr,
    /// 用户名（可选）
    pub username: Option<String>,
    /// 密码（可选）
    pub password: Option<String>,
}

impl Socks5Config {
    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

async fn step<T, F>(what: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(STEP_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(GatewayError::Io(e)),
        Err(_) => Err(GatewayError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{}超时", what),
        ))),
    }
}

// ==================== 服务端 ====================

/// 服务端：完成无认证握手并读取 CONNECT 请求
///
/// ```text
/// C -> S: VER | NMETHODS | METHODS
/// S -> C: VER | METHOD(0)
/// C -> S: VER | CMD(1) | RSV | ATYP | DST.ADDR | DST.PORT
/// ```
///
/// 成功后调用方拨号目标，再用 [`send_reply`] 回应答。
pub async fn accept<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    step("读取 SOCKS5 握手", stream.read_exact(&mut head)).await?;
    if head[0] != VERSION {
        return Err(GatewayError::malformed(format!("SOCKS 版本错误: {}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    step("读取认证方法", stream.read_exact(&mut methods)).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        let _ = stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await;
        return Err(GatewayError::malformed("客户端不支持无认证方式"));
    }
    step("写入握手响应", stream.write_all(&[VERSION, METHOD_NO_AUTH])).await?;

    let mut request = [0u8; 4];
    step("读取 SOCKS5 请求", stream.read_exact(&mut request)).await?;
    if request[0] != VERSION {
        return Err(GatewayError::malformed("SOCKS5 请求版本错误"));
    }
    if request[1] != CMD_CONNECT {
        let _ = send_reply(stream, Reply::CommandNotSupported).await;
        return Err(GatewayError::malformed(format!("不支持的 SOCKS5 命令: {}", request[1])));
    }

    let target = TargetAddr::read_from(stream, request[3]).await?;
    debug!("SOCKS5 请求目标: {}", target);
    Ok(target)
}

/// 回 `VER | REP | RSV | ATYP(1) | 0.0.0.0 | 0`
pub async fn send_reply<S>(stream: &mut S, reply: Reply) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let buf = [VERSION, reply as u8, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
    step("写入 SOCKS5 应答", stream.write_all(&buf)).await?;
    Ok(())
}

// ==================== 客户端 ====================

/// 在已连上 SOCKS5 代理的流上请求连接目标
///
/// 域名直接交给代理解析，避免本地重复解析。
pub async fn connect<S>(stream: &mut S, target: &TargetAddr, config: &Socks5Config) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let credentials = config.credentials();

    // ============ 步骤 1: 版本识别 ============
    let method = if credentials.is_some() {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    step("写入 SOCKS5 握手请求", stream.write_all(&[VERSION, 1, method])).await?;

    let mut response = [0u8; 2];
    step("读取 SOCKS5 握手响应", stream.read_exact(&mut response)).await?;
    if response[0] != VERSION {
        return Err(GatewayError::upstream(config.addr.to_string(), "无效的 SOCKS5 响应: 版本错误"));
    }
    debug!("SOCKS5 握手成功，选择的认证方法: {}", response[1]);

    // ============ 步骤 2: 可选的用户名/密码认证 (RFC 1929) ============
    match (response[1], credentials) {
        (METHOD_USER_PASS, Some((username, password))) => {
            if username.len() > 255 || password.len() > 255 {
                return Err(GatewayError::config("SOCKS5 用户名或密码过长"));
            }
            let mut auth = Vec::with_capacity(3 + username.len() + password.len());
            auth.push(0x01);
            auth.push(username.len() as u8);
            auth.extend_from_slice(username.as_bytes());
            auth.push(password.len() as u8);
            auth.extend_from_slice(password.as_bytes());
            step("发送认证请求", stream.write_all(&auth)).await?;

            let mut auth_response = [0u8; 2];
            step("读取认证响应", stream.read_exact(&mut auth_response)).await?;
            if auth_response[1] != 0 {
                return Err(GatewayError::upstream(config.addr.to_string(), "SOCKS5 认证失败"));
            }
            debug!("SOCKS5 认证成功");
        }
        (METHOD_NO_AUTH, _) => {}
        (other, _) => {
            return Err(GatewayError::upstream(
                config.addr.to_string(),
                format!("不支持的认证方法: {}", other),
            ));
        }
    }

    // ============ 步骤 3: CONNECT 请求 ============
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    target.write_to(&mut request)?;
    step("发送 SOCKS5 连接请求", stream.write_all(&request)).await?;

    let mut head = [0u8; 4];
    step("读取 SOCKS5 连接响应", stream.read_exact(&mut head)).await?;
    if head[0] != VERSION {
        return Err(GatewayError::upstream(config.addr.to_string(), "无效的 SOCKS5 响应: 版本错误"));
    }
    if head[1] != 0 {
        return Err(GatewayError::upstream(target.to_string(), reply_message(head[1])));
    }

    // 绑定地址读掉即可
    let bound = TargetAddr::read_from(stream, head[3]).await?;
    debug!("SOCKS5 连接成功，绑定地址 {}", bound);
    Ok(())
}

fn reply_message(code: u8) -> String {
    match code {
        1 => "SOCKS5: 一般 SOCKS 服务器故障".into(),
        2 => "SOCKS5: 连接规则集不允许的连接".into(),
        3 => "SOCKS5: 网络无法访问".into(),
        4 => "SOCKS5: 主机无法访问".into(),
        5 => "SOCKS5: 连接被拒绝".into(),
        6 => "SOCKS5: TTL 过期".into(),
        7 => "SOCKS5: 不支持的命令".into(),
        8 => "SOCKS5: 不支持的地址类型".into(),
        code => format!("SOCKS5: 未知错误代码 {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::duplex;

    fn config(username: Option<&str>, password: Option<&str>) -> Socks5Config {
        Socks5Config {
            addr: "127.0.0.1:1080".parse().unwrap(),
            username: username.map(String::from),
            password: password.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_client_against_server() {
        let (mut client, mut server) = duplex(1024);
        let target = TargetAddr::Domain("example.com".into(), 443);

        let server_task = tokio::spawn(async move {
            let got = accept(&mut server).await.unwrap();
            send_reply(&mut server, Reply::Succeeded).await.unwrap();
            got
        });

        connect(&mut client, &target, &config(None, None)).await.unwrap();
        assert_eq!(server_task.await.unwrap(), target);
    }

    #[tokio::test]
    async fn test_server_parses_ipv4_request() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(&[5, 1, 0, 5, 1, 0, 1, 192, 168, 1, 1, 0x1f, 0x90])
            .await
            .unwrap();

        let target = accept(&mut server).await.unwrap();
        assert_eq!(target, TargetAddr::Ipv4(Ipv4Addr::new(192, 168, 1, 1), 8080));

        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);
    }

    #[tokio::test]
    async fn test_server_rejects_bind_command() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(&[5, 1, 0, 5, 2, 0, 1, 1, 1, 1, 1, 0, 80])
            .await
            .unwrap();

        assert!(accept(&mut server).await.unwrap_err().is_rejection());

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[5, 0]);
        assert_eq!(&reply[2..4], &[5, Reply::CommandNotSupported as u8]);
    }

    #[tokio::test]
    async fn test_server_rejects_wrong_version() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[4, 1, 0]).await.unwrap();
        assert!(matches!(
            accept(&mut server).await,
            Err(GatewayError::MalformedHeader(_))
        ));
    }

    #[tokio::test]
    async fn test_client_user_pass_auth() {
        let (mut client, mut proxy) = duplex(1024);
        let proxy_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            proxy.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 2]);
            proxy.write_all(&[5, 2]).await.unwrap();

            let mut auth = [0u8; 1 + 1 + 4 + 1 + 6];
            proxy.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth[2..6], b"user");
            assert_eq!(&auth[7..], b"secret");
            proxy.write_all(&[1, 0]).await.unwrap();

            let mut req = [0u8; 3 + 1 + 4 + 2];
            proxy.read_exact(&mut req).await.unwrap();
            assert_eq!(&req[..4], &[5, 1, 0, 1]);
            proxy.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let target = TargetAddr::Ipv4(Ipv4Addr::new(8, 8, 8, 8), 53);
        connect(&mut client, &target, &config(Some("user"), Some("secret")))
            .await
            .unwrap();
        proxy_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_reports_refused() {
        let (mut client, mut proxy) = duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 3];
            proxy.read_exact(&mut buf).await.unwrap();
            proxy.write_all(&[5, 0]).await.unwrap();
            let mut req = [0u8; 3 + 1 + 1 + 5 + 2];
            proxy.read_exact(&mut req).await.unwrap();
            proxy.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let err = connect(
            &mut client,
            &TargetAddr::Domain("a.com".into(), 80),
            &config(None, None),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnreachable { .. }));
    }
}
