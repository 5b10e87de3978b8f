use std::io;
use thiserror::Error;

/// 网关错误分类
///
/// `MalformedHeader` 与 `AuthFailure` 在线路上表现一致（静默关闭或转发到伪装站点），
/// 只在日志里区分。
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("协议头格式错误: {0}")]
    MalformedHeader(String),

    #[error("认证失败")]
    AuthFailure,

    #[error("无法连接上游 {addr}: {reason}")]
    UpstreamUnreachable { addr: String, reason: String },

    #[error("探测超时: {0}")]
    ProbeTimeout(String),

    #[error("DNS 上游查询失败: {0}")]
    DnsUpstreamFailure(String),

    #[error("解密失败")]
    DecryptionFailure,

    #[error("配置错误: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl GatewayError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        GatewayError::MalformedHeader(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    pub fn upstream(addr: impl Into<String>, reason: impl ToString) -> Self {
        GatewayError::UpstreamUnreachable {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// 该错误是否属于"被探测"类错误：对外不可区分，可以转给伪装站点
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GatewayError::MalformedHeader(_) | GatewayError::AuthFailure
        )
    }
}

impl From<GatewayError> for io::Error {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Io(e) => e,
            GatewayError::DecryptionFailure => io::Error::new(io::ErrorKind::InvalidData, err),
            GatewayError::MalformedHeader(_) | GatewayError::AuthFailure => {
                io::Error::new(io::ErrorKind::InvalidData, err)
            }
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
