//! 自定义定长头隧道协议
//!
//! ```text
//! +-----+----------+------+-------------------------+
//! | cmd | checksum | port | addr (253B, NUL 填充)   |
//! | 1B  | 1B       | 2B   | 253B                    |
//! +-----+----------+------+-------------------------+
//! ```
//!
//! 头长度固定 257 字节，`checksum` 为 `MD5(addr ++ password)` 的最低字节。

use md5::{Digest, Md5};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::TargetAddr;
use crate::error::{GatewayError, Result};

/// 私有协议标记
pub const CMD_PRIVATE: u8 = 0x80;
/// DNS 名称最大长度
pub const ADDR_LEN: usize = 253;
pub const HEADER_LEN: usize = 1 + 1 + 2 + ADDR_LEN;

/// 地址 + 密码的 MD5 最低字节（大端意义下的最后一个字节）
pub fn checksum(addr: &[u8], password: &str) -> u8 {
    let mut hasher = Md5::new();
    hasher.update(addr);
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    digest[digest.len() - 1]
}

pub fn encode_header(host: &str, port: u16, password: &str) -> Result<[u8; HEADER_LEN]> {
    let addr = host.as_bytes();
    if addr.is_empty() || addr.len() > ADDR_LEN {
        return Err(GatewayError::malformed(format!("地址长度非法: {}", addr.len())));
    }
    if addr.contains(&0) {
        return Err(GatewayError::malformed("地址含 NUL 字节"));
    }

    let mut header = [0u8; HEADER_LEN];
    header[0] = CMD_PRIVATE;
    header[1] = checksum(addr, password);
    header[2..4].copy_from_slice(&port.to_be_bytes());
    header[4..4 + addr.len()].copy_from_slice(addr);
    Ok(header)
}

/// 读取完整的 257 字节头并校验
pub async fn read_header<S>(stream: &mut S, password: &str) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    decode_header(&header, password)
}

pub fn decode_header(header: &[u8; HEADER_LEN], password: &str) -> Result<TargetAddr> {
    if header[0] != CMD_PRIVATE {
        return Err(GatewayError::malformed(format!("未知命令字 {:#04x}", header[0])));
    }

    let field = &header[4..];
    let addr_len = field.iter().position(|b| *b == 0).unwrap_or(ADDR_LEN);
    let addr = &field[..addr_len];
    if addr.is_empty() {
        return Err(GatewayError::malformed("空地址"));
    }

    if !bool::from(checksum(addr, password).ct_eq(&header[1])) {
        return Err(GatewayError::AuthFailure);
    }

    let host = std::str::from_utf8(addr).map_err(|_| GatewayError::malformed("地址不是合法 UTF-8"))?;
    let port = u16::from_be_bytes([header[2], header[3]]);
    Ok(TargetAddr::from_host_port(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TunnelCodec, TunnelProtocol};
    use tokio::io::{duplex, AsyncWriteExt};

    const PASSWORD: &str = "correct-horse";

    #[test]
    fn test_header_layout() {
        let header = encode_header("example.com", 443, PASSWORD).unwrap();
        assert_eq!(header.len(), 257);
        assert_eq!(header[0], 0x80);
        assert_eq!(&header[2..4], &[0x01, 0xbb]);
        assert_eq!(&header[4..15], b"example.com");
        assert!(header[15..].iter().all(|b| *b == 0));
        assert_eq!(header[1], checksum(b"example.com", PASSWORD));
    }

    #[test]
    fn test_decode_rejects_wrong_cmd() {
        let mut header = encode_header("example.com", 443, PASSWORD).unwrap();
        header[0] = 0x05;
        assert!(matches!(
            decode_header(&header, PASSWORD),
            Err(GatewayError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_max_length_address() {
        let host = "a".repeat(ADDR_LEN);
        let header = encode_header(&host, 80, PASSWORD).unwrap();
        let target = decode_header(&header, PASSWORD).unwrap();
        assert_eq!(target, TargetAddr::Domain(host, 80));

        assert!(encode_header(&"a".repeat(ADDR_LEN + 1), 80, PASSWORD).is_err());
        assert!(encode_header("", 80, PASSWORD).is_err());
    }

    #[tokio::test]
    async fn test_wrap_then_unwrap() {
        let client_codec = TunnelCodec::new(TunnelProtocol::Custom, PASSWORD);
        let server_codec = TunnelCodec::new(TunnelProtocol::Custom, PASSWORD);

        let (client, mut server) = duplex(4096);
        let target = TargetAddr::Domain("example.com".into(), 443);
        let mut wrapped = client_codec.wrap(client, &target).unwrap();
        wrapped.write_all(b"ping").await.unwrap();

        let got = server_codec.unwrap(&mut server).await.unwrap();
        assert_eq!(got.host(), "example.com");
        assert_eq!(got.port(), 443);

        let mut payload = [0u8; 4];
        server.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ping");
    }

    #[tokio::test]
    async fn test_unwrap_with_other_password_fails() {
        // 找一个校验字节确实不同的密码，避免 1/256 的碰撞
        let other = (0..)
            .map(|i| format!("wrong-password-{}", i))
            .find(|p| checksum(b"example.com", p) != checksum(b"example.com", PASSWORD))
            .unwrap();

        let (client, mut server) = duplex(4096);
        let mut wrapped = TunnelCodec::new(TunnelProtocol::Custom, PASSWORD)
            .wrap(client, &TargetAddr::Domain("example.com".into(), 443))
            .unwrap();
        wrapped.flush().await.unwrap();

        let err = TunnelCodec::new(TunnelProtocol::Custom, &other)
            .unwrap(&mut server)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuthFailure));
    }

    #[tokio::test]
    async fn test_ip_literal_address() {
        let header = encode_header("10.0.0.1", 22, PASSWORD).unwrap();
        let mut reader = &header[..];
        let target = read_header(&mut reader, PASSWORD).await.unwrap();
        assert_eq!(target, TargetAddr::from_host_port("10.0.0.1", 22));
    }
}
