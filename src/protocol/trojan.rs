//! Trojan 兼容协议
//!
//! ```text
//! hex(SHA224(password)) | CRLF | cmd | atyp | dst_addr | dst_port | CRLF
//! 56B                     2B     1B    1B     变长       2B         2B
//! ```

use sha2::{Digest, Sha224};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::TargetAddr;
use crate::error::{GatewayError, Result};

pub const HASH_LEN: usize = 56;
pub const CMD_CONNECT: u8 = 0x01;
const CRLF: [u8; 2] = *b"\r\n";

/// 56 个小写十六进制字符
pub fn password_hash(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}

pub fn encode_header(hash: &str, target: &TargetAddr) -> Result<Vec<u8>> {
    let mut header = Vec::with_capacity(HASH_LEN + 2 + 1 + 1 + 1 + 255 + 2 + 2);
    header.extend_from_slice(hash.as_bytes());
    header.extend_from_slice(&CRLF);
    header.push(CMD_CONNECT);
    target.write_to(&mut header)?;
    header.extend_from_slice(&CRLF);
    Ok(header)
}

/// 读取并校验 Trojan 请求头
///
/// 密码不匹配时立即返回，不再读后续字段；调用方对认证失败与格式错误的处理相同。
pub async fn read_header<S>(stream: &mut S, hash: &str) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let mut received = [0u8; HASH_LEN];
    stream.read_exact(&mut received).await?;
    if !bool::from(received[..].ct_eq(hash.as_bytes())) {
        return Err(GatewayError::AuthFailure);
    }

    expect_crlf(stream).await?;

    let cmd = stream.read_u8().await?;
    if cmd != CMD_CONNECT {
        // UDP ASSOCIATE (0x03) 不支持
        return Err(GatewayError::malformed(format!("不支持的 Trojan 命令 {:#04x}", cmd)));
    }

    let atyp = stream.read_u8().await?;
    let target = TargetAddr::read_from(stream, atyp).await?;
    expect_crlf(stream).await?;
    Ok(target)
}

async fn expect_crlf<S: AsyncRead + Unpin>(stream: &mut S) -> Result<()> {
    let mut crlf = [0u8; 2];
    stream.read_exact(&mut crlf).await?;
    if crlf != CRLF {
        return Err(GatewayError::malformed("缺少 CRLF"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TunnelCodec, TunnelProtocol};
    use std::net::Ipv6Addr;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn test_password_hash() {
        let hash = password_hash("password");
        assert_eq!(hash.len(), HASH_LEN);
        assert_eq!(
            hash,
            "d63dc919e201d7bc4c825630d2cf25fdc93d4b2f0d46706d29038d01"
        );
    }

    #[tokio::test]
    async fn test_wrap_then_unwrap_domain() {
        let codec = TunnelCodec::new(TunnelProtocol::Trojan, "trojan-pass");
        let (client, mut server) = duplex(4096);

        let mut wrapped = codec
            .wrap(client, &TargetAddr::Domain("www.wweir.cc".into(), 443))
            .unwrap();
        wrapped.write_all(b"\x16\x03\x01").await.unwrap();

        let target = codec.unwrap(&mut server).await.unwrap();
        assert_eq!(target, TargetAddr::Domain("www.wweir.cc".into(), 443));

        let mut rest = [0u8; 3];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn test_ipv6_target() {
        let hash = password_hash("trojan-pass");
        let target = TargetAddr::Ipv6(Ipv6Addr::LOCALHOST, 8443);
        let header = encode_header(&hash, &target).unwrap();
        assert_eq!(header.len(), 56 + 2 + 1 + 1 + 16 + 2 + 2);

        let mut reader = &header[..];
        assert_eq!(read_header(&mut reader, &hash).await.unwrap(), target);
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let header = encode_header(
            &password_hash("trojan-pass"),
            &TargetAddr::Domain("a.com".into(), 80),
        )
        .unwrap();
        let mut reader = &header[..];
        let err = read_header(&mut reader, &password_hash("other-pass"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuthFailure));
    }

    #[tokio::test]
    async fn test_udp_command_rejected() {
        let hash = password_hash("trojan-pass");
        let mut header = encode_header(&hash, &TargetAddr::Domain("a.com".into(), 53)).unwrap();
        header[HASH_LEN + 2] = 0x03;
        let mut reader = &header[..];
        let err = read_header(&mut reader, &hash).await.unwrap_err();
        assert!(matches!(err, GatewayError::MalformedHeader(_)));
    }

    #[tokio::test]
    async fn test_short_input_is_io_error() {
        let mut reader: &[u8] = b"GET / HTTP/1.1\r\n";
        let err = read_header(&mut reader, &password_hash("x")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)));
    }
}
