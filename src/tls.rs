use rand::RngCore;

/// TLS 记录层 content type: handshake
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;

/// ClientHello 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniParse {
    /// 解析到 SNI
    Found(String),
    /// 数据不足，需要继续读
    Incomplete,
    /// 是 ClientHello 但没有 SNI 扩展
    NoSni,
    /// 不是 TLS ClientHello
    NotTls,
}

/// 简单的游标，越界时返回 None，由调用方决定是"数据不足"还是"格式错误"
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let b = self.take(3)?;
        Some(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }
}

/// 从 TLS ClientHello 中解析 SNI
///
/// 只按固定布局走字段：记录头 → 握手长度 → 随机数 / session id /
/// cipher suites / 压缩方法 → 扩展列表 → server_name 扩展。
pub fn parse_sni(data: &[u8]) -> SniParse {
    if data.is_empty() {
        return SniParse::Incomplete;
    }
    if data[0] != CONTENT_TYPE_HANDSHAKE {
        return SniParse::NotTls;
    }
    if data.len() < 6 {
        return SniParse::Incomplete;
    }
    // 版本 3.x
    if data[1] != 0x03 || data[5] != HANDSHAKE_CLIENT_HELLO {
        return SniParse::NotTls;
    }

    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let body = match data.get(5..5 + record_len) {
        Some(body) => body,
        None => return SniParse::Incomplete,
    };

    match walk_client_hello(body) {
        Some(result) => result,
        // 整条记录已读完仍然越界，说明格式错误
        None => SniParse::NotTls,
    }
}

fn walk_client_hello(body: &[u8]) -> Option<SniParse> {
    let mut c = Cursor::new(body);
    c.u8()?; // handshake type
    let handshake_len = c.u24()?;
    if handshake_len + 4 > body.len() {
        // ClientHello 跨多条记录，这里只看第一条
        return Some(SniParse::NoSni);
    }

    c.take(2)?; // client version
    c.take(32)?; // random
    let session_id_len = c.u8()? as usize;
    c.take(session_id_len)?;
    let cipher_suites_len = c.u16()? as usize;
    c.take(cipher_suites_len)?;
    let compression_len = c.u8()? as usize;
    c.take(compression_len)?;

    let extensions_len = match c.u16() {
        Some(len) => len as usize,
        None => return Some(SniParse::NoSni),
    };
    let mut ext = Cursor::new(c.take(extensions_len)?);

    while let (Some(ext_type), Some(ext_len)) = (ext.u16(), ext.u16()) {
        let ext_data = ext.take(ext_len as usize)?;
        if ext_type == EXT_SERVER_NAME {
            return Some(parse_server_name(ext_data).map_or(SniParse::NoSni, SniParse::Found));
        }
    }

    Some(SniParse::NoSni)
}

fn parse_server_name(data: &[u8]) -> Option<String> {
    let mut c = Cursor::new(data);
    let list_len = c.u16()? as usize;
    let mut list = Cursor::new(c.take(list_len)?);

    while let Some(name_type) = list.u8() {
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        // 0 = host_name
        if name_type == 0 && !name.is_empty() && name.len() <= 255 {
            return String::from_utf8(name.to_vec()).ok();
        }
    }
    None
}

/// 构造一个带 SNI 的最小 ClientHello，用于可达性探测
pub fn build_client_hello(server_name: &str) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let name = server_name.as_bytes();

    let mut extensions = Vec::new();
    // server_name
    let name_entry_len = 3 + name.len();
    extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&((name_entry_len + 2) as u16).to_be_bytes());
    extensions.extend_from_slice(&(name_entry_len as u16).to_be_bytes());
    extensions.push(0);
    extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
    extensions.extend_from_slice(name);
    // supported_groups: x25519, secp256r1, secp384r1
    extensions.extend_from_slice(&[0x00, 0x0a, 0x00, 0x08, 0x00, 0x06, 0x00, 0x1d, 0x00, 0x17, 0x00, 0x18]);
    // ec_point_formats: uncompressed
    extensions.extend_from_slice(&[0x00, 0x0b, 0x00, 0x02, 0x01, 0x00]);
    // signature_algorithms
    extensions.extend_from_slice(&[
        0x00, 0x0d, 0x00, 0x0a, 0x00, 0x08, 0x04, 0x03, 0x08, 0x04, 0x04, 0x01, 0x05, 0x01,
    ]);

    let cipher_suites: [u16; 6] = [0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8];

    let mut hello = Vec::with_capacity(128 + name.len());
    hello.extend_from_slice(&[0x03, 0x03]);
    let mut random = [0u8; 32];
    rng.fill_bytes(&mut random);
    hello.extend_from_slice(&random);
    let mut session_id = [0u8; 32];
    rng.fill_bytes(&mut session_id);
    hello.push(session_id.len() as u8);
    hello.extend_from_slice(&session_id);
    hello.extend_from_slice(&((cipher_suites.len() * 2) as u16).to_be_bytes());
    for suite in cipher_suites {
        hello.extend_from_slice(&suite.to_be_bytes());
    }
    hello.extend_from_slice(&[0x01, 0x00]);
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = Vec::with_capacity(hello.len() + 4);
    handshake.push(HANDSHAKE_CLIENT_HELLO);
    let len = hello.len() as u32;
    handshake.extend_from_slice(&len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = Vec::with_capacity(handshake.len() + 5);
    record.extend_from_slice(&[CONTENT_TYPE_HANDSHAKE, 0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_built_client_hello() {
        let hello = build_client_hello("wweir.cc");
        assert_eq!(parse_sni(&hello), SniParse::Found("wweir.cc".to_string()));
    }

    #[test]
    fn test_truncated_is_incomplete() {
        let hello = build_client_hello("example.com");
        assert_eq!(parse_sni(&hello[..3]), SniParse::Incomplete);
        assert_eq!(parse_sni(&hello[..hello.len() - 1]), SniParse::Incomplete);
        assert_eq!(parse_sni(&[]), SniParse::Incomplete);
    }

    #[test]
    fn test_not_tls() {
        assert_eq!(parse_sni(b"GET / HTTP/1.1\r\n"), SniParse::NotTls);
        assert_eq!(parse_sni(&[0x16, 0x02, 0x00, 0x00, 0x00, 0x01]), SniParse::NotTls);
        assert_eq!(parse_sni(&[0x80, 0x00]), SniParse::NotTls);
    }

    #[test]
    fn test_without_sni_extension() {
        let mut hello = build_client_hello("a.io");
        // 把 server_name 扩展类型改成一个未知扩展
        let pos = hello
            .windows(4)
            .position(|w| w == [0x00, 0x00, 0x00, 0x09])
            .unwrap();
        hello[pos + 1] = 0x99;
        assert_eq!(parse_sni(&hello), SniParse::NoSni);
    }

    #[test]
    fn test_garbage_inside_record_is_not_tls() {
        let mut hello = build_client_hello("example.com");
        // session id 长度改为超出记录
        hello[5 + 4 + 2 + 32] = 0xff;
        assert_eq!(parse_sni(&hello), SniParse::NotTls);
    }
}
