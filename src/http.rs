/// 请求头最多允许的条数
const MAX_HEADERS: usize = 64;

/// 从 HTTP/1.x 请求中得到的目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub host: String,
    pub port: u16,
    /// 是否是 CONNECT 隧道请求
    pub connect: bool,
    /// 请求头（含结尾空行）的字节数
    pub header_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpParse {
    Request(HttpTarget),
    Incomplete,
    NotHttp,
}

/// CONNECT 成功后回给客户端的响应
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// 解析请求行和 Host 头
pub fn parse_request(data: &[u8]) -> HttpParse {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let header_len = match req.parse(data) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return HttpParse::Incomplete,
        Err(_) => return HttpParse::NotHttp,
    };

    let method = req.method.unwrap_or("");
    let path = req.path.unwrap_or("");

    if method.eq_ignore_ascii_case("CONNECT") {
        return match split_host_port(path, 443) {
            Some((host, port)) => HttpParse::Request(HttpTarget {
                host,
                port,
                connect: true,
                header_len,
            }),
            None => HttpParse::NotHttp,
        };
    }

    let host_header = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok());

    let target = match host_header {
        Some(value) => split_host_port(value.trim(), 80),
        None => absolute_uri_authority(path).and_then(|authority| split_host_port(authority, 80)),
    };

    match target {
        Some((host, port)) => HttpParse::Request(HttpTarget {
            host,
            port,
            connect: false,
            header_len,
        }),
        None => HttpParse::NotHttp,
    }
}

fn absolute_uri_authority(path: &str) -> Option<&str> {
    let rest = path
        .strip_prefix("http://")
        .or_else(|| path.strip_prefix("https://"))?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// 拆分 `host[:port]`，支持 `[v6]:port`
pub fn split_host_port(value: &str, default_port: u16) -> Option<(String, u16)> {
    if value.is_empty() {
        return None;
    }

    if let Some(rest) = value.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }

    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            Some((host.to_ascii_lowercase(), port.parse().ok()?))
        }
        Some(_) => Some((value.to_string(), default_port)),
        None => Some((value.to_ascii_lowercase(), default_port)),
    }
}
