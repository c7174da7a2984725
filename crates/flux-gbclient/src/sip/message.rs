// SIP 消息解析和生成
// 支持 GB28181 所需的 SIP 子集；头部保持原始顺序，兼容紧凑形式与折行

use crate::error::{GbError, Result};
use rand::Rng;
use std::fmt;

/// SIP 方法
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Options,
    Subscribe,
    Notify,
    Info,
    Other(String),
}

impl SipMethod {
    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
            SipMethod::Other(m) => m.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "MESSAGE" => SipMethod::Message,
            "OPTIONS" => SipMethod::Options,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "INFO" => SipMethod::Info,
            other => SipMethod::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 紧凑头名展开（RFC 3261 7.3.3）
fn expand_compact(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "e" | "E" => "Content-Encoding",
        "k" | "K" => "Supported",
        "s" | "S" => "Subject",
        other => other,
    }
}

fn names_match(a: &str, b: &str) -> bool {
    expand_compact(a).eq_ignore_ascii_case(expand_compact(b))
}

/// 有序头部列表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 第一个同名头部
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| names_match(k, name))
            .map(|(_, v)| v.as_str())
    }

    /// 所有同名头部（保持顺序）
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| names_match(k, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// 替换同名头部（只保留一个）
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter().position(|(k, _)| names_match(k, name)) {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut i = 0;
                self.entries.retain(|(k, _)| {
                    let keep = i <= pos || !names_match(k, name);
                    i += 1;
                    keep
                });
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !names_match(k, name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 请求与响应共用的头部访问
pub trait SipHeaders {
    fn headers(&self) -> &Headers;

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name)
    }

    fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// CSeq 序号与方法
    fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = SipMethod::parse(parts.next()?);
        Some((seq, method))
    }

    fn from_tag(&self) -> Option<&str> {
        header_param(self.header("From")?, "tag")
    }

    fn to_tag(&self) -> Option<&str> {
        header_param(self.header("To")?, "tag")
    }

    /// 顶层 Via 的 branch
    fn via_branch(&self) -> Option<&str> {
        let via = self.header("Via")?;
        let top = via.split(',').next()?;
        header_param(top, "branch")
    }

    fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    fn expires(&self) -> Option<u32> {
        self.header("Expires")?.trim().parse().ok()
    }
}

/// SIP 请求
#[derive(Debug, Clone, PartialEq)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: String) -> Self {
        Self {
            method,
            uri,
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.add(key, value);
    }

    pub fn set_header(&mut self, key: &str, value: impl Into<String>) {
        self.headers.set(key, value);
    }

    /// 设置消息体
    pub fn set_body(&mut self, content_type: &str, body: String) {
        self.headers.set("Content-Type", content_type);
        self.body = Some(body);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    fn from_parts(start_line: &str, headers: Headers, body: Option<String>) -> Result<Self> {
        let parts: Vec<&str> = start_line.split_whitespace().collect();
        if parts.len() != 3 || !parts[2].starts_with("SIP/") {
            return Err(GbError::Protocol(format!(
                "Invalid request line: {}",
                start_line
            )));
        }

        Ok(Self {
            method: SipMethod::parse(parts[0]),
            uri: parts[1].to_string(),
            version: parts[2].to_string(),
            headers,
            body,
        })
    }
}

impl SipHeaders for SipRequest {
    fn headers(&self) -> &Headers {
        &self.headers
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, self.version)?;
        write_headers_and_body(f, &self.headers, self.body.as_deref())
    }
}

/// SIP 响应
#[derive(Debug, Clone, PartialEq)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// 基于请求构造响应，回显 Via/From/To/Call-ID/CSeq
    pub fn for_request(req: &SipRequest, status_code: u16) -> Self {
        let mut resp = Self::new(status_code, reason_phrase(status_code));
        for via in req.headers.get_all("Via") {
            resp.headers.add("Via", via);
        }
        for key in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = req.headers.get(key) {
                resp.headers.add(key, value);
            }
        }
        resp
    }

    /// 为 To 头补充本端 tag（已有 tag 时保持不变）
    pub fn with_to_tag(mut self, tag: &str) -> Self {
        if let Some(to) = self.headers.get("To") {
            if header_param(to, "tag").is_none() {
                let tagged = format!("{};tag={}", to, tag);
                self.headers.set("To", tagged);
            }
        }
        self
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.add(key, value);
    }

    pub fn set_body(&mut self, content_type: &str, body: String) {
        self.headers.set("Content-Type", content_type);
        self.body = Some(body);
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    fn from_parts(start_line: &str, headers: Headers, body: Option<String>) -> Result<Self> {
        let parts: Vec<&str> = start_line.splitn(3, ' ').collect();
        if parts.len() < 2 {
            return Err(GbError::Protocol(format!(
                "Invalid status line: {}",
                start_line
            )));
        }

        let status_code = parts[1]
            .parse::<u16>()
            .map_err(|_| GbError::Protocol(format!("Invalid status code: {}", parts[1])))?;

        Ok(Self {
            version: parts[0].to_string(),
            status_code,
            reason_phrase: parts.get(2).map(|s| s.to_string()).unwrap_or_default(),
            headers,
            body,
        })
    }
}

impl SipHeaders for SipResponse {
    fn headers(&self) -> &Headers {
        &self.headers
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason_phrase
        )?;
        write_headers_and_body(f, &self.headers, self.body.as_deref())
    }
}

fn write_headers_and_body(
    f: &mut fmt::Formatter<'_>,
    headers: &Headers,
    body: Option<&str>,
) -> fmt::Result {
    for (key, value) in headers.iter() {
        if names_match(key, "Content-Length") {
            continue;
        }
        write!(f, "{}: {}\r\n", key, value)?;
    }

    // Content-Length 始终按实际消息体重新计算
    let body = body.unwrap_or("");
    write!(f, "Content-Length: {}\r\n\r\n", body.len())?;
    f.write_str(body)
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone, PartialEq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 从原始字节解析 SIP 消息
    pub fn parse(data: &[u8]) -> Result<Self> {
        let start = data
            .iter()
            .position(|b| !matches!(b, b'\r' | b'\n'))
            .ok_or_else(|| GbError::Protocol("Empty SIP message".to_string()))?;
        let data = &data[start..];

        let (head_end, body_start) = find_header_end(data)
            .ok_or_else(|| GbError::Protocol("Missing header terminator".to_string()))?;

        let head = String::from_utf8_lossy(&data[..head_end]);
        let mut lines = head.lines();
        let start_line = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| GbError::Protocol("Missing start line".to_string()))?;

        let headers = parse_headers(lines)?;

        let available = &data[body_start..];
        let body_bytes = match headers.get("Content-Length") {
            Some(value) => {
                let len: usize = value.trim().parse().map_err(|_| {
                    GbError::Protocol(format!("Invalid Content-Length: {}", value))
                })?;
                if len > available.len() {
                    return Err(GbError::Protocol(format!(
                        "Truncated body: expected {} bytes, got {}",
                        len,
                        available.len()
                    )));
                }
                &available[..len]
            }
            None => available,
        };

        let body = if body_bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(body_bytes).into_owned())
        };

        if start_line.starts_with("SIP/") {
            Ok(SipMessage::Response(SipResponse::from_parts(
                start_line, headers, body,
            )?))
        } else {
            Ok(SipMessage::Request(SipRequest::from_parts(
                start_line, headers, body,
            )?))
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            SipMessage::Request(req) => req.call_id(),
            SipMessage::Response(resp) => resp.call_id(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers = Headers::new();
    let mut last: Option<(String, String)> = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }

        // 折行：以空白开头的行续接上一个头部
        if line.starts_with(' ') || line.starts_with('\t') {
            match last.as_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => {
                    return Err(GbError::Protocol(
                        "Continuation line without header".to_string(),
                    ))
                }
            }
            continue;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| GbError::Protocol(format!("Malformed header line: {}", line)))?;

        if let Some((k, v)) = last.take() {
            headers.add(k, v);
        }
        last = Some((
            expand_compact(key.trim()).to_string(),
            value.trim().to_string(),
        ));
    }

    if let Some((k, v)) = last {
        headers.add(k, v);
    }

    Ok(headers)
}

/// 返回 (头部结束位置, 消息体起始位置)
fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    data.windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, pos + 2))
}

/// TCP 流分帧：返回缓冲区中第一条完整消息的长度（含前导 CRLF 保活）
///
/// 头部不完整或消息体未收齐时返回 `Ok(None)`。
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    let lead = buf
        .iter()
        .take_while(|b| matches!(b, b'\r' | b'\n'))
        .count();
    if lead == buf.len() {
        return Ok(None);
    }

    let data = &buf[lead..];
    let Some((head_end, body_start)) = find_header_end(data) else {
        return Ok(None);
    };

    let head = String::from_utf8_lossy(&data[..head_end]);
    let mut content_length = 0usize;
    for line in head.lines().skip(1) {
        if let Some((key, value)) = line.split_once(':') {
            if names_match(key.trim(), "Content-Length") {
                content_length = value.trim().parse().map_err(|_| {
                    GbError::Protocol(format!("Invalid Content-Length: {}", value.trim()))
                })?;
            }
        }
    }

    let total = lead + body_start + content_length;
    if buf.len() >= total {
        Ok(Some(total))
    } else {
        Ok(None)
    }
}

/// 读取头部参数，如 From 中的 `tag`、Via 中的 `branch`
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };

    params.split(';').find_map(|part| {
        let (k, v) = part.trim().split_once('=')?;
        if k.trim().eq_ignore_ascii_case(name) {
            Some(v.trim().trim_matches('"'))
        } else {
            None
        }
    })
}

/// 从 `sip:user@host` 形式中提取 user 部分
pub fn uri_user(value: &str) -> Option<&str> {
    let start = value
        .find("sip:")
        .map(|p| p + 4)
        .or_else(|| value.find("sips:").map(|p| p + 5))?;
    let rest = &value[start..];
    let end = rest.find('@')?;
    let user = &rest[..end];
    if user.is_empty() {
        None
    } else {
        Some(user)
    }
}

/// 常用状态码的原因短语
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
        .collect()
}

/// 生成 From/To tag
pub fn generate_tag() -> String {
    random_hex(10)
}

/// 生成 RFC 3261 magic cookie 开头的 branch
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", random_hex(16))
}

pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", random_hex(20), host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_request_parsing() {
        let sip_str = "REGISTER sip:41010500002000000001@4101050000 SIP/2.0\r\n\
                       Via: SIP/2.0/UDP 192.168.1.100:5061;rport;branch=z9hG4bK776asdhds\r\n\
                       From: <sip:31011500991320000532@4101050000>;tag=1928301774\r\n\
                       To: <sip:31011500991320000532@4101050000>\r\n\
                       Call-ID: a84b4c76e66710@192.168.1.100\r\n\
                       CSeq: 1 REGISTER\r\n\
                       Expires: 3600\r\n\
                       Content-Length: 0\r\n\
                       \r\n";

        let msg = SipMessage::parse(sip_str.as_bytes()).unwrap();
        let SipMessage::Request(req) = msg else {
            panic!("expected request");
        };

        assert_eq!(req.method, SipMethod::Register);
        assert_eq!(req.uri, "sip:41010500002000000001@4101050000");
        assert_eq!(req.call_id(), Some("a84b4c76e66710@192.168.1.100"));
        assert_eq!(req.cseq(), Some((1, SipMethod::Register)));
        assert_eq!(req.from_tag(), Some("1928301774"));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.via_branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(req.expires(), Some(3600));
        assert!(req.body.is_none());
    }

    #[test]
    fn test_response_body_bounded_by_content_length() {
        let body = "<?xml version=\"1.0\"?>\r\n<Query><CmdType>Catalog</CmdType></Query>";
        let raw = format!(
            "MESSAGE sip:31011500991320000532@4101050000 SIP/2.0\r\n\
             v: SIP/2.0/UDP 192.168.1.14:5060;branch=z9hG4bKabc\r\n\
             i: 42@192.168.1.14\r\n\
             c: Application/MANSCDP+xml\r\n\
             l: {}\r\n\r\n{}trailing-garbage",
            body.len(),
            body
        );

        let SipMessage::Request(req) = SipMessage::parse(raw.as_bytes()).unwrap() else {
            panic!("expected request");
        };

        assert_eq!(req.method, SipMethod::Message);
        assert_eq!(req.call_id(), Some("42@192.168.1.14"));
        assert_eq!(req.content_type(), Some("Application/MANSCDP+xml"));
        assert_eq!(req.body.as_deref(), Some(body));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let raw = "SIP/2.0 200 OK\r\nCall-ID: x\r\nContent-Length: 50\r\n\r\nshort";
        assert!(SipMessage::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_folded_header() {
        let raw = "SIP/2.0 401 Unauthorized\r\n\
                   WWW-Authenticate: Digest realm=\"4101050000\",\r\n \
                   nonce=\"abc\"\r\n\
                   Content-Length: 0\r\n\r\n";

        let SipMessage::Response(resp) = SipMessage::parse(raw.as_bytes()).unwrap() else {
            panic!("expected response");
        };

        assert_eq!(resp.status_code, 401);
        assert_eq!(
            resp.header("www-authenticate"),
            Some("Digest realm=\"4101050000\", nonce=\"abc\"")
        );
    }

    #[test]
    fn test_response_for_request_echoes_headers() {
        let raw = "BYE sip:32011500991320000040@192.168.1.100:5061 SIP/2.0\r\n\
                   Via: SIP/2.0/UDP 192.168.1.14:5060;branch=z9hG4bK1\r\n\
                   Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK2\r\n\
                   From: <sip:41010500002000000001@4101050000>;tag=srv\r\n\
                   To: <sip:32011500991320000040@4101050000>\r\n\
                   Call-ID: dialog-1\r\n\
                   CSeq: 2 BYE\r\n\
                   Content-Length: 0\r\n\r\n";

        let SipMessage::Request(req) = SipMessage::parse(raw.as_bytes()).unwrap() else {
            panic!("expected request");
        };

        let resp = SipResponse::for_request(&req, 200).with_to_tag("dev");
        let vias: Vec<&str> = resp.headers.get_all("Via").collect();

        assert_eq!(vias.len(), 2);
        assert_eq!(resp.reason_phrase, "OK");
        assert_eq!(resp.call_id(), Some("dialog-1"));
        assert_eq!(resp.to_tag(), Some("dev"));
        assert_eq!(resp.cseq(), Some((2, SipMethod::Bye)));

        let text = resp.to_string();
        assert!(text.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_serialized_request_parses_back() {
        let mut req = SipRequest::new(
            SipMethod::Message,
            "sip:41010500002000000001@4101050000".to_string(),
        );
        req.add_header("Call-ID", "k1@host");
        req.add_header("CSeq", "20 MESSAGE");
        req.set_body("Application/MANSCDP+xml", "<Notify/>".to_string());

        let text = req.to_string();
        assert!(text.contains("Content-Length: 9\r\n"));

        let SipMessage::Request(parsed) = SipMessage::parse(text.as_bytes()).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(parsed.body.as_deref(), Some("<Notify/>"));
    }

    #[test]
    fn test_frame_length() {
        let msg = "SIP/2.0 200 OK\r\nContent-Length: 4\r\n\r\nbody";
        let mut stream = b"\r\n\r\n".to_vec();
        stream.extend_from_slice(msg.as_bytes());
        stream.extend_from_slice(b"SIP/2.0 100");

        assert_eq!(frame_length(&stream).unwrap(), Some(4 + msg.len()));
        assert_eq!(frame_length(&stream[..10]).unwrap(), None);
        assert_eq!(frame_length(b"\r\n\r\n").unwrap(), None);
    }

    #[test]
    fn test_header_param_and_uri_user() {
        let from = "\"cam\" <sip:32011500991320000040@4101050000;transport=udp>;tag=abc";
        assert_eq!(header_param(from, "tag"), Some("abc"));
        assert_eq!(header_param(from, "transport"), None);
        assert_eq!(uri_user(from), Some("32011500991320000040"));
        assert_eq!(uri_user("sip:4101050000"), None);
    }

    #[test]
    fn test_set_header_replaces_all() {
        let mut headers = Headers::new();
        headers.add("Expires", "10");
        headers.add("Call-ID", "a");
        headers.add("expires", "20");
        headers.set("Expires", "0");

        let values: Vec<&str> = headers.get_all("Expires").collect();
        assert_eq!(values, vec!["0"]);
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_generated_identifiers() {
        assert!(generate_branch().starts_with("z9hG4bK"));
        assert_ne!(generate_tag(), generate_tag());
        assert!(generate_call_id("10.0.0.1").ends_with("@10.0.0.1"));
    }
}
