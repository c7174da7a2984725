// SIP 摘要鉴权（RFC 2617，MD5）
// 解析平台下发的挑战，生成 Authorization / Proxy-Authorization

use crate::error::{GbError, Result};
use rand::Rng;
use std::collections::HashMap;

/// 挑战来源：401 或 407
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Www,
    Proxy,
}

impl ChallengeKind {
    pub fn from_status(code: u16) -> Option<Self> {
        match code {
            401 => Some(ChallengeKind::Www),
            407 => Some(ChallengeKind::Proxy),
            _ => None,
        }
    }

    /// 响应中携带挑战的头部
    pub fn challenge_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "WWW-Authenticate",
            ChallengeKind::Proxy => "Proxy-Authenticate",
        }
    }

    /// 请求中携带凭证的头部
    pub fn credentials_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "Authorization",
            ChallengeKind::Proxy => "Proxy-Authorization",
        }
    }
}

/// 平台下发的摘要挑战
#[derive(Debug, Clone, PartialEq)]
pub struct DigestChallenge {
    pub kind: ChallengeKind,
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    /// 仅当平台提供 `auth` 时为 Some("auth")
    pub qop: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    pub fn parse(kind: ChallengeKind, value: &str) -> Result<Self> {
        let value = value.trim();
        let rest = match value.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("Digest") => rest,
            _ => {
                return Err(GbError::Protocol(format!(
                    "unsupported auth scheme: {}",
                    value
                )))
            }
        };

        let params = parse_params(rest);

        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or_else(|| GbError::Protocol("digest challenge without nonce".to_string()))?;

        if let Some(algorithm) = params.get("algorithm") {
            if !algorithm.eq_ignore_ascii_case("MD5") {
                return Err(GbError::Protocol(format!(
                    "unsupported digest algorithm: {}",
                    algorithm
                )));
            }
        }

        let qop = params.get("qop").and_then(|q| {
            q.split(',')
                .map(str::trim)
                .find(|q| q.eq_ignore_ascii_case("auth"))
                .map(|_| "auth".to_string())
        });

        Ok(Self {
            kind,
            realm: params.get("realm").cloned().unwrap_or_default(),
            nonce,
            opaque: params.get("opaque").cloned(),
            algorithm: params.get("algorithm").cloned(),
            qop,
            stale: params
                .get("stale")
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// 生成凭证头部的值；`nc` 为本 nonce 下的第几次使用（从 1 开始）
    pub fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        nc: u32,
    ) -> String {
        let qop = self.qop.as_ref().map(|_| {
            let cnonce = generate_cnonce();
            (format!("{:08x}", nc), cnonce)
        });

        let response = compute_digest_response(
            username,
            &self.realm,
            password,
            method,
            uri,
            &self.nonce,
            qop.as_ref().map(|(nc, cnonce)| QopAuth { nc, cnonce }),
        );

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            username, self.realm, self.nonce, uri, response
        );

        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }

        if let Some((nc, cnonce)) = &qop {
            header.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
        }

        header
    }
}

/// qop=auth 时参与计算的参数
#[derive(Debug, Clone, Copy)]
pub struct QopAuth<'a> {
    pub nc: &'a str,
    pub cnonce: &'a str,
}

/// 计算摘要响应；`qop` 为 None 时退化为 RFC 2069 形式
pub fn compute_digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<QopAuth<'_>>,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    let resp_source = match qop {
        Some(q) => format!("{}:{}:{}:{}:auth:{}", ha1, nonce, q.nc, q.cnonce, ha2),
        None => format!("{}:{}:{}", ha1, nonce, ha2),
    };
    format!("{:x}", md5::compute(resp_source))
}

fn generate_cnonce() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

/// 逗号分隔的 key=value 列表，引号内的逗号不作分隔
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            ',' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);

    parts
        .iter()
        .filter_map(|part| {
            let (key, val) = part.trim().split_once('=')?;
            let val = val.trim();
            let val = val
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(val);
            Some((key.trim().to_ascii_lowercase(), val.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc2617_vector() {
        let response = compute_digest_response(
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some(QopAuth {
                nc: "00000001",
                cnonce: "0a4f113b",
            }),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_response_without_qop() {
        let response = compute_digest_response(
            "admin",
            "4101050000",
            "admin",
            "REGISTER",
            "sip:41010500002000000001@4101050000",
            "9bd055",
            None,
        );
        assert_eq!(response, "97892628fea301220afe1cfc5eada99c");
    }

    #[test]
    fn test_parse_challenge_with_quoted_commas() {
        let header = "Digest realm=\"4101050000\", nonce=\"a,b,c\", opaque=\"xyz\", qop=\"auth,auth-int\", algorithm=MD5, stale=TRUE";
        let challenge = DigestChallenge::parse(ChallengeKind::Www, header).unwrap();

        assert_eq!(challenge.realm, "4101050000");
        assert_eq!(challenge.nonce, "a,b,c");
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert!(challenge.stale);
    }

    #[test]
    fn test_parse_rejects_basic_and_missing_nonce() {
        assert!(DigestChallenge::parse(ChallengeKind::Www, "Basic realm=\"x\"").is_err());
        assert!(DigestChallenge::parse(ChallengeKind::Www, "Digest realm=\"x\"").is_err());
        assert!(
            DigestChallenge::parse(ChallengeKind::Proxy, "Digest nonce=\"n\", algorithm=SHA-256")
                .is_err()
        );
    }

    #[test]
    fn test_authorization_header_without_qop() {
        let challenge = DigestChallenge::parse(
            ChallengeKind::Www,
            "Digest realm=\"4101050000\", nonce=\"9bd055\"",
        )
        .unwrap();

        let header = challenge.authorization(
            "admin",
            "admin",
            "REGISTER",
            "sip:41010500002000000001@4101050000",
            1,
        );

        assert!(header.starts_with("Digest username=\"admin\""));
        assert!(header.contains("response=\"97892628fea301220afe1cfc5eada99c\""));
        assert!(!header.contains("qop"));
    }

    #[test]
    fn test_authorization_header_with_qop() {
        let challenge = DigestChallenge::parse(
            ChallengeKind::Proxy,
            "Digest realm=\"r\", nonce=\"n\", qop=\"auth\", opaque=\"o\"",
        )
        .unwrap();

        let header = challenge.authorization("u", "p", "REGISTER", "sip:r", 2);
        let params = parse_params(header.trim_start_matches("Digest "));

        assert_eq!(params.get("nc").map(String::as_str), Some("00000002"));
        assert_eq!(params.get("opaque").map(String::as_str), Some("o"));

        let cnonce = params.get("cnonce").unwrap();
        let expected = compute_digest_response(
            "u",
            "r",
            "p",
            "REGISTER",
            "sip:r",
            "n",
            Some(QopAuth {
                nc: "00000002",
                cnonce,
            }),
        );
        assert_eq!(params.get("response"), Some(&expected));
        assert_eq!(ChallengeKind::Proxy.credentials_header(), "Proxy-Authorization");
    }
}
