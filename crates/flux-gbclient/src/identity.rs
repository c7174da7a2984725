// 客户端身份
// 加载后不可变，负责生成出向请求的公共头部

use crate::error::Result;
use crate::settings::{ClientConfig, TransportMode};
use crate::sip::message::{generate_branch, generate_call_id, generate_tag, SipMethod, SipRequest};
use crate::sip::MANSCDP_CONTENT_TYPE;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// 客户端身份
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub server_id: String,
    pub realm: String,
    /// 本端国标编码
    pub gb_id: String,
    pub username: String,
    pub password: String,
    pub server_addr: SocketAddr,
    pub transport: TransportMode,
    pub local_port: u16,
    /// Via/Contact 中使用的地址
    pub local_ip: String,
    pub media_port: u16,
    pub user_agent: String,
}

impl ClientIdentity {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let server_addr = config.server_socket_addr()?;
        let local_ip = match &config.local_ip {
            Some(ip) => ip.clone(),
            None => detect_local_ip(server_addr).to_string(),
        };

        Ok(Self {
            server_id: config.server_id.clone(),
            realm: config.realm.clone(),
            gb_id: config.gb_id.clone(),
            username: if config.username.is_empty() {
                config.gb_id.clone()
            } else {
                config.username.clone()
            },
            password: config.password.clone(),
            server_addr,
            transport: config.transport,
            local_port: config.local_sip_port,
            local_ip,
            media_port: config.media_port(),
            user_agent: config.user_agent.clone(),
        })
    }

    /// 平台 URI：sip:{serverID}@{realm}
    pub fn server_uri(&self) -> String {
        format!("sip:{}@{}", self.server_id, self.realm)
    }

    /// 本端 AOR：sip:{gbId}@{realm}
    pub fn local_uri(&self) -> String {
        format!("sip:{}@{}", self.gb_id, self.realm)
    }

    pub fn contact(&self) -> String {
        format!("<sip:{}@{}:{}>", self.gb_id, self.local_ip, self.local_port)
    }

    pub fn via(&self, branch: &str) -> String {
        format!(
            "SIP/2.0/{} {}:{};rport;branch={}",
            self.transport.via_token(),
            self.local_ip,
            self.local_port,
            branch
        )
    }

    /// 构造出向请求（新 branch），From 为本端 AOR，To 为 `to_uri`
    pub fn new_request(
        &self,
        method: SipMethod,
        request_uri: &str,
        to_uri: &str,
        call_id: &str,
        cseq: u32,
        from_tag: &str,
    ) -> SipRequest {
        let mut req = SipRequest::new(method.clone(), request_uri.to_string());
        req.add_header("Via", self.via(&generate_branch()));
        req.add_header("From", format!("<{}>;tag={}", self.local_uri(), from_tag));
        req.add_header("To", format!("<{}>", to_uri));
        req.add_header("Call-ID", call_id);
        req.add_header("CSeq", format!("{} {}", cseq, method));
        req.add_header("Max-Forwards", "70");
        req.add_header("User-Agent", self.user_agent.clone());
        req
    }

    /// 独立的 MANSCDP MESSAGE（新 Call-ID），`to_uri` 同时作为 Request-URI
    pub fn manscdp_message(&self, to_uri: &str, body: String) -> SipRequest {
        let call_id = generate_call_id(&self.local_ip);
        let mut req = self.new_request(
            SipMethod::Message,
            to_uri,
            to_uri,
            &call_id,
            1,
            &generate_tag(),
        );
        req.set_body(MANSCDP_CONTENT_TYPE, body);
        req
    }
}

/// 按到平台的路由探测本机地址；探测失败时退回 0.0.0.0
fn detect_local_ip(server: SocketAddr) -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let bind = if server.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(server)?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(ip) => ip,
        Err(e) => {
            tracing::warn!(target: "gb28181::client", error = %e, "Local address detection failed");
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::tests::SIM_CONF;
    use crate::sip::message::SipHeaders;

    fn identity() -> ClientIdentity {
        let mut cfg = ClientConfig::from_json(SIM_CONF).unwrap();
        cfg.local_ip = Some("192.168.1.100".to_string());
        ClientIdentity::from_config(&cfg).unwrap()
    }

    #[test]
    fn test_uris() {
        let id = identity();
        assert_eq!(id.server_uri(), "sip:41010500002000000001@4101050000");
        assert_eq!(id.local_uri(), "sip:31011500991320000532@4101050000");
        assert_eq!(id.contact(), "<sip:31011500991320000532@192.168.1.100:5061>");
        assert_eq!(id.media_port, 5063);
    }

    #[test]
    fn test_new_request_headers() {
        let id = identity();
        let req = id.new_request(
            SipMethod::Register,
            &id.server_uri(),
            &id.local_uri(),
            "c1@192.168.1.100",
            7,
            "ftag",
        );

        assert_eq!(req.cseq(), Some((7, SipMethod::Register)));
        assert_eq!(req.from_tag(), Some("ftag"));
        assert!(req.via_branch().unwrap().starts_with("z9hG4bK"));
        assert!(req
            .header("Via")
            .unwrap()
            .starts_with("SIP/2.0/UDP 192.168.1.100:5061;rport"));
    }

    #[test]
    fn test_manscdp_message() {
        let id = identity();
        let req = id.manscdp_message(&id.server_uri(), "<Notify/>".to_string());

        assert_eq!(req.method, SipMethod::Message);
        assert_eq!(req.uri, "sip:41010500002000000001@4101050000");
        assert_eq!(req.content_type(), Some("Application/MANSCDP+xml"));
        assert_eq!(req.cseq(), Some((1, SipMethod::Message)));
        assert_eq!(req.body.as_deref(), Some("<Notify/>"));
    }

    #[test]
    fn test_loopback_detection() {
        let ip = detect_local_ip("127.0.0.1:5060".parse().unwrap());
        assert!(ip.is_loopback());
    }
}
