// 端到端流程测试
// 本地 UDP 上的脚本化平台驱动一个真实的用户代理

use async_trait::async_trait;
use flux_gbclient::sip::auth::compute_digest_response;
use flux_gbclient::sip::{SdpSession, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
use flux_gbclient::{
    ClientConfig, GbError, MediaPlane, RegistrationState, Result, SessionParams, UserAgent,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;

const NONCE: &str = "9bd055";
const ON_DEVICE: &str = "32011500991320000040";
const OFF_DEVICE: &str = "32011500991320000043";
const UNKNOWN_DEVICE: &str = "32011500991320009999";

#[derive(Default)]
struct RecordingMediaPlane {
    armed: Mutex<Vec<String>>,
    disarmed: Mutex<Vec<String>>,
}

#[async_trait]
impl MediaPlane for RecordingMediaPlane {
    async fn arm_stream(&self, device_id: &str, _params: &SessionParams) -> Result<()> {
        self.armed.lock().unwrap().push(device_id.to_string());
        Ok(())
    }

    async fn disarm_stream(&self, session_id: &str) -> Result<()> {
        self.disarmed.lock().unwrap().push(session_id.to_string());
        Ok(())
    }
}

/// 脚本化平台
struct Platform {
    socket: UdpSocket,
    client: Option<SocketAddr>,
    sn: u32,
}

impl Platform {
    async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            client: None,
            sn: 100,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    async fn recv(&mut self) -> SipMessage {
        let mut buf = vec![0u8; 65535];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), self.socket.recv_from(&mut buf))
            .await
            .expect("platform receive timed out")
            .unwrap();
        self.client = Some(from);
        SipMessage::parse(&buf[..n]).unwrap()
    }

    /// 下一个请求；心跳直接回 200 并跳过
    async fn next_request(&mut self) -> SipRequest {
        loop {
            match self.recv().await {
                SipMessage::Request(req) if is_keepalive(&req) => {
                    self.respond(&req, 200, &[]).await;
                }
                SipMessage::Request(req) => return req,
                SipMessage::Response(_) => {}
            }
        }
    }

    /// 下一个最终响应，跳过临时响应并记录其状态码
    async fn final_response(&mut self, provisional: &mut Vec<u16>) -> SipResponse {
        loop {
            match self.recv().await {
                SipMessage::Response(resp) if resp.is_provisional() => {
                    provisional.push(resp.status_code)
                }
                SipMessage::Response(resp) => return resp,
                SipMessage::Request(req) if is_keepalive(&req) => {
                    self.respond(&req, 200, &[]).await;
                }
                SipMessage::Request(req) => panic!("unexpected request: {}", req.method),
            }
        }
    }

    /// 下一个 REGISTER；期间的心跳不回应，返回被忽略的心跳数
    async fn next_register_silent(&mut self) -> (SipRequest, usize) {
        let mut ignored = 0;
        loop {
            match self.recv().await {
                SipMessage::Request(req) if is_keepalive(&req) => ignored += 1,
                SipMessage::Request(req) if req.method == SipMethod::Register => {
                    return (req, ignored)
                }
                SipMessage::Request(req) => panic!("unexpected request: {}", req.method),
                SipMessage::Response(_) => {}
            }
        }
    }

    async fn respond(&self, req: &SipRequest, code: u16, extra: &[(&str, String)]) {
        let mut resp = SipResponse::for_request(req, code).with_to_tag("platform");
        for (name, value) in extra {
            resp.add_header(*name, value.clone());
        }
        self.send(&resp.to_bytes()).await;
    }

    async fn send(&self, data: &[u8]) {
        let client = self.client.expect("client address not learned yet");
        self.socket.send_to(data, client).await.unwrap();
    }

    async fn send_query(&mut self, cmd_type: &str, device_id: &str) -> String {
        self.sn += 1;
        let body = format!(
            "<?xml version=\"1.0\"?>\r\n<Query>\r\n<CmdType>{}</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n</Query>\r\n",
            cmd_type, self.sn, device_id
        );
        let call_id = format!("query-{}", self.sn);
        let raw = request(
            "MESSAGE",
            device_id,
            &call_id,
            1,
            &format!("z9hG4bKq{}", self.sn),
            "Application/MANSCDP+xml",
            &body,
        );
        self.send(raw.as_bytes()).await;
        call_id
    }
}

fn is_keepalive(req: &SipRequest) -> bool {
    req.method == SipMethod::Message
        && req
            .body
            .as_deref()
            .map(|b| b.contains("<CmdType>Keepalive</CmdType>"))
            .unwrap_or(false)
}

fn request(
    method: &str,
    target: &str,
    call_id: &str,
    cseq: u32,
    branch: &str,
    content_type: &str,
    body: &str,
) -> String {
    let mut raw = format!(
        "{method} sip:{target}@4101050000 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;rport;branch={branch}\r\n\
         From: <sip:41010500002000000001@4101050000>;tag=plat{cseq}\r\n\
         To: <sip:{target}@4101050000>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n\
         Max-Forwards: 70\r\n"
    );
    if !body.is_empty() {
        raw.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    raw.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    raw
}

fn offer(ssrc: &str) -> String {
    format!(
        "v=0\r\n\
         o=41010500002000000001 0 0 IN IP4 127.0.0.1\r\n\
         s=Play\r\n\
         c=IN IP4 127.0.0.1\r\n\
         t=0 0\r\n\
         m=video 30000 RTP/AVP 96 98 97\r\n\
         a=recvonly\r\n\
         a=rtpmap:96 PS/90000\r\n\
         a=rtpmap:98 H264/90000\r\n\
         a=rtpmap:97 MPEG4/90000\r\n\
         y={}\r\n",
        ssrc
    )
}

fn digest_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = value.trim_start_matches("Digest").trim();
    params.split(',').find_map(|part| {
        let (k, v) = part.trim().split_once('=')?;
        (k.trim() == name).then(|| v.trim().trim_matches('"'))
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn config(server: SocketAddr) -> ClientConfig {
    let json = format!(
        r#"{{
            "localSipPort": {port},
            "localIp": "127.0.0.1",
            "serverID": "41010500002000000001",
            "realm": "4101050000",
            "serverAddr": "{server}",
            "userName": "admin",
            "password": "admin",
            "regExpire": 3600,
            "keepaliveInterval": 60,
            "maxKeepaliveRetry": 3,
            "transport": "udp",
            "gbId": "31011500991320000532",
            "transactionTimeoutMs": 2000,
            "devices": [
                {{
                    "deviceID": "{on}",
                    "name": "test001",
                    "manufacturer": "simulatorFactory",
                    "model": "Mars",
                    "CivilCode": "civilCode",
                    "address": "192.18.1.1",
                    "parental": 0,
                    "safeWay": 1,
                    "registerWay": 1,
                    "secrecy": 1,
                    "status": "ON"
                }},
                {{
                    "deviceID": "{off}",
                    "name": "test004",
                    "manufacturer": "simulatorFactory",
                    "model": "Mars",
                    "CivilCode": "civilCode",
                    "address": "192.18.1.4",
                    "parental": 0,
                    "safeWay": 1,
                    "registerWay": 1,
                    "secrecy": 1,
                    "status": "OFF"
                }}
            ]
        }}"#,
        port = free_port(),
        server = server,
        on = ON_DEVICE,
        off = OFF_DEVICE,
    );
    ClientConfig::from_json(&json).unwrap()
}

/// 401 挑战后校验摘要并接受注册，返回注册 Call-ID
async fn register(platform: &mut Platform, expires: u32) -> String {
    let first = platform.next_request().await;
    assert_eq!(first.method, SipMethod::Register);
    assert!(first.header("Authorization").is_none());
    assert_eq!(first.expires(), Some(expires));
    platform
        .respond(
            &first,
            401,
            &[(
                "WWW-Authenticate",
                format!("Digest realm=\"4101050000\", nonce=\"{}\"", NONCE),
            )],
        )
        .await;

    let second = platform.next_request().await;
    assert_eq!(second.method, SipMethod::Register);
    assert_eq!(second.call_id(), first.call_id());
    assert_eq!(second.cseq().unwrap().0, first.cseq().unwrap().0 + 1);

    let auth = second.header("Authorization").expect("credentials expected");
    let expected = compute_digest_response(
        "admin",
        "4101050000",
        "admin",
        "REGISTER",
        digest_param(auth, "uri").unwrap(),
        NONCE,
        None,
    );
    assert_eq!(digest_param(auth, "username"), Some("admin"));
    assert_eq!(digest_param(auth, "response"), Some(expected.as_str()));

    platform
        .respond(&second, 200, &[("Expires", expires.to_string())])
        .await;

    first.call_id().unwrap_or_default().to_string()
}

async fn wait_registered(agent: &UserAgent) {
    let mut state = agent.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == RegistrationState::Registered),
    )
    .await
    .expect("registration should complete")
    .unwrap();
}

fn spawn_receiver(agent: &Arc<UserAgent>) -> tokio::task::JoinHandle<Result<()>> {
    let agent = agent.clone();
    tokio::spawn(async move { agent.handle_incoming_messages().await })
}

/// 应答注销后等待 shutdown 与接收循环结束
async fn stop(
    platform: &mut Platform,
    agent: &Arc<UserAgent>,
    receiver: tokio::task::JoinHandle<Result<()>>,
) {
    let stopping = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.shutdown().await })
    };
    let (unregister, _) = platform.next_register_silent().await;
    assert_eq!(unregister.expires(), Some(0));
    platform.respond(&unregister, 200, &[]).await;

    tokio::time::timeout(Duration::from_secs(3), stopping)
        .await
        .expect("shutdown should finish once unregister is answered")
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), receiver)
        .await
        .expect("receive loop should stop")
        .unwrap()
        .unwrap();
}

/// 建立 ON 设备的点播会话
async fn establish_session(platform: &mut Platform, call_id: &str) {
    let raw = request(
        "INVITE",
        ON_DEVICE,
        call_id,
        1,
        &format!("z9hG4bK{}", call_id),
        "application/sdp",
        &offer("0100000009"),
    );
    platform.send(raw.as_bytes()).await;
    let ok = platform.final_response(&mut Vec::new()).await;
    assert_eq!(ok.status_code, 200);

    let raw = request("ACK", ON_DEVICE, call_id, 1, &format!("z9hG4bKack{}", call_id), "", "");
    platform.send(raw.as_bytes()).await;
}

#[tokio::test]
async fn test_full_client_lifecycle() {
    init_tracing();
    let mut platform = Platform::bind().await;
    let media = Arc::new(RecordingMediaPlane::default());
    let agent = Arc::new(UserAgent::new(config(platform.addr()), media.clone()).unwrap());

    agent.start().await.unwrap();
    let receiver = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.handle_incoming_messages().await })
    };

    // 注册：挑战 -> 鉴权 -> 200
    register(&mut platform, 3600).await;
    wait_registered(&agent).await;

    // 注册成功后立即发送第一次心跳
    let keepalive = loop {
        match platform.recv().await {
            SipMessage::Request(req) if is_keepalive(&req) => break req,
            _ => {}
        }
    };
    assert!(keepalive
        .body
        .as_deref()
        .unwrap()
        .contains("<DeviceID>31011500991320000532</DeviceID>"));
    platform.respond(&keepalive, 200, &[]).await;

    // Catalog：先 200，再按配置顺序列出两个设备
    let query_call_id = platform.send_query("Catalog", "31011500991320000532").await;
    let ack = platform.final_response(&mut Vec::new()).await;
    assert_eq!(ack.status_code, 200);
    assert_eq!(ack.call_id(), Some(query_call_id.as_str()));

    let catalog = platform.next_request().await;
    assert_eq!(catalog.method, SipMethod::Message);
    let body = catalog.body.clone().unwrap();
    assert!(body.contains("<CmdType>Catalog</CmdType>"));
    assert!(body.contains("<SumNum>2</SumNum>"));
    let on_pos = body.find(ON_DEVICE).expect("ON device listed");
    let off_pos = body.find(OFF_DEVICE).expect("OFF device listed");
    assert!(on_pos < off_pos);
    platform.respond(&catalog, 200, &[]).await;

    // DeviceInfo：未知设备 404
    platform.send_query("DeviceInfo", UNKNOWN_DEVICE).await;
    let not_found = platform.final_response(&mut Vec::new()).await;
    assert_eq!(not_found.status_code, 404);

    // INVITE：OFF 设备被拒绝，不建会话
    let raw = request(
        "INVITE",
        OFF_DEVICE,
        "invite-off",
        1,
        "z9hG4bKinv1",
        "application/sdp",
        &offer("0100000001"),
    );
    platform.send(raw.as_bytes()).await;
    let refused = platform.final_response(&mut Vec::new()).await;
    assert_eq!(refused.status_code, 480);
    assert!(media.armed.lock().unwrap().is_empty());

    // INVITE：ON 设备 100 + 200(SDP)，一次 arm
    let raw = request(
        "INVITE",
        ON_DEVICE,
        "invite-on",
        1,
        "z9hG4bKinv2",
        "application/sdp",
        &offer("0100000002"),
    );
    platform.send(raw.as_bytes()).await;
    let mut provisional = Vec::new();
    let ok = platform.final_response(&mut provisional).await;
    assert_eq!(provisional, vec![100]);
    assert_eq!(ok.status_code, 200);
    assert!(ok.to_tag().is_some());

    let answer = SdpSession::parse(ok.body.as_deref().unwrap()).unwrap();
    assert_eq!(answer.ssrc.as_deref(), Some("0100000002"));
    assert_eq!(answer.video().unwrap().formats, vec![96]);
    assert_eq!(media.armed.lock().unwrap().as_slice(), [ON_DEVICE.to_string()]);

    let raw = request("ACK", ON_DEVICE, "invite-on", 1, "z9hG4bKack2", "", "");
    platform.send(raw.as_bytes()).await;

    // BYE 未知对话：481，无 disarm
    let raw = request("BYE", ON_DEVICE, "no-such-dialog", 2, "z9hG4bKbye0", "", "");
    platform.send(raw.as_bytes()).await;
    let missing = platform.final_response(&mut Vec::new()).await;
    assert_eq!(missing.status_code, 481);
    assert!(media.disarmed.lock().unwrap().is_empty());

    // BYE 活动会话：200，一次 disarm
    let raw = request("BYE", ON_DEVICE, "invite-on", 2, "z9hG4bKbye1", "", "");
    platform.send(raw.as_bytes()).await;
    let closed = platform.final_response(&mut Vec::new()).await;
    assert_eq!(closed.status_code, 200);
    assert_eq!(
        media.disarmed.lock().unwrap().as_slice(),
        ["invite-on".to_string()]
    );

    // 两次 shutdown 只发送一次注销
    let stopping = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.shutdown().await })
    };
    let unregister = platform.next_request().await;
    assert_eq!(unregister.method, SipMethod::Register);
    assert_eq!(unregister.expires(), Some(0));
    assert!(unregister.header("Authorization").is_some());
    platform.respond(&unregister, 200, &[]).await;

    // 注销响应经接收循环投递，无需等到超时
    tokio::time::timeout(Duration::from_secs(1), stopping)
        .await
        .expect("shutdown should not wait for the unregister timeout")
        .unwrap()
        .unwrap();
    agent.shutdown().await.unwrap();
    assert_eq!(agent.registration_state(), RegistrationState::Unregistered);

    let mut buf = [0u8; 2048];
    let extra =
        tokio::time::timeout(Duration::from_millis(300), platform.socket.recv_from(&mut buf)).await;
    assert!(extra.is_err(), "no traffic expected after shutdown");

    tokio::time::timeout(Duration::from_secs(2), receiver)
        .await
        .expect("receive loop should stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_unanswered_registration_retries() {
    init_tracing();
    let mut platform = Platform::bind().await;
    let mut cfg = config(platform.addr());
    cfg.register_retry = 1;
    cfg.transaction_timeout_ms = 600;
    let agent = Arc::new(UserAgent::new(cfg, Arc::new(RecordingMediaPlane::default())).unwrap());

    agent.start().await.unwrap();
    let receiver = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.handle_incoming_messages().await })
    };

    // 首个 REGISTER 不回应，超时后以新 branch 重发
    let first = platform.next_request().await;
    let mut retry = platform.next_request().await;
    while retry.via_branch() == first.via_branch() {
        retry = platform.next_request().await;
    }
    assert_eq!(retry.method, SipMethod::Register);
    assert_eq!(retry.call_id(), first.call_id());
    assert_ne!(agent.registration_state(), RegistrationState::Registered);

    // 停止过程中到达的 200 不再推进状态机
    let mut state = agent.subscribe_state();
    let stopping = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.shutdown().await })
    };
    state
        .wait_for(|s| *s == RegistrationState::Unregistered)
        .await
        .unwrap();
    platform
        .respond(&retry, 200, &[("Expires", "3600".to_string())])
        .await;
    stopping.await.unwrap().unwrap();
    assert_eq!(agent.registration_state(), RegistrationState::Unregistered);

    tokio::time::timeout(Duration::from_secs(2), receiver)
        .await
        .expect("receive loop should stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_keepalive_loss_triggers_fresh_registration() {
    init_tracing();
    let mut platform = Platform::bind().await;
    let mut cfg = config(platform.addr());
    cfg.keepalive_interval = 1;
    cfg.max_keepalive_retry = 2;
    cfg.transaction_timeout_ms = 500;
    let agent = Arc::new(UserAgent::new(cfg, Arc::new(RecordingMediaPlane::default())).unwrap());

    agent.start().await.unwrap();
    let receiver = spawn_receiver(&agent);

    let call_id = register(&mut platform, 3600).await;
    wait_registered(&agent).await;

    // 心跳全部不回应，达到阈值后重新发起不带凭证的注册
    let (fresh, ignored) = platform.next_register_silent().await;
    assert!(ignored >= 2, "expected unanswered keepalives, got {}", ignored);
    assert_eq!(fresh.call_id(), Some(call_id.as_str()));
    assert!(fresh.header("Authorization").is_none());
    assert_eq!(fresh.expires(), Some(3600));
    assert_eq!(agent.registration_state(), RegistrationState::Registering);

    platform
        .respond(&fresh, 200, &[("Expires", "3600".to_string())])
        .await;
    wait_registered(&agent).await;

    stop(&mut platform, &agent, receiver).await;
}

#[tokio::test]
async fn test_registration_cycles_exhausted() {
    init_tracing();
    let mut platform = Platform::bind().await;
    let mut cfg = config(platform.addr());
    cfg.max_register_cycles = 1;
    let agent = Arc::new(UserAgent::new(cfg, Arc::new(RecordingMediaPlane::default())).unwrap());

    agent.start().await.unwrap();
    let receiver = spawn_receiver(&agent);

    let first = platform.next_request().await;
    assert_eq!(first.method, SipMethod::Register);
    platform.respond(&first, 403, &[]).await;

    let result = tokio::time::timeout(Duration::from_secs(3), receiver)
        .await
        .expect("receive loop should report exhaustion")
        .unwrap();
    assert!(matches!(result, Err(GbError::RegistrationExhausted(1))));
    assert_eq!(agent.registration_state(), RegistrationState::Failed);

    // 未注册，不发送注销
    agent.shutdown().await.unwrap();
    let mut buf = [0u8; 2048];
    let extra =
        tokio::time::timeout(Duration::from_millis(300), platform.socket.recv_from(&mut buf)).await;
    assert!(extra.is_err(), "no unregister expected after a failed cycle");
}

#[tokio::test]
async fn test_failed_cycle_backs_off_and_restarts() {
    init_tracing();
    let mut platform = Platform::bind().await;
    let mut cfg = config(platform.addr());
    cfg.register_backoff = 1;
    let agent = Arc::new(UserAgent::new(cfg, Arc::new(RecordingMediaPlane::default())).unwrap());

    agent.start().await.unwrap();
    let receiver = spawn_receiver(&agent);

    let first = platform.next_request().await;
    platform.respond(&first, 403, &[]).await;

    let mut state = agent.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == RegistrationState::Failed),
    )
    .await
    .expect("rejected cycle should fail")
    .unwrap();

    // 退避结束后从头注册
    let started = tokio::time::Instant::now();
    let restart = platform.next_request().await;
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(restart.method, SipMethod::Register);
    assert_eq!(restart.call_id(), first.call_id());
    assert!(restart.header("Authorization").is_none());
    assert!(restart.cseq().unwrap().0 > first.cseq().unwrap().0);

    platform
        .respond(&restart, 200, &[("Expires", "3600".to_string())])
        .await;
    wait_registered(&agent).await;

    stop(&mut platform, &agent, receiver).await;
}

#[tokio::test]
async fn test_refresh_rechallenge_keeps_session() {
    init_tracing();
    let mut platform = Platform::bind().await;
    let mut cfg = config(platform.addr());
    cfg.reg_expire = 3;
    let media = Arc::new(RecordingMediaPlane::default());
    let agent = Arc::new(UserAgent::new(cfg, media.clone()).unwrap());

    agent.start().await.unwrap();
    let receiver = spawn_receiver(&agent);

    let call_id = register(&mut platform, 3).await;
    wait_registered(&agent).await;
    establish_session(&mut platform, "live-1").await;

    // 80% 处刷新，平台换 nonce 再次挑战
    let refresh = platform.next_request().await;
    assert_eq!(refresh.method, SipMethod::Register);
    assert_eq!(refresh.call_id(), Some(call_id.as_str()));
    assert!(refresh.header("Authorization").is_some());
    platform
        .respond(
            &refresh,
            401,
            &[(
                "WWW-Authenticate",
                "Digest realm=\"4101050000\", nonce=\"a1b2c3\"".to_string(),
            )],
        )
        .await;

    let retry = platform.next_request().await;
    let auth = retry.header("Authorization").expect("credentials expected");
    assert_eq!(digest_param(auth, "nonce"), Some("a1b2c3"));
    assert!(media.disarmed.lock().unwrap().is_empty());
    platform
        .respond(&retry, 200, &[("Expires", "3600".to_string())])
        .await;
    wait_registered(&agent).await;

    // 会话仍在：BYE 得到 200 而不是 481
    let raw = request("BYE", ON_DEVICE, "live-1", 2, "z9hG4bKbyelive", "", "");
    platform.send(raw.as_bytes()).await;
    let closed = platform.final_response(&mut Vec::new()).await;
    assert_eq!(closed.status_code, 200);
    assert_eq!(media.disarmed.lock().unwrap().as_slice(), ["live-1".to_string()]);

    stop(&mut platform, &agent, receiver).await;
}

#[tokio::test]
async fn test_rejected_refresh_reregisters_without_credentials() {
    init_tracing();
    let mut platform = Platform::bind().await;
    let mut cfg = config(platform.addr());
    cfg.reg_expire = 3;
    let agent = Arc::new(UserAgent::new(cfg, Arc::new(RecordingMediaPlane::default())).unwrap());

    agent.start().await.unwrap();
    let receiver = spawn_receiver(&agent);

    let call_id = register(&mut platform, 3).await;
    wait_registered(&agent).await;

    let refresh = platform.next_request().await;
    assert!(refresh.header("Authorization").is_some());
    platform.respond(&refresh, 403, &[]).await;

    // 刷新失败不退避，立即重新注册
    let fresh = platform.next_request().await;
    assert_eq!(fresh.method, SipMethod::Register);
    assert_eq!(fresh.call_id(), Some(call_id.as_str()));
    assert!(fresh.header("Authorization").is_none());
    platform
        .respond(&fresh, 200, &[("Expires", "3600".to_string())])
        .await;
    wait_registered(&agent).await;

    stop(&mut platform, &agent, receiver).await;
}
