// 入向消息分发
// 响应交给客户端事务表；请求按方法/命令分类后在独立任务中处理

use crate::identity::ClientIdentity;
use crate::manscdp::{self, DeviceInfoReply, ManscdpMessage, QueryCommand, RootKind};
use crate::registry::{DeviceRecord, DeviceRegistry, DeviceStatus};
use crate::session::SessionManager;
use crate::sip::message::{generate_tag, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
use crate::sip::transaction::ClientTransactions;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// 入向事件（封闭集合）
#[derive(Debug)]
pub enum InboundEvent {
    Response(SipResponse),
    Query(SipRequest, ManscdpMessage),
    Invite(SipRequest),
    Ack(SipRequest),
    Bye(SipRequest),
    Cancel(SipRequest),
    Options(SipRequest),
    Unsupported(SipRequest),
    /// 无法解析；能解析出请求行时带上请求以便回 400
    Malformed {
        request: Option<SipRequest>,
        reason: String,
    },
}

impl InboundEvent {
    pub fn classify(data: &[u8]) -> Self {
        let message = match SipMessage::parse(data) {
            Ok(message) => message,
            Err(e) => {
                return InboundEvent::Malformed {
                    request: None,
                    reason: e.to_string(),
                }
            }
        };

        let req = match message {
            SipMessage::Response(resp) => return InboundEvent::Response(resp),
            SipMessage::Request(req) => req,
        };

        match req.method {
            SipMethod::Message => {
                let parsed = req
                    .body
                    .as_deref()
                    .ok_or_else(|| crate::GbError::Protocol("MESSAGE without body".to_string()))
                    .and_then(ManscdpMessage::parse);
                match parsed {
                    Ok(msg) => InboundEvent::Query(req, msg),
                    Err(e) => InboundEvent::Malformed {
                        request: Some(req),
                        reason: e.to_string(),
                    },
                }
            }
            SipMethod::Invite => InboundEvent::Invite(req),
            SipMethod::Ack => InboundEvent::Ack(req),
            SipMethod::Bye => InboundEvent::Bye(req),
            SipMethod::Cancel => InboundEvent::Cancel(req),
            SipMethod::Options => InboundEvent::Options(req),
            _ => InboundEvent::Unsupported(req),
        }
    }
}

/// 入向分发器
pub struct Dispatcher {
    identity: Arc<ClientIdentity>,
    registry: Arc<DeviceRegistry>,
    transactions: Arc<ClientTransactions>,
    sessions: Arc<SessionManager>,
    catalog_page_size: usize,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        identity: Arc<ClientIdentity>,
        registry: Arc<DeviceRegistry>,
        transactions: Arc<ClientTransactions>,
        sessions: Arc<SessionManager>,
        catalog_page_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            registry,
            transactions,
            sessions,
            catalog_page_size,
            cancel,
        }
    }

    /// 接收循环调用：响应同步投递，请求派生任务处理，从不阻塞
    pub fn dispatch(self: &Arc<Self>, data: Bytes, source: SocketAddr) {
        match InboundEvent::classify(&data) {
            InboundEvent::Response(resp) => {
                let status = resp.status_code;
                if !self.transactions.on_response(resp) {
                    tracing::debug!(
                        target: "gb28181::sip",
                        remote = %source,
                        status,
                        "Response without matching transaction"
                    );
                }
            }
            InboundEvent::Malformed {
                request: None,
                reason,
            } => {
                // 纯 CRLF 保活也会落到这里
                tracing::debug!(target: "gb28181::sip", remote = %source, %reason, "Dropping malformed message");
            }
            event => {
                let span = tracing::info_span!(
                    "gb28181.sip.handle_request",
                    remote = %source,
                    bytes = data.len()
                );
                let dispatcher = self.clone();
                tokio::spawn(
                    async move {
                        dispatcher.handle(event, source).await;
                    }
                    .instrument(span),
                );
            }
        }
    }

    pub async fn handle(&self, event: InboundEvent, source: SocketAddr) {
        match event {
            InboundEvent::Response(resp) => {
                self.transactions.on_response(resp);
            }
            InboundEvent::Query(req, msg) => self.handle_query(req, msg, source).await,
            InboundEvent::Invite(req) => {
                tracing::info!(target: "gb28181::sip", call_id = req.call_id().unwrap_or("-"), "Handling INVITE");
                for resp in self.sessions.handle_invite(&req).await {
                    self.reply(resp, source).await;
                }
            }
            InboundEvent::Ack(req) => {
                self.sessions.handle_ack(&req).await;
            }
            InboundEvent::Bye(req) => {
                tracing::info!(target: "gb28181::sip", call_id = req.call_id().unwrap_or("-"), "Handling BYE");
                let resp = self.sessions.handle_bye(&req).await;
                self.reply(resp, source).await;
            }
            InboundEvent::Cancel(req) => {
                let resp = self.sessions.handle_cancel(&req).await;
                self.reply(resp, source).await;
            }
            InboundEvent::Options(req) => {
                self.reply(respond(&req, 200), source).await;
            }
            InboundEvent::Unsupported(req) => {
                tracing::warn!(target: "gb28181::sip", method = %req.method, "Unsupported SIP method");
                self.reply(respond(&req, 501), source).await;
            }
            InboundEvent::Malformed {
                request: Some(req),
                reason,
            } => {
                tracing::warn!(target: "gb28181::sip", %reason, "Malformed MESSAGE body");
                self.reply(respond(&req, 400), source).await;
            }
            InboundEvent::Malformed { request: None, .. } => {}
        }
    }

    async fn handle_query(&self, req: SipRequest, msg: ManscdpMessage, source: SocketAddr) {
        let sn = msg.body.sn;
        let target = msg.body.device_id.as_str();

        tracing::debug!(
            target: "gb28181::sip",
            cmd_type = %msg.body.cmd_type,
            sn,
            device_id = %target,
            "Handling MANSCDP query"
        );

        if msg.kind != RootKind::Query {
            self.reply(respond(&req, 501), source).await;
            return;
        }

        let command = msg.command();
        if let QueryCommand::Other(cmd) = &command {
            tracing::warn!(target: "gb28181::sip", cmd_type = %cmd, "Unsupported query");
            self.reply(respond(&req, 501), source).await;
            return;
        }

        // 目标为本端编码或某个通道
        let is_self = target == self.identity.gb_id;
        let device = if is_self {
            None
        } else {
            match self.registry.get(target).await {
                Ok(device) => Some(device),
                Err(_) => {
                    tracing::warn!(target: "gb28181::sip", device_id = %target, "Query for unknown device");
                    self.reply(respond(&req, 404), source).await;
                    return;
                }
            }
        };

        self.reply(respond(&req, 200), source).await;

        let bodies = match command {
            QueryCommand::Catalog => {
                let devices = self.registry.list().await;
                manscdp::catalog_responses(sn, &self.identity.gb_id, &devices, self.catalog_page_size)
            }
            QueryCommand::DeviceInfo => vec![self.device_info(sn, device.as_ref())],
            QueryCommand::DeviceStatus => {
                let status = device.as_ref().map(|d| d.status).unwrap_or(DeviceStatus::On);
                vec![manscdp::device_status_response(sn, target, status)]
            }
            QueryCommand::RecordInfo => {
                let name = device.as_ref().map(|d| d.name.as_str()).unwrap_or(target);
                vec![manscdp::record_info_response(sn, target, name)]
            }
            QueryCommand::Other(_) => Vec::new(),
        };

        for body in bodies {
            self.send_manscdp(body, source).await;
        }
    }

    fn device_info(&self, sn: u32, device: Option<&DeviceRecord>) -> String {
        let firmware = env!("CARGO_PKG_VERSION");
        let reply = match device {
            Some(d) => DeviceInfoReply {
                device_id: &d.device_id,
                device_name: &d.name,
                manufacturer: &d.manufacturer,
                model: &d.model,
                firmware,
                channel: None,
            },
            None => DeviceInfoReply {
                device_id: &self.identity.gb_id,
                device_name: &self.identity.gb_id,
                manufacturer: "flux",
                model: "gbclient",
                firmware,
                channel: Some(self.registry.len()),
            },
        };
        manscdp::device_info_response(sn, &reply)
    }

    /// 作为新 MESSAGE 发给查询来源地址，等待平台确认
    async fn send_manscdp(&self, body: String, destination: SocketAddr) {
        let req = self
            .identity
            .manscdp_message(&self.identity.server_uri(), body);

        match self
            .transactions
            .send_request(&req, destination, &self.cancel)
            .await
        {
            Ok(resp) if resp.is_success() => {}
            Ok(resp) => {
                tracing::warn!(target: "gb28181::sip", status = resp.status_code, "MANSCDP response rejected");
            }
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", error = %e, "MANSCDP response not delivered");
            }
        }
    }

    async fn reply(&self, resp: SipResponse, destination: SocketAddr) {
        let status = resp.status_code;
        if let Err(e) = self
            .transactions
            .transport()
            .send_to(&resp.to_bytes(), destination)
            .await
        {
            tracing::warn!(target: "gb28181::sip", remote = %destination, status, error = %e, "Failed to send response");
        }
    }
}

fn respond(req: &SipRequest, code: u16) -> SipResponse {
    SipResponse::for_request(req, code).with_to_tag(&generate_tag())
}
