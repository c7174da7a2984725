// GB28181 点播会话管理
// 每个对话（Call-ID）至多一个会话；负责 INVITE/ACK/BYE/CANCEL 与媒体面 arm/disarm

use crate::identity::ClientIdentity;
use crate::media::{MediaPlane, SessionParams};
use crate::registration::RegistrationState;
use crate::registry::DeviceRegistry;
use crate::sip::message::{generate_tag, uri_user, SipHeaders, SipRequest, SipResponse};
use crate::sip::sdp::SdpSession;
use crate::sip::SDP_CONTENT_TYPE;
use crate::GbError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Invited,
    Active,
    Terminating,
    Closed,
}

/// 点播会话
#[derive(Debug, Clone)]
pub struct Session {
    pub call_id: String,
    pub device_id: String,
    pub params: SessionParams,
    pub state: SessionState,
    pub acked: bool,
    pub local_tag: String,
    /// 最近一次 INVITE 的 CSeq，用于识别重传
    invite_cseq: u32,
    answer: String,
    ack_timer: CancellationToken,
}

type SessionMap = Arc<RwLock<HashMap<String, Session>>>;

/// 会话管理器
pub struct SessionManager {
    identity: Arc<ClientIdentity>,
    registry: Arc<DeviceRegistry>,
    media: Arc<dyn MediaPlane>,
    registration: watch::Receiver<RegistrationState>,
    sessions: SessionMap,
    ack_timeout: Duration,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        identity: Arc<ClientIdentity>,
        registry: Arc<DeviceRegistry>,
        media: Arc<dyn MediaPlane>,
        registration: watch::Receiver<RegistrationState>,
        ack_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            registry,
            media,
            registration,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ack_timeout,
            cancel,
        }
    }

    /// 处理 INVITE，返回按顺序发送的响应
    pub async fn handle_invite(&self, req: &SipRequest) -> Vec<SipResponse> {
        let Some(call_id) = req.call_id().map(str::to_string) else {
            return vec![reject(req, 400)];
        };
        let Some(device_id) = uri_user(&req.uri)
            .or_else(|| req.header("To").and_then(uri_user))
            .map(str::to_string)
        else {
            return vec![reject(req, 400)];
        };
        let cseq = req.cseq().map(|(seq, _)| seq).unwrap_or(0);

        let mut sessions = self.sessions.write().await;

        if let Some(session) = sessions.get_mut(&call_id) {
            return self.handle_reinvite(req, session, cseq).await;
        }

        let device = match self.registry.get(&device_id).await {
            Ok(device) => device,
            Err(_) => {
                tracing::warn!(target: "gb28181::session", %device_id, %call_id, "INVITE for unknown device");
                return vec![reject(req, 404)];
            }
        };

        let state = *self.registration.borrow();
        if !state.is_registered() {
            tracing::warn!(target: "gb28181::session", %device_id, %state, "INVITE while not registered");
            return vec![reject(req, 503)];
        }

        if !device.status.is_on() {
            tracing::info!(target: "gb28181::session", %device_id, "INVITE refused, device is OFF");
            return vec![reject(req, 480)];
        }

        let Some((params, answer)) = self.negotiate(req, &call_id, &device_id) else {
            return vec![reject(req, 488)];
        };

        let local_tag = generate_tag();
        let ack_timer = self.cancel.child_token();
        let mut session = Session {
            call_id: call_id.clone(),
            device_id: device_id.clone(),
            params,
            state: SessionState::Invited,
            acked: false,
            local_tag,
            invite_cseq: cseq,
            answer,
            ack_timer,
        };

        if let Err(e) = self.media.arm_stream(&device_id, &session.params).await {
            tracing::error!(target: "gb28181::session", %device_id, %call_id, error = %e, "Media arm failed");
            return vec![reject(req, 500)];
        }
        session.state = SessionState::Active;

        tracing::info!(
            target: "gb28181::session",
            %device_id,
            %call_id,
            remote = %format!("{}:{}", session.params.remote_ip, session.params.remote_port),
            "Session active"
        );

        let responses = vec![
            SipResponse::for_request(req, 100),
            self.ok_with_answer(req, &session),
        ];

        self.spawn_ack_timer(&session);
        sessions.insert(call_id, session);

        responses
    }

    async fn handle_reinvite(
        &self,
        req: &SipRequest,
        session: &mut Session,
        cseq: u32,
    ) -> Vec<SipResponse> {
        // 重传的 INVITE：重发同一应答
        if cseq != 0 && cseq == session.invite_cseq {
            return vec![self.ok_with_answer(req, session)];
        }

        let Some((params, answer)) = self.negotiate(req, &session.call_id, &session.device_id)
        else {
            return vec![reject(req, 488)];
        };

        if !session.params.same_destination(&params) {
            tracing::info!(
                target: "gb28181::session",
                call_id = %session.call_id,
                "Media destination changed, re-arming"
            );
            if let Err(e) = self.media.disarm_stream(&session.call_id).await {
                tracing::warn!(target: "gb28181::session", error = %e, "Media disarm failed");
            }
            if let Err(e) = self.media.arm_stream(&session.device_id, &params).await {
                tracing::error!(target: "gb28181::session", error = %e, "Media re-arm failed");
                return vec![reject(req, 500)];
            }
        }

        session.params = params;
        session.answer = answer;
        session.invite_cseq = cseq;

        vec![self.ok_with_answer(req, session)]
    }

    /// 解析 offer 并生成应答 SDP
    fn negotiate(
        &self,
        req: &SipRequest,
        call_id: &str,
        device_id: &str,
    ) -> Option<(SessionParams, String)> {
        let result = req
            .body
            .as_deref()
            .ok_or_else(|| GbError::Protocol("INVITE without SDP offer".to_string()))
            .and_then(SdpSession::parse)
            .and_then(|offer| {
                let params =
                    SessionParams::from_offer(call_id, device_id, &offer, self.identity.media_port)?;
                let answer = SdpSession::answer(
                    &offer,
                    device_id,
                    &self.identity.local_ip,
                    self.identity.media_port,
                )?;
                Ok((params, answer.to_string()))
            });

        match result {
            Ok(negotiated) => Some(negotiated),
            Err(e) => {
                tracing::warn!(target: "gb28181::session", %call_id, error = %e, "Unacceptable offer");
                None
            }
        }
    }

    fn ok_with_answer(&self, req: &SipRequest, session: &Session) -> SipResponse {
        let mut resp = SipResponse::for_request(req, 200).with_to_tag(&session.local_tag);
        resp.add_header(
            "Contact",
            format!(
                "<sip:{}@{}:{}>",
                session.device_id, self.identity.local_ip, self.identity.local_port
            ),
        );
        resp.add_header("User-Agent", self.identity.user_agent.clone());
        resp.set_body(SDP_CONTENT_TYPE, session.answer.clone());
        resp
    }

    fn spawn_ack_timer(&self, session: &Session) {
        let sessions = self.sessions.clone();
        let media = self.media.clone();
        let timer = session.ack_timer.clone();
        let call_id = session.call_id.clone();
        let timeout = self.ack_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }

            let expired = {
                let mut map = sessions.write().await;
                match map.get(&call_id) {
                    Some(s) if !s.acked && !timer.is_cancelled() => map.remove(&call_id),
                    _ => None,
                }
            };

            if let Some(session) = expired {
                tracing::warn!(target: "gb28181::session", %call_id, "ACK not received, closing session");
                teardown(media.as_ref(), session).await;
            }
        });
    }

    pub async fn handle_ack(&self, req: &SipRequest) -> bool {
        let Some(call_id) = req.call_id() else {
            return false;
        };

        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(call_id) {
            Some(session) => {
                session.acked = true;
                session.ack_timer.cancel();
                tracing::debug!(target: "gb28181::session", %call_id, "Session acknowledged");
                true
            }
            None => {
                tracing::debug!(target: "gb28181::session", %call_id, "ACK for unknown dialog");
                false
            }
        }
    }

    pub async fn handle_bye(&self, req: &SipRequest) -> SipResponse {
        let removed = match req.call_id() {
            Some(call_id) => self.sessions.write().await.remove(call_id),
            None => None,
        };

        match removed {
            Some(session) => {
                let tag = session.local_tag.clone();
                teardown(self.media.as_ref(), session).await;
                SipResponse::for_request(req, 200).with_to_tag(&tag)
            }
            None => {
                tracing::debug!(
                    target: "gb28181::session",
                    call_id = req.call_id().unwrap_or("-"),
                    "BYE for unknown dialog"
                );
                reject(req, 481)
            }
        }
    }

    /// CANCEL：未确认的会话被关闭；已确认的会话不受影响
    pub async fn handle_cancel(&self, req: &SipRequest) -> SipResponse {
        let Some(call_id) = req.call_id() else {
            return reject(req, 481);
        };

        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(call_id) {
                None => return reject(req, 481),
                Some(session) if session.acked => None,
                Some(_) => sessions.remove(call_id),
            }
        };

        if let Some(session) = removed {
            tracing::info!(target: "gb28181::session", %call_id, "Session cancelled before ACK");
            teardown(self.media.as_ref(), session).await;
        }

        SipResponse::for_request(req, 200)
    }

    /// 关闭全部会话（注销、注册丢失）
    pub async fn close_all(&self) {
        let drained: Vec<Session> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();

        if !drained.is_empty() {
            tracing::info!(target: "gb28181::session", count = drained.len(), "Closing all sessions");
        }

        for session in drained {
            teardown(self.media.as_ref(), session).await;
        }
    }

    pub async fn get(&self, call_id: &str) -> Option<Session> {
        self.sessions.read().await.get(call_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// Terminating -> disarm -> Closed
async fn teardown(media: &dyn MediaPlane, mut session: Session) {
    session.state = SessionState::Terminating;
    session.ack_timer.cancel();

    if let Err(e) = media.disarm_stream(&session.call_id).await {
        tracing::warn!(
            target: "gb28181::session",
            call_id = %session.call_id,
            error = %e,
            "Media disarm failed"
        );
    }

    session.state = SessionState::Closed;
    tracing::info!(
        target: "gb28181::session",
        call_id = %session.call_id,
        device_id = %session.device_id,
        "Session closed"
    );
}

fn reject(req: &SipRequest, code: u16) -> SipResponse {
    SipResponse::for_request(req, code).with_to_tag(&generate_tag())
}
