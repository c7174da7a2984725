// GB28181 注册状态机
// 纯状态机（Registration）只生成请求、消化响应；驱动任务（RegistrationDriver）负责 I/O 与定时

use crate::error::{GbError, Result};
use crate::identity::ClientIdentity;
use crate::keepalive::KeepaliveScheduler;
use crate::session::SessionManager;
use crate::sip::auth::{ChallengeKind, DigestChallenge};
use crate::sip::message::{
    generate_call_id, generate_tag, header_param, SipHeaders, SipMethod, SipRequest, SipResponse,
};
use crate::sip::transaction::ClientTransactions;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Challenged,
    Registered,
    /// 已到刷新点，刷新 REGISTER 在途
    Expiring,
    Failed,
}

impl RegistrationState {
    /// 是否处于可提供服务的注册态
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::Registered | RegistrationState::Expiring)
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Challenged => "challenged",
            RegistrationState::Registered => "registered",
            RegistrationState::Expiring => "expiring",
            RegistrationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 一次响应处理的结果
#[derive(Debug)]
pub struct Transition {
    pub state: RegistrationState,
    /// 需要继续发送的 REGISTER（鉴权、423 调整）
    pub resend: Option<SipRequest>,
    /// 进入 Registered 时生效的有效期（秒）
    pub expires: Option<u32>,
    /// 进入 Failed 的原因
    pub failure: Option<GbError>,
}

impl Transition {
    fn stay(state: RegistrationState, resend: Option<SipRequest>) -> Self {
        Self {
            state,
            resend,
            expires: None,
            failure: None,
        }
    }
}

/// 注册状态机
pub struct Registration {
    identity: Arc<ClientIdentity>,
    requested_expires: u32,
    state: RegistrationState,
    call_id: String,
    from_tag: String,
    cseq: u32,

    /// 最近一次发出的 REGISTER
    last_cseq: Option<u32>,
    last_expires: u32,
    last_had_credentials: bool,

    challenge: Option<DigestChallenge>,
    nonce_count: u32,
    consecutive_rejects: u32,

    granted_expires: Option<u32>,
    deadline: Option<Instant>,
}

impl Registration {
    pub fn new(identity: Arc<ClientIdentity>, requested_expires: u32) -> Self {
        let call_id = generate_call_id(&identity.local_ip);
        Self {
            identity,
            requested_expires,
            state: RegistrationState::Unregistered,
            call_id,
            from_tag: generate_tag(),
            cseq: 0,
            last_cseq: None,
            last_expires: requested_expires,
            last_had_credentials: false,
            challenge: None,
            nonce_count: 0,
            consecutive_rejects: 0,
            granted_expires: None,
            deadline: None,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn granted_expires(&self) -> Option<u32> {
        self.granted_expires
    }

    /// 注册到期时间
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 刷新点：有效期的 80%
    pub fn refresh_delay(&self) -> Option<Duration> {
        self.granted_expires
            .map(|secs| Duration::from_millis(u64::from(secs) * 800))
    }

    /// Unregistered -> Registering，返回不带凭证的首个 REGISTER
    pub fn start(&mut self) -> Result<SipRequest> {
        if self.state != RegistrationState::Unregistered {
            return Err(GbError::Protocol(format!(
                "cannot start registration in state {}",
                self.state
            )));
        }

        self.challenge = None;
        self.consecutive_rejects = 0;
        self.state = RegistrationState::Registering;
        Ok(self.build_register(self.requested_expires))
    }

    /// Registered -> Expiring，使用缓存凭证刷新
    pub fn refresh(&mut self) -> Result<SipRequest> {
        if self.state != RegistrationState::Registered {
            return Err(GbError::Protocol(format!(
                "cannot refresh registration in state {}",
                self.state
            )));
        }

        self.state = RegistrationState::Expiring;
        Ok(self.build_register(self.requested_expires))
    }

    /// 心跳失败触发：任意状态 -> Registering，不带凭证，沿用 Call-ID
    pub fn force_reregister(&mut self) -> SipRequest {
        self.challenge = None;
        self.consecutive_rejects = 0;
        self.granted_expires = None;
        self.deadline = None;
        self.state = RegistrationState::Registering;
        self.build_register(self.requested_expires)
    }

    /// 同一 REGISTER 的传输层重试：新事务（CSeq + 1），其余不变
    pub fn retry_request(&mut self) -> SipRequest {
        self.build_register(self.last_expires)
    }

    /// 重试耗尽
    pub fn transport_failed(&mut self) {
        self.state = RegistrationState::Failed;
        self.granted_expires = None;
        self.deadline = None;
    }

    /// 退避结束后回到初始状态
    pub fn reset(&mut self) {
        self.state = RegistrationState::Unregistered;
        self.challenge = None;
        self.consecutive_rejects = 0;
        self.granted_expires = None;
        self.deadline = None;
    }

    /// 注销：已注册时返回 `Expires: 0` 的 REGISTER；无论如何立即进入 Unregistered
    pub fn unregister(&mut self) -> Option<SipRequest> {
        let request = if self.state.is_registered() {
            Some(self.build_register(0))
        } else {
            None
        };

        self.state = RegistrationState::Unregistered;
        self.granted_expires = None;
        self.deadline = None;
        request
    }

    pub fn handle_response(&mut self, resp: &SipResponse) -> Result<Transition> {
        self.check_correlation(resp)?;

        if !matches!(
            self.state,
            RegistrationState::Registering
                | RegistrationState::Challenged
                | RegistrationState::Expiring
        ) {
            return Err(GbError::Protocol(format!(
                "unexpected REGISTER response in state {}",
                self.state
            )));
        }

        if resp.is_provisional() {
            return Ok(Transition::stay(self.state, None));
        }

        if resp.is_success() {
            let expires = self.effective_expires(resp);
            self.state = RegistrationState::Registered;
            self.consecutive_rejects = 0;
            self.granted_expires = Some(expires);
            self.deadline = Some(Instant::now() + Duration::from_secs(u64::from(expires)));
            return Ok(Transition {
                state: self.state,
                resend: None,
                expires: Some(expires),
                failure: None,
            });
        }

        if let Some(kind) = ChallengeKind::from_status(resp.status_code) {
            return Ok(self.on_challenge(kind, resp));
        }

        if resp.status_code == 423 {
            let min_expires = resp
                .header("Min-Expires")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|v| *v > 0);

            return Ok(match min_expires {
                Some(min) => {
                    self.requested_expires = self.requested_expires.max(min);
                    let resend = self.build_register(self.requested_expires);
                    Transition::stay(self.state, Some(resend))
                }
                None => self.fail(GbError::Protocol(
                    "423 without Min-Expires".to_string(),
                )),
            });
        }

        Ok(self.fail(GbError::Protocol(format!(
            "registration rejected: {} {}",
            resp.status_code, resp.reason_phrase
        ))))
    }

    fn on_challenge(&mut self, kind: ChallengeKind, resp: &SipResponse) -> Transition {
        let challenge = match resp
            .header(kind.challenge_header())
            .ok_or_else(|| {
                GbError::Protocol(format!("{} without {}", resp.status_code, kind.challenge_header()))
            })
            .and_then(|value| DigestChallenge::parse(kind, value))
        {
            Ok(challenge) => challenge,
            Err(e) => return self.fail(e),
        };

        if self.last_had_credentials && !challenge.stale {
            self.consecutive_rejects += 1;
            if self.consecutive_rejects >= 2 {
                return self.fail(GbError::AuthChallenge(format!(
                    "credentials for {} rejected by realm {}",
                    self.identity.username, challenge.realm
                )));
            }
        }

        self.challenge = Some(challenge);
        self.nonce_count = 0;
        self.state = RegistrationState::Challenged;

        let resend = self.build_register(self.last_expires);
        Transition::stay(self.state, Some(resend))
    }

    fn fail(&mut self, err: GbError) -> Transition {
        self.state = RegistrationState::Failed;
        self.granted_expires = None;
        self.deadline = None;
        Transition {
            state: self.state,
            resend: None,
            expires: None,
            failure: Some(err),
        }
    }

    fn check_correlation(&self, resp: &SipResponse) -> Result<()> {
        if resp.call_id() != Some(self.call_id.as_str()) {
            return Err(GbError::Protocol(format!(
                "stale REGISTER response: Call-ID {:?}",
                resp.call_id()
            )));
        }

        match (resp.cseq(), self.last_cseq) {
            (Some((seq, SipMethod::Register)), Some(last)) if seq == last => Ok(()),
            (cseq, _) => Err(GbError::Protocol(format!(
                "stale REGISTER response: CSeq {:?}",
                cseq
            ))),
        }
    }

    /// min(请求值, 平台授予值)；平台未给或给 0 时取请求值
    fn effective_expires(&self, resp: &SipResponse) -> u32 {
        let granted = resp.expires().or_else(|| {
            resp.header("Contact")
                .and_then(|c| header_param(c, "expires"))
                .and_then(|v| v.parse().ok())
        });

        match granted {
            Some(0) | None => self.last_expires.max(1),
            Some(granted) => granted.min(self.last_expires.max(1)),
        }
    }

    fn build_register(&mut self, expires: u32) -> SipRequest {
        self.cseq += 1;
        self.last_cseq = Some(self.cseq);
        self.last_expires = expires;

        let identity = self.identity.clone();
        let request_uri = format!("sip:{}@{}", identity.server_id, identity.realm);
        let local_uri = identity.local_uri();

        let mut req = identity.new_request(
            SipMethod::Register,
            &request_uri,
            &local_uri,
            &self.call_id,
            self.cseq,
            &self.from_tag,
        );
        req.add_header("Contact", identity.contact());
        req.add_header("Expires", expires.to_string());

        self.last_had_credentials = false;
        if let Some(challenge) = &self.challenge {
            self.nonce_count += 1;
            let value = challenge.authorization(
                &identity.username,
                &identity.password,
                "REGISTER",
                &request_uri,
                self.nonce_count,
            );
            req.add_header(challenge.kind.credentials_header(), value);
            self.last_had_credentials = true;
        }

        req
    }
}

/// 状态机的共享句柄：串行化访问并通过 watch 发布状态
pub struct RegistrationHandle {
    machine: Mutex<Registration>,
    state_tx: watch::Sender<RegistrationState>,
}

impl RegistrationHandle {
    pub fn new(machine: Registration) -> Self {
        let (state_tx, _) = watch::channel(machine.state());
        Self {
            machine: Mutex::new(machine),
            state_tx,
        }
    }

    pub fn state(&self) -> RegistrationState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state_tx.subscribe()
    }

    /// 在锁内修改状态机，返回 (旧状态, 新状态, 结果)
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut Registration) -> R,
    ) -> (RegistrationState, RegistrationState, R) {
        let mut machine = self.machine.lock().await;
        let old = machine.state();
        let result = f(&mut machine);
        let new = machine.state();
        self.state_tx.send_if_modified(|state| {
            if *state != new {
                *state = new;
                true
            } else {
                false
            }
        });
        (old, new, result)
    }
}

/// 驱动任务参数
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub server: std::net::SocketAddr,
    pub register_retry: u32,
    pub register_backoff: Duration,
    /// 0 表示不限
    pub max_register_cycles: u32,
}

enum Action {
    Start,
    Refresh,
    Reregister,
}

enum Outcome {
    Registered(u32),
    Failed(GbError),
    Shutdown,
}

/// 注册驱动任务
pub struct RegistrationDriver {
    handle: Arc<RegistrationHandle>,
    transactions: Arc<ClientTransactions>,
    keepalive: Arc<KeepaliveScheduler>,
    sessions: Arc<SessionManager>,
    keepalive_lost: Arc<Notify>,
    options: DriverOptions,
    cancel: CancellationToken,
}

impl RegistrationDriver {
    pub fn new(
        handle: Arc<RegistrationHandle>,
        transactions: Arc<ClientTransactions>,
        keepalive: Arc<KeepaliveScheduler>,
        sessions: Arc<SessionManager>,
        options: DriverOptions,
        cancel: CancellationToken,
    ) -> Self {
        let keepalive_lost = keepalive.trigger();
        Self {
            handle,
            transactions,
            keepalive,
            sessions,
            keepalive_lost,
            options,
            cancel,
        }
    }

    /// 在后台运行；周期耗尽时通过 `fatal` 上报
    pub fn spawn(self, fatal: mpsc::Sender<GbError>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!(target: "gb28181::register", error = %e, "Registration driver stopped");
                let _ = fatal.send(e).await;
            }
        })
    }

    pub async fn run(self) -> Result<()> {
        let mut failed_cycles = 0u32;
        let mut action = Action::Start;

        loop {
            let request = match action {
                Action::Start => self.apply(|r| r.start()).await,
                Action::Refresh => self.apply(|r| r.refresh()).await,
                Action::Reregister => self.apply(|r| Ok(r.force_reregister())).await,
            };
            let request = match request {
                None => return Ok(()),
                Some(Ok(request)) => request,
                Some(Err(e)) => return Err(e),
            };

            let was_refresh = matches!(action, Action::Refresh);

            match self.exchange(request).await {
                Outcome::Registered(expires) => {
                    failed_cycles = 0;
                    tracing::info!(
                        target: "gb28181::register",
                        expires,
                        "Registered with platform"
                    );

                    action = tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(Duration::from_millis(u64::from(expires) * 800)) => Action::Refresh,
                        _ = self.keepalive_lost.notified() => {
                            tracing::warn!(target: "gb28181::register", "Keepalive lost, re-registering");
                            Action::Reregister
                        }
                    };
                }
                Outcome::Failed(err) if was_refresh => {
                    tracing::warn!(target: "gb28181::register", error = %err, "Refresh failed, starting fresh registration");
                    action = Action::Reregister;
                }
                Outcome::Failed(err) => {
                    failed_cycles += 1;
                    tracing::warn!(
                        target: "gb28181::register",
                        error = %err,
                        cycle = failed_cycles,
                        backoff = ?self.options.register_backoff,
                        "Registration failed"
                    );

                    if self.options.max_register_cycles > 0
                        && failed_cycles >= self.options.max_register_cycles
                    {
                        return Err(GbError::RegistrationExhausted(failed_cycles));
                    }

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.options.register_backoff) => {}
                    }

                    if self.apply(|r| r.reset()).await.is_none() {
                        return Ok(());
                    }
                    action = Action::Start;
                }
                Outcome::Shutdown => return Ok(()),
            }
        }
    }

    /// 发送 REGISTER 并跟随鉴权/423，直到 Registered 或 Failed
    async fn exchange(&self, mut request: SipRequest) -> Outcome {
        let mut retries = 0u32;

        loop {
            let result = self
                .transactions
                .send_request(&request, self.options.server, &self.cancel)
                .await;

            // shutdown 期间到达的响应不再推进状态机
            if self.cancel.is_cancelled() {
                return Outcome::Shutdown;
            }

            let resp = match result {
                Ok(resp) => resp,
                Err(GbError::Shutdown) => return Outcome::Shutdown,
                Err(e) if e.is_transport() && retries < self.options.register_retry => {
                    retries += 1;
                    tracing::warn!(
                        target: "gb28181::register",
                        error = %e,
                        retry = retries,
                        "REGISTER not answered, retrying"
                    );
                    match self.apply(|r| r.retry_request()).await {
                        Some(next) => request = next,
                        None => return Outcome::Shutdown,
                    }
                    continue;
                }
                Err(e) => return self.fail(e).await,
            };

            tracing::debug!(
                target: "gb28181::register",
                status = resp.status_code,
                "REGISTER response"
            );

            let transition = match self.apply(|r| r.handle_response(&resp)).await {
                None => return Outcome::Shutdown,
                Some(Ok(transition)) => transition,
                Some(Err(e)) => return self.fail(e).await,
            };

            match (transition.state, transition.resend) {
                (RegistrationState::Registered, _) => {
                    return Outcome::Registered(transition.expires.unwrap_or(1));
                }
                (RegistrationState::Failed, _) => {
                    return Outcome::Failed(transition.failure.unwrap_or_else(|| {
                        GbError::Protocol("registration failed".to_string())
                    }));
                }
                (_, Some(next)) => {
                    retries = 0;
                    request = next;
                }
                (state, None) => {
                    tracing::debug!(target: "gb28181::register", %state, "Waiting for final response");
                    return self
                        .fail(GbError::Protocol(
                            "no follow-up request after provisional response".to_string(),
                        ))
                        .await;
                }
            }
        }
    }

    async fn fail(&self, err: GbError) -> Outcome {
        match self.apply(|r| r.transport_failed()).await {
            Some(()) => Outcome::Failed(err),
            None => Outcome::Shutdown,
        }
    }

    /// 在状态机锁内执行；shutdown 之后返回 None 且不改变状态
    async fn apply<R>(&self, f: impl FnOnce(&mut Registration) -> R) -> Option<R> {
        let cancel = &self.cancel;
        let (old, new, result) = self
            .handle
            .update(|r| if cancel.is_cancelled() { None } else { Some(f(r)) })
            .await;
        if result.is_some() && old != new {
            self.on_transition(old, new).await;
        }
        result
    }

    async fn on_transition(&self, old: RegistrationState, new: RegistrationState) {
        tracing::info!(
            target: "gb28181::register",
            from = %old,
            to = %new,
            "Registration state changed"
        );

        if new == RegistrationState::Registered {
            self.drain_keepalive_lost().await;
            self.keepalive.arm();
        } else if old == RegistrationState::Registered {
            self.keepalive.disarm();
        }

        if matches!(
            new,
            RegistrationState::Unregistered | RegistrationState::Failed
        ) {
            self.sessions.close_all().await;
        }
    }

    /// 丢弃上一轮心跳遗留的触发
    async fn drain_keepalive_lost(&self) {
        if discard_permit(&self.keepalive_lost).await {
            tracing::debug!(target: "gb28181::register", "Discarded stale keepalive trigger");
        }
    }
}

/// 消费 Notify 中已存的 permit，不等待新的通知
async fn discard_permit(notify: &Notify) -> bool {
    // Timeout 先轮询内部 future，已存的 permit 在此被消费
    tokio::time::timeout(Duration::ZERO, notify.notified())
        .await
        .is_ok()
}
