// GB28181 客户端用户代理
// 组装传输、事务、注册、心跳、会话与分发，对外提供生命周期接口

use crate::dispatcher::Dispatcher;
use crate::error::{GbError, Result};
use crate::identity::ClientIdentity;
use crate::keepalive::{KeepaliveScheduler, TransactionHeartbeat};
use crate::manscdp;
use crate::media::MediaPlane;
use crate::registration::{
    DriverOptions, Registration, RegistrationDriver, RegistrationHandle, RegistrationState,
};
use crate::registry::{DeviceRegistry, DeviceStatus};
use crate::session::SessionManager;
use crate::settings::ClientConfig;
use crate::sip::transaction::ClientTransactions;
use crate::sip::transport::SipTransport;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 注销时单次等待上限
const UNREGISTER_WAIT: Duration = Duration::from_secs(4);
const UNREGISTER_ATTEMPTS: u32 = 2;

/// start 之后才存在的组件
struct Running {
    transactions: Arc<ClientTransactions>,
    keepalive: Arc<KeepaliveScheduler>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    fatal: Mutex<mpsc::Receiver<GbError>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// 模拟前端设备的 SIP 用户代理
pub struct UserAgent {
    config: ClientConfig,
    identity: Arc<ClientIdentity>,
    registry: Arc<DeviceRegistry>,
    media: Arc<dyn MediaPlane>,
    registration: Arc<RegistrationHandle>,
    running: OnceCell<Running>,

    /// 定时器、驱动、会话
    cancel: CancellationToken,

    /// 接收循环与 TCP 连接；注销完成后才取消
    transport_cancel: CancellationToken,

    shutting_down: AtomicBool,
    notify_sn: AtomicU32,
}

impl UserAgent {
    pub fn new(config: ClientConfig, media: Arc<dyn MediaPlane>) -> Result<Self> {
        config.validate()?;

        let identity = Arc::new(ClientIdentity::from_config(&config)?);
        let registry = Arc::new(DeviceRegistry::from_config(&config.devices)?);
        let registration = Arc::new(RegistrationHandle::new(Registration::new(
            identity.clone(),
            config.reg_expire,
        )));

        Ok(Self {
            config,
            identity,
            registry,
            media,
            registration,
            running: OnceCell::new(),
            cancel: CancellationToken::new(),
            transport_cancel: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            notify_sn: AtomicU32::new(1),
        })
    }

    pub fn identity(&self) -> &Arc<ClientIdentity> {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration.state()
    }

    /// 订阅注册状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<RegistrationState> {
        self.registration.subscribe()
    }

    /// 绑定传输并启动注册驱动
    pub async fn start(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GbError::Shutdown);
        }
        if self.running.initialized() {
            return Err(GbError::Protocol("user agent already started".to_string()));
        }

        let transport = Arc::new(
            SipTransport::bind(
                self.identity.transport,
                self.identity.local_port,
                self.identity.server_addr,
                self.config.send_timeout(),
                self.transport_cancel.clone(),
            )
            .await?,
        );
        let transactions = Arc::new(ClientTransactions::new(
            transport,
            self.config.transaction_timeout(),
        ));

        let heartbeat = Arc::new(TransactionHeartbeat::new(
            self.identity.clone(),
            transactions.clone(),
            self.cancel.clone(),
        ));
        let keepalive = Arc::new(KeepaliveScheduler::new(
            heartbeat,
            self.config.keepalive_interval(),
            self.config.max_keepalive_retry,
            self.config.transaction_timeout(),
            self.cancel.clone(),
        ));

        let sessions = Arc::new(SessionManager::new(
            self.identity.clone(),
            self.registry.clone(),
            self.media.clone(),
            self.registration.subscribe(),
            self.config.session_ack_timeout(),
            self.cancel.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            self.identity.clone(),
            self.registry.clone(),
            transactions.clone(),
            sessions.clone(),
            self.config.catalog_page_size,
            self.cancel.clone(),
        ));

        let options = DriverOptions {
            server: self.identity.server_addr,
            register_retry: self.config.register_retry,
            register_backoff: self.config.register_backoff(),
            max_register_cycles: self.config.max_register_cycles,
        };

        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let driver = RegistrationDriver::new(
            self.registration.clone(),
            transactions.clone(),
            keepalive.clone(),
            sessions.clone(),
            options,
            self.cancel.clone(),
        )
        .spawn(fatal_tx);

        let running = Running {
            transactions,
            keepalive,
            sessions,
            dispatcher,
            fatal: Mutex::new(fatal_rx),
            driver: Mutex::new(Some(driver)),
        };
        if self.running.set(running).is_err() {
            return Err(GbError::Protocol("user agent already started".to_string()));
        }

        tracing::info!(
            target: "gb28181::client",
            gb_id = %self.identity.gb_id,
            server = %self.identity.server_addr,
            transport = ?self.identity.transport,
            devices = self.registry.len(),
            "GB28181 client started"
        );

        Ok(())
    }

    /// 接收循环，直到 shutdown 完成；注册周期耗尽时返回错误
    pub async fn handle_incoming_messages(&self) -> Result<()> {
        let running = self.running()?;
        let transport = running.transactions.transport().clone();
        let mut fatal = running.fatal.lock().await;
        let mut driver_alive = true;

        loop {
            tokio::select! {
                _ = self.transport_cancel.cancelled() => break,
                err = fatal.recv(), if driver_alive => {
                    match err {
                        Some(err) => return Err(err),
                        // 驱动已退出；注销响应仍需经由接收循环投递
                        None => driver_alive = false,
                    }
                }
                result = transport.recv() => match result {
                    Ok((data, source)) => running.dispatcher.dispatch(data, source),
                    Err(e) => {
                        if self.transport_cancel.is_cancelled() {
                            break;
                        }
                        tracing::warn!(target: "gb28181::sip", error = %e, "Receive failed");
                    }
                },
            }
        }

        tracing::debug!(target: "gb28181::client", "Receive loop stopped");
        Ok(())
    }

    /// 停止所有定时器，注销后关闭传输；可重复调用
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(target: "gb28181::client", "Shutting down GB28181 client");
        self.cancel.cancel();

        let running = match self.running.get() {
            Some(running) => running,
            None => {
                self.transport_cancel.cancel();
                return Ok(());
            }
        };

        running.keepalive.disarm();
        running.sessions.close_all().await;

        let (old, new, request) = self.registration.update(|r| r.unregister()).await;
        if old != new {
            tracing::info!(target: "gb28181::register", from = %old, to = %new, "Registration state changed");
        }

        if let Some(request) = request {
            self.send_unregister(running, request).await;
        }

        self.transport_cancel.cancel();

        let driver = running.driver.lock().await.take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }

        tracing::info!(target: "gb28181::client", "GB28181 client stopped");
        Ok(())
    }

    /// 修改设备状态；已注册时向平台发送目录状态通知
    pub async fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<()> {
        let previous = self.registry.set_status(device_id, status).await?;
        if previous == status {
            return Ok(());
        }

        let running = match self.running.get() {
            Some(running) if self.registration_state().is_registered() => running,
            _ => return Ok(()),
        };

        let device = self.registry.get(device_id).await?;
        let sn = self.notify_sn.fetch_add(1, Ordering::Relaxed);
        let body = manscdp::catalog_status_notify(sn, &self.identity.gb_id, &device);
        let req = self
            .identity
            .manscdp_message(&self.identity.server_uri(), body);

        let resp = running
            .transactions
            .send_request(&req, self.identity.server_addr, &self.cancel)
            .await?;

        if !resp.is_success() {
            return Err(GbError::Protocol(format!(
                "status notify answered with {}",
                resp.status_code
            )));
        }

        tracing::info!(target: "gb28181::client", %device_id, %status, "Status notify delivered");
        Ok(())
    }

    async fn send_unregister(&self, running: &Running, request: crate::sip::SipRequest) {
        // 根 token 已取消，注销事务单独计时
        let token = CancellationToken::new();
        let window = running.transactions.timeout().min(UNREGISTER_WAIT);

        for attempt in 1..=UNREGISTER_ATTEMPTS {
            match running
                .transactions
                .send_with_timeout(&request, self.identity.server_addr, &token, window)
                .await
            {
                Ok(resp) => {
                    tracing::info!(
                        target: "gb28181::register",
                        status = resp.status_code,
                        "Unregister answered"
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "gb28181::register",
                        error = %e,
                        attempt,
                        "Unregister not answered"
                    );
                }
            }
        }
    }

    fn running(&self) -> Result<&Running> {
        self.running
            .get()
            .ok_or_else(|| GbError::Protocol("user agent not started".to_string()))
    }
}
