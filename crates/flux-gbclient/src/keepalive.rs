// GB28181 心跳
// 注册成功后周期发送 Keepalive Notify，连续失败达到阈值时通知注册驱动重新注册

use crate::error::{GbError, Result};
use crate::identity::ClientIdentity;
use crate::manscdp;
use crate::sip::transaction::ClientTransactions;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// 心跳失败计数
#[derive(Debug, Clone)]
pub struct KeepaliveCounter {
    failures: u32,
    last_success: Option<DateTime<Local>>,
    interval: Duration,
    max_retry: u32,
}

impl KeepaliveCounter {
    pub fn new(interval: Duration, max_retry: u32) -> Self {
        Self {
            failures: 0,
            last_success: None,
            interval,
            max_retry,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.last_success = Some(Local::now());
    }

    /// 记录一次失败，返回是否达到阈值
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        self.failures >= self.max_retry
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_success(&self) -> Option<DateTime<Local>> {
        self.last_success
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// 单次心跳
#[async_trait]
pub trait Heartbeat: Send + Sync {
    /// 发送心跳并在 `window` 内等待 2xx
    async fn beat(&self, window: Duration) -> Result<()>;
}

/// 基于 SIP MESSAGE 的心跳
pub struct TransactionHeartbeat {
    identity: Arc<ClientIdentity>,
    transactions: Arc<ClientTransactions>,
    cancel: CancellationToken,
    sn: AtomicU32,
}

impl TransactionHeartbeat {
    pub fn new(
        identity: Arc<ClientIdentity>,
        transactions: Arc<ClientTransactions>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            transactions,
            cancel,
            sn: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl Heartbeat for TransactionHeartbeat {
    async fn beat(&self, window: Duration) -> Result<()> {
        let sn = self.sn.fetch_add(1, Ordering::Relaxed);
        let body = manscdp::keepalive_notify(sn, &self.identity.gb_id);
        let req = self
            .identity
            .manscdp_message(&self.identity.server_uri(), body);

        let resp = self
            .transactions
            .send_with_timeout(&req, self.identity.server_addr, &self.cancel, window)
            .await?;

        if resp.is_success() {
            Ok(())
        } else {
            Err(GbError::Protocol(format!(
                "keepalive answered with {}",
                resp.status_code
            )))
        }
    }
}

/// 心跳调度器
pub struct KeepaliveScheduler {
    heartbeat: Arc<dyn Heartbeat>,
    interval: Duration,
    ack_window: Duration,
    counter: Arc<Mutex<KeepaliveCounter>>,
    trigger: Arc<Notify>,
    parent: CancellationToken,
    armed: Mutex<Option<CancellationToken>>,
}

impl KeepaliveScheduler {
    pub fn new(
        heartbeat: Arc<dyn Heartbeat>,
        interval: Duration,
        max_retry: u32,
        transaction_timeout: Duration,
        parent: CancellationToken,
    ) -> Self {
        Self {
            heartbeat,
            interval,
            ack_window: interval.min(transaction_timeout),
            counter: Arc::new(Mutex::new(KeepaliveCounter::new(interval, max_retry))),
            trigger: Arc::new(Notify::new()),
            parent,
            armed: Mutex::new(None),
        }
    }

    /// 阈值触发时被通知
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// 启动（或重启）心跳任务，计数清零
    pub fn arm(&self) {
        if self.parent.is_cancelled() {
            return;
        }

        let token = self.parent.child_token();
        {
            let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = armed.replace(token.clone()) {
                previous.cancel();
            }
        }
        self.counter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();

        tracing::debug!(target: "gb28181::keepalive", interval = ?self.interval, "Keepalive armed");

        tokio::spawn(run_keepalive(
            self.heartbeat.clone(),
            self.interval,
            self.ack_window,
            self.counter.clone(),
            self.trigger.clone(),
            token,
        ));
    }

    pub fn disarm(&self) {
        let previous = self
            .armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = previous {
            token.cancel();
            tracing::debug!(target: "gb28181::keepalive", "Keepalive disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| !t.is_cancelled())
            .unwrap_or(false)
    }

    pub fn counter(&self) -> KeepaliveCounter {
        self.counter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

async fn run_keepalive(
    heartbeat: Arc<dyn Heartbeat>,
    interval: Duration,
    window: Duration,
    counter: Arc<Mutex<KeepaliveCounter>>,
    trigger: Arc<Notify>,
    token: CancellationToken,
) {
    // 第一次 tick 立即触发
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = heartbeat.beat(window) => result,
        };

        if token.is_cancelled() {
            break;
        }

        let mut counter = counter.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(()) => {
                if counter.failures() > 0 {
                    tracing::info!(target: "gb28181::keepalive", "Keepalive recovered");
                }
                counter.record_success();
            }
            Err(e) => {
                let exhausted = counter.record_failure();
                tracing::warn!(
                    target: "gb28181::keepalive",
                    error = %e,
                    failures = counter.failures(),
                    "Keepalive failed"
                );
                if exhausted {
                    drop(counter);
                    tracing::warn!(target: "gb28181::keepalive", "Keepalive threshold reached");
                    token.cancel();
                    trigger.notify_one();
                    break;
                }
            }
        }
    }
}
