// 客户端事务
// 按顶层 Via branch 关联本端发出的请求与平台响应；UDP 下按 RFC 3261 17.1.2 重传

use crate::error::{GbError, Result};
use crate::sip::message::{SipHeaders, SipRequest, SipResponse};
use crate::sip::transport::SipTransport;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// T1
const RETRANSMIT_INITIAL: Duration = Duration::from_millis(500);
/// T2
const RETRANSMIT_MAX: Duration = Duration::from_secs(4);

/// 未完成的客户端事务表
pub struct ClientTransactions {
    transport: Arc<SipTransport>,
    pending: DashMap<String, mpsc::Sender<SipResponse>>,
    timeout: Duration,
}

struct PendingGuard<'a> {
    pending: &'a DashMap<String, mpsc::Sender<SipResponse>>,
    branch: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.branch);
    }
}

impl ClientTransactions {
    pub fn new(transport: Arc<SipTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            pending: DashMap::new(),
            timeout,
        }
    }

    pub fn transport(&self) -> &Arc<SipTransport> {
        &self.transport
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 发送请求并等待最终响应（事务超时内）
    pub async fn send_request(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<SipResponse> {
        self.send_with_timeout(req, addr, cancel, self.timeout).await
    }

    /// 发送请求并在 `timeout` 内等待最终响应
    pub async fn send_with_timeout(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<SipResponse> {
        if cancel.is_cancelled() {
            return Err(GbError::Shutdown);
        }

        let branch = req
            .via_branch()
            .ok_or_else(|| GbError::Protocol("request without Via branch".to_string()))?
            .to_string();

        let (tx, mut rx) = mpsc::channel(8);
        self.pending.insert(branch.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            branch,
        };

        let data = req.to_bytes();
        self.transport.send_to(&data, addr).await?;

        let deadline = Instant::now() + timeout;
        let reliable = self.transport.is_reliable();
        let mut interval = RETRANSMIT_INITIAL;
        let mut next_retransmit = Instant::now() + interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(GbError::Shutdown),
                _ = tokio::time::sleep_until(deadline) => return Err(GbError::Timeout),
                _ = tokio::time::sleep_until(next_retransmit), if !reliable => {
                    tracing::debug!(
                        target: "gb28181::sip",
                        method = %req.method,
                        call_id = req.call_id().unwrap_or("-"),
                        "Retransmitting request"
                    );
                    if let Err(e) = self.transport.send_to(&data, addr).await {
                        tracing::warn!(target: "gb28181::sip", error = %e, "Retransmit failed");
                    }
                    interval = (interval * 2).min(RETRANSMIT_MAX);
                    next_retransmit = Instant::now() + interval;
                }
                resp = rx.recv() => {
                    let Some(resp) = resp else {
                        return Err(GbError::Transport("transaction dropped".to_string()));
                    };
                    if resp.is_provisional() {
                        // 收到临时响应后只按 T2 重传
                        interval = RETRANSMIT_MAX;
                        next_retransmit = Instant::now() + interval;
                        continue;
                    }
                    return Ok(resp);
                }
            }
        }
    }

    /// 投递响应；没有匹配事务时返回 false
    pub fn on_response(&self, resp: SipResponse) -> bool {
        let Some(branch) = resp.via_branch() else {
            return false;
        };

        let Some(sender) = self.pending.get(branch).map(|s| s.value().clone()) else {
            return false;
        };

        sender.try_send(resp).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TransportMode;
    use crate::sip::message::{SipMessage, SipMethod};
    use tokio::net::UdpSocket;

    async fn setup() -> (Arc<ClientTransactions>, UdpSocket, CancellationToken) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let cancel = CancellationToken::new();
        let transport = SipTransport::bind(
            TransportMode::Udp,
            port,
            peer.local_addr().unwrap(),
            Duration::from_secs(1),
            cancel.clone(),
        )
        .await
        .unwrap();

        let transactions = Arc::new(ClientTransactions::new(
            Arc::new(transport),
            Duration::from_secs(2),
        ));
        (transactions, peer, cancel)
    }

    fn request(branch: &str) -> SipRequest {
        let mut req = SipRequest::new(SipMethod::Message, "sip:a@b".to_string());
        req.add_header("Via", format!("SIP/2.0/UDP 127.0.0.1:5061;branch={}", branch));
        req.add_header("Call-ID", "t1");
        req.add_header("CSeq", "1 MESSAGE");
        req
    }

    /// 模拟平台：读取请求并回复；`skip` 为先忽略的报文数（触发重传）
    async fn answer(peer: &UdpSocket, skip: usize, codes: &[u16]) {
        let mut buf = vec![0u8; 4096];
        let mut seen = 0;
        loop {
            let (n, from) = peer.recv_from(&mut buf).await.unwrap();
            seen += 1;
            if seen <= skip {
                continue;
            }
            let SipMessage::Request(req) = SipMessage::parse(&buf[..n]).unwrap() else {
                panic!("expected request");
            };
            for code in codes {
                let resp = SipResponse::for_request(&req, *code);
                peer.send_to(&resp.to_bytes(), from).await.unwrap();
            }
            return;
        }
    }

    /// 接收循环：把收到的响应交给事务表
    fn spawn_pump(transactions: Arc<ClientTransactions>) {
        tokio::spawn(async move {
            while let Ok((data, _)) = transactions.transport().recv().await {
                if let Ok(SipMessage::Response(resp)) = SipMessage::parse(&data) {
                    transactions.on_response(resp);
                }
            }
        });
    }

    #[tokio::test]
    async fn test_final_response_after_provisional() {
        let (transactions, peer, cancel) = setup().await;
        spawn_pump(transactions.clone());

        let peer_addr = peer.local_addr().unwrap();
        let responder = tokio::spawn(async move { answer(&peer, 0, &[100, 200]).await });

        let resp = transactions
            .send_request(&request("z9hG4bKt1"), peer_addr, &cancel)
            .await
            .unwrap();

        assert_eq!(resp.status_code, 200);
        assert_eq!(transactions.pending_count(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_retransmits_until_answered() {
        let (transactions, peer, cancel) = setup().await;
        spawn_pump(transactions.clone());

        let peer_addr = peer.local_addr().unwrap();
        let responder = tokio::spawn(async move { answer(&peer, 1, &[200]).await });

        let resp = transactions
            .send_request(&request("z9hG4bKt2"), peer_addr, &cancel)
            .await
            .unwrap();
        assert!(resp.is_success());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_and_shutdown() {
        let (transactions, peer, cancel) = setup().await;
        let peer_addr = peer.local_addr().unwrap();

        let err = transactions
            .send_with_timeout(
                &request("z9hG4bKt3"),
                peer_addr,
                &cancel,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GbError::Timeout));
        assert_eq!(transactions.pending_count(), 0);

        cancel.cancel();
        let err = transactions
            .send_request(&request("z9hG4bKt4"), peer_addr, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GbError::Shutdown));
    }

    #[tokio::test]
    async fn test_unmatched_response_is_ignored() {
        let (transactions, _peer, _cancel) = setup().await;
        let resp = SipResponse::for_request(&request("z9hG4bKnobody"), 200);
        assert!(!transactions.on_response(resp));
    }
}
