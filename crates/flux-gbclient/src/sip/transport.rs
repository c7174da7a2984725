// SIP 传输层
// UDP 直接收发；TCP 维持一条到平台的连接，按 Content-Length 分帧，断线后退避重连

use crate::error::{GbError, Result};
use crate::settings::TransportMode;
use crate::sip::message::frame_length;
use bytes::{Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpSocket, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 65535;
const MAX_TCP_MESSAGE: usize = 1024 * 1024;
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// SIP 传输
pub struct SipTransport {
    inner: Inner,
    server: SocketAddr,
    send_timeout: Duration,
}

enum Inner {
    Udp(Arc<UdpSocket>),
    Tcp(TcpChannel),
}

struct TcpChannel {
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
}

impl SipTransport {
    /// 绑定本地端口；TCP 模式下后台维持到平台的连接，直到 `cancel` 触发
    pub async fn bind(
        mode: TransportMode,
        local_port: u16,
        server: SocketAddr,
        send_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let inner = match mode {
            TransportMode::Udp => {
                let socket = UdpSocket::bind(("0.0.0.0", local_port))
                    .await
                    .map_err(|e| GbError::Transport(format!("bind udp {}: {}", local_port, e)))?;
                tracing::info!(
                    target: "gb28181::sip",
                    local = %socket.local_addr()?,
                    "UDP transport bound"
                );
                Inner::Udp(Arc::new(socket))
            }
            TransportMode::Tcp => {
                let writer = Arc::new(Mutex::new(None));
                let (tx, rx) = mpsc::channel(256);
                tokio::spawn(tcp_connection_loop(
                    local_port,
                    server,
                    writer.clone(),
                    tx,
                    cancel,
                ));
                Inner::Tcp(TcpChannel {
                    writer,
                    inbound: Mutex::new(rx),
                })
            }
        };

        Ok(Self {
            inner,
            server,
            send_timeout,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self.inner, Inner::Tcp(_))
    }

    /// 发送一条消息，超过 send timeout 返回 `Timeout`
    ///
    /// TCP 模式下只有一条到平台的连接，`addr` 被忽略。
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        match &self.inner {
            Inner::Udp(socket) => {
                tokio::time::timeout(self.send_timeout, socket.send_to(data, addr))
                    .await
                    .map_err(|_| GbError::Timeout)?
                    .map_err(|e| GbError::Transport(format!("send to {}: {}", addr, e)))?;
            }
            Inner::Tcp(channel) => {
                let write = async {
                    let mut guard = channel.writer.lock().await;
                    let writer = guard
                        .as_mut()
                        .ok_or_else(|| GbError::Transport("tcp not connected".to_string()))?;
                    if let Err(e) = writer.write_all(data).await {
                        *guard = None;
                        return Err(GbError::Transport(format!("tcp write: {}", e)));
                    }
                    Ok(())
                };
                tokio::time::timeout(self.send_timeout, write)
                    .await
                    .map_err(|_| GbError::Timeout)??;
            }
        }

        tracing::trace!(target: "gb28181::sip", remote = %addr, bytes = data.len(), "SIP message sent");
        Ok(())
    }

    /// 接收下一条原始消息及其来源地址
    pub async fn recv(&self) -> Result<(Bytes, SocketAddr)> {
        match &self.inner {
            Inner::Udp(socket) => {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let (len, addr) = socket.recv_from(&mut buf).await?;
                buf.truncate(len);
                Ok((Bytes::from(buf), addr))
            }
            Inner::Tcp(channel) => {
                let frame = channel
                    .inbound
                    .lock()
                    .await
                    .recv()
                    .await
                    .ok_or_else(|| GbError::Transport("tcp transport closed".to_string()))?;
                Ok((frame, self.server))
            }
        }
    }
}

async fn connect_tcp(local_port: u16, server: SocketAddr) -> std::io::Result<tokio::net::TcpStream> {
    let socket = if server.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    let local = if server.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, local_port))
    };
    socket.bind(local)?;
    socket.connect(server).await
}

async fn tcp_connection_loop(
    local_port: u16,
    server: SocketAddr,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    inbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut backoff = RECONNECT_MIN;

    while !cancel.is_cancelled() {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_tcp(local_port, server) => result,
        };

        match stream {
            Ok(stream) => {
                tracing::info!(target: "gb28181::sip", remote = %server, "TCP connection established");
                backoff = RECONNECT_MIN;

                let (mut reader, write_half) = stream.into_split();
                *writer.lock().await = Some(write_half);

                let result = tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    result = read_frames(&mut reader, &inbound) => result,
                };

                *writer.lock().await = None;

                if let Err(e) = result {
                    tracing::warn!(target: "gb28181::sip", remote = %server, error = %e, "TCP connection lost");
                }
                if inbound.is_closed() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "gb28181::sip",
                    remote = %server,
                    error = %e,
                    retry_in = ?backoff,
                    "TCP connect failed"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }

    tracing::debug!(target: "gb28181::sip", "TCP connection loop stopped");
}

/// 从流中切出完整 SIP 消息；对端关闭时返回错误
async fn read_frames(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    inbound: &mpsc::Sender<Bytes>,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        while let Some(len) = frame_length(&buf)? {
            let frame = buf.split_to(len).freeze();
            if inbound.send(frame).await.is_err() {
                return Ok(());
            }
        }

        if buf.len() > MAX_TCP_MESSAGE {
            return Err(GbError::Protocol("tcp message exceeds size limit".to_string()));
        }

        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(GbError::Transport("connection closed by peer".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_udp_send_and_recv() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let port = free_udp_port();

        let transport = SipTransport::bind(
            TransportMode::Udp,
            port,
            peer_addr,
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        transport.send_to(b"OPTIONS", peer_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OPTIONS");

        peer.send_to(b"SIP/2.0 200 OK\r\n\r\n", from).await.unwrap();
        let (data, src) = transport.recv().await.unwrap();
        assert_eq!(src, peer_addr);
        assert!(data.starts_with(b"SIP/2.0 200"));
    }

    #[tokio::test]
    async fn test_tcp_framing_across_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let transport = SipTransport::bind(
            TransportMode::Tcp,
            0,
            server,
            Duration::from_secs(1),
            cancel.clone(),
        )
        .await
        .unwrap();

        let (mut peer, _) = listener.accept().await.unwrap();
        let msg = "SIP/2.0 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        peer.write_all(&msg.as_bytes()[..20]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.write_all(&msg.as_bytes()[20..]).await.unwrap();
        peer.write_all(b"\r\n\r\n").await.unwrap();

        let (frame, src) = transport.recv().await.unwrap();
        assert_eq!(src, server);
        assert_eq!(&frame[..], msg.as_bytes());

        // 连接建立后可写
        let mut sent = false;
        for _ in 0..50 {
            if transport.send_to(b"ping", server).await.is_ok() {
                sent = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sent);

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        cancel.cancel();
    }
}
