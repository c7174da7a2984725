// 媒体面接口
// 信令层只负责协商并通知媒体面开始/停止推流，RTP/PS 封装不在本 crate 内

use crate::error::{GbError, Result};
use crate::sip::sdp::SdpSession;
use async_trait::async_trait;

/// 设备侧的 RTP 传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTransport {
    Udp,
    /// 设备主动连接平台
    TcpActive,
    /// 设备监听，平台连接
    TcpPassive,
}

/// 协商后的推流参数
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    /// 对话 ID（Call-ID）
    pub session_id: String,
    pub device_id: String,
    pub remote_ip: String,
    pub remote_port: u16,
    pub ssrc: Option<String>,
    pub transport: MediaTransport,
    pub payload_type: u8,
    pub session_name: String,
    pub local_port: u16,
}

impl SessionParams {
    pub fn from_offer(
        session_id: &str,
        device_id: &str,
        offer: &SdpSession,
        local_port: u16,
    ) -> Result<Self> {
        let video = offer
            .video()
            .ok_or_else(|| GbError::Protocol("offer has no video media".to_string()))?;

        // m= 级别的 c= 不常见，统一使用会话级地址
        if offer.connection.address.is_empty() {
            return Err(GbError::Protocol("offer has no connection address".to_string()));
        }

        let transport = if video.is_tcp() {
            match video.setup() {
                Some("active") => MediaTransport::TcpPassive,
                _ => MediaTransport::TcpActive,
            }
        } else {
            MediaTransport::Udp
        };

        Ok(Self {
            session_id: session_id.to_string(),
            device_id: device_id.to_string(),
            remote_ip: offer.connection.address.clone(),
            remote_port: video.port,
            ssrc: offer.ssrc.clone(),
            transport,
            payload_type: video.preferred_payload().unwrap_or(96),
            session_name: offer.session_name.clone(),
            local_port,
        })
    }

    /// 推流目的地是否相同（re-INVITE 时据此决定是否重新 arm）
    pub fn same_destination(&self, other: &SessionParams) -> bool {
        self.remote_ip == other.remote_ip
            && self.remote_port == other.remote_port
            && self.ssrc == other.ssrc
            && self.transport == other.transport
    }
}

/// 媒体面
#[async_trait]
pub trait MediaPlane: Send + Sync {
    /// 开始向协商目的地推流
    async fn arm_stream(&self, device_id: &str, params: &SessionParams) -> Result<()>;

    /// 停止推流
    async fn disarm_stream(&self, session_id: &str) -> Result<()>;
}

/// 只记录日志的媒体面
#[derive(Debug, Default, Clone)]
pub struct LoggingMediaPlane;

#[async_trait]
impl MediaPlane for LoggingMediaPlane {
    async fn arm_stream(&self, device_id: &str, params: &SessionParams) -> Result<()> {
        tracing::info!(
            target: "gb28181::media",
            %device_id,
            call_id = %params.session_id,
            remote = %format!("{}:{}", params.remote_ip, params.remote_port),
            ssrc = params.ssrc.as_deref().unwrap_or("-"),
            transport = ?params.transport,
            "Media stream armed"
        );
        Ok(())
    }

    async fn disarm_stream(&self, session_id: &str) -> Result<()> {
        tracing::info!(target: "gb28181::media", call_id = %session_id, "Media stream disarmed");
        Ok(())
    }
}
