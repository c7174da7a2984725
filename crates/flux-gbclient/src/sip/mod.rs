// GB28181 SIP 信令层（客户端侧）
// 编解码、摘要鉴权、SDP、客户端事务与传输

pub mod auth;
pub mod message;
pub mod sdp;
pub mod transaction;
pub mod transport;

pub use auth::{ChallengeKind, DigestChallenge};
pub use message::{SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::SdpSession;
pub use transaction::ClientTransactions;
pub use transport::SipTransport;

/// MANSCDP 消息体的 Content-Type
pub const MANSCDP_CONTENT_TYPE: &str = "Application/MANSCDP+xml";

pub const SDP_CONTENT_TYPE: &str = "application/sdp";
