// flux-gbclient: GB28181 前端设备模拟客户端
//
// 架构：
// - sip/: SIP 编解码、摘要鉴权、SDP、客户端事务、传输层
// - registration / keepalive: 注册状态机与心跳
// - dispatcher / session: 入向请求分发与点播会话
// - agent: 生命周期入口（start / handle_incoming_messages / shutdown）

pub mod agent;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod keepalive;
pub mod manscdp;
pub mod media;
pub mod registration;
pub mod registry;
pub mod session;
pub mod settings;
pub mod sip;

pub use agent::UserAgent;
pub use error::{GbError, Result};
pub use identity::ClientIdentity;
pub use media::{LoggingMediaPlane, MediaPlane, MediaTransport, SessionParams};
pub use registration::RegistrationState;
pub use registry::{DeviceRecord, DeviceRegistry, DeviceStatus};
pub use settings::{ClientConfig, ConfigLoader, DeviceConfig, TransportMode};
