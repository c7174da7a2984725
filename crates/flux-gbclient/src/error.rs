use thiserror::Error;

#[derive(Error, Debug)]
pub enum GbError {
    /// 配置缺失或非法（启动期致命）
    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// 报文畸形或不符合预期（记录后丢弃，不改变状态）
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 连续两次凭证被拒
    #[error("Authentication rejected: {0}")]
    AuthChallenge(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Timeout")]
    Timeout,

    #[error("Registration failed after {0} consecutive cycles")]
    RegistrationExhausted(u32),

    #[error("Shutting down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GbError {
    /// 是否计入传输层重试（Timeout 与 Transport 同等对待）
    pub fn is_transport(&self) -> bool {
        matches!(self, GbError::Transport(_) | GbError::Timeout | GbError::Io(_))
    }
}

impl From<config::ConfigError> for GbError {
    fn from(err: config::ConfigError) -> Self {
        GbError::Config(err.to_string())
    }
}

impl From<quick_xml::de::DeError> for GbError {
    fn from(err: quick_xml::de::DeError) -> Self {
        GbError::Protocol(format!("MANSCDP body: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, GbError>;
