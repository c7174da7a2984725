// 模拟客户端配置
// 读取 JSON 配置文件（键名与原模拟器 sim.conf 保持一致）并做启动期校验

use crate::error::{GbError, Result};
use crate::registry::DeviceStatus;
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// SIP 传输模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    #[serde(alias = "UDP")]
    Udp,
    #[serde(alias = "TCP")]
    Tcp,
}

impl TransportMode {
    /// Via 头中的传输标识
    pub fn via_token(&self) -> &'static str {
        match self {
            TransportMode::Udp => "UDP",
            TransportMode::Tcp => "TCP",
        }
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportMode::Tcp)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Udp => write!(f, "udp"),
            TransportMode::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for TransportMode {
    type Err = GbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportMode::Udp),
            "tcp" => Ok(TransportMode::Tcp),
            other => Err(GbError::Config(format!("unsupported transport: {}", other))),
        }
    }
}

/// 0/1 标志位，配置中既可能是字符串也可能是数字
#[derive(Deserialize)]
#[serde(untagged)]
enum FlagValue {
    Num(u8),
    Text(String),
}

fn de_flag<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match FlagValue::deserialize(deserializer)? {
        FlagValue::Num(v) => Ok(v),
        FlagValue::Text(s) if s.trim().is_empty() => Ok(0),
        FlagValue::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid flag value: {}", s))),
    }
}

/// 单个模拟设备（通道）描述
// config 源可能把键名折叠为小写，因此每个驼峰键都带小写别名
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(rename = "deviceID", alias = "deviceid")]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub manufacturer: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub owner: String,

    #[serde(rename = "CivilCode", alias = "civilCode", alias = "civilcode", default)]
    pub civil_code: String,

    #[serde(default)]
    pub address: String,

    #[serde(default, deserialize_with = "de_flag")]
    pub parental: u8,

    #[serde(rename = "safeWay", alias = "safeway", default, deserialize_with = "de_flag")]
    pub safety_way: u8,

    #[serde(rename = "registerWay", alias = "registerway", default, deserialize_with = "de_flag")]
    pub register_way: u8,

    #[serde(default, deserialize_with = "de_flag")]
    pub secrecy: u8,

    #[serde(default)]
    pub status: DeviceStatus,
}

fn default_local_sip_port() -> u16 {
    5061
}

fn default_reg_expire() -> u32 {
    3600
}

fn default_keepalive_interval() -> u64 {
    60
}

fn default_max_keepalive_retry() -> u32 {
    3
}

fn default_register_retry() -> u32 {
    3
}

fn default_register_backoff() -> u64 {
    30
}

fn default_transaction_timeout_ms() -> u64 {
    32_000
}

fn default_send_timeout_ms() -> u64 {
    2_000
}

fn default_session_ack_timeout() -> u64 {
    32
}

fn default_catalog_page_size() -> usize {
    20
}

fn default_user_agent() -> String {
    format!("flux-gbclient/{}", env!("CARGO_PKG_VERSION"))
}

/// 客户端完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(rename = "localSipPort", alias = "localsipport", default = "default_local_sip_port")]
    pub local_sip_port: u16,

    /// Via/Contact 中使用的本机地址，缺省时按路由自动探测
    #[serde(rename = "localIp", alias = "localip", default)]
    pub local_ip: Option<String>,

    #[serde(rename = "serverID", alias = "serverid")]
    pub server_id: String,

    pub realm: String,

    #[serde(rename = "serverAddr", alias = "serveraddr")]
    pub server_addr: String,

    #[serde(rename = "userName", alias = "username", default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// 请求的注册有效期（秒）
    #[serde(rename = "regExpire", alias = "regexpire", default = "default_reg_expire")]
    pub reg_expire: u32,

    /// 心跳间隔（秒）
    #[serde(
        rename = "keepaliveInterval",
        alias = "keepaliveinterval",
        default = "default_keepalive_interval"
    )]
    pub keepalive_interval: u64,

    #[serde(
        rename = "maxKeepaliveRetry",
        alias = "maxkeepaliveretry",
        default = "default_max_keepalive_retry"
    )]
    pub max_keepalive_retry: u32,

    #[serde(default)]
    pub transport: TransportMode,

    #[serde(rename = "gbId", alias = "gbid", alias = "GBID")]
    pub gb_id: String,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// 单次 REGISTER 的传输层重试次数
    #[serde(rename = "registerRetry", alias = "registerretry", default = "default_register_retry")]
    pub register_retry: u32,

    /// 注册失败后的退避时间（秒）
    #[serde(
        rename = "registerBackoff",
        alias = "registerbackoff",
        default = "default_register_backoff"
    )]
    pub register_backoff: u64,

    /// 连续失败的注册周期上限，0 表示不限
    #[serde(rename = "maxRegisterCycles", alias = "maxregistercycles", default)]
    pub max_register_cycles: u32,

    #[serde(
        rename = "transactionTimeoutMs",
        alias = "transactiontimeoutms",
        default = "default_transaction_timeout_ms"
    )]
    pub transaction_timeout_ms: u64,

    #[serde(rename = "sendTimeoutMs", alias = "sendtimeoutms", default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// INVITE 200 后等待 ACK 的时间（秒）
    #[serde(
        rename = "sessionAckTimeout",
        alias = "sessionacktimeout",
        default = "default_session_ack_timeout"
    )]
    pub session_ack_timeout: u64,

    /// SDP 应答中声明的本地媒体端口，缺省为 localSipPort + 2
    #[serde(rename = "mediaPort", alias = "mediaport", default)]
    pub media_port: Option<u16>,

    #[serde(
        rename = "catalogPageSize",
        alias = "catalogpagesize",
        default = "default_catalog_page_size"
    )]
    pub catalog_page_size: usize,

    #[serde(rename = "userAgent", alias = "useragent", default = "default_user_agent")]
    pub user_agent: String,
}

impl ClientConfig {
    /// 从 JSON 字符串解析
    pub fn from_json(json: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(json, FileFormat::Json))
            .build()?;
        let cfg: ClientConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 启动期校验，任何错误都是致命的 ConfigError
    pub fn validate(&self) -> Result<()> {
        if self.local_sip_port == 0 {
            return Err(GbError::Config("localSipPort must be non-zero".to_string()));
        }

        validate_gb_id("serverID", &self.server_id)?;
        validate_gb_id("gbId", &self.gb_id)?;

        if self.realm.trim().is_empty() {
            return Err(GbError::Config("realm is required".to_string()));
        }

        self.server_socket_addr()?;

        if let Some(ip) = &self.local_ip {
            ip.parse::<std::net::IpAddr>()
                .map_err(|_| GbError::Config(format!("invalid localIp: {}", ip)))?;
        }

        if self.reg_expire == 0 {
            return Err(GbError::Config("regExpire must be greater than 0".to_string()));
        }

        if self.keepalive_interval == 0 {
            return Err(GbError::Config(
                "keepaliveInterval must be greater than 0".to_string(),
            ));
        }

        if self.max_keepalive_retry == 0 {
            return Err(GbError::Config(
                "maxKeepaliveRetry must be greater than 0".to_string(),
            ));
        }

        if self.catalog_page_size == 0 {
            return Err(GbError::Config(
                "catalogPageSize must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.device_id.trim().is_empty() {
                return Err(GbError::Config("device with empty deviceID".to_string()));
            }
            if device.device_id == self.gb_id {
                return Err(GbError::Config(format!(
                    "deviceID {} collides with gbId",
                    device.device_id
                )));
            }
            if !seen.insert(device.device_id.as_str()) {
                return Err(GbError::Config(format!(
                    "duplicate deviceID: {}",
                    device.device_id
                )));
            }
        }

        Ok(())
    }

    pub fn server_socket_addr(&self) -> Result<SocketAddr> {
        self.server_addr
            .parse()
            .map_err(|_| GbError::Config(format!("invalid serverAddr: {}", self.server_addr)))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    pub fn register_backoff(&self) -> Duration {
        Duration::from_secs(self.register_backoff)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn session_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.session_ack_timeout)
    }

    pub fn media_port(&self) -> u16 {
        self.media_port
            .unwrap_or_else(|| self.local_sip_port.saturating_add(2))
    }
}

/// 国标编码：20 位数字
fn validate_gb_id(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(GbError::Config(format!("{} is required", field)));
    }
    if !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(GbError::Config(format!(
            "{} must be numeric, got {}",
            field, value
        )));
    }
    Ok(())
}

/// 配置加载器
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// 加载并校验客户端配置
    pub fn load(&self) -> Result<ClientConfig> {
        if !self.path.exists() {
            return Err(GbError::Config(format!(
                "config file not found: {}",
                self.path.display()
            )));
        }

        let path = self
            .path
            .to_str()
            .ok_or_else(|| GbError::Config("Invalid config path".to_string()))?;

        let config = Config::builder()
            .add_source(File::new(path, FileFormat::Json))
            .build()?;

        let cfg: ClientConfig = config.try_deserialize()?;
        cfg.validate()?;

        tracing::info!(
            target: "gb28181::client",
            path = %self.path.display(),
            devices = cfg.devices.len(),
            transport = %cfg.transport,
            "Configuration loaded"
        );

        Ok(cfg)
    }
}
