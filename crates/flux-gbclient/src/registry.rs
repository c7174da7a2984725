// 模拟设备目录
// 按配置顺序维护虚拟设备，只在加载时和显式状态变更时写入

use crate::error::{GbError, Result};
use crate::settings::DeviceConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;

/// 设备状态（ON/OFF）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeviceStatus {
    #[default]
    #[serde(rename = "ON", alias = "on", alias = "On")]
    On,
    #[serde(rename = "OFF", alias = "off", alias = "Off")]
    Off,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::On => "ON",
            DeviceStatus::Off => "OFF",
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, DeviceStatus::On)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = GbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(DeviceStatus::On),
            "OFF" => Ok(DeviceStatus::Off),
            other => Err(GbError::Protocol(format!("unknown device status: {}", other))),
        }
    }
}

/// 虚拟设备记录
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    /// 设备 ID（20位国标编码）
    pub device_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,
    pub parental: u8,
    pub safety_way: u8,
    pub register_way: u8,
    pub secrecy: u8,
    pub status: DeviceStatus,
}

impl From<&DeviceConfig> for DeviceRecord {
    fn from(cfg: &DeviceConfig) -> Self {
        Self {
            device_id: cfg.device_id.clone(),
            name: cfg.name.clone(),
            manufacturer: cfg.manufacturer.clone(),
            model: cfg.model.clone(),
            owner: cfg.owner.clone(),
            civil_code: cfg.civil_code.clone(),
            address: cfg.address.clone(),
            parental: cfg.parental,
            safety_way: cfg.safety_way,
            register_way: cfg.register_way,
            secrecy: cfg.secrecy,
            status: cfg.status,
        }
    }
}

/// 设备目录
pub struct DeviceRegistry {
    /// 配置顺序的设备列表，下标在进程生命周期内不变
    devices: RwLock<Vec<DeviceRecord>>,

    /// device_id -> 下标
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn new(records: Vec<DeviceRecord>) -> Result<Self> {
        let mut index = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if index.insert(record.device_id.clone(), i).is_some() {
                return Err(GbError::Config(format!(
                    "duplicate deviceID: {}",
                    record.device_id
                )));
            }
        }

        Ok(Self {
            devices: RwLock::new(records),
            index,
        })
    }

    pub fn from_config(devices: &[DeviceConfig]) -> Result<Self> {
        Self::new(devices.iter().map(DeviceRecord::from).collect())
    }

    /// 获取设备
    pub async fn get(&self, device_id: &str) -> Result<DeviceRecord> {
        let i = self.position(device_id)?;
        let devices = self.devices.read().await;
        Ok(devices[i].clone())
    }

    /// 列出所有设备（配置顺序）
    pub async fn list(&self) -> Vec<DeviceRecord> {
        self.devices.read().await.clone()
    }

    /// 更新设备状态，返回旧状态
    pub async fn set_status(&self, device_id: &str, status: DeviceStatus) -> Result<DeviceStatus> {
        let i = self.position(device_id)?;
        let mut devices = self.devices.write().await;
        let previous = std::mem::replace(&mut devices[i].status, status);

        if previous != status {
            tracing::info!(
                target: "gb28181::client",
                %device_id,
                from = %previous,
                to = %status,
                "Device status changed"
            );
        }

        Ok(previous)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.index.contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn position(&self, device_id: &str) -> Result<usize> {
        self.index
            .get(device_id)
            .copied()
            .ok_or_else(|| GbError::NotFound(device_id.to_string()))
    }
}
