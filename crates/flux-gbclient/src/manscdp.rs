// GB28181 MANSCDP 消息体
// 解析平台下发的 Query/Control，生成设备侧 Response/Notify

use crate::error::{GbError, Result};
use crate::registry::{DeviceRecord, DeviceStatus};
use quick_xml::de::from_str;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use std::fmt::Write as _;

const XML_DECL: &str = r#"<?xml version="1.0" encoding="GB2312"?>"#;

/// 根节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Query,
    Control,
    Notify,
    Response,
}

impl RootKind {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"Query" => Some(RootKind::Query),
            b"Control" => Some(RootKind::Control),
            b"Notify" => Some(RootKind::Notify),
            b"Response" => Some(RootKind::Response),
            _ => None,
        }
    }
}

/// 查询命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryCommand {
    Catalog,
    DeviceInfo,
    DeviceStatus,
    RecordInfo,
    Other(String),
}

impl QueryCommand {
    pub fn parse(cmd_type: &str) -> Self {
        match cmd_type {
            "Catalog" => QueryCommand::Catalog,
            "DeviceInfo" => QueryCommand::DeviceInfo,
            "DeviceStatus" => QueryCommand::DeviceStatus,
            "RecordInfo" => QueryCommand::RecordInfo,
            other => QueryCommand::Other(other.to_string()),
        }
    }
}

/// 消息体公共字段
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ManscdpBody {
    pub cmd_type: String,

    #[serde(rename = "SN", default)]
    pub sn: u32,

    #[serde(rename = "DeviceID")]
    pub device_id: String,

    /// RecordInfo 查询时间段
    #[serde(default)]
    pub start_time: Option<String>,

    #[serde(default)]
    pub end_time: Option<String>,

    #[serde(rename = "Type", default)]
    pub record_type: Option<String>,
}

/// 解析后的 MANSCDP 消息
#[derive(Debug, Clone, PartialEq)]
pub struct ManscdpMessage {
    pub kind: RootKind,
    pub body: ManscdpBody,
}

impl ManscdpMessage {
    pub fn parse(xml: &str) -> Result<Self> {
        let kind = root_kind(xml)?;
        let body: ManscdpBody = from_str(xml)?;
        Ok(Self { kind, body })
    }

    pub fn command(&self) -> QueryCommand {
        QueryCommand::parse(&self.body.cmd_type)
    }
}

fn root_kind(xml: &str) -> Result<RootKind> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = e.name();
                return RootKind::from_name(name.as_ref()).ok_or_else(|| {
                    GbError::Protocol(format!(
                        "unknown MANSCDP root: {}",
                        String::from_utf8_lossy(name.as_ref())
                    ))
                });
            }
            Ok(Event::Eof) => return Err(GbError::Protocol("empty MANSCDP body".to_string())),
            Ok(_) => continue,
            Err(e) => return Err(GbError::Protocol(format!("MANSCDP xml: {}", e))),
        }
    }
}

fn push_field(xml: &mut String, tag: &str, value: &str) {
    let _ = write!(xml, "<{tag}>{}</{tag}>\r\n", escape(value));
}

fn push_catalog_item(xml: &mut String, device: &DeviceRecord, parent_id: &str) {
    xml.push_str("<Item>\r\n");
    push_field(xml, "DeviceID", &device.device_id);
    push_field(xml, "Name", &device.name);
    push_field(xml, "Manufacturer", &device.manufacturer);
    push_field(xml, "Model", &device.model);
    push_field(xml, "Owner", &device.owner);
    push_field(xml, "CivilCode", &device.civil_code);
    push_field(xml, "Address", &device.address);
    push_field(xml, "Parental", &device.parental.to_string());
    push_field(xml, "ParentID", parent_id);
    push_field(xml, "SafetyWay", &device.safety_way.to_string());
    push_field(xml, "RegisterWay", &device.register_way.to_string());
    push_field(xml, "Secrecy", &device.secrecy.to_string());
    push_field(xml, "Status", device.status.as_str());
    xml.push_str("</Item>\r\n");
}

fn open(root: &str, cmd_type: &str, sn: u32, device_id: &str) -> String {
    let mut xml = format!("{}\r\n<{}>\r\n", XML_DECL, root);
    push_field(&mut xml, "CmdType", cmd_type);
    push_field(&mut xml, "SN", &sn.to_string());
    push_field(&mut xml, "DeviceID", device_id);
    xml
}

fn close(mut xml: String, root: &str) -> String {
    let _ = write!(xml, "</{}>\r\n", root);
    xml
}

/// Catalog 应答，按 `page_size` 分页；`SumNum` 为设备总数
pub fn catalog_responses(
    sn: u32,
    gb_id: &str,
    devices: &[DeviceRecord],
    page_size: usize,
) -> Vec<String> {
    let page_size = page_size.max(1);
    let total = devices.len();

    let pages: Vec<&[DeviceRecord]> = if devices.is_empty() {
        vec![devices]
    } else {
        devices.chunks(page_size).collect()
    };

    pages
        .into_iter()
        .map(|page| {
            let mut xml = open("Response", "Catalog", sn, gb_id);
            push_field(&mut xml, "SumNum", &total.to_string());
            let _ = write!(xml, "<DeviceList Num=\"{}\">\r\n", page.len());
            for device in page {
                push_catalog_item(&mut xml, device, gb_id);
            }
            xml.push_str("</DeviceList>\r\n");
            close(xml, "Response")
        })
        .collect()
}

/// DeviceInfo 应答内容
#[derive(Debug, Clone)]
pub struct DeviceInfoReply<'a> {
    pub device_id: &'a str,
    pub device_name: &'a str,
    pub manufacturer: &'a str,
    pub model: &'a str,
    pub firmware: &'a str,
    /// 仅对本端编码（NVR 视角）给出通道数
    pub channel: Option<usize>,
}

pub fn device_info_response(sn: u32, info: &DeviceInfoReply<'_>) -> String {
    let mut xml = open("Response", "DeviceInfo", sn, info.device_id);
    push_field(&mut xml, "DeviceName", info.device_name);
    push_field(&mut xml, "Result", "OK");
    push_field(&mut xml, "Manufacturer", info.manufacturer);
    push_field(&mut xml, "Model", info.model);
    push_field(&mut xml, "Firmware", info.firmware);
    if let Some(channel) = info.channel {
        push_field(&mut xml, "Channel", &channel.to_string());
    }
    close(xml, "Response")
}

pub fn device_status_response(sn: u32, device_id: &str, status: DeviceStatus) -> String {
    let mut xml = open("Response", "DeviceStatus", sn, device_id);
    push_field(&mut xml, "Result", "OK");
    push_field(
        &mut xml,
        "Online",
        if status.is_on() { "ONLINE" } else { "OFFLINE" },
    );
    push_field(&mut xml, "Status", "OK");
    push_field(&mut xml, "Encode", status.as_str());
    push_field(&mut xml, "Record", "OFF");
    push_field(
        &mut xml,
        "DeviceTime",
        &chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
    );
    close(xml, "Response")
}

/// 录像查询应答：模拟设备没有录像
pub fn record_info_response(sn: u32, device_id: &str, name: &str) -> String {
    let mut xml = open("Response", "RecordInfo", sn, device_id);
    push_field(&mut xml, "Name", name);
    push_field(&mut xml, "SumNum", "0");
    xml.push_str("<RecordList Num=\"0\">\r\n</RecordList>\r\n");
    close(xml, "Response")
}

pub fn keepalive_notify(sn: u32, gb_id: &str) -> String {
    let mut xml = open("Notify", "Keepalive", sn, gb_id);
    push_field(&mut xml, "Status", "OK");
    close(xml, "Notify")
}

/// 目录状态变化通知（`<Event>ON|OFF</Event>`）
pub fn catalog_status_notify(sn: u32, gb_id: &str, device: &DeviceRecord) -> String {
    let mut xml = open("Notify", "Catalog", sn, gb_id);
    push_field(&mut xml, "SumNum", "1");
    xml.push_str("<DeviceList Num=\"1\">\r\n<Item>\r\n");
    push_field(&mut xml, "DeviceID", &device.device_id);
    push_field(&mut xml, "Name", &device.name);
    push_field(&mut xml, "Status", device.status.as_str());
    push_field(&mut xml, "Event", device.status.as_str());
    xml.push_str("</Item>\r\n</DeviceList>\r\n");
    close(xml, "Notify")
}
