// GB28181 SDP
// 解析平台 INVITE 中的媒体请求，生成设备侧应答

use crate::error::{GbError, Result};
use std::fmt;

/// SDP 会话描述
#[derive(Debug, Clone, PartialEq)]
pub struct SdpSession {
    pub version: u8,

    /// o= 中的用户名（GB28181 中为设备/平台编码）
    pub session_id: String,

    /// Play / Playback / Download
    pub session_name: String,

    pub connection: SdpConnection,

    /// t= 起止时间，实时流为 0 0
    pub timing: (u64, u64),

    /// y= 行携带的 SSRC，原样保留（十位十进制）
    pub ssrc: Option<String>,

    pub media: Vec<SdpMedia>,
}

/// SDP 连接信息
#[derive(Debug, Clone, PartialEq)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

/// SDP 媒体描述
#[derive(Debug, Clone, PartialEq)]
pub struct SdpMedia {
    /// video/audio
    pub media_type: String,
    pub port: u16,
    /// RTP/AVP 或 TCP/RTP/AVP
    pub protocol: String,
    pub formats: Vec<u8>,
    pub rtpmap: Vec<RtpMap>,
    pub attributes: Vec<String>,
}

/// RTP 映射
#[derive(Debug, Clone, PartialEq)]
pub struct RtpMap {
    pub payload_type: u8,
    /// PS/H264/MPEG4
    pub encoding_name: String,
    pub clock_rate: u32,
}

impl SdpMedia {
    /// a=setup:active|passive
    pub fn setup(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find_map(|a| a.strip_prefix("setup:"))
            .map(str::trim)
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol.to_ascii_uppercase().starts_with("TCP/")
    }

    /// 首选负载类型：优先 PS，其次第一个格式
    pub fn preferred_payload(&self) -> Option<u8> {
        self.rtpmap
            .iter()
            .find(|m| m.encoding_name.eq_ignore_ascii_case("PS"))
            .map(|m| m.payload_type)
            .or_else(|| self.formats.first().copied())
    }
}

impl SdpSession {
    pub fn new(session_id: String, ip: String) -> Self {
        Self {
            version: 0,
            session_id,
            session_name: "Play".to_string(),
            connection: SdpConnection {
                network_type: "IN".to_string(),
                address_type: "IP4".to_string(),
                address: ip,
            },
            timing: (0, 0),
            ssrc: None,
            media: Vec::new(),
        }
    }

    /// 第一个视频媒体
    pub fn video(&self) -> Option<&SdpMedia> {
        self.media
            .iter()
            .find(|m| m.media_type.eq_ignore_ascii_case("video"))
    }

    /// 设备侧应答：sendonly，PS/90000，回显 SSRC 与会话名
    pub fn answer(offer: &SdpSession, device_id: &str, local_ip: &str, media_port: u16) -> Result<Self> {
        let video = offer
            .video()
            .ok_or_else(|| GbError::Protocol("offer has no video media".to_string()))?;

        let payload_type = video.preferred_payload().unwrap_or(96);
        let encoding_name = video
            .rtpmap
            .iter()
            .find(|m| m.payload_type == payload_type)
            .map(|m| m.encoding_name.clone())
            .unwrap_or_else(|| "PS".to_string());

        let mut attributes = vec!["sendonly".to_string()];
        if video.is_tcp() {
            // 角色与平台相反
            let setup = match video.setup() {
                Some("active") => "passive",
                _ => "active",
            };
            attributes.push(format!("setup:{}", setup));
            attributes.push("connection:new".to_string());
        }

        let mut answer = SdpSession::new(device_id.to_string(), local_ip.to_string());
        answer.session_name = offer.session_name.clone();
        answer.timing = offer.timing;
        answer.ssrc = offer.ssrc.clone();
        answer.media.push(SdpMedia {
            media_type: "video".to_string(),
            port: media_port,
            protocol: video.protocol.clone(),
            formats: vec![payload_type],
            rtpmap: vec![RtpMap {
                payload_type,
                encoding_name,
                clock_rate: 90000,
            }],
            attributes,
        });

        Ok(answer)
    }

    /// 从字符串解析 SDP
    pub fn parse(sdp: &str) -> Result<Self> {
        let mut session = SdpSession::new(String::new(), String::new());
        session.session_name = String::new();

        let mut current_media: Option<SdpMedia> = None;

        for line in sdp.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key {
                "v" => {
                    session.version = value.trim().parse().unwrap_or(0);
                }
                "o" => {
                    if let Some(id) = value.split_whitespace().next() {
                        session.session_id = id.to_string();
                    }
                }
                "s" => {
                    session.session_name = value.trim().to_string();
                }
                "c" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(GbError::Protocol(format!("invalid c= line: {}", value)));
                    }
                    session.connection = SdpConnection {
                        network_type: parts[0].to_string(),
                        address_type: parts[1].to_string(),
                        address: parts[2].to_string(),
                    };
                }
                "t" => {
                    let mut parts = value.split_whitespace().map(|v| v.parse().unwrap_or(0));
                    session.timing = (
                        parts.next().unwrap_or(0),
                        parts.next().unwrap_or(0),
                    );
                }
                "y" => {
                    let ssrc = value.trim();
                    if !ssrc.is_empty() && ssrc.chars().all(|c| c.is_ascii_digit()) {
                        session.ssrc = Some(ssrc.to_string());
                    }
                }
                "m" => {
                    if let Some(media) = current_media.take() {
                        session.media.push(media);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 4 {
                        return Err(GbError::Protocol(format!("invalid m= line: {}", value)));
                    }
                    let port = parts[1]
                        .parse()
                        .map_err(|_| GbError::Protocol(format!("invalid media port: {}", parts[1])))?;

                    current_media = Some(SdpMedia {
                        media_type: parts[0].to_string(),
                        port,
                        protocol: parts[2].to_string(),
                        formats: parts[3..].iter().filter_map(|s| s.parse().ok()).collect(),
                        rtpmap: Vec::new(),
                        attributes: Vec::new(),
                    });
                }
                "a" => {
                    let Some(media) = current_media.as_mut() else {
                        continue;
                    };
                    match value.strip_prefix("rtpmap:").and_then(parse_rtpmap) {
                        Some(rtpmap) => media.rtpmap.push(rtpmap),
                        None => media.attributes.push(value.to_string()),
                    }
                }
                _ => {}
            }
        }

        if let Some(media) = current_media {
            session.media.push(media);
        }

        Ok(session)
    }
}

fn parse_rtpmap(value: &str) -> Option<RtpMap> {
    let (pt, rest) = value.split_once(' ')?;
    let (name, clock) = rest.split_once('/')?;
    let clock = clock.split('/').next()?;
    Some(RtpMap {
        payload_type: pt.trim().parse().ok()?,
        encoding_name: name.trim().to_string(),
        clock_rate: clock.trim().parse().unwrap_or(90000),
    })
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(
            f,
            "o={} 0 0 {} {} {}\r\n",
            self.session_id,
            self.connection.network_type,
            self.connection.address_type,
            self.connection.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        write!(
            f,
            "c={} {} {}\r\n",
            self.connection.network_type, self.connection.address_type, self.connection.address
        )?;
        write!(f, "t={} {}\r\n", self.timing.0, self.timing.1)?;

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|f| f.to_string()).collect();
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            )?;
            for attr in &media.attributes {
                write!(f, "a={}\r\n", attr)?;
            }
            for rtpmap in &media.rtpmap {
                write!(
                    f,
                    "a=rtpmap:{} {}/{}\r\n",
                    rtpmap.payload_type, rtpmap.encoding_name, rtpmap.clock_rate
                )?;
            }
        }

        // y= 紧跟在媒体描述之后（GB28181 附录 F）
        if let Some(ssrc) = &self.ssrc {
            write!(f, "y={}\r\n", ssrc)?;
        }

        Ok(())
    }
}
