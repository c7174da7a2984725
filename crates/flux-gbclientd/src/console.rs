// 标准输入控制台
// 支持 `status <deviceID> ON|OFF`、`state`、`quit`

use flux_gbclient::{DeviceStatus, UserAgent};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status { device_id: String, status: DeviceStatus },
    State,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "status" => {
            let device_id = parts
                .next()
                .ok_or_else(|| "usage: status <deviceID> ON|OFF".to_string())?;
            let status = parts
                .next()
                .ok_or_else(|| "usage: status <deviceID> ON|OFF".to_string())?
                .parse::<DeviceStatus>()
                .map_err(|e| e.to_string())?;
            Command::Status {
                device_id: device_id.to_string(),
                status,
            }
        }
        "state" => Command::State,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command: {}", other)),
    };

    if parts.next().is_some() {
        return Err("unexpected trailing arguments".to_string());
    }
    Ok(Some(command))
}

/// 逐行读取 stdin，直到 EOF 或 quit
pub async fn run(agent: Arc<UserAgent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                // 后台运行时 stdin 可能直接关闭，保持运行
                std::future::pending::<()>().await;
                return;
            }
            Err(e) => {
                tracing::warn!(target: "gbclientd", error = %e, "Console read failed");
                std::future::pending::<()>().await;
                return;
            }
        };

        match parse_command(&line) {
            Ok(None) => {}
            Ok(Some(Command::Status { device_id, status })) => {
                if let Err(e) = agent.set_device_status(&device_id, status).await {
                    tracing::warn!(target: "gbclientd", %device_id, error = %e, "Status command failed");
                }
            }
            Ok(Some(Command::State)) => {
                tracing::info!(
                    target: "gbclientd",
                    state = %agent.registration_state(),
                    "Registration state"
                );
            }
            Ok(Some(Command::Quit)) => return,
            Err(e) => tracing::warn!(target: "gbclientd", error = %e, "Invalid console command"),
        }
    }
}
