use tokio::signal;
use tracing::info;

/// 关闭信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Term,

    /// SIGINT - Ctrl+C
    Interrupt,

    /// 控制台 quit
    Console,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Term => f.write_str("SIGTERM"),
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Console => f.write_str("console"),
        }
    }
}

/// 等待系统信号
#[cfg(unix)]
pub async fn wait_for_system_signal() -> std::io::Result<ShutdownSignal> {
    use signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = sigterm.recv() => ShutdownSignal::Term,
        _ = sigint.recv() => ShutdownSignal::Interrupt,
    };
    info!(target: "gbclientd", signal = %received, "Received shutdown signal");
    Ok(received)
}

/// 等待系统信号（Windows 版本）
#[cfg(not(unix))]
pub async fn wait_for_system_signal() -> std::io::Result<ShutdownSignal> {
    signal::ctrl_c().await?;
    info!(target: "gbclientd", "Received Ctrl+C");
    Ok(ShutdownSignal::Interrupt)
}
