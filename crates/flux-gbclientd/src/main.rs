use clap::{Parser, Subcommand, ValueEnum};
use flux_gbclient::{ConfigLoader, LoggingMediaPlane, UserAgent};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod console;
mod signal;

use signal::ShutdownSignal;

#[derive(Parser, Debug)]
#[command(author, version, about = "GB28181 simulated front-end device")]
struct Args {
    /// JSON 配置文件
    #[arg(short, long, default_value = "sim.json")]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// 不读取标准输入命令
    #[arg(long)]
    no_console: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 打印版本
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(Command::Version) = args.command {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_tracing(args.log_format);

    let config = ConfigLoader::new(&args.config)
        .load()
        .map_err(|e| anyhow::anyhow!("failed to load {}: {}", args.config.display(), e))?;

    tracing::info!(
        target: "gbclientd",
        config = %args.config.display(),
        gb_id = %config.gb_id,
        server = %config.server_addr,
        devices = config.devices.len(),
        "Configuration loaded"
    );

    let agent = Arc::new(UserAgent::new(config, Arc::new(LoggingMediaPlane))?);
    agent.start().await?;

    let mut receiver = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.handle_incoming_messages().await })
    };

    let console = {
        let agent = agent.clone();
        let enabled = !args.no_console;
        async move {
            if enabled {
                console::run(agent).await;
            } else {
                std::future::pending::<()>().await;
            }
        }
    };

    let outcome = tokio::select! {
        signal = signal::wait_for_system_signal() => match signal {
            Ok(signal) => {
                tracing::info!(target: "gbclientd", %signal, "Stopping");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("failed to install signal handler: {}", e)),
        },
        _ = console => {
            tracing::info!(target: "gbclientd", signal = %ShutdownSignal::Console, "Stopping");
            Ok(())
        }
        result = &mut receiver => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::anyhow!(e)),
                Err(e) => Err(anyhow::anyhow!("receive loop panicked: {}", e)),
            }
        }
    };

    agent.shutdown().await?;
    if !receiver.is_finished() {
        let _ = receiver.await;
    }

    outcome
}
