mod gateway;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use wagate_core::config::{self, shellexpand, Config};

#[derive(Parser)]
#[command(name = "wagate", version, about = "Multi-tenant WhatsApp session gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore every paired session and run until Ctrl-C.
    Start,
    /// Link a new session by scanning a QR code.
    Pair {
        #[arg(long)]
        session: String,
        #[arg(long)]
        tenant: String,
    },
    /// Send one text message through a paired session.
    Send {
        #[arg(long)]
        session: String,
        #[arg(long)]
        tenant: String,
        /// Phone number or JID.
        #[arg(long)]
        to: String,
        #[arg(long)]
        text: String,
    },
    /// List known sessions.
    Status,
}

/// Stdout plus a daily log file under `{data_dir}/logs`. The returned guard
/// must live until exit so buffered lines get flushed.
fn init_logging(cfg: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.gateway.log_level));
    let log_dir = format!("{}/logs", shellexpand(&cfg.gateway.data_dir));
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "wagate.log"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let _log_guard = init_logging(&cfg);

    match cli.command {
        Commands::Start => {
            println!("wagate: starting gateway...");
            let gw = gateway::Gateway::build(cfg).await?;
            gw.run().await?;
        }
        Commands::Pair { session, tenant } => {
            let gw = gateway::Gateway::build(cfg).await?;
            gw.pair(&session, &tenant).await?;
        }
        Commands::Send {
            session,
            tenant,
            to,
            text,
        } => {
            let gw = gateway::Gateway::build(cfg).await?;
            let sent = gw.send_once(&session, &tenant, &to, &text).await?;
            println!(
                "sent {} to {}{}",
                sent.id,
                sent.jid,
                if sent.fallback_used { " (plain-text fallback)" } else { "" }
            );
        }
        Commands::Status => {
            let gw = gateway::Gateway::build(cfg).await?;
            let instances = gw.store().list_instances().await?;
            println!("wagate status\n");
            println!("Config: {}", cli.config);
            if instances.is_empty() {
                println!("  no sessions registered");
            }
            for inst in instances {
                let sync = match inst.sync_status.as_deref() {
                    Some(status) => format!("{status} {}%", inst.sync_percent),
                    None => "-".to_string(),
                };
                println!(
                    "  {} (tenant {}): {} | sync {} | {}",
                    inst.session_id,
                    inst.company_id,
                    inst.status,
                    sync,
                    inst.owner_jid.as_deref().unwrap_or("unlinked"),
                );
            }
        }
    }

    Ok(())
}
