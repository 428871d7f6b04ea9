use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use forgeq::config::ServerConfig;
use forgeq::server::Server;
use forgeq::shutdown;

#[derive(Parser, Debug)]
#[command(name = "forgeq")]
#[command(about = "A language-agnostic background job server", version)]
struct Args {
    /// Address to bind the command listener on
    #[arg(long, default_value = "127.0.0.1:7419")]
    bind: SocketAddr,

    /// Shared password required from every client (also FORGEQ_PASSWORD)
    #[arg(long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let password = args
        .password
        .or_else(|| std::env::var("FORGEQ_PASSWORD").ok());
    if password.is_none() {
        tracing::warn!("No password configured; production deployments must set one");
    }

    let mut config = ServerConfig::new(args.bind);
    config.password = password;

    let server = Server::new(config).await?;
    tracing::info!(
        pid = std::process::id(),
        addr = %server.local_addr(),
        "Starting forgeq, press Ctrl-C to stop"
    );

    let mut run = tokio::spawn(server.clone().run());
    tokio::select! {
        result = &mut run => result??,
        _ = shutdown::shutdown_signal() => {
            server.stop().await;
            run.await??;
        }
    }

    Ok(())
}
