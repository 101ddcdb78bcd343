use clap::Parser;
use taskd_server::config::{Args, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskd_server=info,libtaskd=info".into()),
        )
        .init();

    let config = ServerConfig::load(Args::parse())?;
    taskd_server::run(config, async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await
}
