use ncphotosd::daemon::{DaemonConfig, DaemonRuntime};
use ncphotosd::events::{self, EventSender};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: ncphotosd [--once]");
        println!("  --once   Run a single sync cycle and exit");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = DaemonConfig::from_env()?;
    let (tx, rx) = events::channel();
    let forwarder = tokio::spawn(events::forward_events(rx, tokio::io::stdout()));

    let result = run(mode, config, tx).await;
    // The sender is gone once run returns, so the forwarder drains and exits.
    match forwarder.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!("failed to write events: {err}"),
        Err(err) => tracing::warn!("event forwarder stopped: {err}"),
    }
    result
}

async fn run(mode: CliMode, config: DaemonConfig, events: EventSender) -> anyhow::Result<()> {
    let daemon = DaemonRuntime::bootstrap(config, events).await?;
    if mode == CliMode::Once {
        let report = daemon.run_once().await?;
        tracing::info!(
            photos = report.photos.len(),
            failed = report.failed.len(),
            evicted = report.evicted.len(),
            "single sync cycle finished"
        );
        return Ok(());
    }
    daemon.run().await
}
