use clap::Parser;
use envoy_exporter::metrics::Exporter;
use envoy_exporter::settings::{read_settings, Overrides};
use envoy_exporter::{envoy, poller, routes};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "envoy-exporter", version)]
#[command(about = "Prometheus exporter for information from Enphase Envoy.")]
struct Cli {
    /// Address of Enphase Envoy.
    #[arg(short, long)]
    envoy: Option<String>,

    /// Minimum time between requests to Envoy, in seconds.
    #[arg(short = 't', long)]
    min_request_interval: Option<u64>,

    /// Port number for prometheus to scrape from.
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to listen on.
    #[arg(long)]
    address: Option<String>,

    /// Timeout of a single request to Envoy, in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Debug output.
    #[arg(short, long)]
    debug: bool,
}

impl From<Cli> for Overrides {
    fn from(cli: Cli) -> Self {
        Overrides {
            host: cli.envoy,
            port: cli.port,
            address: cli.address,
            interval: cli.min_request_interval,
            timeout: cli.timeout,
            debug: cli.debug,
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    let settings = read_settings(&Cli::parse().into())?;
    init_logging(settings.debug);

    log::info!(
        "Prometheus exporter for Enphase Envoy starting up. Reading data from {} every {}s, publishing on port {}.",
        settings.host,
        settings.interval,
        settings.port
    );

    let exporter = Arc::new(Exporter::new()?);
    let client = envoy::client(&settings.host, settings.timeout())?;
    log::debug!("envoy base url: {}", client.base_url());
    tokio::spawn(poller::run(client, exporter.clone(), settings.interval()));

    let figment = rocket::Config::figment()
        .merge(("port", settings.port))
        .merge(("address", settings.address.as_str()));

    routes::mount(rocket::custom(figment), exporter)
        .launch()
        .await
        .map_err(|e| anyhow::anyhow!("metrics server failed: {}", e))?;

    log::debug!("Server finished.");
    Ok(())
}
