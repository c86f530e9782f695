use crate::envoy::response::{inventory, inverters, production};
use crate::envoy::{endpoint, Endpoint, Error, Source};
use crate::metrics::{Cycle, Exporter, Fetch};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};

async fn fetch<S, T, F>(source: &S, endpoint: &'static Endpoint, parse: F) -> Fetch<T>
where
    S: Source + ?Sized,
    F: FnOnce(Value) -> Result<T, Error>,
{
    let start = Instant::now();
    let response = source.fetch(endpoint).await;
    let duration = start.elapsed();

    let (raw, parsed) = match response {
        Ok(value) => {
            log::info!(
                "{} response from envoy, duration {:.3}s",
                endpoint.name,
                duration.as_secs_f64()
            );
            (Some(value.clone()), parse(value))
        }
        Err(e) => (None, Err(e)),
    };

    if let Err(e) = &parsed {
        log::error!("Failed to request {} from envoy: {}", endpoint.name, e);
    }

    Fetch {
        endpoint,
        duration,
        raw,
        parsed,
    }
}

/// Request every endpoint once and publish the result.
///
/// Never fails: each endpoint that cannot be read is logged and keeps its previous metrics.
pub async fn poll_once<S: Source + ?Sized>(source: &S, exporter: &Exporter) {
    let start = Instant::now();

    let inventory = fetch(source, endpoint::INVENTORY, inventory::parse).await;
    let production = fetch(source, endpoint::PRODUCTION, production::parse).await;
    let inverters = fetch(source, endpoint::INVERTERS, inverters::parse).await;

    let duration = start.elapsed();
    exporter.publish(Cycle {
        duration,
        inventory,
        production,
        inverters,
    });

    log::info!(
        "Requesting information from envoy done in {:.3}s.",
        duration.as_secs_f64()
    );
}

/// Poll forever, starting a cycle at most once per `interval`.
pub async fn run<S: Source>(source: S, exporter: Arc<Exporter>, interval: Duration) {
    let mut ticker = time::interval(interval);
    /* a slow cycle pushes the schedule back instead of firing a burst */
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        poll_once(&source, &exporter).await;
    }
}
