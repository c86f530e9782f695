pub mod endpoint;
pub mod error;
pub mod response;

use async_trait::async_trait;
pub use endpoint::Endpoint;
pub use error::Error;
use serde_json::Value;
use std::time::Duration;

/// Something the poller can read Envoy JSON from.
#[async_trait]
pub trait Source: Send + Sync {
    async fn fetch(&self, endpoint: &Endpoint) -> Result<Value, Error>;
}

/// HTTP client for the Envoy's unauthenticated local API.
#[derive(Debug, Clone)]
pub struct EnvoyClient {
    base_url: String,
    client: reqwest::Client,
}

/// Build a client for `host`, which is either a bare hostname or a full `http(s)://` URL.
pub fn client(host: &str, timeout: Duration) -> Result<EnvoyClient, Error> {
    let client = reqwest::ClientBuilder::new()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| Error::InternalError(e.to_string()))?;

    Ok(EnvoyClient {
        base_url: base_url(host),
        client,
    })
}

fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

/// Map transport-level failures to Error
fn map_request_err(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout(error.to_string())
    } else if let Some(status) = error.status() {
        Error::Status(status)
    } else {
        Error::Request(error.to_string())
    }
}

impl EnvoyClient {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Source for EnvoyClient {
    async fn fetch(&self, endpoint: &Endpoint) -> Result<Value, Error> {
        let url = format!("{}{}", self.base_url, endpoint.path);
        log::debug!("requesting {} from {}", endpoint.name, url);

        let response = self.client.get(&url).send().await.map_err(map_request_err)?;
        let status = response.status();
        if !status.is_success() {
            log::debug!("{} response headers: {:?}", endpoint.name, response.headers());
            return Err(Error::Status(status));
        }

        let text = response.text().await.map_err(map_request_err)?;
        log::trace!("endpoint: {}, response_text: {}", endpoint.name, text);

        decode(text)
    }
}

/// Decode a response body, keeping the body around when it is not JSON.
pub(crate) fn decode(text: String) -> Result<Value, Error> {
    serde_json::from_str::<Value>(&text).map_err(|e| Error::InvalidResponse(text, e.to_string()))
}
