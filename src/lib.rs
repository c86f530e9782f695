pub mod envoy;
pub mod metrics;
pub mod model;
pub mod poller;
pub mod routes;
pub mod settings;
