/// A JSON resource served by the Envoy's local API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Short name used in logs, metric names and the debug pages.
    pub name: &'static str,
    pub path: &'static str,
}

pub const INVENTORY: &Endpoint = &Endpoint {
    name: "inventory",
    path: "/inventory.json",
};

pub const PRODUCTION: &Endpoint = &Endpoint {
    name: "production",
    path: "/production.json?details=1",
};

pub const INVERTERS: &Endpoint = &Endpoint {
    name: "inverters",
    path: "/api/v1/production/inverters",
};

/// Endpoints in the order they are requested during a poll cycle.
pub const ALL: [&Endpoint; 3] = [INVENTORY, PRODUCTION, INVERTERS];
