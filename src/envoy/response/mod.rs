pub mod inventory;
pub mod inverters;
pub mod production;

use serde::Deserialize;
use serde_json::Value;

/* The Envoy reports epoch seconds as strings in the inventory and as numbers elsewhere */
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum Epoch {
    Seconds(i64),
    Fractional(f64),
    Text(String),
}

impl Epoch {
    pub(crate) fn seconds(&self) -> Option<i64> {
        match self {
            Epoch::Seconds(s) => Some(*s),
            Epoch::Fractional(s) => Some(s.trunc() as i64),
            Epoch::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Read a boolean flag that some firmware versions encode as 0/1.
pub(crate) fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use crate::envoy::Error;
    use crate::model::{DeviceKind, Direction};
    use std::fs;
    use std::path::PathBuf;

    fn read_resource(filename: &str) -> serde_json::Value {
        let mut d = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        d.push(format!("resources/test/{}", filename));
        serde_json::from_str(&fs::read_to_string(d.as_path()).unwrap()).unwrap()
    }

    #[test]
    fn inventory() {
        let output = super::inventory::parse(read_resource("inventory.json")).unwrap();
        let inverters: Vec<_> = output
            .devices
            .iter()
            .filter(|d| d.kind == DeviceKind::Inverter)
            .map(|d| d.serial_num.as_str())
            .collect();
        assert_eq!(vec!["121935144671", "121935144672", "121935144673"], inverters);

        let first = &output.devices[0];
        assert_eq!(Some("800-00598-r02".to_string()), first.part_num);
        assert_eq!(Some(1573554938), first.installed);
        assert_eq!(Some(1612345678), first.last_report);
        assert_eq!(Some(vec!["envoy.global.ok".to_string()]), first.status);

        let relay = output
            .devices
            .iter()
            .find(|d| d.kind == DeviceKind::Relay)
            .and_then(|d| d.relay.as_ref())
            .unwrap();
        assert_eq!(Some(3), relay.line_count);
        assert_eq!(vec![1, 2, 3], relay.connected_lines().collect::<Vec<_>>());
    }

    #[test]
    fn production() {
        let output = super::production::parse(read_resource("production.json")).unwrap();
        let inverters = output.inverters.unwrap();
        assert_eq!(Some(3.0), inverters.active_count);
        assert_eq!(Some(625.0), inverters.watt_now);
        assert_eq!(Some(8372044.0), inverters.watt_hour_lifetime);

        assert_eq!(3, output.meters.len());
        let production = &output.meters[0];
        assert_eq!(Direction::Production, production.direction);
        assert_eq!("production", production.measurement_type);
        assert_eq!(3, production.lines.len());
        assert_eq!(Some(231.4), production.lines[1].rms_voltage);
        assert_eq!("total-consumption", output.meters[1].measurement_type);
        assert_eq!("net-consumption", output.meters[2].measurement_type);
    }

    #[test]
    fn inverters() {
        let output = super::inverters::parse(read_resource("inverters.json")).unwrap();
        assert_eq!(3, output.len());
        assert_eq!("121935144671", output[0].serial_num);
        assert_eq!(Some(1612345678), output[0].last_report);
        assert_eq!(Some(211.0), output[0].watt_now);
        assert_eq!(Some(295.0), output[0].watt_max);
    }

    #[test]
    fn invalid_json() {
        let mut d = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        d.push("resources/test/invalid_json.json");
        let text = fs::read_to_string(d.as_path()).unwrap();

        match crate::envoy::decode(text.clone()) {
            Err(Error::InvalidResponse(body, _)) => assert_eq!(text, body),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn valid_json_wrong_shape() {
        let value = read_resource("valid_json.json");
        assert!(super::inventory::parse(value.clone()).is_err());
        assert!(super::inverters::parse(value.clone()).is_err());
        assert!(super::production::parse(value).is_err());
    }
}
