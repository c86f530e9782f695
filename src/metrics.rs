use crate::envoy::{endpoint, Endpoint, Error};
use crate::model::{
    Device, DeviceKind, Inventory, InverterReading, Production, Relay, Timestamp,
};
use chrono::{DateTime, TimeZone, Utc};
use prometheus::{opts, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::time::Duration;

const SERIAL: &str = "serial_num";
const NET_CONSUMPTION: &str = "net-consumption";

/// Result of requesting one endpoint during a poll cycle.
#[derive(Debug)]
pub struct Fetch<T> {
    pub endpoint: &'static Endpoint,
    pub duration: Duration,
    /// Decoded JSON body, present whenever the Envoy answered with valid JSON.
    pub raw: Option<Value>,
    pub parsed: Result<T, Error>,
}

/// Everything gathered during one poll cycle, published in one go.
#[derive(Debug)]
pub struct Cycle {
    pub duration: Duration,
    pub inventory: Fetch<Inventory>,
    pub production: Fetch<Production>,
    pub inverters: Fetch<Vec<InverterReading>>,
}

/// Last successfully received body of an endpoint, kept for the debug pages.
#[derive(Debug, Clone)]
pub struct LastResponse {
    pub json: Value,
    pub duration: Duration,
    pub received: DateTime<Utc>,
}

struct RequestGauges {
    duration: Gauge,
    failed: Gauge,
}

struct Gauges {
    inverters_active: Gauge,
    inverters_watt_now: Gauge,
    inverters_watt_hour_lifetime: Gauge,
    meter_watt_now: GaugeVec,
    meter_watt_hour_lifetime: GaugeVec,

    device_metadata: GaugeVec,
    device_producing: GaugeVec,
    device_communicating: GaugeVec,
    device_provisioned: GaugeVec,
    device_operating: GaugeVec,
    device_last_report: GaugeVec,
    device_status: GaugeVec,

    inverter_watt_now: GaugeVec,
    inverter_watt_max: GaugeVec,
    inverter_last_report: GaugeVec,

    relay_line_count: GaugeVec,
    relay_line_connected: GaugeVec,
    relay_watt_now: GaugeVec,
    relay_rms_current: GaugeVec,
    relay_rms_voltage: GaugeVec,
    relay_apparent_power: GaugeVec,
    relay_power_factor: GaugeVec,

    data_request_duration: Gauge,
    requests: BTreeMap<&'static str, RequestGauges>,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<Gauge> {
    let gauge = Gauge::with_opts(opts!(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<GaugeVec> {
    let gauge = GaugeVec::new(opts!(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl Gauges {
    fn register(r: &Registry) -> prometheus::Result<Gauges> {
        let line = &[SERIAL, "line", "direction"];

        let mut requests = BTreeMap::new();
        for endpoint in endpoint::ALL {
            requests.insert(
                endpoint.name,
                RequestGauges {
                    duration: gauge(
                        r,
                        &format!("envoy_{}_request_duration_seconds", endpoint.name),
                        &format!(
                            "The time it took to request {} from the envoy, in seconds.",
                            endpoint.name
                        ),
                    )?,
                    failed: gauge(
                        r,
                        &format!("envoy_{}_request_failed_count", endpoint.name),
                        "Sequential counter of failed requests, reset on successful request.",
                    )?,
                },
            );
        }

        Ok(Gauges {
            inverters_active: gauge(
                r,
                "envoy_production_inverters_active_count",
                "Active inverter count.",
            )?,
            inverters_watt_now: gauge(
                r,
                "envoy_production_inverters_watt_now",
                "Watt produced now.",
            )?,
            inverters_watt_hour_lifetime: gauge(
                r,
                "envoy_production_inverters_watt_hour_lifetime",
                "Watt/hour produced over the lifetime.",
            )?,
            meter_watt_now: gauge_vec(
                r,
                "envoy_meter_watt_now",
                "Watt measured now by the integrated meter.",
                &["direction", "measurement_type"],
            )?,
            meter_watt_hour_lifetime: gauge_vec(
                r,
                "envoy_meter_watt_hour_lifetime",
                "Watt/hour measured over the lifetime by the integrated meter.",
                &["direction", "measurement_type"],
            )?,
            device_metadata: gauge_vec(
                r,
                "envoy_device_metadata_info",
                "Device metadata, always 1.",
                &[
                    SERIAL,
                    "device_type",
                    "part_number",
                    "installed_date",
                    "image_loaded_date",
                ],
            )?,
            device_producing: gauge_vec(
                r,
                "envoy_device_producing",
                "Indicates whether the device is producing data.",
                &[SERIAL],
            )?,
            device_communicating: gauge_vec(
                r,
                "envoy_device_communicating",
                "Indicates whether the device is communicating.",
                &[SERIAL],
            )?,
            device_provisioned: gauge_vec(
                r,
                "envoy_device_provisioned",
                "Indicates whether the device is provisioned.",
                &[SERIAL],
            )?,
            device_operating: gauge_vec(
                r,
                "envoy_device_operating",
                "Indicates whether the device is operating.",
                &[SERIAL],
            )?,
            device_last_report: gauge_vec(
                r,
                "envoy_device_last_report_timestamp_seconds",
                "Time the device last reported to the envoy.",
                &[SERIAL],
            )?,
            device_status: gauge_vec(
                r,
                "envoy_device_status",
                "Status codes currently reported for the device, always 1.",
                &[SERIAL, "status"],
            )?,
            inverter_watt_now: gauge_vec(
                r,
                "envoy_inverter_watt_now",
                "Watt produced by the inverter at its last report.",
                &[SERIAL],
            )?,
            inverter_watt_max: gauge_vec(
                r,
                "envoy_inverter_watt_max",
                "Maximum watt ever reported by the inverter.",
                &[SERIAL],
            )?,
            inverter_last_report: gauge_vec(
                r,
                "envoy_inverter_last_report_timestamp_seconds",
                "Time of the inverter's last production report.",
                &[SERIAL],
            )?,
            relay_line_count: gauge_vec(
                r,
                "envoy_relay_line_count",
                "Number of lines of the relay.",
                &[SERIAL],
            )?,
            relay_line_connected: gauge_vec(
                r,
                "envoy_relay_line_connected",
                "Indicates whether the relay line is connected.",
                &[SERIAL, "line"],
            )?,
            relay_watt_now: gauge_vec(r, "envoy_relay_watt_now", "Watt on the line now.", line)?,
            relay_rms_current: gauge_vec(
                r,
                "envoy_relay_rms_current",
                "RMS current on the line.",
                line,
            )?,
            relay_rms_voltage: gauge_vec(
                r,
                "envoy_relay_rms_voltage",
                "RMS voltage on the line.",
                line,
            )?,
            relay_apparent_power: gauge_vec(
                r,
                "envoy_relay_apparent_power",
                "Apparent power on the line.",
                line,
            )?,
            relay_power_factor: gauge_vec(
                r,
                "envoy_relay_power_factor",
                "Power factor of the line.",
                line,
            )?,
            data_request_duration: gauge(
                r,
                "envoy_data_request_duration_seconds",
                "The total time it took to request data from the envoy, in seconds.",
            )?,
            requests,
        })
    }
}

#[derive(Default)]
struct Published {
    devices: BTreeMap<String, Device>,
    readings: BTreeMap<String, InverterReading>,
    last_responses: BTreeMap<&'static str, LastResponse>,
}

/// Owns the Prometheus registry and everything learned from the Envoy so far.
///
/// The poller is the only writer; a whole cycle is applied under one write lock so a scrape
/// never observes half of it.
pub struct Exporter {
    registry: Registry,
    gauges: Gauges,
    state: RwLock<Published>,
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

pub(crate) fn format_date(timestamp: Option<Timestamp>) -> String {
    timestamp
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .map(|date| date.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn metadata_labels(device: &Device) -> [String; 5] {
    [
        device.serial_num.to_owned(),
        device.kind.as_str().to_string(),
        device.part_num.to_owned().unwrap_or_default(),
        format_date(device.installed),
        format_date(device.image_loaded),
    ]
}

/// Overlay the fields present in `update` on top of `known`.
fn merge(known: &mut Device, update: &Device) {
    fn take<T: Clone>(known: &mut Option<T>, update: &Option<T>) {
        if update.is_some() {
            *known = update.clone();
        }
    }

    take(&mut known.part_num, &update.part_num);
    take(&mut known.installed, &update.installed);
    take(&mut known.image_loaded, &update.image_loaded);
    take(&mut known.last_report, &update.last_report);
    take(&mut known.producing, &update.producing);
    take(&mut known.communicating, &update.communicating);
    take(&mut known.provisioned, &update.provisioned);
    take(&mut known.operating, &update.operating);
    take(&mut known.status, &update.status);
    take(&mut known.relay, &update.relay);
}

fn set(vec: &GaugeVec, labels: &[&str], value: Option<f64>) {
    if let Some(value) = value {
        vec.with_label_values(labels).set(value);
    }
}

fn set_gauge(gauge: &Gauge, value: Option<f64>) {
    if let Some(value) = value {
        gauge.set(value);
    }
}

impl Exporter {
    pub fn new() -> prometheus::Result<Exporter> {
        let registry = Registry::new();
        let gauges = Gauges::register(&registry)?;

        Ok(Exporter {
            registry,
            gauges,
            state: RwLock::new(Published::default()),
        })
    }

    /// Apply the outcome of a poll cycle. Failed fetches leave their metrics untouched.
    pub fn publish(&self, cycle: Cycle) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(_) => {
                log::error!("metrics state lock poisoned, dropping poll cycle");
                return;
            }
        };

        if let Some(inventory) = self.record_request(&mut state, cycle.inventory) {
            self.publish_inventory(&mut state, &inventory);
        }
        if let Some(production) = self.record_request(&mut state, cycle.production) {
            self.publish_production(&state, &production);
        }
        if let Some(readings) = self.record_request(&mut state, cycle.inverters) {
            self.publish_inverters(&mut state, readings);
        }

        self.gauges
            .data_request_duration
            .set(cycle.duration.as_secs_f64());
    }

    fn record_request<T>(&self, state: &mut Published, fetch: Fetch<T>) -> Option<T> {
        let name = fetch.endpoint.name;
        let gauges = self.gauges.requests.get(name);
        match fetch.parsed {
            Ok(parsed) => {
                if let Some(gauges) = gauges {
                    gauges.failed.set(0.0);
                    gauges.duration.set(fetch.duration.as_secs_f64());
                }
                if let Some(json) = fetch.raw {
                    state.last_responses.insert(
                        name,
                        LastResponse {
                            json,
                            duration: fetch.duration,
                            received: Utc::now(),
                        },
                    );
                }
                Some(parsed)
            }
            Err(_) => {
                if let Some(gauges) = gauges {
                    gauges.failed.inc();
                }
                None
            }
        }
    }

    fn publish_inventory(&self, state: &mut Published, inventory: &Inventory) {
        let g = &self.gauges;

        for update in &inventory.devices {
            let serial = update.serial_num.as_str();
            let known = state.devices.entry(serial.to_string()).or_insert_with(|| {
                log::info!("discovered {} {}", update.kind, serial);
                Device::new(update.kind, serial)
            });

            let old_metadata = metadata_labels(known);
            let old_status: BTreeSet<String> =
                known.status.iter().flatten().cloned().collect();
            merge(known, update);

            let metadata = metadata_labels(known);
            if old_metadata != metadata {
                let old: Vec<&str> = old_metadata.iter().map(String::as_str).collect();
                /* absent on first sight */
                let _ = g.device_metadata.remove_label_values(&old);
            }
            let labels: Vec<&str> = metadata.iter().map(String::as_str).collect();
            g.device_metadata.with_label_values(&labels).set(1.0);

            set(&g.device_producing, &[serial], update.producing.map(flag));
            set(&g.device_communicating, &[serial], update.communicating.map(flag));
            set(&g.device_provisioned, &[serial], update.provisioned.map(flag));
            set(&g.device_operating, &[serial], update.operating.map(flag));
            set(
                &g.device_last_report,
                &[serial],
                update.last_report.map(|ts| ts as f64),
            );

            if let Some(status) = &update.status {
                for gone in old_status.iter().filter(|s| !status.contains(*s)) {
                    let _ = g.device_status.remove_label_values(&[serial, gone.as_str()]);
                }
                for code in status {
                    g.device_status
                        .with_label_values(&[serial, code.as_str()])
                        .set(1.0);
                }
            }

            if let Some(relay) = &update.relay {
                self.publish_relay(serial, relay);
            }
        }
    }

    fn publish_relay(&self, serial: &str, relay: &Relay) {
        let g = &self.gauges;
        set(
            &g.relay_line_count,
            &[serial],
            relay.line_count.map(f64::from),
        );
        for (line, connected) in &relay.lines_connected {
            g.relay_line_connected
                .with_label_values(&[serial, &line.to_string()])
                .set(flag(*connected));
        }
    }

    fn publish_production(&self, state: &Published, production: &Production) {
        let g = &self.gauges;

        if let Some(totals) = &production.inverters {
            set_gauge(&g.inverters_active, totals.active_count);
            set_gauge(&g.inverters_watt_now, totals.watt_now);
            set_gauge(&g.inverters_watt_hour_lifetime, totals.watt_hour_lifetime);
        }

        let relay = state
            .devices
            .values()
            .find(|d| d.kind == DeviceKind::Relay)
            .and_then(|d| d.relay.as_ref().map(|relay| (d.serial_num.as_str(), relay)));

        for meter in &production.meters {
            let direction = meter.direction.as_str();
            let labels = &[direction, meter.measurement_type.as_str()];
            set(&g.meter_watt_now, labels, meter.watt_now);
            set(&g.meter_watt_hour_lifetime, labels, meter.watt_hour_lifetime);

            /* relay consumption lines are fed by total-consumption, net-consumption is the
             * grid balance */
            if meter.measurement_type == NET_CONSUMPTION || meter.lines.is_empty() {
                continue;
            }
            let (serial, relay) = match relay {
                Some(relay) => relay,
                None => {
                    log::debug!("no relay known, skipping {} line readings", direction);
                    continue;
                }
            };

            for line in relay.connected_lines() {
                let reading = match (line as usize)
                    .checked_sub(1)
                    .and_then(|index| meter.lines.get(index))
                {
                    Some(reading) => reading,
                    None => {
                        log::debug!("no {} reading for line {}", direction, line);
                        continue;
                    }
                };
                let line = line.to_string();
                let labels = &[serial, line.as_str(), direction];
                set(&g.relay_watt_now, labels, reading.watt_now);
                set(&g.relay_rms_current, labels, reading.rms_current);
                set(&g.relay_rms_voltage, labels, reading.rms_voltage);
                set(&g.relay_apparent_power, labels, reading.apparent_power);
                set(&g.relay_power_factor, labels, reading.power_factor);
            }
        }
    }

    fn publish_inverters(&self, state: &mut Published, readings: Vec<InverterReading>) {
        let g = &self.gauges;
        for reading in readings {
            let serial = reading.serial_num.as_str();
            set(&g.inverter_watt_now, &[serial], reading.watt_now);
            set(&g.inverter_watt_max, &[serial], reading.watt_max);
            set(
                &g.inverter_last_report,
                &[serial],
                reading.last_report.map(|ts| ts as f64),
            );
            state.readings.insert(reading.serial_num.to_owned(), reading);
        }
    }

    /// Encode the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, Error> {
        let _state = self
            .state
            .read()
            .map_err(|_| Error::InternalError("metrics state lock poisoned".to_string()))?;

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        encoder
            .encode(&metric_families, &mut buffer)
            .or(Err(Error::FormatError))?;
        String::from_utf8(buffer).or(Err(Error::FormatError))
    }

    /// All devices seen so far, ordered by serial number, each with its latest inverter
    /// reading. Both come from the same poll cycle.
    pub fn overview(&self) -> Result<Vec<(Device, Option<InverterReading>)>, Error> {
        self.state
            .read()
            .map(|state| {
                state
                    .devices
                    .values()
                    .map(|device| {
                        let reading = state.readings.get(&device.serial_num).cloned();
                        (device.clone(), reading)
                    })
                    .collect()
            })
            .map_err(|_| Error::InternalError("metrics state lock poisoned".to_string()))
    }

    pub fn last_response(&self, endpoint: &Endpoint) -> Result<Option<LastResponse>, Error> {
        self.state
            .read()
            .map(|state| state.last_responses.get(endpoint.name).cloned())
            .map_err(|_| Error::InternalError("metrics state lock poisoned".to_string()))
    }

    /// Current value of the sample `name` carrying all of `labels`.
    pub fn sample(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                labels.iter().all(|(key, value)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|pair| pair.get_name() == *key && pair.get_value() == *value)
                })
            })
            .map(|metric| metric.get_gauge().get_value())
    }
}

#[cfg(test)]
mod test {
    use super::{Cycle, Exporter, Fetch};
    use crate::envoy::{endpoint, Error};
    use crate::model::{Device, DeviceKind, Inventory, Production};
    use std::time::Duration;

    fn device(serial: &str, producing: bool, status: &[&str]) -> Device {
        Device {
            kind: DeviceKind::Inverter,
            serial_num: serial.to_string(),
            part_num: Some("800-00598-r02".to_string()),
            installed: Some(1573554938),
            image_loaded: Some(1561045130),
            last_report: Some(1612345678),
            producing: Some(producing),
            communicating: Some(true),
            provisioned: Some(true),
            operating: None,
            status: Some(status.iter().map(|s| s.to_string()).collect()),
            relay: None,
        }
    }

    fn ok<T>(endpoint: &'static crate::envoy::Endpoint, value: T) -> Fetch<T> {
        Fetch {
            endpoint,
            duration: Duration::from_millis(120),
            raw: Some(serde_json::json!([])),
            parsed: Ok(value),
        }
    }

    fn failed<T>(endpoint: &'static crate::envoy::Endpoint) -> Fetch<T> {
        Fetch {
            endpoint,
            duration: Duration::from_millis(3000),
            raw: None,
            parsed: Err(Error::Timeout("3s".into())),
        }
    }

    fn cycle(devices: Vec<Device>) -> Cycle {
        Cycle {
            duration: Duration::from_millis(400),
            inventory: ok(endpoint::INVENTORY, Inventory { devices }),
            production: ok(endpoint::PRODUCTION, Production::default()),
            inverters: ok(endpoint::INVERTERS, vec![]),
        }
    }

    #[test]
    fn flags_follow_device() {
        let exporter = Exporter::new().unwrap();
        exporter.publish(cycle(vec![device("A", true, &[])]));

        let serial = &[("serial_num", "A")];
        assert_eq!(Some(1.0), exporter.sample("envoy_device_producing", serial));
        assert_eq!(Some(1.0), exporter.sample("envoy_device_communicating", serial));
        assert_eq!(None, exporter.sample("envoy_device_operating", serial));
        assert_eq!(
            Some(1612345678.0),
            exporter.sample("envoy_device_last_report_timestamp_seconds", serial)
        );
    }

    #[test]
    fn metadata_is_replaced_when_image_changes() {
        let exporter = Exporter::new().unwrap();
        exporter.publish(cycle(vec![device("A", true, &[])]));

        let mut updated = device("A", true, &[]);
        updated.image_loaded = Some(1612000000);
        exporter.publish(cycle(vec![updated]));

        let text = exporter.render().unwrap();
        let metadata: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with("envoy_device_metadata_info{"))
            .collect();
        assert_eq!(1, metadata.len());
        assert!(metadata[0].contains("image_loaded_date=\"2021-01-30 09:46:40\""));
        assert!(metadata[0].contains("device_type=\"inverter\""));
    }

    #[test]
    fn statuses_no_longer_reported_are_removed() {
        let exporter = Exporter::new().unwrap();
        exporter.publish(cycle(vec![device(
            "A",
            false,
            &["envoy.cond_flags.pcu_ctrl.dc-pwr-low", "envoy.global.ok"],
        )]));
        exporter.publish(cycle(vec![device("A", true, &["envoy.global.ok"])]));

        let low = &[("serial_num", "A"), ("status", "envoy.cond_flags.pcu_ctrl.dc-pwr-low")];
        let ok = &[("serial_num", "A"), ("status", "envoy.global.ok")];
        assert_eq!(None, exporter.sample("envoy_device_status", low));
        assert_eq!(Some(1.0), exporter.sample("envoy_device_status", ok));
    }

    #[test]
    fn missing_fields_keep_previous_values() {
        let exporter = Exporter::new().unwrap();
        exporter.publish(cycle(vec![device("A", true, &[])]));

        let mut sparse = device("A", true, &[]);
        sparse.producing = None;
        sparse.part_num = None;
        exporter.publish(cycle(vec![sparse]));

        assert_eq!(
            Some(1.0),
            exporter.sample("envoy_device_producing", &[("serial_num", "A")])
        );
        assert_eq!(
            Some(1.0),
            exporter.sample("envoy_device_metadata_info", &[("part_number", "800-00598-r02")])
        );
    }

    #[test]
    fn failures_count_sequentially() {
        let exporter = Exporter::new().unwrap();
        for _ in 0..2 {
            exporter.publish(Cycle {
                duration: Duration::from_secs(3),
                inventory: failed(endpoint::INVENTORY),
                production: ok(endpoint::PRODUCTION, Production::default()),
                inverters: failed(endpoint::INVERTERS),
            });
        }
        assert_eq!(Some(2.0), exporter.sample("envoy_inventory_request_failed_count", &[]));
        assert_eq!(Some(0.0), exporter.sample("envoy_production_request_failed_count", &[]));
        assert_eq!(
            Some(0.12),
            exporter.sample("envoy_production_request_duration_seconds", &[])
        );

        exporter.publish(cycle(vec![]));
        assert_eq!(Some(0.0), exporter.sample("envoy_inventory_request_failed_count", &[]));
    }

    #[test]
    fn last_response_is_kept() {
        let exporter = Exporter::new().unwrap();
        assert!(exporter.last_response(endpoint::INVENTORY).unwrap().is_none());
        exporter.publish(cycle(vec![]));
        let last = exporter.last_response(endpoint::INVENTORY).unwrap().unwrap();
        assert_eq!(serde_json::json!([]), last.json);
        assert_eq!(Duration::from_millis(120), last.duration);
    }

    #[test]
    fn unparsable_body_does_not_replace_last_response() {
        let exporter = Exporter::new().unwrap();
        exporter.publish(cycle(vec![]));

        let mut broken = cycle(vec![]);
        broken.inventory = Fetch {
            endpoint: endpoint::INVENTORY,
            duration: Duration::from_millis(80),
            raw: Some(serde_json::json!({ "status": 401 })),
            parsed: Err(Error::UnexpectedResponse("not an array".into())),
        };
        exporter.publish(broken);

        let last = exporter.last_response(endpoint::INVENTORY).unwrap().unwrap();
        assert_eq!(serde_json::json!([]), last.json);
        assert_eq!(Some(1.0), exporter.sample("envoy_inventory_request_failed_count", &[]));
    }
}
