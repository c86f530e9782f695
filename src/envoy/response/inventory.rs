use super::{as_flag, Epoch};
use crate::envoy::Error;
use crate::model::{self, DeviceKind};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Deserialize)]
struct Group {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    devices: Vec<Value>,
}

/* every field is read on its own so one odd value only loses that value */
#[derive(Deserialize)]
struct Device {
    serial_num: Option<Value>,
    part_num: Option<Value>,
    installed: Option<Value>,
    img_load_date: Option<Value>,
    last_rpt_date: Option<Value>,
    producing: Option<Value>,
    communicating: Option<Value>,
    provisioned: Option<Value>,
    operating: Option<Value>,
    device_status: Option<Value>,
    #[serde(rename = "line-count")]
    line_count: Option<Value>,
    /* relay devices report `line1-connected`, `line2-connected`, ... */
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

/// Reads the fields of one inventory entry, logging the ones that are missing or unusable.
struct Fields<'a> {
    kind: DeviceKind,
    serial_num: &'a str,
}

impl Fields<'_> {
    fn read<T, F>(&self, name: &str, value: &Option<Value>, read: F) -> Option<T>
    where
        F: FnOnce(&Value) -> Option<T>,
    {
        let value = match value {
            Some(value) => value,
            None => {
                log::debug!("{} {}: no `{}` field", self.kind, self.serial_num, name);
                return None;
            }
        };
        let read = read(value);
        if read.is_none() {
            log::debug!(
                "{} {}: ignoring unusable `{}` = {}",
                self.kind,
                self.serial_num,
                name,
                value
            );
        }
        read
    }

    fn flag(&self, name: &str, value: &Option<Value>) -> Option<bool> {
        self.read(name, value, as_flag)
    }

    fn text(&self, name: &str, value: &Option<Value>) -> Option<String> {
        self.read(name, value, |v| v.as_str().map(str::to_string))
    }

    fn epoch(&self, name: &str, value: &Option<Value>) -> Option<i64> {
        self.read(name, value, |v| {
            serde_json::from_value::<Epoch>(v.clone())
                .ok()
                .as_ref()
                .and_then(Epoch::seconds)
        })
    }

    fn count(&self, name: &str, value: &Option<Value>) -> Option<u32> {
        self.read(name, value, |v| match v {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    fn status(&self, value: &Option<Value>) -> Option<Vec<String>> {
        self.read("device_status", value, |v| {
            let codes = v.as_array()?;
            Some(
                codes
                    .iter()
                    .filter_map(|code| {
                        let text = code.as_str();
                        if text.is_none() {
                            log::debug!(
                                "{} {}: ignoring non-string status {}",
                                self.kind,
                                self.serial_num,
                                code
                            );
                        }
                        text.map(str::to_string)
                    })
                    .collect(),
            )
        })
    }
}

fn line_number(key: &str) -> Option<u32> {
    key.strip_prefix("line")?
        .strip_suffix("-connected")?
        .parse()
        .ok()
}

fn relay(fields: &Fields, device: &Device) -> model::Relay {
    let lines_connected: BTreeMap<u32, bool> = device
        .other
        .iter()
        .filter_map(|(key, value)| {
            let line = line_number(key)?;
            match as_flag(value) {
                Some(connected) => Some((line, connected)),
                None => {
                    log::debug!("ignoring non-boolean {} = {}", key, value);
                    None
                }
            }
        })
        .collect();

    let sequential = lines_connected.keys().copied().eq(1..=lines_connected.len() as u32);
    if !sequential {
        log::warn!(
            "relay lines of {} are not sequential: {:?}",
            fields.serial_num,
            lines_connected.keys().collect::<Vec<_>>()
        );
    }

    model::Relay {
        line_count: fields.count("line-count", &device.line_count),
        lines_connected,
    }
}

fn device(kind: DeviceKind, value: Value) -> Option<model::Device> {
    let device = match serde_json::from_value::<Device>(value) {
        Ok(device) => device,
        Err(e) => {
            log::warn!("skipping malformed {} inventory entry: {}", kind, e);
            return None;
        }
    };

    let serial_num = match device.serial_num.as_ref().and_then(Value::as_str) {
        Some(serial_num) => serial_num.to_owned(),
        None => {
            log::warn!("skipping {} inventory entry without serial_num", kind);
            return None;
        }
    };
    let fields = Fields {
        kind,
        serial_num: &serial_num,
    };

    let relay = match kind {
        DeviceKind::Relay => Some(relay(&fields, &device)),
        _ => None,
    };

    let mut parsed = model::Device::new(kind, &serial_num);
    parsed.part_num = fields.text("part_num", &device.part_num);
    parsed.installed = fields.epoch("installed", &device.installed);
    parsed.image_loaded = fields.epoch("img_load_date", &device.img_load_date);
    parsed.last_report = fields.epoch("last_rpt_date", &device.last_rpt_date);
    parsed.producing = fields.flag("producing", &device.producing);
    parsed.communicating = fields.flag("communicating", &device.communicating);
    parsed.provisioned = fields.flag("provisioned", &device.provisioned);
    parsed.operating = fields.flag("operating", &device.operating);
    parsed.status = fields.status(&device.device_status);
    parsed.relay = relay;
    Some(parsed)
}

/// Map the body of `/inventory.json` to an `Inventory`.
///
/// Only the top-level shape is mandatory; unknown groups and broken devices are logged and
/// skipped.
pub fn parse(value: Value) -> Result<model::Inventory, Error> {
    let groups = match value {
        Value::Array(groups) => groups,
        other => {
            return Err(Error::UnexpectedResponse(format!(
                "inventory is not an array: {}",
                other
            )))
        }
    };

    let mut devices = Vec::new();
    for group in groups {
        let group = match serde_json::from_value::<Group>(group) {
            Ok(group) => group,
            Err(e) => {
                log::debug!("skipping malformed inventory group: {}", e);
                continue;
            }
        };

        let kind = match group.kind.as_deref().map(|code| (code, DeviceKind::from_code(code))) {
            Some((_, Some(kind))) => kind,
            Some((code, None)) => {
                log::debug!("skipping unknown inventory type {}", code);
                continue;
            }
            None => {
                log::debug!("skipping inventory group without type");
                continue;
            }
        };

        devices.extend(group.devices.into_iter().filter_map(|v| device(kind, v)));
    }

    Ok(model::Inventory { devices })
}
