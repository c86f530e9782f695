use super::Epoch;
use crate::envoy::Error;
use crate::model;
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reading {
    serial_number: Option<String>,
    last_report_date: Option<Epoch>,
    last_report_watts: Option<f64>,
    max_report_watts: Option<f64>,
}

/// Map the body of `/api/v1/production/inverters` to per-inverter readings.
pub fn parse(value: Value) -> Result<Vec<model::InverterReading>, Error> {
    let entries = match value {
        Value::Array(entries) => entries,
        other => {
            return Err(Error::UnexpectedResponse(format!(
                "inverter readings are not an array: {}",
                other
            )))
        }
    };

    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<Reading>(entry) {
            Ok(Reading {
                serial_number: Some(serial_num),
                last_report_date,
                last_report_watts,
                max_report_watts,
            }) => Some(model::InverterReading {
                serial_num,
                last_report: last_report_date.as_ref().and_then(Epoch::seconds),
                watt_now: last_report_watts,
                watt_max: max_report_watts,
            }),
            Ok(_) => {
                log::warn!("skipping inverter reading without serialNumber");
                None
            }
            Err(e) => {
                log::warn!("skipping malformed inverter reading: {}", e);
                None
            }
        })
        .collect())
}
