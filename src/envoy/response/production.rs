use crate::envoy::Error;
use crate::model::{self, Direction};
use serde::Deserialize;
use serde_json::Value;

const TYPE_INVERTERS: &str = "inverters";
/* integrated meter, one entry per direction with per-line readings */
const TYPE_EIM: &str = "eim";

#[derive(Deserialize)]
struct Report {
    production: Option<Vec<Value>>,
    consumption: Option<Vec<Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Line {
    w_now: Option<f64>,
    rms_current: Option<f64>,
    rms_voltage: Option<f64>,
    #[serde(rename = "apprntPwr")]
    apparent_power: Option<f64>,
    #[serde(rename = "pwrFactor")]
    power_factor: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Item {
    #[serde(rename = "type")]
    kind: Option<String>,
    active_count: Option<f64>,
    w_now: Option<f64>,
    wh_lifetime: Option<f64>,
    measurement_type: Option<String>,
    #[serde(default)]
    lines: Vec<Line>,
}

impl From<Line> for model::MeterLine {
    fn from(line: Line) -> Self {
        model::MeterLine {
            watt_now: line.w_now,
            rms_current: line.rms_current,
            rms_voltage: line.rms_voltage,
            apparent_power: line.apparent_power,
            power_factor: line.power_factor,
        }
    }
}

/// Map the body of `/production.json?details=1` to a `Production` summary.
pub fn parse(value: Value) -> Result<model::Production, Error> {
    let report = serde_json::from_value::<Report>(value)
        .map_err(|e| Error::UnexpectedResponse(format!("production report: {}", e)))?;
    if report.production.is_none() && report.consumption.is_none() {
        return Err(Error::UnexpectedResponse(
            "production report has neither production nor consumption".to_string(),
        ));
    }

    let mut production = model::Production::default();
    let sections = [
        (Direction::Production, report.production.unwrap_or_default()),
        (Direction::Consumption, report.consumption.unwrap_or_default()),
    ];

    for (direction, items) in sections {
        for item in items {
            let item = match serde_json::from_value::<Item>(item) {
                Ok(item) => item,
                Err(e) => {
                    log::debug!("skipping malformed {} item: {}", direction.as_str(), e);
                    continue;
                }
            };

            match item.kind.as_deref() {
                Some(TYPE_INVERTERS) => {
                    if production.inverters.is_some() {
                        log::debug!("ignoring repeated inverters item in {}", direction.as_str());
                        continue;
                    }
                    production.inverters = Some(model::InverterTotals {
                        active_count: item.active_count,
                        watt_now: item.w_now,
                        watt_hour_lifetime: item.wh_lifetime,
                    });
                }
                Some(TYPE_EIM) => production.meters.push(model::Meter {
                    direction,
                    measurement_type: item
                        .measurement_type
                        .unwrap_or_else(|| direction.as_str().to_string()),
                    watt_now: item.w_now,
                    watt_hour_lifetime: item.wh_lifetime,
                    lines: item.lines.into_iter().map(model::MeterLine::from).collect(),
                }),
                Some(other) => log::debug!("skipping {} item of type {}", direction.as_str(), other),
                None => log::debug!("skipping {} item without type", direction.as_str()),
            }
        }
    }

    Ok(production)
}
