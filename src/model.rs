use std::collections::BTreeMap;
use std::fmt;

type Watt = f64;
type WattHour = f64;
/// Seconds since the Unix epoch, as reported by the Envoy.
pub type Timestamp = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    /// Power conversion unit, a microinverter.
    Inverter,
    AcBattery,
    /// Network system relay block, the grid switch carrying the meter lines.
    Relay,
}

impl DeviceKind {
    /// Inventory group type code used by the Envoy.
    pub fn from_code(code: &str) -> Option<DeviceKind> {
        match code {
            "PCU" => Some(DeviceKind::Inverter),
            "ACB" => Some(DeviceKind::AcBattery),
            "NSRB" => Some(DeviceKind::Relay),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Inverter => "inverter",
            DeviceKind::AcBattery => "ac_battery",
            DeviceKind::Relay => "relay",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relay {
    pub line_count: Option<u32>,
    /// Connected flag per line number (1-based).
    pub lines_connected: BTreeMap<u32, bool>,
}

impl Relay {
    pub fn connected_lines(&self) -> impl Iterator<Item = u32> + '_ {
        self.lines_connected
            .iter()
            .filter(|(_, connected)| **connected)
            .map(|(line, _)| *line)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub kind: DeviceKind,
    pub serial_num: String,
    pub part_num: Option<String>,
    pub installed: Option<Timestamp>,
    pub image_loaded: Option<Timestamp>,
    pub last_report: Option<Timestamp>,
    pub producing: Option<bool>,
    pub communicating: Option<bool>,
    pub provisioned: Option<bool>,
    pub operating: Option<bool>,
    /// Status codes such as `envoy.global.ok`.
    pub status: Option<Vec<String>>,
    pub relay: Option<Relay>,
}

impl Device {
    /// A device known only by its serial number.
    pub fn new(kind: DeviceKind, serial_num: &str) -> Device {
        Device {
            kind,
            serial_num: serial_num.to_string(),
            part_num: None,
            installed: None,
            image_loaded: None,
            last_report: None,
            producing: None,
            communicating: None,
            provisioned: None,
            operating: None,
            status: None,
            relay: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Production,
    Consumption,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Production => "production",
            Direction::Consumption => "consumption",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InverterTotals {
    pub active_count: Option<f64>,
    pub watt_now: Option<Watt>,
    pub watt_hour_lifetime: Option<WattHour>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterLine {
    pub watt_now: Option<Watt>,
    pub rms_current: Option<f64>,
    pub rms_voltage: Option<f64>,
    pub apparent_power: Option<f64>,
    pub power_factor: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Meter {
    pub direction: Direction,
    /// `production`, `total-consumption` or `net-consumption`.
    pub measurement_type: String,
    pub watt_now: Option<Watt>,
    pub watt_hour_lifetime: Option<WattHour>,
    pub lines: Vec<MeterLine>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Production {
    pub inverters: Option<InverterTotals>,
    pub meters: Vec<Meter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InverterReading {
    pub serial_num: String,
    pub last_report: Option<Timestamp>,
    pub watt_now: Option<Watt>,
    pub watt_max: Option<Watt>,
}
