use crate::envoy::{endpoint, Endpoint, Error};
use crate::metrics::{format_date as date, Exporter};
use crate::model::{Device, DeviceKind, InverterReading};
use rocket::response::content::RawHtml;
use rocket::{get, routes, Build, Rocket, State};
use std::fmt::Write;
use std::sync::Arc;

const STYLE: &str =
    "table, th, td { border: 1px solid black; border-collapse: collapse; padding: 5px; }";

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

type Row = (Device, Option<InverterReading>);

fn device_table(page: &mut String, title: &str, rows: &[&Row]) {
    let with_watts = rows.iter().any(|(d, _)| d.kind == DeviceKind::Inverter);

    let _ = write!(
        page,
        "<h2>{}</h2><table><tr><th>Serial</th><th>Part number</th><th>Installed date</th>\
         <th>Image loaded date</th><th>Last report</th><th>Status</th>",
        title
    );
    if with_watts {
        page.push_str("<th>Watt now</th><th>Watt max</th>");
    }
    page.push_str("</tr>");

    for (device, reading) in rows {
        let status = device.status.as_deref().unwrap_or_default().join(", ");
        let _ = write!(
            page,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td>",
            escape_html(&device.serial_num),
            escape_html(device.part_num.as_deref().unwrap_or_default()),
            date(device.installed),
            date(device.image_loaded),
            date(device.last_report),
            escape_html(&status),
        );
        if with_watts {
            let _ = write!(
                page,
                "<td>{}</td><td>{}</td>",
                optional(reading.as_ref().and_then(|r| r.watt_now)),
                optional(reading.as_ref().and_then(|r| r.watt_max)),
            );
        }
        page.push_str("</tr>");
    }
    page.push_str("</table>");
}

#[get("/")]
fn homepage_route(exporter: &State<Arc<Exporter>>) -> Result<RawHtml<String>, Error> {
    let rows = exporter.overview()?;
    let mut page = format!(
        "<html><head><style>{}</style></head><body>\
         <h1>Enphase Envoy Prometheus Exporter</h1>\
         For prometheus metrics, have a look at <a href=\"/metrics\">/metrics</a>.",
        STYLE
    );

    for (kind, title) in [
        (DeviceKind::Relay, "Relays"),
        (DeviceKind::Inverter, "Inverters"),
        (DeviceKind::AcBattery, "AC batteries"),
    ] {
        let of_kind: Vec<&Row> = rows.iter().filter(|(d, _)| d.kind == kind).collect();
        if !of_kind.is_empty() || kind == DeviceKind::Inverter {
            device_table(&mut page, title, &of_kind);
        }
    }

    page.push_str("<h2>Development</h2><ul>");
    for endpoint in endpoint::ALL {
        let _ = write!(
            page,
            "<li><a href=\"/last_{0}\">last successful {0} response</a></li>",
            endpoint.name
        );
    }
    page.push_str("</ul></body></html>");

    Ok(RawHtml(page))
}

fn last_data(exporter: &Exporter, endpoint: &Endpoint) -> Result<RawHtml<String>, Error> {
    let mut page = format!("<html><body><h1>{}</h1>", endpoint.name);

    match exporter.last_response(endpoint)? {
        Some(last) => {
            let json = serde_json::to_string_pretty(&last.json).or(Err(Error::FormatError))?;
            let _ = write!(
                page,
                "<p>received: {}</p><p>request duration: {:.3} seconds</p>\
                 <h2>response:</h2><pre>{}</pre>",
                last.received.format("%Y-%m-%d %H:%M:%S UTC"),
                last.duration.as_secs_f64(),
                escape_html(&json)
            );
        }
        None => page.push_str("<p>No response received from the envoy yet.</p>"),
    }
    page.push_str("</body></html>");

    Ok(RawHtml(page))
}

#[get("/last_inventory")]
fn last_inventory_route(exporter: &State<Arc<Exporter>>) -> Result<RawHtml<String>, Error> {
    last_data(exporter, endpoint::INVENTORY)
}

#[get("/last_production")]
fn last_production_route(exporter: &State<Arc<Exporter>>) -> Result<RawHtml<String>, Error> {
    last_data(exporter, endpoint::PRODUCTION)
}

#[get("/last_inverters")]
fn last_inverters_route(exporter: &State<Arc<Exporter>>) -> Result<RawHtml<String>, Error> {
    last_data(exporter, endpoint::INVERTERS)
}

#[get("/metrics")]
fn metrics_route(exporter: &State<Arc<Exporter>>) -> Result<String, Error> {
    exporter.render()
}

/// Attach `exporter` and the exporter routes to `rocket`.
pub fn mount(rocket: Rocket<Build>, exporter: Arc<Exporter>) -> Rocket<Build> {
    rocket.manage(exporter).mount(
        "/",
        routes![
            homepage_route,
            metrics_route,
            last_inventory_route,
            last_production_route,
            last_inverters_route
        ],
    )
}
