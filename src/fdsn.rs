use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;

use crate::config::{BoundingBox, DownloadConfig, ServiceEndpoint};
use crate::domain::{ChannelEntry, TimeWindow, WILDCARD_LOCATION};
use crate::error::HarvestError;
use crate::mseed;
use crate::trace::RawStream;

/// One line of a bulk station request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkRequest {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InventoryQuery {
    pub requests: Vec<BulkRequest>,
    pub bbox: BoundingBox,
}

impl InventoryQuery {
    /// Cartesian product of configured networks, stations and channels.
    pub fn from_config(config: &DownloadConfig) -> Self {
        let mut requests = Vec::new();
        for network in &config.networks {
            for station in &config.stations {
                for channel in &config.channels {
                    requests.push(BulkRequest {
                        network: network.clone(),
                        station: station.clone(),
                        location: WILDCARD_LOCATION.to_string(),
                        channel: channel.clone(),
                        start: config.start,
                        end: config.end,
                    });
                }
            }
        }
        Self {
            requests,
            bbox: config.bbox,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInventory {
    pub code: String,
    pub stations: Vec<StationInventory>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationInventory {
    pub code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub channels: Vec<ChannelInventory>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInventory {
    pub code: String,
    pub location: String,
    pub sample_rate: Option<f64>,
    pub sensitivity: Option<f64>,
}

pub trait FdsnClient: Send + Sync {
    fn fetch_inventory(&self, query: &InventoryQuery) -> Result<Vec<NetworkInventory>, HarvestError>;
    /// Returns `HarvestError::NoData` when the service confirms there is nothing
    /// to deliver; any other error is worth retrying.
    fn fetch_waveform(&self, entry: &ChannelEntry, window: &TimeWindow) -> Result<RawStream, HarvestError>;
}

#[derive(Clone)]
pub struct FdsnHttpClient {
    client: Client,
    base_url: String,
}

impl FdsnHttpClient {
    /// `connect_timeout` bounds connection setup; `request_timeout` bounds a
    /// whole request including the body, which for a day of high-rate
    /// dataselect output can take far longer than the connect limit.
    pub fn new(
        service: &ServiceEndpoint,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("seis-harvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::FdsnHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|err| HarvestError::FdsnHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: service.base_url.clone(),
        })
    }

    pub fn station_url(&self) -> String {
        format!("{}/fdsnws/station/1/query", self.base_url)
    }

    pub fn dataselect_url(&self) -> String {
        format!("{}/fdsnws/dataselect/1/query", self.base_url)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, HarvestError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(HarvestError::FdsnHttp(err.to_string()));
                }
            }
        }
    }
}

impl FdsnClient for FdsnHttpClient {
    fn fetch_inventory(&self, query: &InventoryQuery) -> Result<Vec<NetworkInventory>, HarvestError> {
        let body = bulk_station_body(query);
        let url = self.station_url();
        let response = self.send_with_retries(|| self.client.post(&url).body(body.clone()))?;
        let status = response.status().as_u16();
        if status == 204 || status == 404 {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "station request failed".to_string());
            return Err(HarvestError::FdsnStatus { status, message });
        }
        let text = response
            .text()
            .map_err(|err| HarvestError::FdsnHttp(err.to_string()))?;
        parse_station_text(&text)
    }

    fn fetch_waveform(&self, entry: &ChannelEntry, window: &TimeWindow) -> Result<RawStream, HarvestError> {
        let location = request_location(&entry.location);
        let start = fdsn_time(window.start());
        let end = fdsn_time(window.end());
        let response = self
            .client
            .get(self.dataselect_url())
            .query(&[
                ("network", entry.network.as_str()),
                ("station", entry.station.as_str()),
                ("location", location),
                ("channel", entry.channel.as_str()),
                ("starttime", start.as_str()),
                ("endtime", end.as_str()),
            ])
            .send()
            .map_err(|err| HarvestError::FdsnHttp(err.to_string()))?;

        let status = response.status().as_u16();
        if status == 204 || status == 404 {
            return Err(HarvestError::NoData(format!("{} {window}", entry.label())));
        }
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "dataselect request failed".to_string());
            return Err(HarvestError::FdsnStatus { status, message });
        }
        let bytes = response
            .bytes()
            .map_err(|err| HarvestError::FdsnHttp(err.to_string()))?;
        if bytes.is_empty() {
            return Err(HarvestError::NoData(format!("{} {window}", entry.label())));
        }
        Ok(RawStream::new(mseed::decode(&bytes)?))
    }
}

/// POST body for `fdsnws/station` bulk queries.
pub fn bulk_station_body(query: &InventoryQuery) -> String {
    let mut lines = vec![
        "level=channel".to_string(),
        "format=text".to_string(),
        format!("minlatitude={}", query.bbox.lamin),
        format!("maxlatitude={}", query.bbox.lamax),
        format!("minlongitude={}", query.bbox.lomin),
        format!("maxlongitude={}", query.bbox.lomax),
    ];
    for request in &query.requests {
        lines.push(format!(
            "{} {} {} {} {} {}",
            request.network,
            request.station,
            request_location(&request.location),
            request.channel,
            fdsn_time(request.start),
            fdsn_time(request.end)
        ));
    }
    let mut body = lines.join("\n");
    body.push('\n');
    body
}

/// Parses the pipe-delimited `format=text` channel listing into a hierarchy,
/// keeping first-seen order and folding repeated epochs into one station.
pub fn parse_station_text(text: &str) -> Result<Vec<NetworkInventory>, HarvestError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'|')
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut networks: Vec<NetworkInventory> = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|err| HarvestError::FdsnHttp(err.to_string()))?;
        if record.len() < 7 {
            return Err(HarvestError::FdsnHttp(format!(
                "station listing line {} has {} columns, expected at least 7",
                line + 1,
                record.len()
            )));
        }
        let field = |index: usize| record.get(index).unwrap_or("");
        let number = |index: usize| -> Result<f64, HarvestError> {
            field(index).parse::<f64>().map_err(|_| {
                HarvestError::FdsnHttp(format!(
                    "station listing line {}: column {} is not a number: {:?}",
                    line + 1,
                    index + 1,
                    field(index)
                ))
            })
        };
        let optional = |index: usize| field(index).parse::<f64>().ok();

        let channel = ChannelInventory {
            code: field(3).to_string(),
            location: field(2).to_string(),
            sample_rate: optional(14),
            sensitivity: optional(11),
        };
        let network_code = field(0).to_string();
        let station_code = field(1).to_string();

        let network_index = match networks.iter().position(|net| net.code == network_code) {
            Some(index) => index,
            None => {
                networks.push(NetworkInventory {
                    code: network_code,
                    stations: Vec::new(),
                });
                networks.len() - 1
            }
        };
        let stations = &mut networks[network_index].stations;
        match stations.iter().position(|sta| sta.code == station_code) {
            Some(index) => {
                let station = &mut stations[index];
                if !station
                    .channels
                    .iter()
                    .any(|known| known.code == channel.code && known.location == channel.location)
                {
                    station.channels.push(channel);
                }
            }
            None => stations.push(StationInventory {
                code: station_code,
                latitude: number(4)?,
                longitude: number(5)?,
                elevation: number(6)?,
                channels: vec![channel],
            }),
        }
    }
    Ok(networks)
}

fn request_location(location: &str) -> &str {
    if location.is_empty() { "--" } else { location }
}

fn fdsn_time(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const LISTING: &str = "\
#Network | Station | Location | Channel | Latitude | Longitude | Elevation | Depth | Azimuth | Dip | SensorDescription | Scale | ScaleFreq | ScaleUnits | SampleRate | StartTime | EndTime
CI|SDD||BHE|34.0|-118.1|120.0|0.0|90.0|0.0|STS-2|6.27E8|1.0|M/S|40.0|2000-01-01T00:00:00|
CI|SDD||BHN|34.0|-118.1|120.0|0.0|0.0|0.0|STS-2|6.27E8|1.0|M/S|40.0|2000-01-01T00:00:00|
CI|SDD||BHN|34.0|-118.1|120.0|0.0|0.0|0.0|STS-2|6.27E8|1.0|M/S|40.0|1990-01-01T00:00:00|1999-12-31T00:00:00
CI|RPV|10|BHZ|33.7|-118.3|60.0|0.0|0.0|-90.0|STS-2||1.0|M/S|40.0|2000-01-01T00:00:00|
IU|ANMO|00|BHZ|34.9|-106.5|1850.0|0.0|0.0|-90.0|STS-6|1.9E9|0.02|M/S|20.0|2000-01-01T00:00:00|
";

    #[test]
    fn parses_text_listing_into_hierarchy() {
        let networks = parse_station_text(LISTING).unwrap();
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].code, "CI");
        assert_eq!(networks[0].stations.len(), 2);

        let sdd = &networks[0].stations[0];
        assert_eq!(sdd.code, "SDD");
        assert_eq!(sdd.channels.len(), 2);
        assert_eq!(sdd.channels[0].location, "");
        assert_eq!(sdd.channels[0].sensitivity, Some(6.27e8));
        assert_eq!(sdd.latitude, 34.0);

        let rpv = &networks[0].stations[1];
        assert_eq!(rpv.channels[0].location, "10");
        assert_eq!(rpv.channels[0].sensitivity, None);
        assert_eq!(rpv.channels[0].sample_rate, Some(40.0));
    }

    #[test]
    fn bulk_body_lists_every_combination() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();
        let mut requests = Vec::new();
        for station in ["SDD", "RPV"] {
            for channel in ["BHE", "BHZ"] {
                requests.push(BulkRequest {
                    network: "CI".to_string(),
                    station: station.to_string(),
                    location: WILDCARD_LOCATION.to_string(),
                    channel: channel.to_string(),
                    start,
                    end,
                });
            }
        }
        let query = InventoryQuery {
            requests,
            bbox: BoundingBox {
                lamin: 31.0,
                lamax: 36.0,
                lomin: -122.0,
                lomax: -115.0,
            },
        };
        let body = bulk_station_body(&query);
        assert!(body.starts_with("level=channel\nformat=text\n"));
        assert!(body.contains("minlatitude=31\n"));
        assert!(body.contains("CI RPV * BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n"));
        assert_eq!(body.lines().filter(|line| line.starts_with("CI ")).count(), 4);
    }
}
