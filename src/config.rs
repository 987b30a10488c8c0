use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{LocationPolicy, RemoveResponse};
use crate::error::HarvestError;

pub const DEFAULT_CONFIG_FILE: &str = "seis-harvest.json";

const KNOWN_SERVICES: &[(&str, &str)] = &[
    ("BGR", "https://eida.bgr.de"),
    ("EARTHSCOPE", "https://service.iris.edu"),
    ("ETH", "https://eida.ethz.ch"),
    ("GEOFON", "https://geofon.gfz-potsdam.de"),
    ("GEONET", "https://service.geonet.org.nz"),
    ("ICGC", "https://ws.icgc.cat"),
    ("INGV", "https://webservices.ingv.it"),
    ("IRIS", "https://service.iris.edu"),
    ("NCEDC", "https://service.ncedc.org"),
    ("NOA", "https://eida.gein.noa.gr"),
    ("ORFEUS", "https://www.orfeus-eu.org"),
    ("RESIF", "https://ws.resif.fr"),
    ("SCEDC", "https://service.scedc.caltech.edu"),
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub client_url_key: String,
    #[serde(default = "default_networks")]
    pub net_list: Vec<String>,
    pub stations: Vec<String>,
    pub channels: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub inc_hours: f64,
    #[serde(default = "default_lamin")]
    pub lamin: f64,
    #[serde(default = "default_lamax")]
    pub lamax: f64,
    #[serde(default = "default_lomin")]
    pub lomin: f64,
    #[serde(default = "default_lomax")]
    pub lomax: f64,
    pub cc_len: f64,
    pub step: f64,
    pub samp_freq: f64,
    #[serde(default)]
    pub rm_resp: RemoveResponse,
    #[serde(default)]
    pub down_list: bool,
    #[serde(default)]
    pub location_policy: LocationPolicy,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_gap_fraction")]
    pub max_gap_fraction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEndpoint {
    pub key: String,
    pub base_url: String,
}

impl ServiceEndpoint {
    pub fn resolve(key: &str) -> Option<Self> {
        let trimmed = key.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Some(Self {
                key: trimmed.to_string(),
                base_url: trimmed.trim_end_matches('/').to_string(),
            });
        }
        let upper = trimmed.to_uppercase();
        KNOWN_SERVICES
            .iter()
            .find(|(name, _)| *name == upper)
            .map(|(name, url)| Self {
                key: name.to_string(),
                base_url: url.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lamin: f64,
    pub lamax: f64,
    pub lomin: f64,
    pub lomax: f64,
}

/// Validated, immutable run configuration shared by every stage.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub service: ServiceEndpoint,
    pub networks: Vec<String>,
    pub stations: Vec<String>,
    pub channels: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub inc_hours: f64,
    pub bbox: BoundingBox,
    pub cc_len: f64,
    pub step: f64,
    pub samp_freq: f64,
    pub rm_resp: RemoveResponse,
    pub down_list: bool,
    pub location_policy: LocationPolicy,
    pub max_workers: usize,
    pub fetch_attempts: u32,
    pub retry_delay: Duration,
    /// Connection setup limit for every service request.
    pub timeout: Duration,
    /// Deadline for one whole request, body included.
    pub request_timeout: Duration,
    pub max_gap_fraction: f64,
}

impl DownloadConfig {
    pub fn chunk_seconds(&self) -> f64 {
        self.inc_hours * 3600.0
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<DownloadConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(HarvestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Validates every field and either accepts the whole config or reports
    /// all problems at once.
    pub fn resolve_config(config: Config) -> Result<DownloadConfig, HarvestError> {
        let mut problems = Vec::new();
        let code = code_pattern()?;

        let service = ServiceEndpoint::resolve(&config.client_url_key);
        if service.is_none() {
            problems.push(format!(
                "unknown client_url_key {:?} (use a data centre key or an http(s) URL)",
                config.client_url_key
            ));
        }

        check_codes("net_list", &config.net_list, &code, &mut problems);
        check_codes("stations", &config.stations, &code, &mut problems);
        check_codes("channels", &config.channels, &code, &mut problems);

        let start = parse_timestamp(&config.start_date)
            .map_err(|err| problems.push(format!("start_date: {err}")))
            .ok();
        let end = parse_timestamp(&config.end_date)
            .map_err(|err| problems.push(format!("end_date: {err}")))
            .ok();
        if let (Some(start), Some(end)) = (start, end) {
            if end <= start {
                problems.push(format!(
                    "end_date {} must be after start_date {}",
                    config.end_date, config.start_date
                ));
            }
        }

        check_positive("inc_hours", config.inc_hours, &mut problems);
        check_positive("cc_len", config.cc_len, &mut problems);
        check_positive("step", config.step, &mut problems);
        check_positive("samp_freq", config.samp_freq, &mut problems);

        check_range("lamin", config.lamin, -90.0, 90.0, &mut problems);
        check_range("lamax", config.lamax, -90.0, 90.0, &mut problems);
        check_range("lomin", config.lomin, -180.0, 180.0, &mut problems);
        check_range("lomax", config.lomax, -180.0, 180.0, &mut problems);
        if config.lamin > config.lamax {
            problems.push("lamin must not exceed lamax".to_string());
        }
        if config.lomin > config.lomax {
            problems.push("lomin must not exceed lomax".to_string());
        }

        if config.max_workers == Some(0) {
            problems.push("max_workers must be at least 1".to_string());
        }
        if config.fetch_attempts == 0 {
            problems.push("fetch_attempts must be at least 1".to_string());
        }
        if config.timeout_secs == 0 {
            problems.push("timeout_secs must be at least 1".to_string());
        }
        if config.request_timeout_secs < config.timeout_secs {
            problems.push("request_timeout_secs must not be below timeout_secs".to_string());
        }
        if !(0.0..=1.0).contains(&config.max_gap_fraction) {
            problems.push("max_gap_fraction must lie in [0, 1]".to_string());
        }

        match (service, start, end) {
            (Some(service), Some(start), Some(end)) if problems.is_empty() => Ok(DownloadConfig {
                service,
                networks: normalize_codes(config.net_list),
                stations: normalize_codes(config.stations),
                channels: normalize_codes(config.channels),
                start,
                end,
                inc_hours: config.inc_hours,
                bbox: BoundingBox {
                    lamin: config.lamin,
                    lamax: config.lamax,
                    lomin: config.lomin,
                    lomax: config.lomax,
                },
                cc_len: config.cc_len,
                step: config.step,
                samp_freq: config.samp_freq,
                rm_resp: config.rm_resp,
                down_list: config.down_list,
                location_policy: config.location_policy,
                max_workers: config.max_workers.unwrap_or_else(default_workers),
                fetch_attempts: config.fetch_attempts,
                retry_delay: Duration::from_millis(config.retry_delay_ms),
                timeout: Duration::from_secs(config.timeout_secs),
                request_timeout: Duration::from_secs(config.request_timeout_secs),
                max_gap_fraction: config.max_gap_fraction,
            }),
            _ => Err(HarvestError::Config(problems.join("; "))),
        }
    }
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, layout) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("unrecognized timestamp {value:?}"))
}

fn code_pattern() -> Result<Regex, HarvestError> {
    Regex::new(r"^[A-Za-z0-9*?\-]{1,8}$").map_err(|err| HarvestError::Config(err.to_string()))
}

fn check_codes(field: &str, values: &[String], pattern: &Regex, problems: &mut Vec<String>) {
    if values.is_empty() {
        problems.push(format!("{field} must list at least one code"));
        return;
    }
    for value in values {
        if !pattern.is_match(value.trim()) {
            problems.push(format!("{field}: invalid code {value:?}"));
        }
    }
}

fn check_positive(field: &str, value: f64, problems: &mut Vec<String>) {
    if !value.is_finite() || value <= 0.0 {
        problems.push(format!("{field} must be a positive number, got {value}"));
    }
}

fn check_range(field: &str, value: f64, min: f64, max: f64, problems: &mut Vec<String>) {
    if !value.is_finite() || value < min || value > max {
        problems.push(format!("{field} must lie in [{min}, {max}], got {value}"));
    }
}

fn normalize_codes(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_uppercase())
        .collect()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
}

fn default_networks() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_lamin() -> f64 {
    -90.0
}

fn default_lamax() -> f64 {
    90.0
}

fn default_lomin() -> f64 {
    -180.0
}

fn default_lomax() -> f64 {
    180.0
}

fn default_fetch_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_max_gap_fraction() -> f64 {
    0.5
}
