use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Location code used when a station advertises none.
pub const WILDCARD_LOCATION: &str = "*";

/// Location part of a storage tag when the request used the wildcard.
pub const PLACEHOLDER_LOCATION: &str = "00";

/// Timestamp layout used in chunk archive names.
pub const CHUNK_TIME_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StationId(String);

impl StationId {
    pub fn new(network: &str, station: &str) -> Self {
        Self(format!("{network}.{station}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StationId {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (network, station) = trimmed
            .split_once('.')
            .ok_or_else(|| HarvestError::Archive(format!("invalid station identity: {value}")))?;
        if network.is_empty() || station.is_empty() || station.contains('.') {
            return Err(HarvestError::Archive(format!(
                "invalid station identity: {value}"
            )));
        }
        Ok(Self::new(network, station))
    }
}

/// Label a waveform is stored under inside its station entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WaveformTag(String);

impl WaveformTag {
    pub fn derive(channel: &str, location: &str) -> Self {
        let location = if location.is_empty() || location == WILDCARD_LOCATION {
            PLACEHOLDER_LOCATION
        } else {
            location
        };
        Self(format!(
            "{}_{}",
            channel.to_lowercase(),
            location.to_lowercase()
        ))
    }

    pub fn from_stored(value: &str) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WaveformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub network: String,
    pub station: String,
    pub channel: String,
    pub location: String,
    pub longitude: f64,
    pub latitude: f64,
    pub elevation: f64,
    #[serde(default)]
    pub sample_rate: Option<f64>,
    #[serde(default)]
    pub sensitivity: Option<f64>,
}

impl ChannelEntry {
    pub fn station_id(&self) -> StationId {
        StationId::new(&self.network, &self.station)
    }

    pub fn key(&self) -> (&str, &str, &str, &str) {
        (&self.network, &self.station, &self.channel, &self.location)
    }

    pub fn tag(&self) -> WaveformTag {
        WaveformTag::derive(&self.channel, &self.location)
    }

    pub fn label(&self) -> String {
        format!("{}.{}.{}", self.network, self.station, self.channel)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    entries: Vec<ChannelEntry>,
}

impl Inventory {
    /// Builds an inventory, dropping later entries that repeat an identity key.
    pub fn new(entries: Vec<ChannelEntry>) -> Self {
        let mut unique: Vec<ChannelEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            if !unique.iter().any(|known| known.key() == entry.key()) {
                unique.push(entry);
            }
        }
        Self { entries: unique }
    }

    pub fn entries(&self) -> &[ChannelEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct tags the inventory expects for each station.
    pub fn expected_channels(&self) -> BTreeMap<StationId, usize> {
        let mut tags = BTreeMap::<StationId, Vec<WaveformTag>>::new();
        for entry in &self.entries {
            let station_tags = tags.entry(entry.station_id()).or_default();
            let tag = entry.tag();
            if !station_tags.contains(&tag) {
                station_tags.push(tag);
            }
        }
        tags.into_iter()
            .map(|(station, tags)| (station, tags.len()))
            .collect()
    }

    /// Entries grouped per station, in first-seen order.
    pub fn stations(&self) -> Vec<(StationId, Vec<&ChannelEntry>)> {
        let mut grouped: Vec<(StationId, Vec<&ChannelEntry>)> = Vec::new();
        for entry in &self.entries {
            let id = entry.station_id();
            match grouped.iter_mut().find(|(known, _)| *known == id) {
                Some((_, channels)) => channels.push(entry),
                None => grouped.push((id, vec![entry])),
            }
        }
        grouped
    }

    /// Looks up a channel by the codes a service echoed back, ignoring case.
    pub fn find(&self, network: &str, station: &str, channel: &str) -> Option<&ChannelEntry> {
        self.entries.iter().find(|entry| {
            entry.network.eq_ignore_ascii_case(network)
                && entry.station.eq_ignore_ascii_case(station)
                && entry.channel.eq_ignore_ascii_case(channel)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationPolicy {
    /// Every channel of a station uses the location code of its first channel.
    #[default]
    First,
    PerChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoveResponse {
    #[default]
    No,
    Inv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, HarvestError> {
        if end <= start {
            return Err(HarvestError::Config(format!(
                "time window end {end} is not after start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn seconds(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / 1000.0
    }

    pub fn archive_stem(&self) -> String {
        format!(
            "{}T{}",
            self.start.format(CHUNK_TIME_FORMAT),
            self.end.format(CHUNK_TIME_FORMAT)
        )
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;

    fn entry(station: &str, channel: &str, location: &str) -> ChannelEntry {
        ChannelEntry {
            network: "CI".to_string(),
            station: station.to_string(),
            channel: channel.to_string(),
            location: location.to_string(),
            longitude: -118.0,
            latitude: 34.0,
            elevation: 100.0,
            sample_rate: None,
            sensitivity: None,
        }
    }

    #[test]
    fn tag_uses_placeholder_for_wildcard() {
        assert_eq!(WaveformTag::derive("BHZ", "*").as_str(), "bhz_00");
        assert_eq!(WaveformTag::derive("BHZ", "").as_str(), "bhz_00");
        assert_eq!(WaveformTag::derive("HHE", "10").as_str(), "hhe_10");
    }

    #[test]
    fn station_id_parses_network_and_station() {
        let id: StationId = "CI.SDD".parse().unwrap();
        assert_eq!(id, StationId::new("CI", "SDD"));
        assert_matches!("CISDD".parse::<StationId>(), Err(HarvestError::Archive(_)));
    }

    #[test]
    fn inventory_drops_repeated_keys() {
        let inventory = Inventory::new(vec![
            entry("SDD", "BHZ", "*"),
            entry("SDD", "BHZ", "*"),
            entry("SDD", "BHE", "*"),
        ]);
        assert_eq!(inventory.len(), 2);
        let expected = inventory.expected_channels();
        assert_eq!(expected[&StationId::new("CI", "SDD")], 2);
    }

    #[test]
    fn find_ignores_code_case() {
        let inventory = Inventory::new(vec![entry("sdd", "BHZ", "*")]);
        assert!(inventory.find("CI", "SDD", "bhz").is_some());
        assert!(inventory.find("CI", "RPV", "BHZ").is_none());
    }

    #[test]
    fn window_rejects_inverted_range() {
        let start = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_matches!(TimeWindow::new(start, end), Err(HarvestError::Config(_)));
    }

    #[test]
    fn window_archive_stem() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, end).unwrap();
        assert_eq!(
            window.archive_stem(),
            "2020_01_01_00_00_00T2020_01_02_00_00_00"
        );
    }
}
