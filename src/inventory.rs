use camino::{Utf8Path, Utf8PathBuf};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::DownloadConfig;
use crate::domain::{ChannelEntry, Inventory, LocationPolicy, WILDCARD_LOCATION};
use crate::error::HarvestError;
use crate::fdsn::{FdsnClient, InventoryQuery, NetworkInventory};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InventorySource {
    StationTable,
    Service,
}

#[derive(Debug, Clone)]
pub struct ResolvedInventory {
    pub inventory: Inventory,
    pub source: InventorySource,
    pub station_table: Utf8PathBuf,
}

impl ResolvedInventory {
    /// Saves a service-resolved inventory as the station table. A table that
    /// was read from disk, or an empty result, leaves the directory alone.
    pub fn persist(&self) -> Result<bool, HarvestError> {
        if self.source != InventorySource::Service || self.inventory.is_empty() {
            return Ok(false);
        }
        StationTable::write(&self.station_table, &self.inventory)?;
        info!(path = %self.station_table, channels = self.inventory.len(), "station table saved");
        Ok(true)
    }
}

/// Produces the channel list for a run, from a saved station table or the
/// data centre's station service. Nothing is written here; see
/// [`ResolvedInventory::persist`].
pub struct InventoryResolver<'a, C: FdsnClient> {
    client: &'a C,
    table_path: Utf8PathBuf,
}

impl<'a, C: FdsnClient> InventoryResolver<'a, C> {
    pub fn new(client: &'a C, store: &Store) -> Self {
        Self {
            client,
            table_path: store.station_table_path(),
        }
    }

    pub fn resolve(&self, config: &DownloadConfig) -> Result<ResolvedInventory, HarvestError> {
        let (inventory, source) = if config.down_list {
            (StationTable::read(&self.table_path)?, InventorySource::StationTable)
        } else {
            let query = InventoryQuery::from_config(config);
            let networks = self.client.fetch_inventory(&query)?;
            (flatten(&networks, config.location_policy), InventorySource::Service)
        };

        info!(
            channels = inventory.len(),
            stations = inventory.expected_channels().len(),
            source = ?source,
            "inventory resolved"
        );
        Ok(ResolvedInventory {
            inventory,
            source,
            station_table: self.table_path.clone(),
        })
    }
}

/// Turns the network/station/channel hierarchy into flat entries.
pub fn flatten(networks: &[NetworkInventory], policy: LocationPolicy) -> Inventory {
    let mut entries = Vec::new();
    for network in networks {
        for station in &network.stations {
            let first_location = station
                .channels
                .first()
                .map(|channel| channel.location.as_str())
                .unwrap_or_default();
            for channel in &station.channels {
                let location = match policy {
                    LocationPolicy::First => first_location,
                    LocationPolicy::PerChannel => channel.location.as_str(),
                };
                entries.push(ChannelEntry {
                    network: network.code.clone(),
                    station: station.code.clone(),
                    channel: channel.code.clone(),
                    location: normalize_location(location),
                    longitude: station.longitude,
                    latitude: station.latitude,
                    elevation: station.elevation,
                    sample_rate: channel.sample_rate,
                    sensitivity: channel.sensitivity,
                });
            }
        }
    }
    Inventory::new(entries)
}

fn normalize_location(location: &str) -> String {
    let trimmed = location.trim();
    if trimmed.is_empty() || trimmed == "--" {
        WILDCARD_LOCATION.to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StationRow {
    network: String,
    station: String,
    channel: String,
    latitude: f64,
    longitude: f64,
    elevation: f64,
    #[serde(default = "wildcard_location")]
    location: String,
    #[serde(default)]
    sensitivity: Option<f64>,
}

fn wildcard_location() -> String {
    WILDCARD_LOCATION.to_string()
}

/// Flat `station.csv` kept next to the archives.
pub struct StationTable;

impl StationTable {
    pub fn read(path: &Utf8Path) -> Result<Inventory, HarvestError> {
        if !path.as_std_path().exists() {
            return Err(HarvestError::MissingInput(path.as_std_path().to_path_buf()));
        }
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path.as_std_path())
            .map_err(|err| HarvestError::StationTable(format!("{path}: {err}")))?;

        let mut entries = Vec::new();
        for row in reader.deserialize::<StationRow>() {
            let row = row.map_err(|err| HarvestError::StationTable(format!("{path}: {err}")))?;
            entries.push(ChannelEntry {
                network: row.network,
                station: row.station,
                channel: row.channel,
                location: normalize_location(&row.location),
                longitude: row.longitude,
                latitude: row.latitude,
                elevation: row.elevation,
                sample_rate: None,
                sensitivity: row.sensitivity,
            });
        }
        Ok(Inventory::new(entries))
    }

    pub fn write(path: &Utf8Path, inventory: &Inventory) -> Result<(), HarvestError> {
        let mut writer = WriterBuilder::new().from_writer(Vec::new());
        for entry in inventory.entries() {
            writer
                .serialize(StationRow {
                    network: entry.network.clone(),
                    station: entry.station.clone(),
                    channel: entry.channel.clone(),
                    latitude: entry.latitude,
                    longitude: entry.longitude,
                    elevation: entry.elevation,
                    location: entry.location.clone(),
                    sensitivity: entry.sensitivity,
                })
                .map_err(|err| HarvestError::StationTable(err.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| HarvestError::StationTable(err.to_string()))?;
        Store::write_bytes_atomic(path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;
    use crate::config::{BoundingBox, ServiceEndpoint};
    use crate::domain::{RemoveResponse, TimeWindow};
    use crate::fdsn::{ChannelInventory, StationInventory};
    use crate::trace::RawStream;

    struct MockClient {
        networks: Vec<NetworkInventory>,
        queries: Mutex<Vec<InventoryQuery>>,
    }

    impl FdsnClient for MockClient {
        fn fetch_inventory(&self, query: &InventoryQuery) -> Result<Vec<NetworkInventory>, HarvestError> {
            self.queries.lock().unwrap().push(query.clone());
            Ok(self.networks.clone())
        }

        fn fetch_waveform(&self, entry: &ChannelEntry, _window: &TimeWindow) -> Result<RawStream, HarvestError> {
            Err(HarvestError::NoData(entry.label()))
        }
    }

    fn channel(code: &str, location: &str) -> ChannelInventory {
        ChannelInventory {
            code: code.to_string(),
            location: location.to_string(),
            sample_rate: Some(40.0),
            sensitivity: Some(6.0e8),
        }
    }

    fn hierarchy() -> Vec<NetworkInventory> {
        vec![NetworkInventory {
            code: "CI".to_string(),
            stations: vec![
                StationInventory {
                    code: "SDD".to_string(),
                    latitude: 34.0,
                    longitude: -118.1,
                    elevation: 120.0,
                    channels: vec![channel("BHZ", "00"), channel("BHZ", "10"), channel("BHE", "10")],
                },
                StationInventory {
                    code: "RPV".to_string(),
                    latitude: 33.7,
                    longitude: -118.3,
                    elevation: 60.0,
                    channels: vec![channel("BHZ", "")],
                },
            ],
        }]
    }

    fn config(down_list: bool) -> DownloadConfig {
        DownloadConfig {
            service: ServiceEndpoint::resolve("SCEDC").unwrap(),
            networks: vec!["CI".to_string()],
            stations: vec!["SDD".to_string(), "RPV".to_string()],
            channels: vec!["BHZ".to_string(), "BHE".to_string()],
            start: crate::config::parse_timestamp("2020-01-01T00:00:00").unwrap(),
            end: crate::config::parse_timestamp("2020-01-02T00:00:00").unwrap(),
            inc_hours: 24.0,
            bbox: BoundingBox {
                lamin: 31.0,
                lamax: 36.0,
                lomin: -122.0,
                lomax: -115.0,
            },
            cc_len: 1800.0,
            step: 450.0,
            samp_freq: 20.0,
            rm_resp: RemoveResponse::No,
            down_list,
            location_policy: LocationPolicy::First,
            max_workers: 2,
            fetch_attempts: 5,
            retry_delay: std::time::Duration::ZERO,
            timeout: std::time::Duration::from_secs(15),
            request_timeout: std::time::Duration::from_secs(600),
            max_gap_fraction: 0.5,
        }
    }

    #[test]
    fn first_location_policy_collapses_locations() {
        let inventory = flatten(&hierarchy(), LocationPolicy::First);
        let keys: Vec<String> = inventory
            .entries()
            .iter()
            .map(|entry| format!("{}.{}.{}", entry.station, entry.location, entry.channel))
            .collect();
        assert_eq!(keys, vec!["SDD.00.BHZ", "SDD.00.BHE", "RPV.*.BHZ"]);
    }

    #[test]
    fn per_channel_policy_keeps_each_location() {
        let inventory = flatten(&hierarchy(), LocationPolicy::PerChannel);
        assert_eq!(inventory.len(), 4);
        assert_eq!(inventory.entries()[1].location, "10");
    }

    #[test]
    fn query_mode_saves_station_table_on_persist() {
        let temp = tempfile::tempdir().unwrap();
        let store = Store::from_std(temp.path()).unwrap();
        let client = MockClient {
            networks: hierarchy(),
            queries: Mutex::new(Vec::new()),
        };
        let resolved = InventoryResolver::new(&client, &store)
            .resolve(&config(false))
            .unwrap();
        assert_eq!(resolved.source, InventorySource::Service);
        assert_eq!(resolved.inventory.len(), 3);

        let queries = client.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].requests.len(), 4);
        assert!(!store.station_table_path().as_std_path().exists());

        assert!(resolved.persist().unwrap());
        let reread = StationTable::read(&store.station_table_path()).unwrap();
        assert_eq!(reread.len(), 3);
        assert_eq!(reread.entries()[0].tag(), resolved.inventory.entries()[0].tag());
        assert_eq!(reread.entries()[0].sensitivity, Some(6.0e8));
    }

    #[test]
    fn table_inventory_is_not_rewritten() {
        let temp = tempfile::tempdir().unwrap();
        let store = Store::from_std(temp.path()).unwrap();
        let table = "network,station,channel,latitude,longitude,elevation\nCI,SDD,BHZ,34.0,-118.1,120.0\n";
        std::fs::write(store.station_table_path().as_std_path(), table).unwrap();
        let client = MockClient {
            networks: hierarchy(),
            queries: Mutex::new(Vec::new()),
        };
        let resolved = InventoryResolver::new(&client, &store)
            .resolve(&config(true))
            .unwrap();
        assert!(!resolved.persist().unwrap());
        let on_disk = std::fs::read_to_string(store.station_table_path().as_std_path()).unwrap();
        assert_eq!(on_disk, table);
    }

    #[test]
    fn list_mode_requires_station_table() {
        let temp = tempfile::tempdir().unwrap();
        let store = Store::from_std(temp.path()).unwrap();
        let client = MockClient {
            networks: hierarchy(),
            queries: Mutex::new(Vec::new()),
        };
        let result = InventoryResolver::new(&client, &store).resolve(&config(true));
        assert_matches!(result, Err(HarvestError::MissingInput(_)));
        assert!(client.queries.lock().unwrap().is_empty());
    }

    #[test]
    fn reads_table_without_location_column() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("station.csv")).unwrap();
        std::fs::write(
            path.as_std_path(),
            "network,station,channel,latitude,longitude,elevation\nCI,SDD,BHZ,34.0,-118.1,120.0\n",
        )
        .unwrap();
        let inventory = StationTable::read(&path).unwrap();
        assert_eq!(inventory.entries()[0].location, "*");
        assert_eq!(inventory.entries()[0].tag().as_str(), "bhz_00");
    }
}
