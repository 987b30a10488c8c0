use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8Path;
use tracing::info;

use crate::archive::ArchiveReader;
use crate::domain::{ChannelEntry, Inventory, StationId, WaveformTag};
use crate::error::HarvestError;

/// What one chunk archive already holds, derived fresh from disk on each run.
#[derive(Debug, Clone, Default)]
pub struct ArchiveLedger {
    recorded: BTreeMap<StationId, BTreeSet<WaveformTag>>,
    expected: BTreeMap<StationId, usize>,
}

impl ArchiveLedger {
    /// A ledger for an archive that does not exist yet.
    pub fn empty(inventory: &Inventory) -> Self {
        Self {
            recorded: BTreeMap::new(),
            expected: inventory.expected_channels(),
        }
    }

    /// Reads the archive at `path` and keeps the stations the inventory targets.
    pub fn scan(path: &Utf8Path, inventory: &Inventory) -> Result<Self, HarvestError> {
        if !path.as_std_path().exists() {
            return Ok(Self::empty(inventory));
        }
        let reader = ArchiveReader::open(path)?;
        Ok(Self::from_reader(&reader, inventory))
    }

    pub fn from_reader(reader: &ArchiveReader, inventory: &Inventory) -> Self {
        let expected = inventory.expected_channels();
        let mut recorded = BTreeMap::new();
        for station in reader.stations() {
            if !expected.contains_key(&station) {
                continue;
            }
            let tags: BTreeSet<WaveformTag> = reader.tags(&station).into_iter().collect();
            info!(
                archive = %reader.path(),
                station = %station,
                records = tags.len(),
                "records found in archive"
            );
            recorded.insert(station, tags);
        }
        Self { recorded, expected }
    }

    pub fn recorded_count(&self, station: &StationId) -> usize {
        self.recorded.get(station).map_or(0, BTreeSet::len)
    }

    pub fn expected_count(&self, station: &StationId) -> usize {
        self.expected.get(station).copied().unwrap_or(0)
    }

    /// Station identity to number of recorded tags.
    pub fn counts(&self) -> BTreeMap<StationId, usize> {
        self.recorded
            .iter()
            .map(|(station, tags)| (station.clone(), tags.len()))
            .collect()
    }

    pub fn is_complete(&self, station: &StationId) -> bool {
        let expected = self.expected_count(station);
        expected > 0 && self.recorded_count(station) >= expected
    }

    pub fn contains(&self, station: &StationId, tag: &WaveformTag) -> bool {
        self.recorded
            .get(station)
            .is_some_and(|tags| tags.contains(tag))
    }

    pub fn should_fetch(&self, entry: &ChannelEntry) -> bool {
        let station = entry.station_id();
        !self.is_complete(&station) && !self.contains(&station, &entry.tag())
    }

    /// Splits the inventory into entries to fetch and the number skipped.
    ///
    /// Entries that map to the same storage tag of a station (a blank and a
    /// `00` location, say) share one slot: only the first is scheduled.
    pub fn pending<'a>(&self, inventory: &'a Inventory) -> (Vec<(usize, &'a ChannelEntry)>, usize) {
        let mut pending = Vec::new();
        let mut scheduled = BTreeSet::<(StationId, WaveformTag)>::new();
        let mut skipped = 0;
        for (index, entry) in inventory.entries().iter().enumerate() {
            if self.should_fetch(entry) && scheduled.insert((entry.station_id(), entry.tag())) {
                pending.push((index, entry));
            } else {
                skipped += 1;
            }
        }
        (pending, skipped)
    }
}
