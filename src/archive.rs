//! Per-chunk waveform archive.
//!
//! Each chunk is a zip container:
//!
//! ```text
//! stations/NET.STA.json           station coordinates and channels
//! waveforms/NET.STA/<tag>.trace   one cleaned trace
//! provenance.json                 tool version and last write time
//! ```
//!
//! A `.trace` entry is `SHTR`, a version byte, a little-endian `u32` header
//! length, the JSON [`TraceHeader`] and then little-endian `f32` samples.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::domain::{ChannelEntry, Inventory, StationId, TimeWindow, WaveformTag};
use crate::error::HarvestError;
use crate::trace::{Trace, TraceHeader};

const STATIONS_DIR: &str = "stations";
const WAVEFORMS_DIR: &str = "waveforms";
const PROVENANCE_ENTRY: &str = "provenance.json";
const TRACE_EXTENSION: &str = "trace";
const TRACE_MAGIC: &[u8; 4] = b"SHTR";
const TRACE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationMetadata {
    pub network: String,
    pub station: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub channels: Vec<ChannelMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub channel: String,
    pub location: String,
    pub sample_rate: Option<f64>,
    pub sensitivity: Option<f64>,
}

impl StationMetadata {
    fn from_entries(entries: &[&ChannelEntry]) -> Option<Self> {
        let first = entries.first()?;
        Some(Self {
            network: first.network.clone(),
            station: first.station.clone(),
            latitude: first.latitude,
            longitude: first.longitude,
            elevation: first.elevation,
            channels: entries
                .iter()
                .map(|entry| ChannelMetadata {
                    channel: entry.channel.clone(),
                    location: entry.location.clone(),
                    sample_rate: entry.sample_rate,
                    sensitivity: entry.sensitivity,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub tool: String,
    pub written_at: String,
    pub window_start: String,
    pub window_end: String,
}

pub struct ChunkArchive;

impl ChunkArchive {
    /// Writes a container with no entries.
    pub fn create_empty(path: &Utf8Path) -> Result<(), HarvestError> {
        let temp = temp_beside(path)?;
        let temp = ZipWriter::new(temp)
            .finish()
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn open_read(path: &Utf8Path) -> Result<ArchiveReader, HarvestError> {
        ArchiveReader::open(path)
    }

    pub fn open_append(path: &Utf8Path, window: TimeWindow) -> Result<ArchiveWriter, HarvestError> {
        ArchiveWriter::open(path, window)
    }
}

/// Read-only view of a chunk archive.
pub struct ArchiveReader {
    path: Utf8PathBuf,
    archive: ZipArchive<File>,
    waveforms: BTreeMap<StationId, BTreeSet<WaveformTag>>,
    station_metadata: BTreeSet<StationId>,
}

impl ArchiveReader {
    pub fn open(path: &Utf8Path) -> Result<Self, HarvestError> {
        let archive = open_zip(path)?;

        let mut waveforms = BTreeMap::<StationId, BTreeSet<WaveformTag>>::new();
        let mut station_metadata = BTreeSet::new();
        for name in archive.file_names() {
            let parts: Vec<&str> = name.split('/').collect();
            match parts.as_slice() {
                [WAVEFORMS_DIR, station, file] => {
                    let Some(tag) = file.strip_suffix(&format!(".{TRACE_EXTENSION}")) else {
                        continue;
                    };
                    let Ok(station) = station.parse::<StationId>() else {
                        continue;
                    };
                    waveforms
                        .entry(station)
                        .or_default()
                        .insert(WaveformTag::from_stored(tag));
                }
                [STATIONS_DIR, file] => {
                    if let Some(Ok(station)) =
                        file.strip_suffix(".json").map(|stem| stem.parse::<StationId>())
                    {
                        station_metadata.insert(station);
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            archive,
            waveforms,
            station_metadata,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Stations holding at least one waveform.
    pub fn stations(&self) -> Vec<StationId> {
        self.waveforms.keys().cloned().collect()
    }

    pub fn tags(&self, station: &StationId) -> Vec<WaveformTag> {
        self.waveforms
            .get(station)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn waveform_count(&self) -> usize {
        self.waveforms.values().map(BTreeSet::len).sum()
    }

    /// Stations whose metadata is stored, whether or not they have data.
    pub fn metadata_stations(&self) -> Vec<StationId> {
        self.station_metadata.iter().cloned().collect()
    }

    pub fn read_waveform(&mut self, station: &StationId, tag: &WaveformTag) -> Result<Trace, HarvestError> {
        let bytes = self.read_entry(&waveform_entry(station, tag))?;
        decode_trace(&bytes)
    }

    pub fn station_metadata(&mut self, station: &StationId) -> Result<Option<StationMetadata>, HarvestError> {
        if !self.station_metadata.contains(station) {
            return Ok(None);
        }
        let bytes = self.read_entry(&station_entry(station))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| HarvestError::Archive(err.to_string()))
    }

    pub fn provenance(&mut self) -> Result<Option<Provenance>, HarvestError> {
        if self.archive.index_for_name(PROVENANCE_ENTRY).is_none() {
            return Ok(None);
        }
        let bytes = self.read_entry(PROVENANCE_ENTRY)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| HarvestError::Archive(err.to_string()))
    }

    fn read_entry(&mut self, name: &str) -> Result<Vec<u8>, HarvestError> {
        let mut entry = self
            .archive
            .by_name(name)
            .map_err(|err| HarvestError::Archive(format!("{}: {name}: {err}", self.path)))?;
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|err| HarvestError::Archive(format!("{}: {name}: {err}", self.path)))?;
        Ok(bytes)
    }
}

/// Exclusive append handle for one chunk archive.
///
/// New entries are staged in a temp file next to the archive. `commit`
/// carries over every prior entry that was not rewritten and swaps the file
/// into place, so whatever was committed survives a later failure or a
/// killed process. Entries staged since the last commit are lost if the
/// writer is dropped.
pub struct ArchiveWriter {
    path: Utf8PathBuf,
    window: TimeWindow,
    staging: Option<ZipWriter<NamedTempFile>>,
    staged: BTreeSet<String>,
    session_waveforms: BTreeSet<String>,
    uncommitted: usize,
}

impl ArchiveWriter {
    pub fn open(path: &Utf8Path, window: TimeWindow) -> Result<Self, HarvestError> {
        if path.as_std_path().exists() {
            open_zip(path)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            window,
            staging: None,
            staged: BTreeSet::new(),
            session_waveforms: BTreeSet::new(),
            uncommitted: 0,
        })
    }

    /// Writes one metadata entry per station, replacing earlier versions.
    pub fn add_station_metadata(&mut self, inventory: &Inventory) -> Result<usize, HarvestError> {
        let mut count = 0;
        for (station, entries) in inventory.stations() {
            let Some(metadata) = StationMetadata::from_entries(&entries) else {
                continue;
            };
            let name = station_entry(&station);
            if self.staged.contains(&name) {
                continue;
            }
            let bytes = serde_json::to_vec_pretty(&metadata)
                .map_err(|err| HarvestError::Archive(err.to_string()))?;
            self.stage(name, &bytes)?;
            count += 1;
        }
        Ok(count)
    }

    /// Stages one trace under `station`, the identity the ledger reads back.
    pub fn add_waveform(
        &mut self,
        station: &StationId,
        trace: &Trace,
        tag: &WaveformTag,
    ) -> Result<(), HarvestError> {
        let name = waveform_entry(station, tag);
        if self.session_waveforms.contains(&name) {
            return Err(HarvestError::Archive(format!(
                "{} already written to {} in this session",
                name, self.path
            )));
        }
        let bytes = encode_trace(trace)?;
        self.stage(name.clone(), &bytes)?;
        self.session_waveforms.insert(name);
        self.uncommitted += 1;
        Ok(())
    }

    /// Number of waveforms staged since the last commit.
    pub fn uncommitted(&self) -> usize {
        self.uncommitted
    }

    /// Makes every staged entry durable. A no-op when nothing is staged.
    pub fn commit(&mut self) -> Result<(), HarvestError> {
        let Some(mut writer) = self.staging.take() else {
            return Ok(());
        };
        let provenance = Provenance {
            tool: format!("seis-harvest/{}", env!("CARGO_PKG_VERSION")),
            written_at: chrono::Utc::now().to_rfc3339(),
            window_start: self.window.start().to_rfc3339(),
            window_end: self.window.end().to_rfc3339(),
        };
        let bytes = serde_json::to_vec_pretty(&provenance)
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
        write_entry(&mut writer, PROVENANCE_ENTRY, &bytes)?;
        self.staged.insert(PROVENANCE_ENTRY.to_string());

        let mut carried = 0usize;
        if self.path.as_std_path().exists() {
            let mut previous = open_zip(&self.path)?;
            for index in 0..previous.len() {
                let entry = previous
                    .by_index_raw(index)
                    .map_err(|err| HarvestError::Archive(err.to_string()))?;
                if self.staged.contains(entry.name()) {
                    continue;
                }
                writer
                    .raw_copy_file(entry)
                    .map_err(|err| HarvestError::Archive(err.to_string()))?;
                carried += 1;
            }
        }

        let temp = writer
            .finish()
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
        temp.persist(self.path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        debug!(
            archive = %self.path,
            added = self.uncommitted,
            carried,
            "archive committed"
        );
        self.staged.clear();
        self.uncommitted = 0;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), HarvestError> {
        self.commit()
    }

    fn stage(&mut self, name: String, bytes: &[u8]) -> Result<(), HarvestError> {
        let writer = match self.staging.take() {
            Some(writer) => writer,
            None => ZipWriter::new(temp_beside(&self.path)?),
        };
        let writer = self.staging.insert(writer);
        write_entry(writer, &name, bytes)?;
        self.staged.insert(name);
        Ok(())
    }
}

fn write_entry(writer: &mut ZipWriter<NamedTempFile>, name: &str, bytes: &[u8]) -> Result<(), HarvestError> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(3));
    writer
        .start_file(name, options)
        .map_err(|err| HarvestError::Archive(err.to_string()))?;
    writer
        .write_all(bytes)
        .map_err(|err| HarvestError::Archive(err.to_string()))
}

fn open_zip(path: &Utf8Path) -> Result<ZipArchive<File>, HarvestError> {
    let file = File::open(path.as_std_path())
        .map_err(|err| HarvestError::Filesystem(format!("open {path}: {err}")))?;
    ZipArchive::new(file).map_err(|err| HarvestError::Archive(format!("{path}: {err}")))
}

pub fn encode_trace(trace: &Trace) -> Result<Vec<u8>, HarvestError> {
    let mut header = trace.header.clone();
    header.npts = trace.samples.len();
    let header = serde_json::to_vec(&header).map_err(|err| HarvestError::Archive(err.to_string()))?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| HarvestError::Archive("trace header too large".to_string()))?;

    let mut out = Vec::with_capacity(9 + header.len() + trace.samples.len() * 4);
    out.extend_from_slice(TRACE_MAGIC);
    out.push(TRACE_VERSION);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header);
    for sample in &trace.samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Ok(out)
}

pub fn decode_trace(bytes: &[u8]) -> Result<Trace, HarvestError> {
    if bytes.len() < 9 || &bytes[..4] != TRACE_MAGIC {
        return Err(HarvestError::Archive("not a trace entry".to_string()));
    }
    if bytes[4] != TRACE_VERSION {
        return Err(HarvestError::Archive(format!(
            "unsupported trace version {}",
            bytes[4]
        )));
    }
    let header_len = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
    let body = &bytes[9..];
    if body.len() < header_len {
        return Err(HarvestError::Archive("truncated trace header".to_string()));
    }
    let header: TraceHeader = serde_json::from_slice(&body[..header_len])
        .map_err(|err| HarvestError::Archive(err.to_string()))?;
    let payload = &body[header_len..];
    if payload.len() != header.npts * 4 {
        return Err(HarvestError::Archive(format!(
            "trace announces {} samples but carries {} bytes",
            header.npts,
            payload.len()
        )));
    }
    let samples = payload
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(Trace { header, samples })
}

fn waveform_entry(station: &StationId, tag: &WaveformTag) -> String {
    format!("{WAVEFORMS_DIR}/{station}/{tag}.{TRACE_EXTENSION}")
}

fn station_entry(station: &StationId) -> String {
    format!("{STATIONS_DIR}/{station}.json")
}

fn temp_beside(path: &Utf8Path) -> Result<NamedTempFile, HarvestError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    tempfile::Builder::new()
        .prefix(".seis-harvest")
        .suffix(".zip.tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};

    use super::*;

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn entry(station: &str, channel: &str) -> ChannelEntry {
        ChannelEntry {
            network: "CI".to_string(),
            station: station.to_string(),
            channel: channel.to_string(),
            location: "*".to_string(),
            longitude: -118.0,
            latitude: 34.0,
            elevation: 10.0,
            sample_rate: Some(40.0),
            sensitivity: None,
        }
    }

    fn trace(station: &str, channel: &str, samples: Vec<f32>) -> Trace {
        Trace {
            header: TraceHeader {
                network: "CI".to_string(),
                station: station.to_string(),
                location: "".to_string(),
                channel: channel.to_string(),
                starttime: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
                sampling_rate: 20.0,
                npts: samples.len(),
            },
            samples,
        }
    }

    #[test]
    fn empty_archive_lists_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("chunk.zip")).unwrap();
        ChunkArchive::create_empty(&path).unwrap();
        let reader = ChunkArchive::open_read(&path).unwrap();
        assert!(reader.stations().is_empty());
        assert_eq!(reader.waveform_count(), 0);
    }

    #[test]
    fn append_keeps_prior_entries() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("chunk.zip")).unwrap();
        ChunkArchive::create_empty(&path).unwrap();
        let inventory = Inventory::new(vec![entry("SDD", "BHZ"), entry("RPV", "BHZ")]);
        let sdd = StationId::new("CI", "SDD");
        let tag = WaveformTag::derive("BHZ", "*");

        let mut writer = ChunkArchive::open_append(&path, window()).unwrap();
        assert_eq!(writer.add_station_metadata(&inventory).unwrap(), 2);
        writer
            .add_waveform(&sdd, &trace("SDD", "BHZ", vec![1.0, -2.5, 3.25]), &tag)
            .unwrap();
        writer.close().unwrap();

        let mut writer = ChunkArchive::open_append(&path, window()).unwrap();
        writer.add_station_metadata(&inventory).unwrap();
        writer
            .add_waveform(&sdd, &trace("SDD", "BHE", vec![4.0]), &WaveformTag::derive("BHE", "*"))
            .unwrap();
        writer.close().unwrap();

        let mut reader = ChunkArchive::open_read(&path).unwrap();
        assert_eq!(reader.stations(), vec![sdd.clone()]);
        assert_eq!(reader.tags(&sdd).len(), 2);
        assert_eq!(reader.metadata_stations().len(), 2);
        let stored = reader.read_waveform(&sdd, &tag).unwrap();
        assert_eq!(stored.samples, vec![1.0, -2.5, 3.25]);
        assert_eq!(stored.header.npts, 3);
        let metadata = reader.station_metadata(&sdd).unwrap().unwrap();
        assert_eq!(metadata.channels[0].sample_rate, Some(40.0));
        assert!(reader.provenance().unwrap().is_some());
    }

    #[test]
    fn dropped_writer_leaves_archive_untouched() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("chunk.zip")).unwrap();
        ChunkArchive::create_empty(&path).unwrap();
        {
            let mut writer = ChunkArchive::open_append(&path, window()).unwrap();
            writer
                .add_waveform(
                    &StationId::new("CI", "SDD"),
                    &trace("SDD", "BHZ", vec![1.0]),
                    &WaveformTag::derive("BHZ", "*"),
                )
                .unwrap();
        }
        let reader = ChunkArchive::open_read(&path).unwrap();
        assert_eq!(reader.waveform_count(), 0);
        let leftovers = std::fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn committed_waveforms_survive_a_later_failure() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("chunk.zip")).unwrap();
        ChunkArchive::create_empty(&path).unwrap();
        let sdd = StationId::new("CI", "SDD");
        let bhz = WaveformTag::derive("BHZ", "*");
        let bhe = WaveformTag::derive("BHE", "*");
        {
            let mut writer = ChunkArchive::open_append(&path, window()).unwrap();
            writer.add_waveform(&sdd, &trace("SDD", "BHZ", vec![1.0]), &bhz).unwrap();
            assert_eq!(writer.uncommitted(), 1);
            writer.commit().unwrap();
            assert_eq!(writer.uncommitted(), 0);

            writer.add_waveform(&sdd, &trace("SDD", "BHE", vec![2.0]), &bhe).unwrap();
            let duplicate = writer.add_waveform(&sdd, &trace("SDD", "BHZ", vec![3.0]), &bhz);
            assert_matches!(duplicate, Err(HarvestError::Archive(_)));
        }

        let mut reader = ChunkArchive::open_read(&path).unwrap();
        assert_eq!(reader.tags(&sdd), vec![bhz.clone()]);
        assert_eq!(reader.read_waveform(&sdd, &bhz).unwrap().samples, vec![1.0]);
        assert!(reader.provenance().unwrap().is_some());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn close_after_a_rejected_waveform_keeps_the_rest() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("chunk.zip")).unwrap();
        let sdd = StationId::new("CI", "SDD");
        let bhz = WaveformTag::derive("BHZ", "*");

        let mut writer = ChunkArchive::open_append(&path, window()).unwrap();
        writer.add_waveform(&sdd, &trace("SDD", "BHZ", vec![1.0]), &bhz).unwrap();
        writer.commit().unwrap();
        writer
            .add_waveform(&sdd, &trace("SDD", "BHE", vec![2.0]), &WaveformTag::derive("BHE", "*"))
            .unwrap();
        assert!(writer.add_waveform(&sdd, &trace("SDD", "BHZ", vec![3.0]), &bhz).is_err());
        writer.close().unwrap();

        let reader = ChunkArchive::open_read(&path).unwrap();
        assert_eq!(reader.tags(&sdd).len(), 2);
    }

    #[test]
    fn waveform_is_filed_under_the_given_station() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("chunk.zip")).unwrap();
        let requested = StationId::new("CI", "sdd");
        let tag = WaveformTag::derive("BHZ", "*");

        let mut writer = ChunkArchive::open_append(&path, window()).unwrap();
        writer.add_waveform(&requested, &trace("SDD", "BHZ", vec![1.0]), &tag).unwrap();
        writer.close().unwrap();

        let reader = ChunkArchive::open_read(&path).unwrap();
        assert_eq!(reader.stations(), vec![requested.clone()]);
        assert_eq!(reader.tags(&requested), vec![tag]);
    }

    #[test]
    fn rejects_corrupt_trace_bytes() {
        let bytes = encode_trace(&trace("SDD", "BHZ", vec![1.0, 2.0])).unwrap();
        assert!(decode_trace(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_trace(b"nope").is_err());
    }
}
