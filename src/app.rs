use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;
use tracing::{info, warn};

use crate::archive::{ArchiveReader, ChunkArchive, Provenance};
use crate::budget::{MemoryBudgetEstimator, MemoryEstimate};
use crate::config::DownloadConfig;
use crate::domain::{Inventory, TimeWindow};
use crate::error::HarvestError;
use crate::fdsn::FdsnClient;
use crate::inventory::{InventoryResolver, InventorySource};
use crate::ledger::ArchiveLedger;
use crate::planner::ChunkPlanner;
use crate::preprocess::Preprocessor;
use crate::scheduler::{FetchScheduler, FetchTask, TaskOutcome};
use crate::store::Store;

/// Waveforms staged before a chunk archive is committed to disk.
const COMMIT_EVERY: usize = 16;

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub inventory_source: InventorySource,
    pub station_table: String,
    pub stream_count: usize,
    pub memory_gb: f64,
    pub chunks: Vec<ChunkReport>,
}

impl DownloadReport {
    pub fn written(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.written).sum()
    }

    pub fn failed(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.failed).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkReport {
    pub window_start: String,
    pub window_end: String,
    pub archive: String,
    pub skipped: usize,
    pub scheduled: usize,
    pub written: usize,
    pub no_data: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub windows: Vec<TimeWindow>,
    /// Streams implied by the configured code lists; wildcards count once.
    pub configured_streams: usize,
    pub memory: MemoryEstimate,
    pub within_budget: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub archive: String,
    pub provenance: Option<Provenance>,
    pub stations: Vec<InspectStation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectStation {
    pub station: String,
    pub has_metadata: bool,
    pub waveforms: Vec<InspectWaveform>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectWaveform {
    pub tag: String,
    pub starttime: String,
    pub endtime: String,
    pub sampling_rate: f64,
    pub npts: usize,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<C: FdsnClient, P: Preprocessor> {
    store: Store,
    client: C,
    preprocessor: P,
}

impl<C: FdsnClient, P: Preprocessor> App<C, P> {
    pub fn new(store: Store, client: C, preprocessor: P) -> Self {
        Self {
            store,
            client,
            preprocessor,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn download(
        &self,
        config: &DownloadConfig,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadReport, HarvestError> {
        let windows = ChunkPlanner::plan(config.start, config.end, config.inc_hours)?;
        sink.event(ProgressEvent {
            message: format!("phase=Plan; {} chunk(s) of {} h", windows.len(), config.inc_hours),
            elapsed: None,
        });

        self.store.ensure_root()?;
        let started = Instant::now();
        let resolved = InventoryResolver::new(&self.client, &self.store).resolve(config)?;
        if resolved.inventory.is_empty() {
            return Err(HarvestError::EmptyInventory);
        }
        sink.event(ProgressEvent {
            message: format!(
                "phase=Inventory; {} channel(s) at {} station(s)",
                resolved.inventory.len(),
                resolved.inventory.expected_channels().len()
            ),
            elapsed: Some(started.elapsed()),
        });

        let estimate = MemoryBudgetEstimator::check(MemoryBudgetEstimator::for_config(
            config,
            resolved.inventory.len(),
        ))?;
        resolved.persist()?;
        sink.event(ProgressEvent {
            message: format!("phase=Budget; {:.3} GB per chunk", estimate.gigabytes),
            elapsed: None,
        });

        let mut chunks = Vec::with_capacity(windows.len());
        for (position, window) in windows.iter().enumerate() {
            sink.event(ProgressEvent {
                message: format!("phase=Chunk; {}/{} {window}", position + 1, windows.len()),
                elapsed: None,
            });
            chunks.push(self.download_chunk(config, &resolved.inventory, *window, sink)?);
        }

        Ok(DownloadReport {
            inventory_source: resolved.source,
            station_table: resolved.station_table.to_string(),
            stream_count: resolved.inventory.len(),
            memory_gb: estimate.gigabytes,
            chunks,
        })
    }

    fn download_chunk(
        &self,
        config: &DownloadConfig,
        inventory: &Inventory,
        window: TimeWindow,
        sink: &dyn ProgressSink,
    ) -> Result<ChunkReport, HarvestError> {
        let started = Instant::now();
        let path = self.store.archive_path(&window);
        if !self.store.exists(&path) {
            ChunkArchive::create_empty(&path)?;
        }

        let ledger = ArchiveLedger::scan(&path, inventory)?;
        let (pending, skipped) = ledger.pending(inventory);
        let tasks: Vec<FetchTask<'_>> = pending
            .into_iter()
            .map(|(index, entry)| FetchTask {
                index,
                entry,
                window,
            })
            .collect();

        let mut report = ChunkReport {
            window_start: window.start().to_rfc3339(),
            window_end: window.end().to_rfc3339(),
            archive: path.to_string(),
            skipped,
            scheduled: tasks.len(),
            written: 0,
            no_data: 0,
            failed: 0,
        };
        sink.event(ProgressEvent {
            message: format!(
                "phase=Fetch; {} scheduled, {} already archived",
                report.scheduled, report.skipped
            ),
            elapsed: None,
        });

        let mut writer = ChunkArchive::open_append(&path, window)?;
        writer.add_station_metadata(inventory)?;

        let scheduler = FetchScheduler::new(&self.client, &self.preprocessor, config, inventory);
        let drained = scheduler.run(tasks, |result| {
            let entry = &inventory.entries()[result.index];
            match result.outcome {
                TaskOutcome::Success(trace) => {
                    let station = entry.station_id();
                    let tag = entry.tag();
                    writer.add_waveform(&station, &trace, &tag)?;
                    info!(
                        station = %station,
                        tag = %tag,
                        attempts = result.attempts,
                        "downloaded"
                    );
                    report.written += 1;
                    if writer.uncommitted() >= COMMIT_EVERY {
                        writer.commit()?;
                    }
                }
                TaskOutcome::NoData => report.no_data += 1,
                TaskOutcome::Failed { .. } => report.failed += 1,
            }
            Ok(())
        });
        if let Err(err) = drained {
            // Keep what already arrived; the ledger picks up the rest next run.
            if let Err(close_err) = writer.close() {
                warn!(archive = %path, error = %close_err, "could not save partial chunk");
            }
            return Err(err);
        }
        writer.close()?;

        info!(
            archive = %path,
            written = report.written,
            no_data = report.no_data,
            failed = report.failed,
            skipped = report.skipped,
            "chunk finished"
        );
        sink.event(ProgressEvent {
            message: format!(
                "phase=Store; {} written, {} without data, {} failed",
                report.written, report.no_data, report.failed
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(report)
    }
}

/// Chunk windows and the memory estimate, without touching the network
/// or the disk.
pub fn plan(config: &DownloadConfig) -> Result<PlanReport, HarvestError> {
    let windows = ChunkPlanner::plan(config.start, config.end, config.inc_hours)?;
    let configured_streams =
        config.networks.len() * config.stations.len() * config.channels.len();
    let memory = MemoryBudgetEstimator::for_config(config, configured_streams);
    let within_budget = MemoryBudgetEstimator::check(memory).is_ok();
    Ok(PlanReport {
        windows,
        configured_streams,
        memory,
        within_budget,
    })
}

pub fn inspect(path: &Utf8Path) -> Result<InspectReport, HarvestError> {
    let mut reader = ArchiveReader::open(path)?;
    let provenance = reader.provenance()?;

    let mut station_ids = reader.metadata_stations();
    for station in reader.stations() {
        if !station_ids.contains(&station) {
            station_ids.push(station);
        }
    }
    station_ids.sort();

    let mut stations = Vec::with_capacity(station_ids.len());
    for station in station_ids {
        let has_metadata = reader.station_metadata(&station)?.is_some();
        let mut waveforms = Vec::new();
        for tag in reader.tags(&station) {
            let trace = reader.read_waveform(&station, &tag)?;
            waveforms.push(InspectWaveform {
                tag: tag.to_string(),
                starttime: trace.header.starttime.to_rfc3339(),
                endtime: trace.endtime().to_rfc3339(),
                sampling_rate: trace.header.sampling_rate,
                npts: trace.header.npts,
            });
        }
        stations.push(InspectStation {
            station: station.to_string(),
            has_metadata,
            waveforms,
        });
    }

    Ok(InspectReport {
        archive: path.to_string(),
        provenance,
        stations,
    })
}
