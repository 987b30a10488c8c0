use std::io::{self, Write};

use serde::Serialize;

use crate::app::{DownloadReport, InspectReport, PlanReport, ProgressEvent, ProgressSink};

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_download(report: &DownloadReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_plan(report: &PlanReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_inspect(reports: &[InspectReport]) -> io::Result<()> {
        Self::print_json(&reports)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-readable progress on stderr and summaries on stdout.
pub struct ConsoleOutput;

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        let mut stderr = io::stderr();
        let _ = match event.elapsed {
            Some(elapsed) => writeln!(
                stderr,
                "{CYAN}>{RESET} {} ({:.1}s)",
                event.message,
                elapsed.as_secs_f64()
            ),
            None => writeln!(stderr, "{CYAN}>{RESET} {}", event.message),
        };
    }
}

impl ConsoleOutput {
    pub fn print_download(report: &DownloadReport) {
        println!("{CYAN}seis-harvest summary{RESET}");
        println!(
            "  inventory: {} stream(s) from {:?}, table {}",
            report.stream_count, report.inventory_source, report.station_table
        );
        println!("  memory per chunk: {:.3} GB", report.memory_gb);
        for chunk in &report.chunks {
            let color = if chunk.failed > 0 { YELLOW } else { GREEN };
            println!(
                "{color}  {} -> {}: {} written, {} skipped, {} no data, {} failed{RESET}",
                chunk.window_start,
                chunk.archive,
                chunk.written,
                chunk.skipped,
                chunk.no_data,
                chunk.failed
            );
        }
        if report.failed() > 0 {
            println!(
                "{RED}  {} channel(s) failed; run again to retry them{RESET}",
                report.failed()
            );
        } else {
            println!("{GREEN}  {} waveform(s) written{RESET}", report.written());
        }
    }

    pub fn print_plan(report: &PlanReport) {
        println!("{CYAN}{} chunk(s){RESET}", report.windows.len());
        for window in &report.windows {
            println!("  {window}");
        }
        let color = if report.within_budget { GREEN } else { RED };
        println!(
            "{color}  {:.3} GB per chunk for {} configured stream(s), {} segment(s) of {} sample(s){RESET}",
            report.memory.gigabytes,
            report.configured_streams,
            report.memory.segments_per_chunk,
            report.memory.samples_per_chunk
        );
    }

    pub fn print_inspect(reports: &[InspectReport]) {
        for report in reports {
            println!("{CYAN}{}{RESET}", report.archive);
            if let Some(provenance) = &report.provenance {
                println!("  written by {} at {}", provenance.tool, provenance.written_at);
            }
            for station in &report.stations {
                let marker = if station.has_metadata { "" } else { " (no metadata)" };
                println!("  {}{marker}", station.station);
                for waveform in &station.waveforms {
                    println!(
                        "    {} {} - {} {} Hz, {} samples",
                        waveform.tag,
                        waveform.starttime,
                        waveform.endtime,
                        waveform.sampling_rate,
                        waveform.npts
                    );
                }
            }
        }
    }
}
