use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::DownloadConfig;
use crate::domain::{Inventory, RemoveResponse, TimeWindow};
use crate::error::HarvestError;
use crate::trace::{RawStream, Segment, Trace, TraceHeader, merge_contiguous, seconds};

/// Turns a fetched stream into the trace stored in the archive.
///
/// Implementations must be deterministic: the scheduler never retries a
/// stream that failed here.
pub trait Preprocessor: Send + Sync {
    fn preprocess(
        &self,
        raw: RawStream,
        inventory: &Inventory,
        config: &DownloadConfig,
        window: &TimeWindow,
    ) -> Result<Trace, HarvestError>;
}

/// Gap filling, detrending, optional sensitivity correction, resampling
/// and trimming to the chunk window.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardPreprocessor;

impl Preprocessor for StandardPreprocessor {
    fn preprocess(
        &self,
        raw: RawStream,
        inventory: &Inventory,
        config: &DownloadConfig,
        window: &TimeWindow,
    ) -> Result<Trace, HarvestError> {
        let stream = dominant_stream(raw.segments)?;
        let rate = stream[0].sampling_rate;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(HarvestError::Preprocess(format!(
                "invalid sampling rate {rate}"
            )));
        }

        let (mut series, real_samples) = fill_gaps(&stream);
        let expected = (window.seconds() * rate).round().max(1.0);
        let gap_fraction = 1.0 - (real_samples as f64).min(expected) / expected;
        if gap_fraction > config.max_gap_fraction {
            return Err(HarvestError::Preprocess(format!(
                "{}.{}.{} is {:.0}% gaps in {window}",
                series.network,
                series.station,
                series.channel,
                gap_fraction * 100.0
            )));
        }

        detrend(&mut series.samples);

        if config.rm_resp == RemoveResponse::Inv {
            let sensitivity = inventory
                .find(&series.network, &series.station, &series.channel)
                .and_then(|entry| entry.sensitivity)
                .filter(|value| *value != 0.0)
                .ok_or_else(|| {
                    HarvestError::Preprocess(format!(
                        "no sensitivity for {}.{}.{}",
                        series.network, series.station, series.channel
                    ))
                })?;
            for sample in &mut series.samples {
                *sample /= sensitivity;
            }
        }

        let series = resample(series, config.samp_freq);
        let series = trim(series, window);
        if series.samples.is_empty() {
            return Err(HarvestError::Preprocess(format!(
                "no samples inside {window}"
            )));
        }

        debug!(
            stream = %format!("{}.{}.{}", series.network, series.station, series.channel),
            npts = series.samples.len(),
            gap_fraction,
            "preprocessed"
        );
        Ok(Trace {
            header: TraceHeader {
                network: series.network,
                station: series.station,
                location: series.location,
                channel: series.channel,
                starttime: series.starttime,
                sampling_rate: series.sampling_rate,
                npts: series.samples.len(),
            },
            samples: series.samples.iter().map(|value| *value as f32).collect(),
        })
    }
}

/// Keeps the stream identity with the most samples; wildcard requests can
/// return several locations.
fn dominant_stream(segments: Vec<Segment>) -> Result<Vec<Segment>, HarvestError> {
    let segments = merge_contiguous(segments);
    let mut groups: Vec<Vec<Segment>> = Vec::new();
    for segment in segments.into_iter().filter(|segment| !segment.samples.is_empty()) {
        match groups.iter_mut().find(|group| group[0].same_stream(&segment)) {
            Some(group) => group.push(segment),
            None => groups.push(vec![segment]),
        }
    }
    groups
        .into_iter()
        .max_by_key(|group| group.iter().map(|segment| segment.samples.len()).sum::<usize>())
        .ok_or_else(|| HarvestError::Preprocess("stream holds no samples".to_string()))
}

/// Joins sorted segments into one series, bridging gaps linearly and
/// dropping overlapping samples. Returns the series and its count of real
/// (not interpolated) samples.
fn fill_gaps(stream: &[Segment]) -> (Segment, usize) {
    let mut series = stream[0].clone();
    let mut real = series.samples.len();
    let delta = series.delta();
    for segment in &stream[1..] {
        let offset = offset_seconds(segment.starttime, series.next_sample_time());
        let shift = (offset / delta).round() as i64;
        if shift >= 0 {
            let missing = shift as usize;
            let before = series.samples.last().copied().unwrap_or(0.0);
            let after = segment.samples[0];
            for step in 1..=missing {
                let weight = step as f64 / (missing + 1) as f64;
                series.samples.push(before + (after - before) * weight);
            }
            series.samples.extend_from_slice(&segment.samples);
            real += segment.samples.len();
        } else {
            let overlap = shift.unsigned_abs() as usize;
            if overlap < segment.samples.len() {
                series.samples.extend_from_slice(&segment.samples[overlap..]);
                real += segment.samples.len() - overlap;
            }
        }
    }
    (series, real)
}

fn detrend(samples: &mut [f64]) {
    let count = samples.len();
    if count == 0 {
        return;
    }
    let n = count as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = samples.iter().sum::<f64>() / n;
    let mut covariance = 0.0;
    let mut variance = 0.0;
    for (index, value) in samples.iter().enumerate() {
        let dx = index as f64 - mean_x;
        covariance += dx * (value - mean_y);
        variance += dx * dx;
    }
    let slope = if variance > 0.0 { covariance / variance } else { 0.0 };
    for (index, value) in samples.iter_mut().enumerate() {
        *value -= mean_y + slope * (index as f64 - mean_x);
    }
}

fn resample(mut series: Segment, target: f64) -> Segment {
    let rate = series.sampling_rate;
    if (rate - target).abs() < 1e-9 || series.samples.is_empty() {
        return series;
    }

    let ratio = rate / target;
    let factor = ratio.round();
    series.samples = if ratio > 1.0 && (ratio - factor).abs() < 1e-6 {
        decimate(&series.samples, factor as usize)
    } else {
        interpolate(&series.samples, rate, target)
    };
    series.sampling_rate = target;
    series
}

/// Centered boxcar average, keeping every `factor`-th sample.
fn decimate(samples: &[f64], factor: usize) -> Vec<f64> {
    let half = factor / 2;
    (0..samples.len())
        .step_by(factor)
        .map(|center| {
            let lo = center.saturating_sub(half);
            let hi = (center + half).min(samples.len() - 1);
            let window = &samples[lo..=hi];
            window.iter().sum::<f64>() / window.len() as f64
        })
        .collect()
}

fn interpolate(samples: &[f64], rate: f64, target: f64) -> Vec<f64> {
    let last = samples.len() - 1;
    let count = (last as f64 * target / rate).floor() as usize + 1;
    (0..count)
        .map(|index| {
            let position = index as f64 * rate / target;
            let lo = position.floor() as usize;
            if lo >= last {
                return samples[last];
            }
            let fraction = position - lo as f64;
            samples[lo] + (samples[lo + 1] - samples[lo]) * fraction
        })
        .collect()
}

/// Keeps samples in `[window.start, window.end)`.
fn trim(mut series: Segment, window: &TimeWindow) -> Segment {
    let delta = series.delta();
    let lead = offset_seconds(window.start(), series.starttime);
    let skip = if lead > 0.0 {
        ((lead / delta) - 1e-6).ceil() as usize
    } else {
        0
    };
    let span = offset_seconds(window.end(), series.starttime);
    let keep_until = if span <= 0.0 {
        0
    } else {
        ((span / delta) - 1e-6).ceil() as usize
    };
    let keep_until = keep_until.min(series.samples.len());
    if skip >= keep_until {
        series.samples.clear();
        return series;
    }
    series.samples = series.samples[skip..keep_until].to_vec();
    series.starttime += seconds(skip as f64 * delta);
    series
}

fn offset_seconds(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    (later - earlier)
        .num_microseconds()
        .map_or(0.0, |micros| micros as f64 / 1_000_000.0)
}
