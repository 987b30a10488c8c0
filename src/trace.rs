use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Contiguous run of raw samples for one channel, as decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub starttime: DateTime<Utc>,
    pub sampling_rate: f64,
    pub samples: Vec<f64>,
}

impl Segment {
    pub fn delta(&self) -> f64 {
        1.0 / self.sampling_rate
    }

    /// Time of the sample that would follow the last one.
    pub fn next_sample_time(&self) -> DateTime<Utc> {
        self.starttime + seconds(self.samples.len() as f64 * self.delta())
    }

    pub fn same_stream(&self, other: &Segment) -> bool {
        self.network == other.network
            && self.station == other.station
            && self.location == other.location
            && self.channel == other.channel
            && (self.sampling_rate - other.sampling_rate).abs() < 1e-9
    }
}

/// Everything the service returned for one request, possibly with gaps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStream {
    pub segments: Vec<Segment>,
}

impl RawStream {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|segment| segment.samples.is_empty())
    }

    pub fn sample_count(&self) -> usize {
        self.segments.iter().map(|segment| segment.samples.len()).sum()
    }
}

/// Cleaned waveform ready to be archived.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub header: TraceHeader,
    pub samples: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceHeader {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    pub starttime: DateTime<Utc>,
    pub sampling_rate: f64,
    pub npts: usize,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn endtime(&self) -> DateTime<Utc> {
        let span = self.samples.len().saturating_sub(1) as f64 / self.header.sampling_rate;
        self.header.starttime + seconds(span)
    }
}

pub(crate) fn seconds(value: f64) -> Duration {
    Duration::microseconds((value * 1_000_000.0).round() as i64)
}

/// Joins time-adjacent segments of the same stream; a segment starting within
/// half a sample of where the previous one ended continues it.
pub fn merge_contiguous(mut segments: Vec<Segment>) -> Vec<Segment> {
    segments.sort_by(|a, b| {
        (&a.network, &a.station, &a.location, &a.channel, a.starttime).cmp(&(
            &b.network,
            &b.station,
            &b.location,
            &b.channel,
            b.starttime,
        ))
    });
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments {
        if let Some(last) = merged.last_mut() {
            if last.same_stream(&segment) {
                let gap = (segment.starttime - last.next_sample_time()).num_microseconds();
                let tolerance = 0.5 * last.delta() * 1_000_000.0;
                if let Some(gap) = gap {
                    if (gap as f64).abs() <= tolerance {
                        last.samples.extend(segment.samples);
                        continue;
                    }
                }
            }
        }
        merged.push(segment);
    }
    merged
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn segment(start_sec: u32, samples: usize) -> Segment {
        Segment {
            network: "IU".to_string(),
            station: "ANMO".to_string(),
            location: "00".to_string(),
            channel: "BHZ".to_string(),
            starttime: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, start_sec).unwrap(),
            sampling_rate: 1.0,
            samples: vec![1.0; samples],
        }
    }

    #[test]
    fn adjacent_segments_are_joined() {
        let merged = merge_contiguous(vec![segment(10, 5), segment(0, 10)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].samples.len(), 15);
    }

    #[test]
    fn gapped_segments_stay_apart() {
        let merged = merge_contiguous(vec![segment(0, 10), segment(20, 5)]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn trace_endtime_is_last_sample() {
        let trace = Trace {
            header: TraceHeader {
                network: "IU".to_string(),
                station: "ANMO".to_string(),
                location: "00".to_string(),
                channel: "BHZ".to_string(),
                starttime: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
                sampling_rate: 2.0,
                npts: 5,
            },
            samples: vec![0.0; 5],
        };
        assert_eq!(
            trace.endtime(),
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 2).unwrap()
        );
    }
}
