use serde::Serialize;

use crate::config::DownloadConfig;
use crate::error::HarvestError;

/// Per-chunk memory ceiling in gigabytes.
pub const MAX_MEMORY_GB: f64 = 5.0;

const BYTES_PER_SAMPLE: u64 = 4;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryEstimate {
    pub stream_count: usize,
    pub segments_per_chunk: u64,
    pub samples_per_chunk: u64,
    pub projected_bytes: u64,
    pub gigabytes: f64,
}

pub struct MemoryBudgetEstimator;

impl MemoryBudgetEstimator {
    /// Peak float32 footprint of one chunk holding `stream_count` streams.
    pub fn estimate(
        chunk_seconds: f64,
        cc_len: f64,
        step: f64,
        sample_rate: f64,
        stream_count: usize,
    ) -> MemoryEstimate {
        let segments = ((chunk_seconds - cc_len) / step).floor() + 1.0;
        let segments_per_chunk = if segments > 0.0 { segments as u64 } else { 0 };
        let samples_per_chunk = (segments_per_chunk as f64 * cc_len * sample_rate) as u64;
        let projected_bytes = (stream_count as u64)
            .saturating_mul(samples_per_chunk)
            .saturating_mul(BYTES_PER_SAMPLE);
        MemoryEstimate {
            stream_count,
            segments_per_chunk,
            samples_per_chunk,
            projected_bytes,
            gigabytes: projected_bytes as f64 / BYTES_PER_GB,
        }
    }

    pub fn for_config(config: &DownloadConfig, stream_count: usize) -> MemoryEstimate {
        Self::estimate(
            config.chunk_seconds(),
            config.cc_len,
            config.step,
            config.samp_freq,
            stream_count,
        )
    }

    /// Rejects estimates above the ceiling; exactly at the ceiling passes.
    pub fn check(estimate: MemoryEstimate) -> Result<MemoryEstimate, HarvestError> {
        if estimate.gigabytes > MAX_MEMORY_GB {
            return Err(HarvestError::ResourceBudget {
                required_gb: estimate.gigabytes,
                limit_gb: MAX_MEMORY_GB,
            });
        }
        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn day_chunk_estimate() {
        let estimate = MemoryBudgetEstimator::estimate(86_400.0, 1800.0, 450.0, 20.0, 10);
        assert_eq!(estimate.segments_per_chunk, 189);
        assert_eq!(estimate.samples_per_chunk, 189 * 1800 * 20);
        assert_eq!(estimate.projected_bytes, 10 * 189 * 1800 * 20 * 4);
        assert!(MemoryBudgetEstimator::check(estimate).is_ok());
    }

    #[test]
    fn exactly_at_ceiling_is_accepted() {
        // 1024 streams * 1_310_720 samples * 4 bytes = 5 GiB
        let estimate = MemoryBudgetEstimator::estimate(1_310_720.0, 1.0, 1.0, 1.0, 1024);
        assert_eq!(estimate.gigabytes, 5.0);
        assert!(MemoryBudgetEstimator::check(estimate).is_ok());
    }

    #[test]
    fn above_ceiling_is_rejected() {
        let estimate = MemoryBudgetEstimator::estimate(1_310_721.0, 1.0, 1.0, 1.0, 1024);
        assert!(estimate.gigabytes > 5.0);
        assert_matches!(
            MemoryBudgetEstimator::check(estimate),
            Err(HarvestError::ResourceBudget { .. })
        );
    }

    #[test]
    fn chunk_shorter_than_cc_len_needs_nothing() {
        let estimate = MemoryBudgetEstimator::estimate(600.0, 1800.0, 450.0, 20.0, 10);
        assert_eq!(estimate.segments_per_chunk, 0);
        assert_eq!(estimate.projected_bytes, 0);
    }
}
