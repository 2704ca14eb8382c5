//! Splits a single target bitrate across simulcast streams and temporal layers.

use venc_protocol::{BitrateAllocation, VideoCodecSettings};

/// Cumulative share of a stream's bitrate used up to each temporal layer,
/// indexed by the number of temporal layers.
const TEMPORAL_RATE_SHARES: [&[f64]; 4] = [
    &[1.0],
    &[0.6, 1.0],
    &[0.4, 0.6, 1.0],
    &[0.25, 0.4, 0.6, 1.0],
];

/// Bitrate allocator for one codec configuration.
#[derive(Debug, Clone)]
pub struct SimulcastRateAllocator {
    settings: VideoCodecSettings,
}

impl SimulcastRateAllocator {
    pub fn new(settings: VideoCodecSettings) -> Self {
        Self { settings }
    }

    /// Allocate `total_kbps` across the configured layers.
    ///
    /// A zero total pauses the stream and yields an empty allocation. Otherwise
    /// the first stream always receives at least its minimum, lower streams are
    /// filled up to their target before higher ones, and whatever remains goes
    /// to the highest active stream up to its maximum.
    pub fn allocate(&self, total_kbps: u32) -> BitrateAllocation {
        let mut allocation = BitrateAllocation::new();
        if total_kbps == 0 {
            return allocation;
        }

        let s = &self.settings;
        let mut left = total_kbps;
        if s.max_bitrate_kbps > 0 {
            left = left.min(s.max_bitrate_kbps);
        }

        if s.simulcast_streams.is_empty() {
            let layer_kbps = left.max(s.min_bitrate_kbps);
            self.split_temporal(&mut allocation, 0, layer_kbps, s.specific.temporal_layers());
            return allocation;
        }

        let streams = &s.simulcast_streams;
        left = left.max(streams[0].min_bitrate_kbps);

        let mut stream_kbps = vec![0u32; streams.len()];
        let mut active = 0;
        for (i, stream) in streams.iter().enumerate() {
            if left < stream.min_bitrate_kbps {
                break;
            }
            let kbps = left.min(stream.target_bitrate_kbps);
            stream_kbps[i] = kbps;
            left -= kbps;
            active = i + 1;
        }

        if left > 0 && active > 0 {
            let top = active - 1;
            let headroom = streams[top]
                .max_bitrate_kbps
                .saturating_sub(stream_kbps[top]);
            stream_kbps[top] += left.min(headroom);
        }

        for (i, kbps) in stream_kbps.into_iter().enumerate() {
            if kbps > 0 {
                self.split_temporal(&mut allocation, i, kbps, streams[i].number_of_temporal_layers);
            }
        }

        tracing::trace!(
            total_kbps,
            allocated_kbps = allocation.sum_kbps(),
            active_streams = active,
            "allocated bitrate"
        );

        allocation
    }

    fn split_temporal(
        &self,
        allocation: &mut BitrateAllocation,
        spatial: usize,
        layer_kbps: u32,
        temporal_layers: u8,
    ) {
        let count = (temporal_layers.max(1) as usize).min(TEMPORAL_RATE_SHARES.len());
        let shares = TEMPORAL_RATE_SHARES[count - 1];
        let total_bps = layer_kbps as u64 * 1000;

        let mut previous = 0u64;
        for (tl, share) in shares.iter().enumerate() {
            let cumulative = if tl + 1 == shares.len() {
                total_bps
            } else {
                (total_bps as f64 * share).round() as u64
            };
            allocation.set_bitrate(spatial, tl, (cumulative - previous) as u32);
            previous = cumulative;
        }
    }
}
