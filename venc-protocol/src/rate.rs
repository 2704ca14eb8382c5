//! Bitrate allocation and channel quality parameters.

/// Maximum spatial/simulcast layers in an allocation.
pub const MAX_SPATIAL_LAYERS: usize = 5;

/// Maximum temporal layers per spatial layer in an allocation.
pub const MAX_TEMPORAL_LAYERS: usize = 4;

/// Per-layer bitrate breakdown in bits per second.
///
/// The running total is kept alongside the matrix and is always equal to the
/// sum of all entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitrateAllocation {
    bitrates: [[u32; MAX_TEMPORAL_LAYERS]; MAX_SPATIAL_LAYERS],
    sum: u32,
}

impl BitrateAllocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bitrate of one layer.
    ///
    /// Returns false, leaving the allocation untouched, if the indices are out
    /// of range or the new total would overflow.
    pub fn set_bitrate(&mut self, spatial: usize, temporal: usize, bps: u32) -> bool {
        if spatial >= MAX_SPATIAL_LAYERS || temporal >= MAX_TEMPORAL_LAYERS {
            return false;
        }
        let old = self.bitrates[spatial][temporal];
        let Some(sum) = (self.sum - old).checked_add(bps) else {
            return false;
        };
        self.bitrates[spatial][temporal] = bps;
        self.sum = sum;
        true
    }

    pub fn bitrate(&self, spatial: usize, temporal: usize) -> u32 {
        if spatial >= MAX_SPATIAL_LAYERS || temporal >= MAX_TEMPORAL_LAYERS {
            return 0;
        }
        self.bitrates[spatial][temporal]
    }

    /// Total bitrate of one spatial layer across its temporal layers.
    pub fn spatial_layer_bitrate(&self, spatial: usize) -> u32 {
        if spatial >= MAX_SPATIAL_LAYERS {
            return 0;
        }
        self.bitrates[spatial].iter().sum()
    }

    pub fn is_spatial_layer_used(&self, spatial: usize) -> bool {
        self.spatial_layer_bitrate(spatial) > 0
    }

    /// Bitrates of one spatial layer, one entry per temporal layer.
    pub fn temporal_layers(&self, spatial: usize) -> &[u32] {
        match self.bitrates.get(spatial) {
            Some(layers) => layers,
            None => &[],
        }
    }

    pub fn sum_bps(&self) -> u32 {
        self.sum
    }

    /// Total in kbps, rounded to nearest.
    pub fn sum_kbps(&self) -> u32 {
        ((self.sum as u64 + 500) / 1000) as u32
    }
}

/// Channel quality reported to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelParameters {
    /// Fraction of packets lost, scaled to 0..=255.
    pub packet_loss: u8,
    /// Round-trip time in milliseconds.
    pub rtt_ms: i64,
}

impl ChannelParameters {
    /// Build from a loss fraction in `0.0..=1.0`.
    pub fn from_loss_fraction(loss: f64, rtt_ms: i64) -> Self {
        let scaled = (loss.clamp(0.0, 1.0) * 255.0).round() as u8;
        Self {
            packet_loss: scaled,
            rtt_ms,
        }
    }

    /// Loss rate in percent.
    pub fn loss_percent(&self) -> f64 {
        100.0 * self.packet_loss as f64 / 255.0
    }
}
