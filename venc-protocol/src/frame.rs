//! Raw and encoded frame types.

use bytes::Bytes;

use crate::codec::CodecType;

/// RTP clock rate for video timestamps.
pub const VIDEO_CLOCK_RATE_HZ: u32 = 90_000;

/// Pixel format of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGBA 8-bit per channel (4 bytes per pixel).
    Rgba,
    /// NV12 (YUV 4:2:0 semi-planar).
    Nv12,
    /// I420 / YUV420P (YUV 4:2:0 planar, Y, U, V separate planes).
    I420,
}

impl PixelFormat {
    /// Number of bytes a frame of this format occupies.
    pub fn expected_len(self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            PixelFormat::Rgba => w * h * 4,
            PixelFormat::Nv12 | PixelFormat::I420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }
}

/// A raw video frame pushed into an encoder.
///
/// Owned by the caller; an encoder only borrows it for one `encode` call.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Pixel data.
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: PixelFormat,
    /// RTP timestamp (90 kHz).
    pub timestamp: u32,
    /// Render time in milliseconds.
    pub render_time_ms: i64,
}

/// Frame type requested from, or produced by, an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Self-contained frame, decodable without prior frames.
    Key,
    /// Predicted from earlier frames.
    Delta,
}

/// True if the hint asks for a key frame on `layer`.
///
/// A hint shorter than the layer count applies its first entry to all layers.
pub fn key_frame_requested(frame_types: Option<&[FrameType]>, layer: usize) -> bool {
    match frame_types {
        None | Some([]) => false,
        Some(types) => types.get(layer).unwrap_or(&types[0]) == &FrameType::Key,
    }
}

/// Compressed output for one input frame on one layer.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// Compressed bitstream.
    pub payload: Bytes,
    /// RTP timestamp of the source frame.
    pub timestamp: u32,
    /// Capture time of the source frame in milliseconds.
    pub capture_time_ms: i64,
    pub frame_type: FrameType,
    pub encoded_width: u32,
    pub encoded_height: u32,
    /// Average QP of the frame, if the encoder reports one.
    pub qp: Option<u32>,
    /// Simulcast or spatial layer index.
    pub layer_index: u8,
    /// False if the payload is only part of the frame.
    pub complete_frame: bool,
}

impl EncodedImage {
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_key_frame(&self) -> bool {
        self.frame_type == FrameType::Key
    }
}

/// Codec-specific side information attached to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecSpecificInfo {
    pub codec_type: CodecType,
    pub implementation_name: String,
    pub simulcast_index: u8,
    pub temporal_index: Option<u8>,
}

/// One contiguous partition of an encoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub offset: usize,
    pub length: usize,
}

/// Partitioning of an encoded payload, e.g. one entry per NAL unit.
///
/// Partitions are contiguous, non-overlapping and cover the whole payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FragmentationHeader {
    fragments: Vec<Fragment>,
}

impl FragmentationHeader {
    /// A single partition spanning `len` bytes.
    pub fn single(len: usize) -> Self {
        Self {
            fragments: vec![Fragment {
                offset: 0,
                length: len,
            }],
        }
    }

    /// Partitions of at most `max_len` bytes covering `len` bytes.
    ///
    /// `max_len == 0` means "no limit".
    pub fn split(len: usize, max_len: usize) -> Self {
        if max_len == 0 || len <= max_len {
            return Self::single(len);
        }
        let fragments = (0..len)
            .step_by(max_len)
            .map(|offset| Fragment {
                offset,
                length: max_len.min(len - offset),
            })
            .collect();
        Self { fragments }
    }

    /// Build from consecutive partition lengths.
    pub fn from_lengths(lengths: impl IntoIterator<Item = usize>) -> Self {
        let mut offset = 0;
        let fragments = lengths
            .into_iter()
            .map(|length| {
                let f = Fragment { offset, length };
                offset += length;
                f
            })
            .collect();
        Self { fragments }
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Total bytes covered.
    pub fn total_len(&self) -> usize {
        self.fragments.iter().map(|f| f.length).sum()
    }

    /// Largest partition in bytes.
    pub fn max_fragment_len(&self) -> usize {
        self.fragments.iter().map(|f| f.length).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_len_per_format() {
        assert_eq!(PixelFormat::Rgba.expected_len(4, 2), 32);
        assert_eq!(PixelFormat::I420.expected_len(4, 2), 8 + 2 * 2);
        assert_eq!(PixelFormat::Nv12.expected_len(3, 3), 9 + 2 * 4);
    }

    #[test]
    fn key_frame_hint_per_layer() {
        assert!(!key_frame_requested(None, 0));
        assert!(!key_frame_requested(Some(&[]), 0));

        let hint = [FrameType::Delta, FrameType::Key];
        assert!(!key_frame_requested(Some(&hint), 0));
        assert!(key_frame_requested(Some(&hint), 1));

        let single = [FrameType::Key];
        assert!(key_frame_requested(Some(&single), 2));
    }

    #[test]
    fn split_covers_payload() {
        let header = FragmentationHeader::split(2500, 1200);
        assert_eq!(header.len(), 3);
        assert_eq!(header.total_len(), 2500);
        assert_eq!(header.max_fragment_len(), 1200);
        assert_eq!(header.fragments()[2], Fragment { offset: 2400, length: 100 });

        let header = FragmentationHeader::split(2500, 0);
        assert_eq!(header.len(), 1);

        let header = FragmentationHeader::split(1200, 1200);
        assert_eq!(header.len(), 1);
    }

    #[test]
    fn from_lengths_is_contiguous() {
        let header = FragmentationHeader::from_lengths([4, 10, 3]);
        let offsets: Vec<usize> = header.fragments().iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 4, 14]);
        assert_eq!(header.total_len(), 17);
    }
}
