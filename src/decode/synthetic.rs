//! Deterministic generated frame source.
//!
//! Stands in for a real decoder wherever one is not available: unit tests,
//! the harness test modes, and CI machines without GStreamer. Every frame is
//! reproducible from its index, so consumers can verify content end to end.
//!
//! Source strings use a tiny parameter syntax after the scheme:
//!
//! ```text
//! synthetic:                          bounded source, default 30 frames
//! synthetic:frames=100                bounded source, 100 frames
//! synthetic:live                      unbounded (stream) source
//! synthetic:frames=50,hw,phys=0x10000000
//! ```
//!
//! With `hw`, frames carry a fabricated hardware block id and a physical
//! address resolved as `phys + block_id * frame_size`, mimicking how an
//! embedded decode block hands out addressable output slots.

use anyhow::{Context, bail};

use super::{DecodedFrame, DecoderSettings, LIVE_SOURCE, PixelFormat, VideoDecoder};

/// Number of output slots a hardware block typically cycles through.
const HW_SLOT_COUNT: u32 = 8;

const DEFAULT_FRAMES: u64 = 30;

/// Generated frame source; see the module docs for the source syntax.
pub struct SyntheticDecoder {
    width: u32,
    height: u32,
    format: PixelFormat,
    total: u64,
    live: bool,
    hardware: bool,
    phys_base: u64,
    cursor: u64,
    opened: bool,
    /// Simulated per-frame decode latency, for backpressure tests.
    frame_delay: Option<std::time::Duration>,
}

impl SyntheticDecoder {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            total: DEFAULT_FRAMES,
            live: false,
            hardware: false,
            phys_base: 0x1000_0000,
            cursor: 0,
            opened: false,
            frame_delay: None,
        }
    }

    /// Bounded source with the given frame count.
    pub fn frames(mut self, total: u64) -> Self {
        self.total = total;
        self
    }

    /// Unbounded (stream) source.
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    /// Emit hardware-style frames carrying block ids and physical addresses.
    pub fn hardware(mut self) -> Self {
        self.hardware = true;
        self
    }

    /// Base physical address for fabricated block resolution.
    pub fn phys_base(mut self, base: u64) -> Self {
        self.phys_base = base;
        self
    }

    /// Sleep this long before producing each frame.
    pub fn frame_delay(mut self, delay: std::time::Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    /// Parse a `synthetic:` source string.
    pub fn from_source(
        source: &str,
        width: u32,
        height: u32,
        settings: &DecoderSettings,
    ) -> anyhow::Result<Self> {
        if width == 0 || height == 0 {
            bail!("synthetic source needs a non-zero output geometry");
        }
        let mut decoder = Self::new(width, height, PixelFormat::Bgra32);
        if settings.enable_hardware {
            decoder.hardware = true;
        }

        let params = source.strip_prefix("synthetic").unwrap_or(source);
        let params = params.trim_start_matches([':', '/']);
        for param in params.split(',').filter(|p| !p.is_empty()) {
            match param.split_once('=') {
                Some(("frames", v)) => {
                    decoder.total = v
                        .parse()
                        .with_context(|| format!("bad frame count '{v}' in '{source}'"))?;
                }
                Some(("phys", v)) => {
                    let v = v.trim_start_matches("0x");
                    decoder.phys_base = u64::from_str_radix(v, 16)
                        .with_context(|| format!("bad physical base '{v}' in '{source}'"))?;
                }
                Some(("delay_ms", v)) => {
                    let ms: u64 = v
                        .parse()
                        .with_context(|| format!("bad delay '{v}' in '{source}'"))?;
                    decoder.frame_delay = Some(std::time::Duration::from_millis(ms));
                }
                None if param == "live" => decoder.live = true,
                None if param == "hw" => decoder.hardware = true,
                _ => bail!("unknown synthetic source parameter '{param}' in '{source}'"),
            }
        }
        Ok(decoder)
    }

    fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    /// Fill pattern for frame `index`: the index stamped little-endian into
    /// the first eight bytes, the remainder set to `index as u8`.
    pub fn pattern(index: u64, size: usize) -> Vec<u8> {
        let mut data = vec![index as u8; size];
        let stamp = index.to_le_bytes();
        let n = stamp.len().min(size);
        data[..n].copy_from_slice(&stamp[..n]);
        data
    }

    /// Recover the frame index stamped into a pattern buffer.
    pub fn index_of(data: &[u8]) -> Option<u64> {
        let stamp: [u8; 8] = data.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(stamp))
    }
}

impl VideoDecoder for SyntheticDecoder {
    fn open(&mut self) -> anyhow::Result<()> {
        self.cursor = 0;
        self.opened = true;
        Ok(())
    }

    fn next_frame(&mut self) -> anyhow::Result<Option<DecodedFrame>> {
        if !self.opened {
            bail!("synthetic decoder driven before open");
        }
        if !self.live && self.cursor >= self.total {
            return Ok(None);
        }
        if let Some(delay) = self.frame_delay {
            std::thread::sleep(delay);
        }

        let index = self.cursor;
        self.cursor += 1;

        let size = self.frame_size();
        let frame = DecodedFrame::packed(
            self.width,
            self.height,
            self.format,
            Self::pattern(index, size),
        );
        if self.hardware {
            let block = (index % HW_SLOT_COUNT as u64) as u32;
            let phys = self.phys_base + block as u64 * size as u64;
            Ok(Some(frame.with_block(block, phys)))
        } else {
            Ok(Some(frame))
        }
    }

    fn seek(&mut self, frame_index: u64) -> bool {
        if self.live || frame_index > self.total {
            return false;
        }
        self.cursor = frame_index;
        true
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn total_frames(&self) -> u64 {
        if self.live { LIVE_SOURCE } else { self.total }
    }

    fn decoder_name(&self) -> &'static str {
        "synthetic"
    }
}
