//! Decoder collaborator contract.
//!
//! The buffer plane does not decode anything itself; it consumes frames from
//! a decoder behind the [`VideoDecoder`] trait. What *is* fixed here is how a
//! decoded frame enters a pool: a [`DecodedFrame`] owns (or pins) the
//! decoder-side memory for one frame, and the decoder-frame allocator wraps
//! it into a pool buffer without copying. Plane pointers stay valid for the
//! lifetime of the `DecodedFrame`, which is kept alive by the allocator's
//! side table until the wrapping buffer is destroyed.
//!
//! Two implementations ship in-tree:
//!
//! - [`synthetic::SyntheticDecoder`] — a deterministic generated source used
//!   by the harness and the test suite.
//! - `gst::GstDecoder` (feature `gst`, Linux only) — decodebin/rtspsrc via
//!   GStreamer for real encoded files and RTSP streams.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod synthetic;

#[cfg(all(target_os = "linux", feature = "gst"))]
pub mod gst;

/// Pixel formats understood by the pipeline.
///
/// The set is deliberately small: raw workers deal in packed formats derived
/// from a bits-per-pixel figure, decoders additionally produce the two planar
/// layouts hardware blocks commonly emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit single channel.
    Gray8,
    /// Packed 24-bit RGB.
    Rgb24,
    /// Packed 32-bit BGRA.
    Bgra32,
    /// Planar Y plus interleaved UV at half resolution (2 planes).
    Nv12,
    /// Planar Y, U, V with chroma at half resolution (3 planes).
    Yuv420p,
}

impl PixelFormat {
    /// Bytes per pixel of plane 0.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 | PixelFormat::Nv12 | PixelFormat::Yuv420p => 1,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Bgra32 => 4,
        }
    }

    /// Number of planes in this layout.
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Gray8 | PixelFormat::Rgb24 | PixelFormat::Bgra32 => 1,
            PixelFormat::Nv12 => 2,
            PixelFormat::Yuv420p => 3,
        }
    }

    /// Total size in bytes of one tightly-packed frame.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Gray8 => w * h,
            PixelFormat::Rgb24 => w * h * 3,
            PixelFormat::Bgra32 => w * h * 4,
            // Chroma at quarter area; NV12 interleaves U and V, YUV420P
            // splits them, the byte total is the same.
            PixelFormat::Nv12 | PixelFormat::Yuv420p => w * h + w * h / 2,
        }
    }

    /// Packed format for a raw source described only by bits per pixel.
    pub fn from_bits_per_pixel(bpp: u32) -> Option<Self> {
        match bpp {
            8 => Some(PixelFormat::Gray8),
            24 => Some(PixelFormat::Rgb24),
            32 => Some(PixelFormat::Bgra32),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Gray8 => "gray8",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgra32 => "bgra32",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Yuv420p => "yuv420p",
        };
        f.write_str(name)
    }
}

/// Backing storage of one decoded frame.
enum FrameData {
    /// The frame owns its bytes (software decode, synthetic source).
    Owned(Vec<u8>),
    /// The bytes live in decoder- or device-owned memory. The release hook
    /// runs exactly once when the frame is dropped (the decoder's unref).
    External {
        base: *const u8,
        len: usize,
        release: Option<Box<dyn FnOnce() + Send>>,
    },
}

impl Drop for FrameData {
    fn drop(&mut self) {
        if let FrameData::External { release, .. } = self {
            if let Some(release) = release.take() {
                release();
            }
        }
    }
}

/// One decoded video frame.
///
/// Immutable after construction. Shared as `Arc<DecodedFrame>` between the
/// wrapping [`crate::buffer::Buffer`] and the decoder-frame allocator's side
/// table; plane pointers remain valid until the last reference drops.
pub struct DecodedFrame {
    width: u32,
    height: u32,
    format: PixelFormat,
    linesize: [i32; 4],
    plane_offset: [usize; 4],
    plane_count: usize,
    data: FrameData,
    /// Hardware block identifier, resolvable to a physical address.
    block_id: Option<u32>,
    /// Resolved physical address of plane 0; 0 = unknown / not applicable.
    physical_address: u64,
}

// SAFETY: a DecodedFrame is immutable after construction. Owned storage is a
// plain Vec; external storage points into decoder memory that stays valid
// until the release hook runs on drop, and the hook itself is Send.
unsafe impl Send for DecodedFrame {}
// SAFETY: all accessors are reads of immutable fields.
unsafe impl Sync for DecodedFrame {}

impl DecodedFrame {
    /// Frame over owned storage with an explicit plane layout.
    pub fn from_planes(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
        linesize: [i32; 4],
        plane_offset: [usize; 4],
        plane_count: usize,
    ) -> Self {
        debug_assert!((1..=4).contains(&plane_count));
        Self {
            width,
            height,
            format,
            linesize,
            plane_offset,
            plane_count,
            data: FrameData::Owned(data),
            block_id: None,
            physical_address: 0,
        }
    }

    /// Frame over owned storage in the format's tightly-packed layout.
    pub fn packed(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        let w = width as usize;
        let mut linesize = [0i32; 4];
        let mut plane_offset = [0usize; 4];
        let plane_count = format.plane_count();
        linesize[0] = (w * format.bytes_per_pixel()) as i32;
        match format {
            PixelFormat::Nv12 => {
                linesize[1] = w as i32;
                plane_offset[1] = w * height as usize;
            }
            PixelFormat::Yuv420p => {
                linesize[1] = (w / 2) as i32;
                linesize[2] = (w / 2) as i32;
                plane_offset[1] = w * height as usize;
                plane_offset[2] = plane_offset[1] + plane_offset[1] / 4;
            }
            _ => {}
        }
        Self::from_planes(width, height, format, data, linesize, plane_offset, plane_count)
    }

    /// Frame over external (decoder- or device-owned) memory.
    ///
    /// `release` runs when the frame drops; it must return the memory to its
    /// owner (decoder unref, queue re-arm).
    pub fn external(
        width: u32,
        height: u32,
        format: PixelFormat,
        base: *const u8,
        len: usize,
        linesize: [i32; 4],
        plane_offset: [usize; 4],
        plane_count: usize,
        release: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        debug_assert!((1..=4).contains(&plane_count));
        Self {
            width,
            height,
            format,
            linesize,
            plane_offset,
            plane_count,
            data: FrameData::External { base, len, release },
            block_id: None,
            physical_address: 0,
        }
    }

    /// Tag the frame with a hardware block id and its resolved physical
    /// address (zero-copy decode paths).
    pub fn with_block(mut self, block_id: u32, physical_address: u64) -> Self {
        self.block_id = Some(block_id);
        self.physical_address = physical_address;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Stride of the given plane in bytes; 0 for planes past `plane_count`.
    pub fn linesize(&self, plane: usize) -> i32 {
        self.linesize.get(plane).copied().unwrap_or(0)
    }

    pub fn plane_count(&self) -> usize {
        self.plane_count
    }

    /// Start address of the given plane, or null for invalid plane indices.
    pub fn plane_ptr(&self, plane: usize) -> *const u8 {
        if plane >= self.plane_count || plane >= 4 {
            return std::ptr::null();
        }
        let base = match &self.data {
            FrameData::Owned(v) => v.as_ptr(),
            FrameData::External { base, .. } => *base,
        };
        // SAFETY: plane offsets were validated against the storage length at
        // construction; base + offset stays inside the frame's memory.
        unsafe { base.add(self.plane_offset[plane]) }
    }

    /// Total byte size of the frame's storage.
    pub fn frame_size(&self) -> usize {
        match &self.data {
            FrameData::Owned(v) => v.len(),
            FrameData::External { len, .. } => *len,
        }
    }

    /// The whole frame as a byte slice, when the storage is CPU-owned.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.data {
            FrameData::Owned(v) => Some(v.as_slice()),
            FrameData::External { .. } => None,
        }
    }

    pub fn block_id(&self) -> Option<u32> {
        self.block_id
    }

    pub fn physical_address(&self) -> u64 {
        self.physical_address
    }

    /// True when the frame came out of a hardware block (carries a block id).
    pub fn is_hardware(&self) -> bool {
        self.block_id.is_some()
    }
}

impl fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("planes", &self.plane_count)
            .field("size", &self.frame_size())
            .field("block_id", &self.block_id)
            .field("physical_address", &format_args!("{:#x}", self.physical_address))
            .finish()
    }
}

/// Crop rectangle for hardware output channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Scale target for hardware output channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

/// Tuning knobs specific to embedded hardware decode blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareTuning {
    /// Disable frame reordering in the decoder (lower latency).
    pub reorder_disable: bool,
    /// Enable output channel 0 (native YUV).
    pub ch0_enable: bool,
    /// Enable output channel 1 (converted RGB).
    pub ch1_enable: bool,
    /// Channel 1 emits RGB rather than YUV.
    pub ch1_rgb: bool,
    /// RGB layout for channel 1.
    pub ch1_rgb_format: String,
    /// Color standard for the RGB conversion.
    pub ch1_color_standard: String,
    /// Optional crop applied on channel 1.
    pub crop: Option<Rect>,
    /// Optional scale applied on channel 1.
    pub scale: Option<Extent>,
}

impl Default for HardwareTuning {
    fn default() -> Self {
        Self {
            reorder_disable: true,
            ch0_enable: true,
            ch1_enable: true,
            ch1_rgb: true,
            ch1_rgb_format: "argb888".to_string(),
            ch1_color_standard: "bt601".to_string(),
            crop: None,
            scale: None,
        }
    }
}

/// Decoder selection and configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderSettings {
    /// Decoder name; `None` selects automatically. `"synthetic"` forces the
    /// in-tree generated source.
    pub name: Option<String>,
    /// Prefer a hardware decode block when one is available. Hardware frames
    /// enter pools by injection (zero copy).
    pub enable_hardware: bool,
    /// Device string for the hardware block (e.g. `"vaapi"`, `"/dev/dri/renderD128"`).
    pub hwaccel_device: Option<String>,
    /// Software decode thread count; 0 = automatic.
    pub decode_threads: u32,
    /// Hardware-block specific tuning.
    pub hardware: HardwareTuning,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            name: None,
            enable_hardware: false,
            hwaccel_device: None,
            decode_threads: 0,
            hardware: HardwareTuning::default(),
        }
    }
}

/// Sentinel total-frame count reported by live sources.
pub const LIVE_SOURCE: u64 = u64::MAX;

/// Contract every decoder backend satisfies.
///
/// Decoders are driven from one thread at a time (the worker serializes
/// access); `&mut self` reflects that.
pub trait VideoDecoder: Send {
    /// Connect to the source and negotiate output geometry. Must be called
    /// before the first `next_frame`.
    fn open(&mut self) -> anyhow::Result<()>;

    /// Decode and return the next frame; `Ok(None)` signals end of stream.
    fn next_frame(&mut self) -> anyhow::Result<Option<DecodedFrame>>;

    /// Reposition to the given frame index. Returns false when the backend
    /// cannot seek (live sources, inter-coded streams without an index).
    fn seek(&mut self, _frame_index: u64) -> bool {
        false
    }

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn pixel_format(&self) -> PixelFormat;

    /// Total frame count, or [`LIVE_SOURCE`] for unbounded streams.
    fn total_frames(&self) -> u64;

    fn is_live(&self) -> bool {
        self.total_frames() == LIVE_SOURCE
    }

    fn decoder_name(&self) -> &'static str;
}

/// Pick a decoder backend for `source` according to `settings`.
///
/// `"synthetic"` (by name or source prefix) selects the generated source.
/// Everything else goes to the GStreamer backend when the `gst` feature is
/// enabled, and fails otherwise.
pub fn decoder_for(
    source: &str,
    width: u32,
    height: u32,
    settings: &DecoderSettings,
) -> anyhow::Result<Box<dyn VideoDecoder>> {
    let forced_synthetic = settings.name.as_deref() == Some("synthetic");
    if forced_synthetic || source.starts_with("synthetic") {
        return Ok(Box::new(synthetic::SyntheticDecoder::from_source(
            source, width, height, settings,
        )?));
    }

    #[cfg(all(target_os = "linux", feature = "gst"))]
    {
        return Ok(Box::new(gst::GstDecoder::new(source, width, height, settings)?));
    }

    #[cfg(not(all(target_os = "linux", feature = "gst")))]
    {
        anyhow::bail!(
            "no decoder backend for '{source}': build with the `gst` feature \
             or use the synthetic decoder"
        )
    }
}
