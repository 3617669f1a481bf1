//! GStreamer-backed decoder.
//!
//! One `uridecodebin` pipeline per source, converted to BGRA and pulled
//! synchronously from an appsink — files and RTSP URLs go through the same
//! path, RTSP merely marks the source live. The appsink is bounded
//! (`max-buffers`) so a stalled caller backpressures the pipeline instead of
//! growing it.
//!
//! Frames are copied out of the mapped sample into owned storage; the
//! zero-copy path through device memory belongs to platform decode blocks,
//! not to this software backend.

use anyhow::{Context, anyhow, bail};
use gstreamer::prelude::*;
use tracing::{debug, warn};

use super::{DecodedFrame, DecoderSettings, LIVE_SOURCE, PixelFormat, VideoDecoder};

/// Appsink queue bound; a stalled consumer blocks the pipeline at this depth.
const SINK_MAX_BUFFERS: u32 = 8;

/// Preroll wait before giving up on the source.
const PREROLL_TIMEOUT: gstreamer::ClockTime = gstreamer::ClockTime::from_seconds(10);

pub struct GstDecoder {
    source: String,
    uri: String,
    target_width: u32,
    target_height: u32,
    live: bool,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
    width: u32,
    height: u32,
    frames_per_second: f64,
    total_frames: u64,
}

impl GstDecoder {
    pub fn new(
        source: &str,
        target_width: u32,
        target_height: u32,
        _settings: &DecoderSettings,
    ) -> anyhow::Result<Self> {
        gstreamer::init().context("initialize GStreamer")?;
        let live = source.starts_with("rtsp://");
        let uri = if live || source.contains("://") {
            source.to_string()
        } else {
            let absolute = std::fs::canonicalize(source)
                .with_context(|| format!("resolve media path '{source}'"))?;
            format!("file://{}", absolute.display())
        };
        Ok(Self {
            source: source.to_string(),
            uri,
            target_width,
            target_height,
            live,
            pipeline: None,
            appsink: None,
            width: 0,
            height: 0,
            frames_per_second: 0.0,
            total_frames: if live { LIVE_SOURCE } else { 0 },
        })
    }

    fn pipeline_description(&self) -> String {
        let scale = if self.target_width > 0 && self.target_height > 0 {
            format!(
                " ! videoscale ! video/x-raw,width={},height={}",
                self.target_width, self.target_height
            )
        } else {
            String::new()
        };
        format!(
            "uridecodebin uri=\"{}\" ! videoconvert ! video/x-raw,format=BGRA{scale} \
             ! appsink name=sink sync=false max-buffers={SINK_MAX_BUFFERS} drop=false",
            self.uri
        )
    }

    fn teardown(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                warn!(error = %e, "pipeline teardown failed");
            }
        }
        self.appsink = None;
    }
}

impl VideoDecoder for GstDecoder {
    fn open(&mut self) -> anyhow::Result<()> {
        self.teardown();

        let description = self.pipeline_description();
        debug!(pipeline = %description, "building decode pipeline");
        let pipeline = gstreamer::parse::launch(&description)
            .with_context(|| format!("build pipeline for '{}'", self.source))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("parsed element is not a pipeline"))?;
        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| anyhow!("no appsink in pipeline"))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("element 'sink' is not an appsink"))?;

        // Preroll paused so the negotiated caps and duration are readable.
        pipeline
            .set_state(gstreamer::State::Paused)
            .context("preroll pipeline")?;
        let (result, _, _) = pipeline.state(PREROLL_TIMEOUT);
        result.context("pipeline failed to preroll")?;

        let caps = appsink
            .static_pad("sink")
            .and_then(|pad| pad.current_caps())
            .ok_or_else(|| anyhow!("no negotiated caps on the appsink"))?;
        let info = gstreamer_video::VideoInfo::from_caps(&caps)
            .context("parse negotiated video caps")?;
        self.width = info.width();
        self.height = info.height();
        let fps = info.fps();
        self.frames_per_second = if fps.denom() > 0 {
            fps.numer() as f64 / fps.denom() as f64
        } else {
            0.0
        };

        if !self.live {
            self.total_frames = pipeline
                .query_duration::<gstreamer::ClockTime>()
                .map(|duration| {
                    let seconds = duration.nseconds() as f64 / 1e9;
                    (seconds * self.frames_per_second).round() as u64
                })
                .filter(|&frames| frames > 0)
                .unwrap_or_else(|| {
                    warn!(source = %self.source, "duration unknown; treating as unbounded");
                    LIVE_SOURCE
                });
        }

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("start pipeline")?;
        debug!(
            width = self.width,
            height = self.height,
            fps = self.frames_per_second,
            total = self.total_frames,
            "decode pipeline playing"
        );
        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn next_frame(&mut self) -> anyhow::Result<Option<DecodedFrame>> {
        let appsink = self.appsink.as_ref().ok_or_else(|| anyhow!("decoder not open"))?;
        if appsink.is_eos() {
            return Ok(None);
        }
        let sample = match appsink.pull_sample() {
            Ok(sample) => sample,
            Err(_) if appsink.is_eos() => return Ok(None),
            Err(e) => bail!("pull_sample failed: {e}"),
        };
        let buffer = sample.buffer().ok_or_else(|| anyhow!("sample without buffer"))?;
        let caps = sample.caps().ok_or_else(|| anyhow!("sample without caps"))?;
        let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse sample caps")?;

        let map = buffer.map_readable().map_err(|_| anyhow!("buffer not mappable"))?;
        let data = map.as_slice().to_vec();

        let mut linesize = [0i32; 4];
        linesize[0] = info.stride()[0];
        Ok(Some(DecodedFrame::from_planes(
            info.width(),
            info.height(),
            PixelFormat::Bgra32,
            data,
            linesize,
            [0; 4],
            1,
        )))
    }

    fn seek(&mut self, frame_index: u64) -> bool {
        if self.live || self.frames_per_second <= 0.0 {
            return false;
        }
        let Some(pipeline) = &self.pipeline else {
            return false;
        };
        let nanos = (frame_index as f64 / self.frames_per_second * 1e9) as u64;
        pipeline
            .seek_simple(
                gstreamer::SeekFlags::FLUSH | gstreamer::SeekFlags::KEY_UNIT,
                gstreamer::ClockTime::from_nseconds(nanos),
            )
            .is_ok()
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Bgra32
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn decoder_name(&self) -> &'static str {
        "gstreamer"
    }
}

impl Drop for GstDecoder {
    fn drop(&mut self) {
        self.teardown();
    }
}
