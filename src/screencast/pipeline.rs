//! GStreamer pipeline construction and management

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use gstreamer as gst;
use gstreamer::prelude::*;

use crate::config::{Container, RecordConfig};

/// Name of the muxer element, the target of injected end-of-stream events
pub const SINK_NAME: &str = "sink";

/// Parameters of one capture pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    /// PipeWire node id of the stream
    pub node_id: u32,
    pub quality: u32,
    pub max_bitrate_kbps: u32,
    pub container: Container,
    pub output: PathBuf,
}

impl PipelineSpec {
    /// Spec for the stream at `index` of a recording run
    pub fn new(config: &RecordConfig, index: usize, node_id: u32) -> Self {
        Self {
            node_id,
            quality: config.quality,
            max_bitrate_kbps: config.max_bitrate_kbps,
            container: config.container,
            output: config.output_for_stream(index),
        }
    }

    /// gst-launch form of the pipeline, for logs
    pub fn describe(&self, fd: RawFd) -> String {
        format!(
            "pipewiresrc fd={} path={} ! videoconvert ! queue \
             ! x264enc intra-refresh=true quantizer={} speed-preset=fast pass=qual bitrate={} \
             ! h264parse ! {} name={} ! filesink location=\"{}\"",
            fd,
            self.node_id,
            self.quality,
            self.max_bitrate_kbps,
            self.container.muxer_element(),
            SINK_NAME,
            self.output.display()
        )
    }
}

/// Bus message the controller acts on
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Eos,
    /// Resource-class error, the capture source went away
    SourceVanished { source: String, message: String },
    Error {
        source: String,
        message: String,
        debug: Option<String>,
    },
}

impl PipelineEvent {
    /// Classify a bus message; `None` for messages the controller ignores
    pub fn from_message(message: &gst::Message) -> Option<Self> {
        use gst::MessageView;

        match message.view() {
            MessageView::Eos(..) => Some(PipelineEvent::Eos),
            MessageView::Error(err) => {
                let source = message
                    .src()
                    .map(|s| s.name().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let error = err.error();
                if error.is::<gst::ResourceError>() {
                    Some(PipelineEvent::SourceVanished {
                        source,
                        message: error.to_string(),
                    })
                } else {
                    Some(PipelineEvent::Error {
                        source,
                        message: error.to_string(),
                        debug: err.debug().map(|d| d.to_string()),
                    })
                }
            }
            _ => None,
        }
    }
}

/// Operations the recording controller needs from a media pipeline
pub trait CapturePipeline: Send + Sync + 'static {
    /// Classified bus messages
    fn events(&self) -> Result<BoxStream<'static, PipelineEvent>>;

    /// Set the pipeline to PLAYING
    fn play(&self) -> Result<()>;

    /// Inject end-of-stream at the muxer so the container trailer gets written
    fn send_eos_to_sink(&self) -> Result<()>;

    /// Set the pipeline to NULL
    fn release(&self) -> Result<()>;
}

/// PipeWire to x264 to file pipeline
pub struct GstCapturePipeline {
    pipeline: gst::Pipeline,
    /// PipeWire remote, kept open for the pipeline's lifetime
    _remote: OwnedFd,
}

impl GstCapturePipeline {
    /// Build the pipeline for `spec`, reading from the PipeWire remote `fd`
    pub fn new(spec: &PipelineSpec, fd: OwnedFd) -> Result<Self> {
        gst::init().context("Failed to initialize GStreamer")?;

        log::debug!("Pipeline: {}", spec.describe(fd.as_raw_fd()));

        let pipeline = gst::Pipeline::new();

        let source = gst::ElementFactory::make("pipewiresrc")
            .property("fd", fd.as_raw_fd())
            .property("path", spec.node_id.to_string())
            .build()
            .context("Failed to create pipewiresrc element. Is the PipeWire GStreamer plugin installed?")?;

        let videoconvert = gst::ElementFactory::make("videoconvert")
            .build()
            .context("Failed to create videoconvert element")?;

        let queue = gst::ElementFactory::make("queue")
            .build()
            .context("Failed to create queue element")?;

        let encoder = gst::ElementFactory::make("x264enc")
            .property("intra-refresh", true)
            .property("quantizer", spec.quality)
            .property_from_str("speed-preset", "fast")
            .property_from_str("pass", "qual")
            .property("bitrate", spec.max_bitrate_kbps)
            .build()
            .context("Failed to create x264enc element")?;

        let parser = gst::ElementFactory::make("h264parse")
            .build()
            .context("Failed to create h264parse element")?;

        let muxer = gst::ElementFactory::make(spec.container.muxer_element())
            .name(SINK_NAME)
            .build()
            .with_context(|| format!("Failed to create muxer: {}", spec.container.muxer_element()))?;

        let filesink = gst::ElementFactory::make("filesink")
            .property("location", location(&spec.output)?)
            .build()
            .context("Failed to create filesink element")?;

        let elements = [
            &source,
            &videoconvert,
            &queue,
            &encoder,
            &parser,
            &muxer,
            &filesink,
        ];
        pipeline.add_many(elements)?;
        gst::Element::link_many(elements)?;

        Ok(Self {
            pipeline,
            _remote: fd,
        })
    }
}

fn location(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("Output path is not valid UTF-8: {}", path.display()))
}

impl CapturePipeline for GstCapturePipeline {
    fn events(&self) -> Result<BoxStream<'static, PipelineEvent>> {
        let bus = self.pipeline.bus().context("Pipeline has no bus")?;
        Ok(bus
            .stream()
            .filter_map(|message| futures::future::ready(PipelineEvent::from_message(&message)))
            .boxed())
    }

    fn play(&self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .context("Failed to start pipeline")?;
        Ok(())
    }

    fn send_eos_to_sink(&self) -> Result<()> {
        let sink = self
            .pipeline
            .by_name(SINK_NAME)
            .context("Pipeline has no sink element")?;
        if !sink.send_event(gst::event::Eos::new()) {
            log::debug!("Sink did not accept the EOS event");
        }
        Ok(())
    }

    fn release(&self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Null)
            .context("Failed to stop pipeline")?;
        Ok(())
    }
}

impl Drop for GstCapturePipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
