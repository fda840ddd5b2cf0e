//! Recording run: negotiate streams, then record each one until stopped

use std::os::fd::OwnedFd;

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::signal::unix::{SignalKind, signal};

use crate::config::RecordConfig;
use crate::portal::{Broker, Negotiator, PortalBroker, StreamsOutcome};

use super::controller::RecordingController;
use super::pipeline::{CapturePipeline, GstCapturePipeline, PipelineSpec};

/// How a recording run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Every pipeline reached end-of-stream or was drained
    Finished { pipelines: usize },
    /// The portal did not hand out any stream
    NoStreams,
    /// Stopped before any pipeline was started
    Interrupted,
}

/// Ties a [`Negotiator`] to a [`RecordingController`]
pub struct PipewireRecorder<B: Broker> {
    negotiator: Negotiator<B>,
    config: RecordConfig,
}

impl<B: Broker> PipewireRecorder<B> {
    pub fn new(negotiator: Negotiator<B>, config: RecordConfig) -> Self {
        Self { negotiator, config }
    }

    /// Run the handshake and record every returned stream
    ///
    /// `make_pipeline` builds one pipeline per stream from its spec and a fresh
    /// PipeWire remote. Items of `interrupts` cancel the handshake, or drain the
    /// pipelines once recording.
    pub async fn record<P, F, S>(&mut self, mut make_pipeline: F, interrupts: S) -> Result<RecordOutcome>
    where
        P: CapturePipeline,
        F: FnMut(&PipelineSpec, OwnedFd) -> Result<P>,
        S: Stream<Item = ()> + Unpin + Send + 'static,
    {
        let mut interrupts = interrupts;

        let outcome = tokio::select! {
            outcome = self.negotiator.get_streams() => outcome?,
            Some(()) = interrupts.next() => {
                log::info!("Interrupted while waiting for the portal");
                return Ok(RecordOutcome::Interrupted);
            }
        };

        let streams = match outcome {
            StreamsOutcome::Streams(streams) if !streams.is_empty() => streams,
            StreamsOutcome::Streams(_) => {
                log::warn!("Portal returned an empty stream list");
                return Ok(RecordOutcome::NoStreams);
            }
            StreamsOutcome::NoStreams { step, response } => {
                log::warn!(
                    "Did not receive streams from portal ({} returned {})",
                    step,
                    response
                );
                return Ok(RecordOutcome::NoStreams);
            }
        };

        if let Some(session) = self.negotiator.session() {
            log::debug!("Recording {} stream(s) from session {}", streams.len(), session);
        }
        self.config.check_output_dir();

        let mut controller = RecordingController::new(self.config.drain_timeout);
        for (index, stream) in streams.iter().enumerate() {
            match stream.source_type() {
                Some(kind) => log::info!("Stream {} (source type {})", stream.node_id, kind.bits()),
                None => log::info!("Stream {}", stream.node_id),
            }

            let fd = self
                .negotiator
                .open_pipewire_remote()
                .await
                .with_context(|| format!("Failed to open PipeWire remote for stream {}", stream.node_id))?;
            let spec = PipelineSpec::new(&self.config, index, stream.node_id);
            let pipeline = make_pipeline(&spec, fd)
                .with_context(|| format!("Failed to create pipeline for stream {}", stream.node_id))?;

            log::info!("Saving file to {}", spec.output.display());
            controller.start(stream.node_id, spec.output.clone(), pipeline)?;
        }

        let pipelines = controller.pipeline_count();
        controller.forward_interrupts(interrupts);
        controller.run().await;

        Ok(RecordOutcome::Finished { pipelines })
    }
}

/// SIGINT and SIGTERM as a stream
///
/// Installing the handlers replaces the default terminate-on-signal behavior.
pub fn stop_signals() -> Result<BoxStream<'static, ()>> {
    let interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    Ok(futures::stream::unfold(
        (interrupt, terminate),
        |(mut interrupt, mut terminate)| async move {
            tokio::select! {
                _ = interrupt.recv() => log::debug!("Received SIGINT"),
                _ = terminate.recv() => log::debug!("Received SIGTERM"),
            }
            Some(((), (interrupt, terminate)))
        },
    )
    .boxed())
}

/// Record the desktop through the ScreenCast portal
pub async fn start_recording(config: RecordConfig) -> Result<RecordOutcome> {
    log::info!(
        "Starting recording: output={}, quality={}, max bitrate={} kbps",
        config.output.display(),
        config.quality,
        config.max_bitrate_kbps
    );

    let interrupts = stop_signals()?;
    let broker = PortalBroker::connect().await?;
    let mut recorder = PipewireRecorder::new(Negotiator::new(broker), config);
    recorder.record(GstCapturePipeline::new, interrupts).await
}
