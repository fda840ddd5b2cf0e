//! Recording controller
//!
//! Owns the capture pipelines and turns bus messages, interrupts and drain
//! timeouts into an orderly shutdown. Every pipeline moves through
//! `Idle -> Playing -> (Draining ->) Stopped`; the move to `Stopped` happens
//! under the pipeline's state lock, so a drain timer and a bus EOS racing each
//! other release the pipeline exactly once.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::pipeline::{CapturePipeline, PipelineEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Playing,
    Draining,
    Stopped,
}

/// Input of the controller's run loop
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Pipeline { index: usize, event: PipelineEvent },
    /// The user asked to stop
    Interrupt,
    /// A drain timer expired and forced its pipeline to stop
    DrainExpired { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Quit,
}

/// Pipeline plus its state, shared with the drain timer
struct Shared<P> {
    pipeline: P,
    state: Mutex<PipelineState>,
}

impl<P: CapturePipeline> Shared<P> {
    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the pipeline unless already stopped; true if this call did it
    fn stop(&self) -> bool {
        let mut state = self.state();
        if *state == PipelineState::Stopped {
            return false;
        }
        *state = PipelineState::Stopped;
        if let Err(e) = self.pipeline.release() {
            log::error!("Failed to release pipeline: {:#}", e);
        }
        true
    }
}

struct Recording<P> {
    node_id: u32,
    output: PathBuf,
    shared: Arc<Shared<P>>,
    drain_timer: Option<JoinHandle<()>>,
    bus_forwarder: Option<JoinHandle<()>>,
}

impl<P> Recording<P> {
    fn cancel_tasks(&mut self) {
        if let Some(timer) = self.drain_timer.take() {
            timer.abort();
        }
        if let Some(forwarder) = self.bus_forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Drives one pipeline per captured stream until all of them stopped
pub struct RecordingController<P: CapturePipeline> {
    recordings: Vec<Recording<P>>,
    drain_timeout: Duration,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    interrupt_forwarder: Option<JoinHandle<()>>,
}

impl<P: CapturePipeline> RecordingController<P> {
    pub fn new(drain_timeout: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            recordings: Vec::new(),
            drain_timeout,
            events_tx,
            events_rx,
            interrupt_forwarder: None,
        }
    }

    pub fn pipeline_count(&self) -> usize {
        self.recordings.len()
    }

    #[cfg(test)]
    pub fn state(&self, index: usize) -> Option<PipelineState> {
        self.recordings.get(index).map(|r| *r.shared.state())
    }

    /// Take ownership of `pipeline`, subscribe to its bus and set it PLAYING
    ///
    /// Must be called from within the tokio runtime.
    pub fn start(&mut self, node_id: u32, output: PathBuf, pipeline: P) -> Result<usize> {
        let index = self.recordings.len();
        let mut events = pipeline.events()?;

        let shared = Arc::new(Shared {
            pipeline,
            state: Mutex::new(PipelineState::Idle),
        });

        let tx = self.events_tx.clone();
        let bus_forwarder = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if tx.send(ControllerEvent::Pipeline { index, event }).is_err() {
                    break;
                }
            }
        });

        let mut recording = Recording {
            node_id,
            output,
            shared,
            drain_timer: None,
            bus_forwarder: Some(bus_forwarder),
        };

        if let Err(e) = recording.shared.pipeline.play() {
            recording.cancel_tasks();
            recording.shared.stop();
            return Err(e);
        }
        *recording.shared.state() = PipelineState::Playing;
        log::info!("Recording stream {} to {}", node_id, recording.output.display());

        self.recordings.push(recording);
        Ok(index)
    }

    /// Forward every item of `interrupts` to the run loop as [`ControllerEvent::Interrupt`]
    pub fn forward_interrupts<S>(&mut self, mut interrupts: S)
    where
        S: Stream<Item = ()> + Unpin + Send + 'static,
    {
        let tx = self.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while interrupts.next().await.is_some() {
                if tx.send(ControllerEvent::Interrupt).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.interrupt_forwarder.replace(forwarder) {
            previous.abort();
        }
    }

    /// Run until every pipeline has stopped, or an interrupt arrives with none started
    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            if self.handle(event) == LoopControl::Quit {
                break;
            }
        }
        log::debug!("Recording loop finished");
    }

    /// Apply one event
    pub fn handle(&mut self, event: ControllerEvent) -> LoopControl {
        match event {
            ControllerEvent::Pipeline { index, event } => self.handle_pipeline(index, event),
            ControllerEvent::Interrupt => {
                if self.recordings.is_empty() {
                    return LoopControl::Quit;
                }
                log::info!("Caught interrupt, trying to exit gracefully");
                for index in 0..self.recordings.len() {
                    self.drain(index);
                }
            }
            ControllerEvent::DrainExpired { index } => {
                if let Some(recording) = self.recordings.get_mut(index) {
                    recording.drain_timer = None;
                    recording.cancel_tasks();
                }
            }
        }

        if self.all_stopped() {
            LoopControl::Quit
        } else {
            LoopControl::Continue
        }
    }

    fn handle_pipeline(&mut self, index: usize, event: PipelineEvent) {
        if index >= self.recordings.len() {
            log::debug!("Event for unknown pipeline {}: {:?}", index, event);
            return;
        }

        match event {
            PipelineEvent::Eos => self.stop(index),
            PipelineEvent::SourceVanished { source, message } => {
                log::info!(
                    "Stream {} ended ({}: {}), trying to quit gracefully",
                    self.recordings[index].node_id,
                    source,
                    message
                );
                self.drain(index);
            }
            PipelineEvent::Error {
                source,
                message,
                debug,
            } => {
                log::error!("Error: {} {}", source, message);
                if let Some(debug) = debug {
                    log::debug!("{}", debug);
                }
            }
        }
    }

    /// PLAYING -> DRAINING: EOS into the muxer and arm the drain timer
    fn drain(&mut self, index: usize) {
        let timeout = self.drain_timeout;
        let tx = self.events_tx.clone();
        let recording = &mut self.recordings[index];

        {
            let mut state = recording.shared.state();
            if *state != PipelineState::Playing {
                return;
            }
            *state = PipelineState::Draining;
        }

        if let Err(e) = recording.shared.pipeline.send_eos_to_sink() {
            log::error!("Failed to send EOS to stream {}: {:#}", recording.node_id, e);
        }

        let shared = recording.shared.clone();
        let node_id = recording.node_id;
        recording.drain_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if shared.stop() {
                log::warn!(
                    "Stream {} did not finish within {:?}, forcing termination",
                    node_id,
                    timeout
                );
                let _ = tx.send(ControllerEvent::DrainExpired { index });
            }
        }));
    }

    /// Any state -> STOPPED
    fn stop(&mut self, index: usize) {
        let recording = &mut self.recordings[index];
        recording.cancel_tasks();
        if recording.shared.stop() {
            log::info!("Recording finished: {}", recording.output.display());
        }
    }

    fn all_stopped(&self) -> bool {
        !self.recordings.is_empty()
            && self
                .recordings
                .iter()
                .all(|r| *r.shared.state() == PipelineState::Stopped)
    }
}

impl<P: CapturePipeline> Drop for RecordingController<P> {
    fn drop(&mut self) {
        if let Some(forwarder) = self.interrupt_forwarder.take() {
            forwarder.abort();
        }
        for recording in &mut self.recordings {
            recording.cancel_tasks();
        }
    }
}
