//! In-memory pipeline used by the controller and recorder tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;

use super::pipeline::{CapturePipeline, PipelineEvent};

#[derive(Debug, Default)]
pub struct Counters {
    pub plays: AtomicUsize,
    pub eos_to_sink: AtomicUsize,
    pub releases: AtomicUsize,
}

impl Counters {
    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn eos_to_sink(&self) -> usize {
        self.eos_to_sink.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

/// Pipeline whose bus is fed by the test through [`FakeBus`]
pub struct FakePipeline {
    pub counters: Arc<Counters>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PipelineEvent>>>,
}

/// Test side of a [`FakePipeline`]'s bus
#[derive(Clone)]
pub struct FakeBus {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl FakeBus {
    pub fn post(&self, event: PipelineEvent) {
        self.tx.unbounded_send(event).unwrap();
    }
}

impl FakePipeline {
    pub fn new() -> (Self, FakeBus, Arc<Counters>) {
        let (tx, rx) = mpsc::unbounded();
        let counters = Arc::new(Counters::default());
        let pipeline = Self {
            counters: counters.clone(),
            events: Mutex::new(Some(rx)),
        };
        (pipeline, FakeBus { tx }, counters)
    }
}

impl CapturePipeline for FakePipeline {
    fn events(&self) -> Result<BoxStream<'static, PipelineEvent>> {
        let events = self.events.lock().unwrap().take();
        Ok(match events {
            Some(rx) => rx.chain(futures::stream::pending()).boxed(),
            None => futures::stream::pending().boxed(),
        })
    }

    fn play(&self) -> Result<()> {
        self.counters.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_eos_to_sink(&self) -> Result<()> {
        self.counters.eos_to_sink.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
