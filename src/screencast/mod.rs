//! Screen recording functionality
//!
//! Records PipeWire streams handed out by the ScreenCast portal through an
//! x264 GStreamer pipeline, one pipeline per stream.

mod controller;
mod pipeline;
mod recorder;
#[cfg(test)]
pub(crate) mod testing;

pub use recorder::{RecordOutcome, start_recording};
