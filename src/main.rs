mod config;
mod portal;
mod screencast;

use std::process::ExitCode;

use clap::Parser;

use crate::config::{Args, RecordConfig};
use crate::screencast::RecordOutcome;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RecordConfig::from(Args::parse());

    match screencast::start_recording(config).await {
        Ok(RecordOutcome::Finished { pipelines }) => {
            log::debug!("{} pipeline(s) finished", pipelines);
            ExitCode::SUCCESS
        }
        Ok(RecordOutcome::Interrupted) => ExitCode::SUCCESS,
        Ok(RecordOutcome::NoStreams) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
