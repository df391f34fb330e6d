use crate::config::{ProxyConfig, app_name, command, version};
use crate::pipeline::{LocalPipeline, RelocalizationDispatcher, RelocalizationPipeline};
use crate::workers::display::PreviewDisplay;
use crate::workers::save_stream::SaveStream;
use crate::workers::sink::AsyncSink;
use anyhow::Context;
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod assets;
pub mod codec;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod workers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ProxyConfig::from_matches(&command().get_matches())?;
    info!("{} {} starting: {:?}", app_name(), version(), config);

    let pipeline: Arc<dyn RelocalizationPipeline> =
        Arc::new(LocalPipeline::new(config.bootstrap_frames));

    let mut dispatcher = RelocalizationDispatcher::new(pipeline, config.reorder())
        .with_stop_flush_timeout(config.stop_flush_timeout());

    if let Some(folder) = &config.save_folder {
        let sink = AsyncSink::spawn("save", config.sink_capacity, SaveStream::new(folder))
            .context("cannot start the save worker")?;
        dispatcher = dispatcher.with_persistence(sink);
        info!("Saving frames below {}", folder.display());
    }
    if let Some(folder) = &config.display_folder {
        let sink = AsyncSink::spawn("display", config.sink_capacity, PreviewDisplay::new(folder))
            .context("cannot start the display worker")?;
        dispatcher = dispatcher.with_display(sink);
        info!("Previews written to {}", folder.display());
    }
    let dispatcher = Arc::new(dispatcher);

    // stop accepting clients on Ctrl-C, then release every live session
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown requested");
        signal.cancel();
    })
    .context("Error setting Ctrl-C handler")?;

    server::listener::serve(config.socket_addr()?, Arc::clone(&dispatcher), cancel).await?;

    dispatcher.shutdown().await;
    info!("{} stopped", app_name());
    Ok(())
}
