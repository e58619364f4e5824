use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use wiremux_core::{config::Config, listener::ListenerBuilder, print_logo, AnyResult};
use wiremux_services::{
    mux::{Dispatcher, MuxConfig},
    upstream::WireRequestQueue,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: String,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> AnyResult<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
    print_logo();

    let args = Args::parse();
    let config = Config::load(&args.config).await?;
    let server = config.server;

    let mut listeners = Vec::with_capacity(server.listeners.len());
    for spec in &server.listeners {
        let listener = ListenerBuilder::try_from(spec)
            .and_then(|builder| builder.build())
            .with_context(|| format!("bind listener {spec:?}"))?;
        info!("listening on {spec:?}");
        listeners.push(listener);
    }

    let queue = WireRequestQueue::connect(&server.upstream, server.max_frame_size)
        .await
        .with_context(|| format!("connect upstream {:?}", server.upstream))?;
    info!("connected to upstream {:?}", server.upstream);

    let dispatcher = Dispatcher::new(
        listeners,
        queue,
        MuxConfig {
            max_connections: server.max_connections,
            max_frame_size: server.max_frame_size,
        },
    );
    info!(
        "dispatching with at most {} concurrent client connections",
        server.max_connections
    );

    dispatcher.serve().await;

    // serve only returns once the upstream has failed and every client
    // connection has drained.
    error!("upstream connection failed; dispatcher drained");
    anyhow::bail!("upstream connection failed")
}
