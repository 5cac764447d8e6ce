use anyhow::Context;
use clap::Parser;
use coap_stack::{
    config::DEFAULT_PORT, logging::init_events, Dispatcher, ExitStatus, ProxyEndpoint,
    RatePolicy, StackConfig,
};
use std::path::PathBuf;

/// Runs a CoAP server that forwards requests carrying a Proxy-Uri option.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// The port clients send requests to
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// The port requests are forwarded from. Zero picks a free port
    #[arg(long, default_value_t = 0)]
    proxy_port: u16,
    /// Split bodies larger than this into blocks. Zero never splits
    #[arg(short, long, default_value_t = 0)]
    block_size: usize,
    /// Keep running on Ctrl-C
    #[arg(short, long)]
    daemon: bool,
    /// The most requests forwarded per second. Zero is unlimited
    #[arg(long, default_value_t = 0)]
    requests_per_second: u32,
    /// What to do with requests over the limit
    #[arg(long, value_enum, default_value_t = RatePolicy::Queue)]
    rate_policy: RatePolicy,
    /// Log events as JSON
    #[arg(long)]
    json: bool,
    /// Append events to a dated file in this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_events(cli.json, cli.log_dir.as_deref())?;

    let config = StackConfig {
        name: "coap".into(),
        port: cli.port,
        proxy_port: cli.proxy_port,
        block_size: cli.block_size,
        daemon: cli.daemon,
        requests_per_second: cli.requests_per_second,
        rate_policy: cli.rate_policy,
        ..Default::default()
    };
    let endpoint = ProxyEndpoint::bind(config, Dispatcher::new())
        .await
        .context("could not start the proxy")?;
    tracing::info!(
        server = %endpoint.server().local_addr(),
        proxy = %endpoint.proxy().local_addr(),
        "Proxy running"
    );

    match endpoint.serve().await {
        ExitStatus::Exited => Ok(()),
        ExitStatus::Status(code) => anyhow::bail!("stopped with status {code}"),
        ExitStatus::TimedOut => anyhow::bail!("timed out"),
    }
}
