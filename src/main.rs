use clap::Parser;
use p2p_call_lib::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    p2p_call_lib::logger::init(config.log.as_deref(), config.quiet);
    p2p_call_lib::run(config).await
}
