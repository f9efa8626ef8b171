use clap::Parser;
use tracing_subscriber::EnvFilter;
use training::util::{run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = TrainArgs::parse();
    run_train(args)
}
