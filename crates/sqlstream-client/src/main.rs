use clap::Parser;

use sqlstream_client::{adapters::replay, cli::Args, error::ClientResult, logging};

fn main() -> ClientResult<()> {
    let args = Args::parse();
    logging::init(&args.log_level);
    replay::run(args)
}
