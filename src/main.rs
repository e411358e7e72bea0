use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use blockwasm::cli::{run, Mode};

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("blockwasm=info"));
    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    run(Mode::parse());
}
