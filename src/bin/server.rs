use clap::Parser;
use minidis::config::Config;
use minidis::{server, Error};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::parse();

    server::run(config, server::shutdown_signal()).await
}
