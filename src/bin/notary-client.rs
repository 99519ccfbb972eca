use std::{fs::File, path::Path};

use anyhow::{Context, Result};
use notary_client::{bin_utils::Service, bin_utils::ScriptError, config::ClientConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let filename = args
        .next()
        .context("Expected a script file name as the first argument")?;
    let config = match args.next() {
        Some(path) => ClientConfig::from_file(Path::new(&path))
            .with_context(|| format!("Failed to load config `{path}`"))?,
        None => ClientConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.filter))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let file = File::open(&filename).with_context(|| format!("Failed to open `{filename}`"))?;
    let service = Service {
        input: file,
        output: &mut std::io::stdout(),
        config,
        error_printer: Box::new(|line, err| match err {
            // the notary's answer, not a client failure
            ScriptError::Refused(_) => {}
            err => eprintln!("Error at line {line}: {err}"),
        }),
    };
    service.run()
}
