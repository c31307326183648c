//!
//! src/main.rs  Andrew Belles  Oct 9th, 2025
//!
//! Entry point. Parses the command line, loads config and logging, then
//! hands off to the app. Results go to stdout, logs to stderr
//!
//!

use clap::Parser;

use album_ingest::app::{App, IngestOptions};
use album_ingest::cli::{Cli, Command};
use album_ingest::config;
use album_ingest::errors::IngestError;
use album_ingest::logging;

#[tokio::main]
async fn main() -> Result<(), IngestError> {
    let cli = Cli::parse();
    let mut cfgs = config::load_config()?;
    cli.apply_verbosity(&mut cfgs.logging);
    let _guard = logging::init_logging(&cfgs.logging)?;

    tracing::info!(
        service = "album-ingest",
        version = %env!("CARGO_PKG_VERSION"),
        sources = ?cfgs.sources.order,
        "starting"
    );

    let app = App::new(cfgs);
    match cli.command {
        Command::Ingest { file, enrich, store, index, export } => {
            let summary = app.ingest(&IngestOptions { file, enrich, store, index, export })
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        },
        Command::Index { file, enrich } => {
            let opts = IngestOptions { file, enrich, index: true, ..IngestOptions::default() };
            let summary = app.ingest(&opts).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        },
        Command::Search { query, top_k } => {
            for (album, score) in app.search(&query, top_k).await? {
                println!("{score:.3}  [{}]  {album}", album.album_id());
            }
        },
        Command::Show { album_id } => {
            let album = app.show(&album_id).await?;
            println!("{}", serde_json::to_string_pretty(&album)?);
        }
    }

    Ok(())
}
