//!
//! src/cli.rs  Andrew Belles  Oct 9th, 2025
//!
//! Command line surface: ingest, index, search and show
//!

use std::path::PathBuf;

use crate::config::LoggingConfig;

#[derive(Debug, clap::Parser)]
#[command(name = "album-ingest", version, about = "Load, enrich, store and search albums")]
pub struct Cli {
    /// Raise log verbosity, -v info, -vv debug, -vvv trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Load albums from a json file and run them through the pipeline
    Ingest {
        /// Album export, a json array or a result.albums_loop document
        #[arg(short, long)]
        file: PathBuf,

        /// Look every album up in the configured catalogs
        #[arg(long)]
        enrich: bool,

        /// Save albums to the album database
        #[arg(long)]
        store: bool,

        /// Add albums to the vector index
        #[arg(long)]
        index: bool,

        /// Write the resulting albums to this json file
        #[arg(long)]
        export: Option<PathBuf>
    },

    /// Shortcut for `ingest --index`
    Index {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long)]
        enrich: bool
    },

    /// Free-text similarity search over indexed albums
    Search {
        query: String,

        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize
    },

    /// Print one stored album as json
    Show {
        album_id: String
    }
}

impl Cli {
    /// `-v` flags override whatever filter the environment configured
    pub fn apply_verbosity(&self, logging: &mut LoggingConfig) {
        let level = match self.verbose {
            0 => return,
            1 => "info",
            2 => "debug",
            _ => "trace"
        };
        logging.filter_directives = format!("{level},sqlx=warn,reqwest=warn");
    }
}
