//! MeshDB CLI
//!
//! Command-line tools for inspecting MeshDB sync behaviour.
//!
//! # Commands
//!
//! - `identifier` - Compute the auto-launch identifiers of a store
//! - `page` - Page a generated store through the sync cursor
//! - `dump` - Enable auto-launch for stores and dump the runtime table

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// MeshDB command-line tools.
#[derive(Parser)]
#[command(name = "meshdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the auto-launch identifiers of a store
    Identifier {
        /// User id
        #[arg(short, long)]
        user: String,

        /// App id
        #[arg(short, long)]
        app: String,

        /// Store id
        #[arg(short, long)]
        store: String,

        /// Validate as a dual-tuple store (user id not checked)
        #[arg(short, long)]
        dual: bool,
    },

    /// Page a generated store through the sync cursor
    Page {
        /// Number of records to write
        #[arg(short, long, default_value = "500")]
        records: usize,

        /// Delete records from this index on
        #[arg(long)]
        delete_from: Option<usize>,

        /// Delete records up to this index (excluded)
        #[arg(long)]
        delete_to: Option<usize>,

        /// Byte budget per page
        #[arg(short, long, default_value = "1048576")]
        block_size: usize,

        /// Item budget per page
        #[arg(short, long, default_value = "100")]
        packet_size: usize,

        /// Page a query sync for keys with this prefix
        #[arg(short, long)]
        query: Option<String>,

        /// Also require values containing this text
        #[arg(long, requires = "query")]
        value_contains: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Enable auto-launch for stores and dump the runtime table
    Dump {
        /// User id
        #[arg(short, long, default_value = "user")]
        user: String,

        /// App id
        #[arg(short, long)]
        app: String,

        /// Store ids to enable
        #[arg(required = true)]
        stores: Vec<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Identifier {
            user,
            app,
            store,
            dual,
        } => {
            commands::identifier::run(&user, &app, &store, dual)?;
        }
        Commands::Page {
            records,
            delete_from,
            delete_to,
            block_size,
            packet_size,
            query,
            value_contains,
            format,
        } => {
            let deleted = if delete_from.is_some() || delete_to.is_some() {
                let end = delete_to.unwrap_or(records).min(records);
                delete_from.unwrap_or(0).min(end)..end
            } else {
                0..0
            };
            let options = commands::page::PageOptions {
                records,
                deleted,
                block_size,
                packet_size,
                query,
                value_contains,
            };
            commands::page::run(&options, &format)?;
        }
        Commands::Dump { user, app, stores } => {
            commands::dump::run(&user, &app, &stores)?;
        }
        Commands::Version => {
            println!("MeshDB CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
