//! recent_events - print the most recent persisted presence events
//!
//! Output is a JSON array, oldest event first. With `--id`, the single
//! matching event is printed as a JSON object.

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use presence_kernel::{EventStore, PresenceConfig, SqliteEventStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Print recent presence events as JSON")]
struct Args {
    /// Event database (defaults to the configured `paths.db_path`).
    #[arg(long, env = "PRESENCE_DB_PATH")]
    db_path: Option<String>,

    /// Maximum number of events to print.
    #[arg(long, default_value_t = 50)]
    limit: usize,

    /// Print only the event with this `evt_...` id.
    #[arg(long, conflicts_with = "limit")]
    id: Option<String>,

    /// Pretty-print the JSON output.
    #[arg(long)]
    pretty: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let db_path = match args.db_path {
        Some(path) => path,
        None => PresenceConfig::load()?.paths.db_path,
    };
    let store =
        SqliteEventStore::open(&db_path).with_context(|| format!("open event store {}", db_path))?;
    let value = match &args.id {
        Some(id) => {
            let event = store.get(id)?.ok_or_else(|| anyhow!("no event with id {}", id))?;
            serde_json::to_value(event)?
        }
        None => serde_json::to_value(store.recent(args.limit)?)?,
    };

    let out = if args.pretty {
        serde_json::to_string_pretty(&value)?
    } else {
        serde_json::to_string(&value)?
    };
    println!("{}", out);
    Ok(())
}
