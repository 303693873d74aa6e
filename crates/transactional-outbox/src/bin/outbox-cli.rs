//! Narrow operational CLI: redrive FAILED records on demand. Everything else about the engine is
//! embedded in the host process; this binary exists only for the two replay commands operators
//! reach for when a downstream outage needed a fallback that later recovered.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::env;
use transactional_outbox::SqlxRecordStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage:");
        eprintln!("  outbox-cli replay-since <rfc3339_ts> <DATABASE_URL>");
        eprintln!("  outbox-cli replay-range <from_id> <to_id> <DATABASE_URL>");
        std::process::exit(1);
    }

    let cmd = args[1].as_str();

    match cmd {
        "replay-since" if args.len() == 4 => {
            let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(&args[2])?.with_timezone(&Utc);
            let db_url = &args[3];
            let pool = PgPool::connect(db_url).await?;
            let store = SqlxRecordStore::new(pool);
            let count = store.replay_since(ts).await?;
            println!("Replayed {} record(s) failed since {}", count, ts);
        }
        "replay-range" if args.len() == 5 => {
            let from_id = &args[2];
            let to_id = &args[3];
            let db_url = &args[4];
            let pool = PgPool::connect(db_url).await?;
            let store = SqlxRecordStore::new(pool);
            let count = store.replay_range(from_id, to_id).await?;
            println!("Replayed {} record(s) between {} and {}", count, from_id, to_id);
        }
        _ => {
            eprintln!("Invalid arguments");
            std::process::exit(1);
        }
    }

    Ok(())
}
