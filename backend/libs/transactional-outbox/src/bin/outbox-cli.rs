use std::env;

use chrono::{DateTime, Utc};
use db_pool::DbSession;
use sqlx::PgPool;
use transactional_outbox::{OutboxStore, SqlxOutboxRepository};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage:");
        eprintln!("  outbox-cli stats <DATABASE_URL>");
        eprintln!("  outbox-cli replay-since <rfc3339_ts> <DATABASE_URL>");
        std::process::exit(1);
    }

    let cmd = args[1].as_str();

    match cmd {
        "stats" if args.len() == 3 => {
            let pool = PgPool::connect(&args[2]).await?;
            let session = DbSession::begin(&pool).await?;
            let repo = SqlxOutboxRepository;
            let (pending, age) = repo.pending_stats(&session).await?;
            session.commit().await?;
            println!("{} pending event(s), oldest {}s", pending, age);
        }
        "replay-since" if args.len() == 4 => {
            let since: DateTime<Utc> = DateTime::parse_from_rfc3339(&args[2])?.with_timezone(&Utc);
            let pool = PgPool::connect(&args[3]).await?;
            let session = DbSession::begin(&pool).await?;
            let repo = SqlxOutboxRepository;
            let count = repo.replay_since(&session, since).await?;
            session.commit().await?;
            println!("Reset {} event(s) created since {}", count, since);
        }
        _ => {
            eprintln!("Invalid arguments");
            std::process::exit(1);
        }
    }

    Ok(())
}
