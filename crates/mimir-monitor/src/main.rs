mod cli;
mod news;
mod presence;
mod telemetry;

use std::sync::Arc;

use clap::Parser;
use mimir_session::{FallbackHandler, Session, SessionConfig};
use mimir_storage::{NewsStore, PresenceStore};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use cli::Cli;
use news::NewsHandler;
use presence::PresenceHandler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    // `--dbuser` is retained for CLI surface fidelity with the upstream
    // `mimir-monitor` tap options but has no SQLite equivalent; `--dbname`
    // names the on-disk database file instead of a server-side schema.
    let db_path = format!("{}.sqlite3", cli.dbname);
    let options = SqliteConnectOptions::new().filename(&db_path).create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;

    PresenceStore::migrate(&pool).await?;
    NewsStore::migrate(&pool).await?;

    let presence_store = Arc::new(PresenceStore::new(pool.clone()));
    let news_store = Arc::new(NewsStore::new(pool));
    presence_store.reset_on_startup().await?;

    let news_base_url = cli.news_base_url.map(|url| Arc::from(url.as_str()));

    let (session, session_task) = Session::spawn(SessionConfig {
        jid: cli.jid.clone(),
        secret: cli.secret,
        rhost: cli.rhost,
        rport: cli.rport,
        verbose: cli.verbose,
    });

    session
        .add_handler(Arc::new(PresenceHandler::new(presence_store, news_store.clone(), news_base_url)))
        .await;
    session.add_handler(Arc::new(NewsHandler::new(news_store))).await;
    session.add_handler(Arc::new(FallbackHandler)).await;

    info!(jid = %cli.jid, db = %db_path, "mimir-monitor running");
    session_task.await?;
    Ok(())
}
