mod cli;
mod control;
mod pipeline;
mod publisher;
mod scheduler;
mod telemetry;
mod web;
mod writer;

use std::sync::Arc;

use clap::Parser;
use jid::Jid;
use mimir_fetcher::Fetcher;
use mimir_session::{FallbackHandler, Session, SessionConfig};
use mimir_storage::FeedStorage;
use tracing::info;

use cli::Cli;
use control::ControlHandler;
use pipeline::PipelineContext;
use publisher::Publisher;
use scheduler::Scheduler;
use writer::AtomWriter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let service: Jid = cli.service.parse()?;

    let storage = FeedStorage::open(&cli.feeds)?;
    let fetcher = Fetcher::new("mimir-aggregator/0.1")?;
    let publisher = Publisher::new(AtomWriter, service.clone());

    let (session, session_task) = Session::spawn(SessionConfig {
        jid: cli.jid.clone(),
        secret: cli.secret.clone(),
        rhost: cli.rhost.clone(),
        rport: cli.rport,
        verbose: cli.verbose,
    });

    let ctx = Arc::new(PipelineContext { storage, fetcher, publisher, session: session.clone() });
    let scheduler = Scheduler::new(ctx.clone());

    session
        .add_handler(Arc::new(ControlHandler::new(ctx.clone(), scheduler.clone())))
        .await;
    session.add_handler(Arc::new(FallbackHandler)).await;

    scheduler.start().await;

    if let Some(port) = cli.web_port {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let ctx = ctx.clone();
        let scheduler = scheduler.clone();
        let service = cli.service.clone();
        tokio::spawn(async move {
            if let Err(error) = web::serve(addr, ctx, scheduler, service).await {
                tracing::error!(%error, "add-feed http resource exited");
            }
        });
    }

    info!(jid = %cli.jid, "mimir-aggregator running");
    session_task.await?;
    Ok(())
}
