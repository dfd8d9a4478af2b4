use clap::Parser;

/// Presence/news daemon: elects each roster JID's top resource and fans
/// feed updates published by the aggregator out to subscribers.
///
/// Flag names and defaults are reproduced from the upstream
/// `mimir/monitor/tap.py` `Options` declaration, plus a small supplement
/// documented in its own doc comments below.
#[derive(Debug, Parser)]
#[command(name = "mimir-monitor", version)]
pub struct Cli {
    /// JID of this component.
    #[arg(long)]
    pub jid: String,

    /// Secret to connect to the upstream server.
    #[arg(long)]
    pub secret: String,

    /// Database user.
    #[arg(long)]
    pub dbuser: String,

    /// Database name.
    #[arg(long, default_value = "mimir")]
    pub dbname: String,

    /// Upstream server address.
    #[arg(long, default_value = "127.0.0.1")]
    pub rhost: String,

    /// Upstream server port.
    #[arg(long, default_value_t = 5347)]
    pub rport: u16,

    /// Base URL for the digest message's news-page link. Omitted entirely
    /// when unset, per the digest content rules.
    #[arg(long)]
    pub news_base_url: Option<String>,

    /// Show XMPP traffic.
    #[arg(short, long)]
    pub verbose: bool,
}
