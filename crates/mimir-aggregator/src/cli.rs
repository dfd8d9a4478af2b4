use clap::Parser;

/// Feed aggregator: polls feed URLs and republishes new/changed entries to
/// a pub-sub service over an XMPP component connection.
///
/// Flag names and defaults are reproduced from the upstream `tap.py`
/// `Options` declaration.
#[derive(Debug, Parser)]
#[command(name = "mimir-aggregator", version)]
pub struct Cli {
    /// Path to the feed list file.
    #[arg(long, default_value = "feeds")]
    pub feeds: String,

    /// JID of this component.
    #[arg(long)]
    pub jid: String,

    /// Secret to connect to the upstream server.
    #[arg(long)]
    pub secret: String,

    /// Upstream server address.
    #[arg(long, default_value = "127.0.0.1")]
    pub rhost: String,

    /// Upstream server port.
    #[arg(long, default_value_t = 5347)]
    pub rport: u16,

    /// Publish-subscribe service JID.
    #[arg(long)]
    pub service: String,

    /// Port to listen on for the optional HTTP add-feed resource.
    #[arg(long)]
    pub web_port: Option<u16>,

    /// Show XMPP traffic.
    #[arg(short, long)]
    pub verbose: bool,
}
