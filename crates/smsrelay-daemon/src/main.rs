//! SMS relay daemon.
//!
//! Keeps a supervised XMPP session with FCM open, logs every SMS/MMS the
//! phone app sends upstream, and relays newline-delimited JSON requests from
//! stdin back down to the phone.
//!
//!   smsrelay --config relay.toml
//!   SMSRELAY_SENDER_ID=1234 SMSRELAY_SERVER_KEY=... smsrelay --production

mod config;
mod relay;

use anyhow::Context;
use clap::Parser;
use config::{DaemonConfig, Overrides};
use smsrelay_client::{ErrorSink, Supervisor, XmppConnector};
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "smsrelay", version, about)]
struct Args {
    /// TOML file with [xmpp], [supervisor] and [relay] tables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// FCM sender id
    #[arg(long, env = "SMSRELAY_SENDER_ID")]
    sender_id: Option<String>,

    /// FCM server key
    #[arg(long, env = "SMSRELAY_SERVER_KEY", hide_env_values = true)]
    server_key: Option<String>,

    /// Use the production endpoint instead of the development one
    #[arg(long)]
    production: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("smsrelay=info".parse()?))
        .init();

    let args = Args::parse();
    let mut config = DaemonConfig::load(args.config.as_deref())?;
    config.apply(Overrides {
        sender_id: args.sender_id,
        server_key: args.server_key,
        production: args.production,
    });
    tracing::debug!(?config, "configuration loaded");

    let connector = XmppConnector::new(config.xmpp.clone()).context("invalid FCM settings")?;
    let (inbound_tx, inbound_rx) = mpsc::channel(config.relay.inbound_capacity);
    let (errors, reports) = ErrorSink::channel();
    let supervisor = Supervisor::start(connector, config.supervisor.clone(), inbound_tx, errors);

    tokio::spawn(relay::log_inbound(inbound_rx));
    let policy = tokio::spawn(relay::enforce_fatal_policy(reports, supervisor.clone()));

    let id = supervisor
        .spawn_connection()
        .await
        .context("could not connect to FCM")?;
    tracing::info!(
        connection = %id,
        endpoint = %format!("{}:{}", config.xmpp.host, config.xmpp.port()),
        "listening for SMS"
    );

    let outbound = supervisor.outbound();
    tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        match relay::read_outbound(stdin, outbound).await {
            Ok(queued) => tracing::info!(queued, "outbound input finished"),
            Err(e) => tracing::warn!(error = %e, "failed reading outbound input"),
        }
    });

    // Runs until a fatal error leaves no connection to relay through.
    policy.await?.map_err(anyhow::Error::from)
}
