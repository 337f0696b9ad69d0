use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use relay_bus::{Bus, SendOutcome, TopicRouter};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tracing::debug;

use crate::config::{
    RelayConfig, DEFAULT_ENDPOINT, DEFAULT_SUBPROTOCOL, DEFAULT_TWITCH_API_BASE,
    DEFAULT_TWITCH_IRC_URL,
};
use crate::transport::{Connection, TransportEvent};

#[derive(Parser, Debug)]
#[command(name = "hades-relay")]
#[command(about = "Relay between the Hades Live control socket and Twitch chat")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Relay socket url.
    #[arg(long, env = "HADES_ENDPOINT", default_value = DEFAULT_ENDPOINT, global = true)]
    pub endpoint: String,

    /// WebSocket sub-protocol requested from the relay.
    #[arg(long, env = "HADES_SUBPROTOCOL", default_value = DEFAULT_SUBPROTOCOL, global = true)]
    pub subprotocol: String,

    /// Largest frame accepted or sent, in bytes.
    #[arg(long, env = "HADES_MAX_FRAME_BYTES", default_value_t = relay_bus::DEFAULT_MAX_FRAME_BYTES, global = true)]
    pub max_frame_bytes: usize,

    /// Delay before the first reconnect attempt.
    #[arg(long, env = "HADES_RECONNECT_DELAY_MS", default_value_t = 0, global = true)]
    pub reconnect_delay_ms: u64,

    /// Growth factor applied to the delay after each failed attempt.
    #[arg(long, env = "HADES_RECONNECT_MULTIPLIER", default_value_t = 1.0, global = true)]
    pub reconnect_multiplier: f64,

    /// Upper bound on the reconnect delay.
    #[arg(long, env = "HADES_RECONNECT_MAX_DELAY_MS", default_value_t = 0, global = true)]
    pub reconnect_max_delay_ms: u64,

    /// Stop searching after this many consecutive failed attempts.
    #[arg(long, env = "HADES_RECONNECT_MAX_ATTEMPTS", global = true)]
    pub reconnect_max_attempts: Option<u32>,

    #[arg(long, env = "TWITCH_API_BASE", default_value = DEFAULT_TWITCH_API_BASE, global = true)]
    pub twitch_api_base: String,

    /// Client id sent with the channel lookup.
    #[arg(long, env = "TWITCH_CLIENT_ID", global = true)]
    pub twitch_client_id: Option<String>,

    #[arg(long, env = "TWITCH_IRC_URL", default_value = DEFAULT_TWITCH_IRC_URL, global = true)]
    pub twitch_irc_url: String,

    /// Tracing filter directive.
    #[arg(long, env = "RUST_LOG", global = true)]
    pub log_filter: Option<String>,
}

impl Cli {
    pub fn channel(&self) -> Option<&str> {
        match &self.command {
            Some(Commands::Run { channel }) => channel.as_deref(),
            _ => None,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Search for the relay and bridge chat (default)
    Run {
        /// Twitch channel to join on startup
        #[arg(short, long, env = "TWITCH_CHANNEL")]
        channel: Option<String>,
    },

    /// Publish one frame to the relay and print what comes back
    Probe {
        /// Topic to publish on
        #[arg(short, long)]
        topic: String,

        /// JSON payload
        #[arg(short, long, default_value = "null")]
        message: String,

        /// Topics to print inbound frames for
        #[arg(short, long)]
        listen: Vec<String>,

        /// Seconds to wait for replies
        #[arg(short, long, default_value_t = 3)]
        wait: u64,
    },
}

pub struct ProbeArgs {
    pub topic: String,
    pub message: String,
    pub listen: Vec<String>,
    pub wait: Duration,
}

/// Connects once, publishes a frame and prints frames on the listened
/// topics until `wait` elapses or the relay closes.
pub async fn run_probe(config: &RelayConfig, args: ProbeArgs) -> Result<()> {
    let payload: Value = serde_json::from_str(&args.message)
        .with_context(|| format!("message is not valid json: {}", args.message))?;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let connection = Arc::new(Connection::spawn(1, &config.endpoint, events_tx));

    match timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Some((_, TransportEvent::Opened))) => {}
        Ok(Some((_, TransportEvent::Errored(reason)))) => {
            return Err(anyhow!("failed to connect to {}: {}", config.endpoint.url, reason));
        }
        Ok(_) => return Err(anyhow!("relay closed before opening")),
        Err(_) => {
            return Err(anyhow!(
                "connection timeout - is the relay listening on {}?",
                config.endpoint.url
            ))
        }
    }
    debug!(target = "relay.probe", url = %config.endpoint.url, "connected");

    let router = TopicRouter::with_max_frame_bytes(config.max_frame_bytes);
    let sink = Arc::clone(&connection);
    let bus = Bus::new(router.clone(), Arc::new(move |text: String| sink.send(text)));
    let subscriptions: Vec<_> = args
        .listen
        .iter()
        .map(|topic| {
            bus.subscribe(topic, |frame| {
                let body = serde_json::to_string_pretty(&frame.message)
                    .unwrap_or_else(|_| frame.message.to_string());
                println!("[{}] {}", frame.target, body);
            })
        })
        .collect();

    match bus.publish(&args.topic, &payload)? {
        SendOutcome::Sent => println!("published to `{}`", args.topic),
        SendOutcome::Dropped => return Err(anyhow!("relay closed before the frame was sent")),
    }

    let deadline = Instant::now() + args.wait;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some((_, TransportEvent::Message(text)))) => {
                router.dispatch_text(&text);
            }
            Ok(Some((_, TransportEvent::Errored(reason)))) => {
                eprintln!("relay error: {reason}");
            }
            Ok(Some((_, TransportEvent::Closed))) | Ok(None) => {
                println!("relay closed the connection");
                break;
            }
            Ok(Some(_)) => {}
            Err(_) => break,
        }
    }

    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    connection.close();
    Ok(())
}
