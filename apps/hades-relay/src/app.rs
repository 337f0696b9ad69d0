use std::sync::Arc;

use anyhow::Result;
use relay_bus::{Bus, SendOutcome, TopicRouter};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::chat::{ChatBridge, ChatSender, ChatSession, TwitchApi, TwitchIrcClient};
use crate::config::RelayConfig;
use crate::controller::ReconnectController;
use crate::status::{spawn_indicator_log, StatusIndicator};

/// Line commands accepted on stdin while the relay runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start or stop searching for the relay.
    Relay,
    /// Connect or disconnect chat, optionally naming the channel.
    Chat(Option<String>),
    Publish { topic: String, message: Value },
    Status,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let command = match word.to_ascii_lowercase().as_str() {
            "relay" => Command::Relay,
            "chat" => Command::Chat((!rest.is_empty()).then(|| rest.to_string())),
            "publish" | "pub" => {
                let (topic, message) = match rest.split_once(char::is_whitespace) {
                    Some((topic, message)) => (topic, message.trim()),
                    None => (rest, "null"),
                };
                if topic.is_empty() {
                    return Err("usage: publish <topic> [json]".into());
                }
                let message = serde_json::from_str(message)
                    .map_err(|err| format!("message is not valid json: {err}"))?;
                Command::Publish {
                    topic: topic.to_string(),
                    message,
                }
            }
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("unknown command `{other}`; try `help`")),
        };
        Ok(Some(command))
    }
}

const HELP: &str = "commands:
  relay                    start/stop searching for the game
  chat [channel]           connect/disconnect twitch chat
  publish <topic> [json]   send a frame to the game
  status                   show connection status
  quit                     shut down";

struct App {
    config: RelayConfig,
    controller: ReconnectController,
    bus: Bus,
    session: Arc<ChatSession>,
    bridge: Option<ChatBridge>,
}

impl App {
    fn new(config: RelayConfig) -> Self {
        let router = TopicRouter::with_max_frame_bytes(config.max_frame_bytes);
        let controller =
            ReconnectController::new(config.endpoint.clone(), config.reconnect.clone(), router);
        let bus = controller.bus();
        let api = TwitchApi::new(&config.twitch.api_base, &config.twitch.client_id);
        let client = Arc::new(TwitchIrcClient::new(&config.twitch.irc_url));
        let session = Arc::new(ChatSession::new(api, client));
        Self {
            config,
            controller,
            bus,
            session,
            bridge: None,
        }
    }

    async fn toggle_chat(&mut self, channel: Option<String>) {
        if let Some(bridge) = self.bridge.take() {
            bridge.detach();
        }
        if self.session.is_connected() {
            self.session.disconnect().await;
            return;
        }
        let Some(channel) = channel.or_else(|| self.config.twitch.channel.clone()) else {
            println!("no channel given; use `chat <channel>`");
            return;
        };
        match self.session.connect(&channel).await {
            Ok(events) => {
                let sender: Arc<dyn ChatSender> = self.session.clone();
                self.bridge = Some(ChatBridge::attach(self.bus.clone(), events, sender));
            }
            Err(err) => println!("chat: {err}"),
        }
    }

    fn print_status(&self) {
        let relay = StatusIndicator::from(self.controller.phase());
        let chat = self.session.status();
        println!("relay: {relay} (attempts: {})", self.controller.attempts());
        match &chat.error {
            Some(error) => println!("chat:  {} ({error})", StatusIndicator::from(chat.clone())),
            None => println!("chat:  {}", StatusIndicator::from(chat.clone())),
        }
    }

    /// Returns `false` when the app should shut down.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Relay => {
                let searching = self.controller.toggle();
                info!(target = "relay.app", searching, "relay search toggled");
            }
            Command::Chat(channel) => self.toggle_chat(channel).await,
            Command::Publish { topic, message } => match self.bus.publish(&topic, &message) {
                Ok(SendOutcome::Sent) => println!("sent to `{topic}`"),
                Ok(SendOutcome::Dropped) => println!("relay not connected; frame dropped"),
                Err(err) => println!("publish failed: {err}"),
            },
            Command::Status => self.print_status(),
            Command::Help => println!("{HELP}"),
            Command::Quit => return false,
        }
        true
    }

    async fn shutdown(mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.detach();
        }
        self.session.disconnect().await;
        self.controller.shutdown().await;
    }
}

/// Searches for the relay, joins chat when a channel is configured and
/// serves stdin commands until Ctrl-C or `quit`.
pub async fn run(config: RelayConfig) -> Result<()> {
    let mut app = App::new(config);
    let relay_status = spawn_indicator_log("relay", app.controller.watch_phase());
    let chat_status = spawn_indicator_log("chat", app.session.watch_status());

    info!(
        target = "relay.app",
        endpoint = %app.config.endpoint.url,
        subprotocol = %app.config.endpoint.subprotocol,
        "searching for relay"
    );
    app.controller.start();
    if app.config.twitch.channel.is_some() {
        app.toggle_chat(None).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(target = "relay.app", error = %err, "failed to listen for ctrl-c");
                }
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match Command::parse(&line) {
                    Ok(Some(command)) => {
                        if !app.handle(command).await {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(message) => println!("{message}"),
                },
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!(target = "relay.app", error = %err, "stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    info!(target = "relay.app", "shutting down");
    app.shutdown().await;
    relay_status.abort();
    chat_status.abort();
    Ok(())
}
