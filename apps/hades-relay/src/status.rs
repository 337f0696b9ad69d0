//! Text and dot indicators for the relay and chat connections.

use std::fmt;

use tokio::sync::watch;
use tracing::info;

use crate::chat::ChatPhase;
use crate::controller::ConnectionPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dot {
    Connected,
    Scanning,
    Disconnected,
}

impl Dot {
    pub fn css_class(self) -> &'static str {
        match self {
            Dot::Connected => "connection__dot connection__dot--connected",
            Dot::Scanning => "connection__dot connection__dot--scanning",
            Dot::Disconnected => "connection__dot connection__dot--disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusIndicator {
    pub text: &'static str,
    pub dot: Dot,
}

impl fmt::Display for StatusIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.dot {
            Dot::Connected => "●",
            Dot::Scanning => "◌",
            Dot::Disconnected => "○",
        };
        write!(f, "{marker} {}", self.text)
    }
}

impl From<ConnectionPhase> for StatusIndicator {
    fn from(phase: ConnectionPhase) -> Self {
        let (text, dot) = match phase {
            ConnectionPhase::Idle | ConnectionPhase::Closed => ("Disconnected", Dot::Disconnected),
            ConnectionPhase::Scanning => ("Scanning...", Dot::Scanning),
            ConnectionPhase::Open => ("Connected", Dot::Connected),
            ConnectionPhase::Error => ("Error", Dot::Disconnected),
        };
        Self { text, dot }
    }
}

impl From<ChatPhase> for StatusIndicator {
    fn from(phase: ChatPhase) -> Self {
        let (text, dot) = match phase {
            ChatPhase::Disconnected => ("Disconnected", Dot::Disconnected),
            ChatPhase::Connecting => ("Connecting...", Dot::Scanning),
            ChatPhase::Connected => ("Connected", Dot::Connected),
        };
        Self { text, dot }
    }
}

/// Logs every indicator change on `rx` until the sender goes away.
pub fn spawn_indicator_log<T>(label: &'static str, mut rx: watch::Receiver<T>) -> tokio::task::JoinHandle<()>
where
    T: Clone + Into<StatusIndicator> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut last: StatusIndicator = rx.borrow_and_update().clone().into();
        info!(target = "relay.status", connection = label, status = %last, "status");
        while rx.changed().await.is_ok() {
            let current: StatusIndicator = rx.borrow_and_update().clone().into();
            if current != last {
                info!(target = "relay.status", connection = label, status = %current, "status");
                last = current;
            }
        }
    })
}
