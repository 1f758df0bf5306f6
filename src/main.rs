//! svcnet - Echo Service Entry Point
//!
//! Runs one service on top of the connection manager and echoes whatever
//! its clients send.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::signal;
use tracing::{debug, info, warn};

use svcnet::{
    Config, ConnectionId, Mailbox, Message, MessageType, Protocol, ReadMode, SocketEvent,
    TcpManager, VERSION,
};

/// Reply id of the accept requests issued by the text echo loop
const ACCEPT_REPLY: i32 = 1;

/// Application entry point
#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // Load configuration
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Initialize tracing/logging
    svcnet::util::init_tracing(&config.logging)?;

    info!(
        version = VERSION,
        config_path = ?config_path,
        "Starting svcnet echo service"
    );

    // Initialize metrics if enabled
    if config.metrics.enabled {
        svcnet::metrics::init_metrics(&config.metrics)?;
        info!(
            bind_addr = %config.metrics.bind_addr,
            "Metrics endpoint started"
        );
    }

    let (mailbox, mut inbox) = Mailbox::new(config.server.service_id);
    let mut manager = TcpManager::with_config(mailbox, &config.tcp);

    if !manager.listen(&config.server.host, &config.server.port).await {
        anyhow::bail!(
            "Failed to listen on {}:{}",
            config.server.host,
            config.server.port
        );
    }

    let mut echo = Echo::new(config.tcp.protocol);
    echo.start(&mut manager);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            alive = manager.dispatch_next() => {
                if !alive {
                    break;
                }
            }
            Some(msg) = inbox.recv() => echo.handle(&mut manager, &msg),
            _ = &mut shutdown => {
                info!("Shutdown signal received, closing connections...");
                break;
            }
        }
    }

    let closed = manager.destroy();
    info!(closed, "Server stopped");
    Ok(())
}

/// Echo logic driven by the service inbox
struct Echo {
    protocol: Protocol,
    // text variant: outstanding read reply id -> connection
    reads: HashMap<i32, ConnectionId>,
    next_reply: i32,
}

impl Echo {
    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            reads: HashMap::new(),
            next_reply: ACCEPT_REPLY + 1,
        }
    }

    fn start(&mut self, manager: &mut TcpManager<Mailbox>) {
        // the text variant accepts on request only
        if self.protocol == Protocol::Text {
            manager.async_accept(ACCEPT_REPLY);
        }
    }

    fn handle(&mut self, manager: &mut TcpManager<Mailbox>, msg: &Message) {
        match msg.event() {
            Some(event) => self.on_socket_event(manager, event, msg),
            None => self.on_reply(manager, msg),
        }
    }

    fn on_socket_event(&mut self, manager: &mut TcpManager<Mailbox>, event: SocketEvent, msg: &Message) {
        let Ok(id) = ConnectionId::try_from(msg.sender()) else {
            return;
        };
        match event {
            SocketEvent::Accept | SocketEvent::Connect => {
                info!(conn_id = %id, peer = %msg.text(), event = event.as_str(), "Client connected");
            }
            SocketEvent::Message => {
                if !manager.send_message(id, msg) {
                    debug!(conn_id = %id, "Echo dropped");
                }
            }
            SocketEvent::Close => {
                info!(conn_id = %id, reason = %msg.text(), "Client disconnected");
            }
        }
    }

    fn on_reply(&mut self, manager: &mut TcpManager<Mailbox>, msg: &Message) {
        let reply_id = msg.response_id();

        if reply_id == ACCEPT_REPLY {
            if msg.message_type() == MessageType::Text {
                match msg.text().parse::<u16>().ok().and_then(ConnectionId::from_raw) {
                    Some(id) => self.read_line(manager, id),
                    None => warn!(reply = %msg.text(), "Unexpected accept reply"),
                }
            } else {
                warn!(error = %msg.text(), "Accept failed");
            }
            manager.async_accept(ACCEPT_REPLY);
            return;
        }

        let Some(id) = self.reads.remove(&reply_id) else {
            return;
        };
        if msg.message_type() == MessageType::Error {
            debug!(conn_id = %id, reason = %msg.text(), "Read ended");
            return;
        }

        let mut line = msg.data().to_vec();
        line.push(b'\n');
        if manager.send(id, line) {
            self.read_line(manager, id);
        }
    }

    fn read_line(&mut self, manager: &mut TcpManager<Mailbox>, id: ConnectionId) {
        let reply_id = self.next_reply;
        self.next_reply = self.next_reply.checked_add(1).unwrap_or(ACCEPT_REPLY + 1);
        self.reads.insert(reply_id, id);
        manager.read(id, 0, ReadMode::Lf, reply_id);
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
