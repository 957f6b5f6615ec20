//! Rendezvous signalling client
//!
//! Long-lived WebSocket channel to the rendezvous service. Outbound
//! messages are queued on an unbounded channel and written by a writer
//! task; inbound JSON messages are dispatched to registered callbacks by
//! a reader task. The engine only consumes `peer-info`, `chat-request`
//! and `chat-init`; acknowledgements and errors are logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};

/// Invoked when the channel opens (true) or closes (false)
pub type ConnectCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Invoked with the requesting username on an incoming chat request
pub type ChatRequestCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Invoked with (username, ip, port) when peer info arrives
pub type PeerInfoCallback = Arc<dyn Fn(String, String, u16) + Send + Sync>;

/// Invoked with (username, ip, port) on the go-ahead to start punching
pub type ChatInitCallback = Arc<dyn Fn(String, String, u16) + Send + Sync>;

/// Messages sent to the rendezvous service
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Outbound {
    Greeting,
    Register {
        username: String,
        ip: String,
        port: u16,
    },
    GetName,
    GetPeer {
        username: String,
    },
    StartChat {
        target: String,
    },
    ChatAccept,
    ChatDecline,
}

/// Messages received from the rendezvous service
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Inbound {
    PeerInfo {
        username: String,
        ip: String,
        port: u16,
    },
    ChatRequest {
        from: String,
    },
    ChatInit {
        username: String,
        ip: String,
        port: u16,
    },
    GreetBack {
        #[serde(default)]
        message: Option<String>,
    },
    RegisterAck {
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// WebSocket client for the rendezvous service
pub struct SignalingClient {
    connected: AtomicBool,
    out_tx: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,

    on_connect: Mutex<Option<ConnectCallback>>,
    on_chat_request: Mutex<Option<ChatRequestCallback>>,
    on_peer_info: Mutex<Option<PeerInfoCallback>>,
    on_chat_init: Mutex<Option<ChatInitCallback>>,
}

impl SignalingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            out_tx: Mutex::new(None),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
            on_connect: Mutex::new(None),
            on_chat_request: Mutex::new(None),
            on_peer_info: Mutex::new(None),
            on_chat_init: Mutex::new(None),
        })
    }

    pub fn set_connect_callback(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        *self.on_connect.lock().expect("callback mutex poisoned") = Some(Arc::new(callback));
    }

    pub fn set_chat_request_callback(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        *self.on_chat_request.lock().expect("callback mutex poisoned") = Some(Arc::new(callback));
    }

    pub fn set_peer_info_callback(
        &self,
        callback: impl Fn(String, String, u16) + Send + Sync + 'static,
    ) {
        *self.on_peer_info.lock().expect("callback mutex poisoned") = Some(Arc::new(callback));
    }

    pub fn set_chat_init_callback(
        &self,
        callback: impl Fn(String, String, u16) + Send + Sync + 'static,
    ) {
        *self.on_chat_init.lock().expect("callback mutex poisoned") = Some(Arc::new(callback));
    }

    /// Whether the channel is currently open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Open the WebSocket and spawn the reader/writer tasks
    pub async fn connect(self: &Arc<Self>, server_url: &str) -> CoreResult<()> {
        info!("connecting to rendezvous service: {}", server_url);

        let (stream, response) = connect_async(server_url)
            .await
            .map_err(|e| CoreError::Signaling(format!("connect failed: {}", e)))?;
        debug!("signalling connected (status {})", response.status());

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to encode signalling message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("signalling write failed: {}", e);
                    break;
                }
            }
        });

        let client = Arc::clone(self);
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => client.dispatch(&text),
                    Ok(Message::Close(_)) => {
                        info!("signalling connection closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("signalling read error: {}", e);
                        break;
                    }
                }
            }
            client.connected.store(false, Ordering::Release);
            client.notify_connect(false);
        });

        *self.out_tx.lock().expect("channel mutex poisoned") = Some(out_tx);
        *self.writer_task.lock().expect("task mutex poisoned") = Some(writer);
        *self.reader_task.lock().expect("task mutex poisoned") = Some(reader);

        self.connected.store(true, Ordering::Release);
        self.notify_connect(true);
        Ok(())
    }

    /// Close the channel and stop both tasks. Idempotent.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        // Dropping the sender ends the writer task
        self.out_tx.lock().expect("channel mutex poisoned").take();

        if let Some(task) = self.reader_task.lock().expect("task mutex poisoned").take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.lock().expect("task mutex poisoned").take() {
            task.abort();
        }

        info!("disconnected from rendezvous service");
    }

    pub fn send_greeting(&self) {
        self.send(Outbound::Greeting);
    }

    pub fn register_user(&self, username: &str, ip: &str, port: u16) {
        self.send(Outbound::Register {
            username: username.to_string(),
            ip: ip.to_string(),
            port,
        });
    }

    pub fn request_username(&self) {
        self.send(Outbound::GetName);
    }

    pub fn request_peer_info(&self, username: &str) {
        self.send(Outbound::GetPeer {
            username: username.to_string(),
        });
    }

    pub fn send_chat_request(&self, target: &str) {
        self.send(Outbound::StartChat {
            target: target.to_string(),
        });
    }

    pub fn accept_chat_request(&self) {
        self.send(Outbound::ChatAccept);
    }

    pub fn decline_chat_request(&self) {
        self.send(Outbound::ChatDecline);
    }

    fn send(&self, msg: Outbound) {
        if !self.is_connected() {
            warn!("cannot send signalling message: not connected");
            return;
        }
        let tx = self.out_tx.lock().expect("channel mutex poisoned");
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(msg);
        }
    }

    fn dispatch(&self, text: &str) {
        let msg: Inbound = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(_) => {
                debug!("unparsed signalling message: {}", text);
                return;
            }
        };

        match msg {
            Inbound::PeerInfo { username, ip, port } => {
                info!("peer {} is at {}:{}", username, ip, port);
                let callback = self.on_peer_info.lock().expect("callback mutex poisoned").clone();
                if let Some(callback) = callback {
                    callback(username, ip, port);
                }
            }
            Inbound::ChatRequest { from } => {
                let callback = self
                    .on_chat_request
                    .lock()
                    .expect("callback mutex poisoned")
                    .clone();
                if let Some(callback) = callback {
                    callback(from);
                }
            }
            Inbound::ChatInit { username, ip, port } => {
                let callback = self.on_chat_init.lock().expect("callback mutex poisoned").clone();
                if let Some(callback) = callback {
                    callback(username, ip, port);
                }
            }
            Inbound::GreetBack { message } | Inbound::RegisterAck { message } => {
                info!("server: {}", message.unwrap_or_default());
            }
            Inbound::Error { message } => {
                warn!("server error: {}", message.unwrap_or_default());
            }
            Inbound::Unknown => {
                debug!("unexpected signalling message: {}", text);
            }
        }
    }

    fn notify_connect(&self, connected: bool) {
        let callback = self.on_connect.lock().expect("callback mutex poisoned").clone();
        if let Some(callback) = callback {
            callback(connected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn test_outbound_wire_format() {
        let json = serde_json::to_string(&Outbound::Register {
            username: "alice".into(),
            ip: "203.0.113.7".into(),
            port: 40000,
        })
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["username"], "alice");
        assert_eq!(value["ip"], "203.0.113.7");
        assert_eq!(value["port"], 40000);

        let json = serde_json::to_string(&Outbound::GetPeer {
            username: "bob".into(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "get-peer");

        let json = serde_json::to_string(&Outbound::StartChat {
            target: "bob".into(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "start-chat");
    }

    #[test]
    fn test_inbound_dispatch() {
        let client = SignalingClient::new();

        let (tx, rx) = std_mpsc::channel();
        client.set_peer_info_callback(move |username, ip, port| {
            tx.send((username, ip, port)).unwrap();
        });

        client.dispatch(r#"{"type":"peer-info","username":"bob","ip":"198.51.100.4","port":51000}"#);

        let (username, ip, port) = rx.recv().unwrap();
        assert_eq!(username, "bob");
        assert_eq!(ip, "198.51.100.4");
        assert_eq!(port, 51000);
    }

    #[test]
    fn test_chat_init_dispatch() {
        let client = SignalingClient::new();

        let (tx, rx) = std_mpsc::channel();
        client.set_chat_init_callback(move |username, ip, port| {
            tx.send((username, ip, port)).unwrap();
        });

        client.dispatch(r#"{"type":"chat-init","username":"bob","ip":"198.51.100.4","port":51000}"#);
        assert!(rx.recv().is_ok());
    }

    #[test]
    fn test_unknown_and_malformed_messages_ignored() {
        let client = SignalingClient::new();
        client.dispatch(r#"{"type":"something-else","x":1}"#);
        client.dispatch("not json at all");
        client.dispatch(r#"{"type":"error","message":"user not found"}"#);
    }

    #[test]
    fn test_send_requires_connection() {
        let client = SignalingClient::new();
        // Must not panic or queue anything while disconnected
        client.send_greeting();
        client.register_user("alice", "1.2.3.4", 1);
        assert!(!client.is_connected());
    }
}
