//! A [`Network`] on top of a NATS server. Every inbox is a subject under a
//! common prefix, packets are published in their wire encoding.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_nats::{ConnectOptions, Event};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::{
    UnboundedReceiver, UnboundedSender, WeakUnboundedSender, unbounded_channel,
};
use tracing::{Instrument, debug, debug_span, info, trace, warn};

use crate::{
    constants::DEFAULT_RECONNECT_WAIT,
    error::{Error, Result},
    message::Packet,
    traits::{NetEvent, Network},
};

#[derive(Debug, Clone)]
pub struct CertConfig {
    pub root_ca: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct NatsClientConfig {
    pub host: String,
    pub port: u16,
    /// Connection name, shows up in the server's monitoring.
    pub node_name: String,
    /// Inbox "x" is the subject "<subject_prefix>.x".
    pub subject_prefix: String,
    pub skip_tls: bool,
    /// Report asynchronous client and server errors as fatal, which ends the
    /// sessions that see them.
    pub async_error_fatal: bool,
    /// Delay between reconnect attempts. Reconnects are retried forever.
    pub reconnect_wait: Duration,
    /// Required unless `skip_tls` is set.
    pub certs: Option<CertConfig>,
}

impl NatsClientConfig {
    pub fn new(host: impl Into<String>, port: u16, node_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            node_name: node_name.into(),
            subject_prefix: "swp".to_owned(),
            skip_tls: true,
            async_error_fatal: false,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            certs: None,
        }
    }

    pub fn server_url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }

    pub fn subject(&self, inbox: &str) -> String {
        format!("{}.{}", self.subject_prefix, inbox)
    }

    fn connect_options(&self, subscribers: EventSubscribers) -> Result<ConnectOptions> {
        let reconnect_wait = self.reconnect_wait;
        let fatal = self.async_error_fatal;
        let was_disconnected = Arc::new(AtomicBool::new(false));

        let mut opts = ConnectOptions::new()
            .name(&self.node_name)
            .max_reconnects(None::<usize>)
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .event_callback(move |event| {
                let subscribers = subscribers.clone();
                let was_disconnected = was_disconnected.clone();
                async move {
                    if let Some(event) = net_event(event, fatal, &was_disconnected) {
                        broadcast(&subscribers, event);
                    }
                }
            });

        if !self.skip_tls {
            let certs = self.certs.as_ref().ok_or_else(|| {
                Error::Tls("TLS is enabled, but no certificates are configured".to_owned())
            })?;
            for path in [&certs.root_ca, &certs.client_cert, &certs.client_key] {
                std::fs::metadata(path).map_err(|e| Error::Tls(format!("{path:?}: {e}")))?;
            }
            opts = opts
                .require_tls(true)
                .add_root_certificates(certs.root_ca.clone())
                .add_client_certificate(certs.client_cert.clone(), certs.client_key.clone());
        }
        Ok(opts)
    }
}

// Only errors can end a session. Server notices such as lame duck mode or a
// drain are logged and otherwise ignored.
fn net_event(event: Event, fatal: bool, was_disconnected: &AtomicBool) -> Option<NetEvent> {
    let event = match event {
        Event::Connected if was_disconnected.load(Ordering::Relaxed) => NetEvent::Reconnected,
        Event::Connected => NetEvent::Connected,
        Event::Disconnected => {
            was_disconnected.store(true, Ordering::Relaxed);
            NetEvent::Disconnected
        }
        Event::Closed => NetEvent::Closed,
        error @ (Event::ServerError(_) | Event::ClientError(_) | Event::SlowConsumer(_)) => {
            NetEvent::AsyncError {
                error: error.to_string(),
                fatal,
            }
        }
        other => {
            debug!(event = %other, "NATS server notice");
            return None;
        }
    };
    Some(event)
}

type EventSubscribers = Arc<Mutex<Vec<UnboundedSender<NetEvent>>>>;

fn broadcast(subscribers: &EventSubscribers, event: NetEvent) {
    match &event {
        NetEvent::AsyncError { error, fatal } => warn!(%error, fatal, "NATS error"),
        other => debug!(event = ?other, "NATS connection event"),
    }
    subscribers
        .lock()
        .retain(|tx| tx.send(event.clone()).is_ok());
}

pub struct NatsNet {
    client: async_nats::Client,
    cfg: NatsClientConfig,
    subscribers: EventSubscribers,
    // Weak, so the stream still ends when the forwarding task exits.
    listening: Mutex<HashMap<String, WeakUnboundedSender<Packet>>>,
}

impl NatsNet {
    pub async fn connect(cfg: NatsClientConfig) -> Result<Self> {
        let subscribers = EventSubscribers::default();
        let opts = cfg.connect_options(subscribers.clone())?;
        let url = cfg.server_url();
        let client = opts
            .connect(url.as_str())
            .await
            .map_err(|e| Error::Connect(format!("{url}: {e:#}")))?;
        info!(%url, name = %cfg.node_name, "connected to NATS");
        Ok(Self {
            client,
            cfg,
            subscribers,
            listening: Default::default(),
        })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

impl Network for NatsNet {
    async fn send<'a>(&'a self, packet: &'a Packet, reason: &'static str) -> Result<()> {
        let bytes = packet.serialize()?;
        trace!(header = %packet.header.short_repr(), reason, "publishing");
        self.client
            .publish(self.cfg.subject(&packet.dest), bytes.into())
            .await
            .map_err(|e| Error::Send(std::io::Error::other(e)))
    }

    async fn listen<'a>(&'a self, inbox: &'a str) -> Result<UnboundedReceiver<Packet>> {
        let (tx, rx) = unbounded_channel();
        {
            let mut listening = self.listening.lock();
            let alive = listening
                .get(inbox)
                .and_then(|weak| weak.upgrade())
                .is_some_and(|tx| !tx.is_closed());
            if alive {
                return Err(Error::AlreadyListening(inbox.to_owned()));
            }
            listening.insert(inbox.to_owned(), tx.downgrade());
        }

        let subject = self.cfg.subject(inbox);
        let mut sub = match self.client.subscribe(subject.clone()).await {
            Ok(sub) => sub,
            Err(e) => {
                self.listening.lock().remove(inbox);
                return Err(Error::Connect(format!("error subscribing to {subject}: {e:#}")));
            }
        };

        let span = debug_span!("nats_listen", %subject);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = tx.closed() => {
                            trace!("listener dropped");
                            break;
                        }
                        msg = sub.next() => match msg {
                            Some(msg) => match Packet::deserialize(&msg.payload) {
                                Some(packet) => {
                                    let _ = tx.send(packet);
                                }
                                None => trace!(len = msg.payload.len(), "error deserializing packet"),
                            },
                            None => {
                                debug!("subscription ended");
                                break;
                            }
                        },
                    }
                }
                if let Err(e) = sub.unsubscribe().await {
                    debug!("error unsubscribing: {e:#}");
                }
            }
            .instrument(span),
        );
        Ok(rx)
    }

    fn subscribe_events(&self) -> Option<UnboundedReceiver<NetEvent>> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        Some(rx)
    }
}
