//! Cable connection
//!
//! Runs the Action Cable protocol for one client: a `welcome` on connect, a
//! `ping` every ping interval, and the subscribe, unsubscribe and message
//! commands. Channel data reaches the client through one bounded outbound
//! queue shared by all of the connection's subscriptions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::channel::{CableSubscription, Channel, ChannelRegistry};
use super::protocol::{Command, CommandKind, ServerMessage};
use crate::error::{Error, Result};

/// Messages queued for the client before channel tasks wait
pub const OUTBOUND_CAPACITY: usize = 16;

struct Subscribed {
    channel: Arc<dyn Channel>,
    token: CancellationToken,
}

/// One client's cable session
pub struct CableConnection {
    channels: Arc<ChannelRegistry>,
    ping_interval: Duration,
    subscriptions: HashMap<String, Subscribed>,
    tasks: TaskTracker,
    token: CancellationToken,
}

impl CableConnection {
    /// Create a connection whose subscriptions end when `parent` is cancelled
    pub fn new(
        channels: Arc<ChannelRegistry>,
        ping_interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            channels,
            ping_interval,
            subscriptions: HashMap::new(),
            tasks: TaskTracker::new(),
            token: parent.child_token(),
        }
    }

    /// Serve an upgraded websocket until either side closes it
    pub async fn serve_websocket(self, socket: WebSocket) -> Result<()> {
        let (sink, stream) = socket.split();
        let incoming = stream.filter_map(|message| {
            futures::future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            })
        });
        let outgoing = sink.with(|text: String| futures::future::ready(Ok::<_, axum::Error>(Message::Text(text))));
        self.serve(incoming, outgoing).await
    }

    /// Serve text messages until the client goes away or the parent token
    /// is cancelled.
    ///
    /// Every subscription task has finished by the time this returns.
    pub async fn serve<I, O>(mut self, incoming: I, outgoing: O) -> Result<()>
    where
        I: Stream<Item = Result<String>>,
        O: Sink<String>,
        O::Error: fmt::Display,
    {
        let mut incoming = std::pin::pin!(incoming);
        let mut outgoing = std::pin::pin!(outgoing);
        let (outbound, mut queued) = mpsc::channel(OUTBOUND_CAPACITY);
        let (ended_tx, mut ended) = mpsc::unbounded_channel::<String>();

        let result: Result<()> = async {
            write(&mut outgoing, &ServerMessage::welcome()).await?;

            let mut ping = tokio::time::interval_at(
                Instant::now() + self.ping_interval,
                self.ping_interval,
            );
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.token.cancelled() => {
                        return write(&mut outgoing, &ServerMessage::disconnect("server_restart", true)).await;
                    }
                    _ = ping.tick() => {
                        write(&mut outgoing, &ServerMessage::ping(chrono::Utc::now().timestamp())).await?;
                    }
                    Some(message) = queued.recv() => {
                        write(&mut outgoing, &message).await?;
                    }
                    Some(identifier) = ended.recv() => self.forget(&identifier),
                    received = incoming.next() => match received {
                        Some(Ok(text)) => self.handle(&text, &outbound, &ended_tx, &mut outgoing).await?,
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    },
                }
            }
        }
        .await;

        self.close().await;
        result
    }

    async fn handle<O>(
        &mut self,
        text: &str,
        outbound: &mpsc::Sender<ServerMessage>,
        ended: &mpsc::UnboundedSender<String>,
        outgoing: &mut O,
    ) -> Result<()>
    where
        O: Sink<String> + Unpin,
        O::Error: fmt::Display,
    {
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed cable command");
                return Ok(());
            }
        };

        match command.command {
            CommandKind::Subscribe => {
                let reply = match self.subscribe(&command.identifier, outbound, ended).await {
                    Ok(()) => ServerMessage::confirm_subscription(&command.identifier),
                    Err(e) => {
                        tracing::warn!(identifier = %command.identifier, error = %e, "Cable subscription rejected");
                        ServerMessage::reject_subscription(&command.identifier)
                    }
                };
                write(outgoing, &reply).await
            }
            CommandKind::Unsubscribe => {
                if let Some(subscribed) = self.subscriptions.remove(&command.identifier) {
                    subscribed.token.cancel();
                    tracing::debug!(identifier = %command.identifier, "Cable unsubscribed");
                }
                Ok(())
            }
            CommandKind::Message => {
                let Some(subscribed) = self.subscriptions.get(&command.identifier) else {
                    tracing::warn!(identifier = %command.identifier, "Message for unknown cable subscription");
                    return Ok(());
                };
                let channel = Arc::clone(&subscribed.channel);
                let token = subscribed.token.clone();
                let identifier = command.identifier;
                let data = command.data.unwrap_or_else(|| "{}".to_string());
                self.tasks.spawn(async move {
                    let performed = tokio::select! {
                        _ = token.cancelled() => return,
                        performed = channel.perform(&data) => performed,
                    };
                    if let Err(e) = performed {
                        tracing::warn!(identifier = %identifier, error = %e, "Cable action failed");
                    }
                });
                Ok(())
            }
        }
    }

    /// Create the channel and start its stream task
    async fn subscribe(
        &mut self,
        identifier: &str,
        outbound: &mpsc::Sender<ServerMessage>,
        ended: &mpsc::UnboundedSender<String>,
    ) -> Result<()> {
        // An entry whose stream already ended is replaced
        if self
            .subscriptions
            .get(identifier)
            .is_some_and(|subscribed| !subscribed.token.is_cancelled())
        {
            return Err(Error::Identifier(format!("already subscribed to {identifier}")));
        }

        let channel = self.channels.create(identifier)?;
        let token = self.token.child_token();
        let subscription = CableSubscription::new(identifier, outbound.clone(), token.clone());
        let task = channel.subscribe(subscription).await?;

        let id = identifier.to_string();
        let ended = ended.clone();
        let stream_token = token.clone();
        self.tasks.spawn(async move {
            if let Err(e) = task.await {
                tracing::error!(identifier = %id, error = %e, "Cable stream failed");
            }
            stream_token.cancel();
            // Fails only once the connection loop is gone
            let _ = ended.send(id);
        });
        self.subscriptions
            .insert(identifier.to_string(), Subscribed { channel, token });
        tracing::debug!(identifier = %identifier, "Cable subscribed");
        Ok(())
    }

    /// Drop the entry of a subscription whose stream task has ended
    fn forget(&mut self, identifier: &str) {
        let finished = self
            .subscriptions
            .get(identifier)
            .is_some_and(|subscribed| subscribed.token.is_cancelled());
        if finished {
            self.subscriptions.remove(identifier);
            tracing::debug!(identifier = %identifier, "Cable stream ended");
        }
    }

    async fn close(&mut self) {
        self.token.cancel();
        self.subscriptions.clear();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

impl fmt::Debug for CableConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CableConnection")
            .field("ping_interval", &self.ping_interval)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

async fn write<O>(outgoing: &mut O, message: &ServerMessage) -> Result<()>
where
    O: Sink<String> + Unpin,
    O::Error: fmt::Display,
{
    outgoing.send(message.to_json()?).await.map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("couldn't write cable message: {e}"),
        ))
    })
}
