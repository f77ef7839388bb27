//! One physical connection, demultiplexed into logical channels
//!
//! The session owns a single read loop: every received envelope is routed
//! to the dispatcher bound to its logical channel, creating one on first
//! sight. Envelopes are handled strictly in arrival order across all
//! channels of the connection; a slow dispatcher transition therefore
//! blocks the whole connection, which is an accepted bottleneck.

use crate::{
    errors::{DispatchError, ProtocolError},
    protocol::{
        codec::{FrameDecoder, FrameEncoder},
        Message,
    },
};
use async_trait::async_trait;
use rmpv::Value;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Reply-emitting handle bound to one logical channel's outgoing
/// direction. Cheap to clone; all clones share the connection's encoder.
#[derive(Clone)]
pub struct Downstream {
    channel: u64,
    sink: Arc<FrameEncoder>,
}

impl Downstream {
    pub fn new(sink: Arc<FrameEncoder>, channel: u64) -> Self {
        Downstream { channel, sink }
    }

    /// Send one reply envelope on this channel.
    pub async fn reply(&self, kind: u64, args: Vec<Value>) -> Result<(), ProtocolError> {
        self.sink
            .encode(&Message::new(self.channel, kind, args))
            .await
    }
}

/// Everything a per-channel handler needs, constructed once when the
/// channel opens and threaded through explicitly.
pub struct ChannelContext {
    /// `<connection id>.<channel>` tag for log lines
    pub id: String,
    pub downstream: Downstream,
    /// cancelled when the connection goes away
    pub token: CancellationToken,
}

/// The finite-state handler bound to one logical channel. Each `handle`
/// call consumes the current state and returns the next one; `None` or an
/// error terminates the channel.
#[async_trait]
pub trait Dispatcher: Send {
    async fn handle(
        self: Box<Self>,
        message: &Message,
    ) -> Result<Option<Box<dyn Dispatcher>>, DispatchError>;
}

/// Builds the initial dispatcher for a freshly opened channel. Injected
/// into the session so tests can substitute a double.
pub type DispatcherFactory = Arc<dyn Fn(ChannelContext) -> Box<dyn Dispatcher> + Send + Sync>;

/// Per-connection session state. Owned exclusively by the read loop, so
/// the channel table itself needs no locking.
pub struct ConnectionSession {
    conn_id: String,
    session: HashMap<u64, Box<dyn Dispatcher>>,
    highest_channel: u64,
    factory: DispatcherFactory,
    token: CancellationToken,
}

impl ConnectionSession {
    pub fn new(factory: DispatcherFactory) -> Self {
        ConnectionSession {
            conn_id: connection_id(),
            session: HashMap::new(),
            highest_channel: 0,
            factory,
            token: CancellationToken::new(),
        }
    }

    /// Drive the connection until either side closes it. Decode failures
    /// are fatal for the connection; dispatch failures only retire their
    /// own channel.
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // per-channel work inherits this token and dies with the connection
        let _guard = self.token.clone().drop_guard();

        let (reader, writer) = tokio::io::split(stream);
        let mut decoder = FrameDecoder::new(reader);
        let encoder = Arc::new(FrameEncoder::new(Box::new(writer)));

        loop {
            let message = match decoder.decode().await {
                Ok(message) => message,
                Err(ProtocolError::EndOfStream) => {
                    log::warn!("[{}] remote side has closed the connection", self.conn_id);
                    return;
                }
                Err(err) => {
                    log::error!(
                        "[{}] unable to decode protocol message, closing the connection: {}",
                        self.conn_id,
                        err
                    );
                    return;
                }
            };
            self.process(&encoder, &message).await;
        }
    }

    async fn process(&mut self, encoder: &Arc<FrameEncoder>, message: &Message) {
        let dispatcher = match self.session.remove(&message.channel) {
            Some(dispatcher) => dispatcher,
            None => {
                if message.channel < self.highest_channel {
                    log::error!(
                        "[{}] channel has been revoked: {} < {}",
                        self.conn_id,
                        message.channel,
                        self.highest_channel
                    );
                    return;
                }
                self.highest_channel = message.channel;
                (self.factory)(self.channel_context(encoder, message.channel))
            }
        };

        match dispatcher.handle(message).await {
            Ok(Some(next)) => {
                self.session.insert(message.channel, next);
            }
            Ok(None) => self.retire(message.channel),
            Err(err) => {
                log::error!(
                    "[{}.{}] handle returned an error: {}",
                    self.conn_id,
                    message.channel,
                    err
                );
                self.retire(message.channel);
            }
        }
    }

    /// A terminated channel id must never silently reopen: bump the
    /// high-water mark past it.
    fn retire(&mut self, channel: u64) {
        self.highest_channel = self.highest_channel.max(channel + 1);
    }

    fn channel_context(&self, encoder: &Arc<FrameEncoder>, channel: u64) -> ChannelContext {
        ChannelContext {
            id: format!("{}.{}", self.conn_id, channel),
            downstream: Downstream::new(encoder.clone(), channel),
            token: self.token.child_token(),
        }
    }
}

fn connection_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!("{}.{}", now, rand::random::<u64>())
}
