use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{ActuatorCall, ActuatorReply, MessageId, RpcTcp, WireError, WireErrorCode, WireMessage};

pub type HandlerFn<T, S, R> =
    dyn Fn(T, MessageId, &S) -> Pin<Box<dyn Future<Output = R> + Send>> + Send + Sync;

type ActuateHandler<S> = Arc<HandlerFn<ActuatorCall, S, Result<ActuatorReply, WireError>>>;
type ActuateFuture = Pin<Box<dyn Future<Output = Result<ActuatorReply, WireError>> + Send>>;
type PingHandler<S> = Arc<HandlerFn<(), S, WireMessage>>;

/// RPC server for actuator calls. Each connection is served on its own task,
/// and each call on a connection runs concurrently with the others.
pub struct Server<S> {
    listener: TcpListener,
    buffer_size: usize,
    state: Arc<S>,
    handlers: ServerHandlers<S>,
}

struct ServerHandlers<S> {
    on_ping: Option<PingHandler<S>>,
    on_actuate: Option<ActuateHandler<S>>,
}

impl<S> Clone for ServerHandlers<S> {
    fn clone(&self) -> Self {
        Self {
            on_ping: self.on_ping.clone(),
            on_actuate: self.on_actuate.clone(),
        }
    }
}

impl<S> Server<S>
where
    S: Send + Sync + 'static,
{
    pub fn new(listener: TcpListener, state: S) -> Self {
        Self {
            listener,
            buffer_size: 1024,
            state: Arc::new(state),
            handlers: ServerHandlers {
                on_ping: None,
                on_actuate: None,
            },
        }
    }

    pub fn with_buffer(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn on_ping<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(MessageId, &S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WireMessage> + Send + 'static,
    {
        self.handlers.on_ping = Some(Arc::new(
            move |_, msg_id, state: &S| -> Pin<Box<dyn Future<Output = WireMessage> + Send>> {
                Box::pin(handler(msg_id, state))
            },
        ));
        self
    }

    pub fn on_actuate<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ActuatorCall, MessageId, &S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActuatorReply, WireError>> + Send + 'static,
    {
        self.handlers.on_actuate = Some(Arc::new(move |call, msg_id, state: &S| -> ActuateFuture {
            Box::pin(handler(call, msg_id, state))
        }));
        self
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    async fn handle_connection(
        handlers: ServerHandlers<S>,
        state: Arc<S>,
        stream: TcpStream,
        buffer_size: usize,
        cancel: CancellationToken,
    ) {
        let mut rpc = RpcTcp::new(stream, buffer_size);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rpc.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        tracing::debug!("connection closed");
                        break;
                    }
                },
            };

            let msg_id = frame.msg_id;

            match frame.payload {
                WireMessage::Ping => {
                    let response = match &handlers.on_ping {
                        Some(handler) => handler((), msg_id, state.as_ref()).await,
                        None => WireMessage::Pong,
                    };
                    let _ = rpc.reply(msg_id, response).await;
                }
                WireMessage::Actuate(call) => {
                    let Some(handler) = &handlers.on_actuate else {
                        tracing::warn!(device_id = %call.target.device_id, "actuate call but no handler registered");
                        let _ = rpc
                            .reply(
                                msg_id,
                                WireMessage::Error(WireError {
                                    code: WireErrorCode::Unsupported,
                                    message: "actuation is not supported".into(),
                                }),
                            )
                            .await;
                        continue;
                    };

                    let fut = handler(call, msg_id, state.as_ref());
                    let replier = rpc.replier();
                    tokio::spawn(async move {
                        let response = match fut.await {
                            Ok(reply) => WireMessage::ActuatorReply(reply),
                            Err(err) => WireMessage::Error(err),
                        };
                        if let Err(e) = replier.reply(msg_id, response).await {
                            tracing::warn!(error = %e, "failed to send actuator reply");
                        }
                    });
                }
                WireMessage::Pong | WireMessage::ActuatorReply(_) => {
                    tracing::debug!("unsolicited reply on server connection");
                }
                WireMessage::Error(err) => {
                    tracing::warn!(?err, "received error");
                }
            }
        }
    }

    /// Accept connections until `cancel` fires or the listener fails.
    pub async fn serve(&self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "rpc connection accepted");
                    let handlers = self.handlers.clone();
                    let state = self.state.clone();
                    let buffer_size = self.buffer_size;
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        Self::handle_connection(handlers, state, stream, buffer_size, cancel)
                            .await;
                    });
                }
                Err(e) => {
                    tracing::error!(error = ?e, "error accepting connection");
                    break;
                }
            }
        }
    }
}
