use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader, BufWriter},
    sync::{mpsc, oneshot},
};

use crate::{Frame, FrameError, MessageId, WireMessage, read_frame, write_frame};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("send error: {0}")]
    SendError(#[source] Box<mpsc::error::SendError<Frame>>),
    #[error("response channel closed: {0}")]
    ChannelClosed(#[from] oneshot::error::RecvError),
    #[error("timeout: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("connection closed")]
    Closed,
}

impl From<mpsc::error::SendError<Frame>> for RpcError {
    fn from(err: mpsc::error::SendError<Frame>) -> Self {
        RpcError::SendError(Box::new(err))
    }
}

type Pending = Arc<DashMap<MessageId, oneshot::Sender<Frame>>>;

/// A framed, multiplexed RPC connection. Calls are matched to replies by
/// message id, so many calls may be in flight on one stream.
pub struct RpcTcp {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
    pending: Pending,
    closed: Arc<AtomicBool>,
}

/// Cloneable handle for answering calls from tasks other than the reader.
#[derive(Clone)]
pub struct Replier {
    tx: mpsc::Sender<Frame>,
}

impl Replier {
    pub async fn reply(
        &self,
        request_msg_id: MessageId,
        payload: WireMessage,
    ) -> Result<MessageId, RpcError> {
        let msg_id = MessageId::new();
        let frame = Frame {
            msg_id,
            reply_to: Some(request_msg_id),
            payload,
        };

        self.tx.send(frame).await?;

        Ok(msg_id)
    }
}

impl RpcTcp {
    pub fn new<S>(stream: S, buffer: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let (tx_out, mut rx_out) = mpsc::channel::<Frame>(buffer);
        let (tx_in, rx_in) = mpsc::channel::<Frame>(buffer);

        let pending: Pending = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx_out.recv().await {
                if let Err(e) = write_frame(&mut writer, &msg).await {
                    tracing::error!(error = %e, "rpc writer error");
                    break;
                }
                tracing::debug!(msg_id = ?msg.msg_id, "wrote frame");
            }
            writer_closed.store(true, Ordering::Release);
        });

        let pending_clone = pending.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let msg: Frame = match read_frame(&mut reader).await {
                    Ok(m) => m,
                    Err(FrameError::ConnectionClosed) => {
                        tracing::debug!("rpc peer closed connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "rpc reader error");
                        break;
                    }
                };

                tracing::debug!(msg_id = ?msg.msg_id, reply_to = ?msg.reply_to, "read frame");

                if let Some(reply_to) = msg.reply_to {
                    if let Some((_, tx)) = pending_clone.remove(&reply_to) {
                        let _ = tx.send(msg);
                        continue;
                    }
                    tracing::warn!(?reply_to, "no waiter found for reply");
                    continue;
                }

                if tx_in.send(msg).await.is_err() {
                    break;
                }
            }

            // Dropping the senders wakes every waiter with `ChannelClosed`.
            reader_closed.store(true, Ordering::Release);
            pending_clone.clear();
        });

        Self {
            tx: tx_out,
            rx: rx_in,
            pending,
            closed,
        }
    }

    /// True once either direction of the connection has shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    pub fn replier(&self) -> Replier {
        Replier {
            tx: self.tx.clone(),
        }
    }

    pub async fn send(&self, payload: WireMessage) -> Result<MessageId, RpcError> {
        let msg_id = MessageId::new();
        let frame = Frame {
            msg_id,
            reply_to: None,
            payload,
        };

        self.tx.send(frame).await?;

        Ok(msg_id)
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub async fn call(&self, payload: WireMessage, timeout: Duration) -> Result<Frame, RpcError> {
        let msg_id = MessageId::new();
        let (tx_wait, rx_wait) = oneshot::channel();

        self.pending.insert(msg_id, tx_wait);

        // The reader may have exited and cleared the table before the insert.
        if self.is_closed() {
            self.pending.remove(&msg_id);
            return Err(RpcError::Closed);
        }

        let frame = Frame {
            msg_id,
            reply_to: None,
            payload,
        };

        if let Err(e) = self.tx.send(frame).await {
            self.pending.remove(&msg_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx_wait).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(closed)) => Err(RpcError::ChannelClosed(closed)),
            Err(elapsed) => {
                self.pending.remove(&msg_id);
                Err(RpcError::Timeout(elapsed))
            }
        }
    }

    pub async fn reply(
        &self,
        request_msg_id: MessageId,
        payload: WireMessage,
    ) -> Result<MessageId, RpcError> {
        self.replier().reply(request_msg_id, payload).await
    }
}
