use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ClientMessage, NotifyError};
use crate::model::PaymentId;

pub type ClientSink = Pin<Box<dyn Sink<String, Error = NotifyError> + Send>>;
pub type ClientStream = Pin<Box<dyn Stream<Item = Result<String, NotifyError>> + Send>>;

/// Lifecycle of a subscriber connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One client connection waiting on one payment.
pub struct Subscriber {
    payment_id: PaymentId,
    session_id: String,
    state: Mutex<SubscriberState>,
    /// Serializes writes on the transport.
    sink: tokio::sync::Mutex<ClientSink>,
    last_seen: Mutex<Instant>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Subscriber {
    pub(super) fn new(payment_id: PaymentId, sink: ClientSink, cancel: CancellationToken) -> Self {
        Self {
            payment_id,
            session_id: format!("sess_{}", uuid::Uuid::new_v4().simple()),
            state: Mutex::new(SubscriberState::Connecting),
            sink: tokio::sync::Mutex::new(sink),
            last_seen: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn payment_id(&self) -> &str {
        &self.payment_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.lock()
    }

    pub(super) fn set_state(&self, state: SubscriberState) {
        *self.state.lock() = state;
    }

    pub async fn send(&self, message: &ClientMessage) -> Result<(), NotifyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NotifyError::Closed);
        }
        self.sink
            .lock()
            .await
            .send(message.to_json())
            .await
            .map_err(|e| NotifyError::SendFailed(e.to_string()))
    }

    /// Record liveness from the peer.
    pub(super) fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub(super) fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen().elapsed()
    }

    /// Claim the close. Only the first caller gets `true`.
    pub(super) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(super) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(super) async fn shutdown_transport(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("payment_id", &self.payment_id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}
