//! Session state and the read/write pump tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{TransportError, TransportResult};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<u64>,
    #[serde(default)]
    app_props: Value,
    body: Value,
}

/// One message handed to a receiver. Carries enough context to respond.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub app_props: Value,
    pub body: Value,
    pub reply_to: Option<String>,
    pub correlation_id: Option<u64>,
}

struct SessionInner {
    id: Uuid,
    reply_address: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    receivers: DashMap<String, mpsc::UnboundedSender<Delivery>>,
    in_flight: DashMap<u64, oneshot::Sender<(Value, Value)>>,
    next_correlation: AtomicU64,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A point-to-point messaging session. Cheap to clone; all clones share the
/// connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// An addressed producer bound to one destination.
#[derive(Clone)]
pub struct Sender {
    session: Session,
    destination: String,
}

impl Sender {
    pub fn send(&self, body: Value, app_props: Value) -> TransportResult<()> {
        self.session.send_message(&self.destination, body, app_props)
    }

    pub async fn request(
        &self,
        body: Value,
        app_props: Value,
        timeout: Duration,
    ) -> TransportResult<(Value, Value)> {
        self.session
            .request(&self.destination, body, app_props, timeout)
            .await
    }
}

impl Session {
    /// Build a session over any byte stream and start its pump tasks.
    pub fn from_stream<S>(stream: S) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut framed_read = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut framed_write = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let inner = Arc::new(SessionInner {
            id: Uuid::new_v4(),
            reply_address: format!("reply/{}", Uuid::new_v4()),
            outbound: outbound_tx,
            receivers: DashMap::new(),
            in_flight: DashMap::new(),
            next_correlation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let bytes = match serde_json::to_vec(&envelope) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("dropping unserializable frame: {e}");
                        continue;
                    }
                };
                if framed_write.send(bytes.into()).await.is_err() {
                    break;
                }
            }
        });

        let read_inner = Arc::clone(&inner);
        let reader = tokio::spawn(async move {
            while let Some(frame) = framed_read.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("session read ended: {e}");
                        break;
                    }
                };
                let envelope: Envelope = match serde_json::from_slice(&frame) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("dropping undecodable frame: {e}");
                        continue;
                    }
                };
                read_inner.route(envelope);
            }
            read_inner.closed.store(true, Ordering::SeqCst);
        });

        inner.tasks.lock().extend([writer, reader]);
        Session { inner }
    }

    /// Connect a TCP session to a remote endpoint.
    pub async fn connect(addr: &str) -> TransportResult<Session> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        Ok(Session::from_stream(stream))
    }

    /// In-process loopback pair (tests, standalone wiring).
    pub fn pair() -> (Session, Session) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (Session::from_stream(a), Session::from_stream(b))
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// This session's dynamic reply address.
    pub fn reply_address(&self) -> &str {
        &self.inner.reply_address
    }

    /// Fire-and-forget send through the anonymous producer.
    pub fn send_message(
        &self,
        destination: &str,
        body: Value,
        app_props: Value,
    ) -> TransportResult<()> {
        self.post(Envelope {
            to: destination.to_string(),
            reply_to: None,
            correlation_id: None,
            app_props,
            body,
        })
    }

    /// Open an addressed producer once the session is sendable.
    pub async fn open_sender(&self, destination: &str) -> TransportResult<Sender> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(Sender {
            session: self.clone(),
            destination: destination.to_string(),
        })
    }

    /// Issue a request and await its correlated reply.
    ///
    /// On timeout the in-flight slot is cleared and the waiter fails with
    /// [`TransportError::Timeout`]; a late reply is dropped with a debug log.
    pub async fn request(
        &self,
        destination: &str,
        body: Value,
        app_props: Value,
        timeout: Duration,
    ) -> TransportResult<(Value, Value)> {
        let correlation_id = self.inner.next_correlation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.in_flight.insert(correlation_id, tx);

        let posted = self.post(Envelope {
            to: destination.to_string(),
            reply_to: Some(self.inner.reply_address.clone()),
            correlation_id: Some(correlation_id),
            app_props,
            body,
        });
        if let Err(e) = posted {
            self.inner.in_flight.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.inner.in_flight.remove(&correlation_id);
                Err(TransportError::Closed)
            }
            Err(_) => {
                self.inner.in_flight.remove(&correlation_id);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Open a receiver. A static receiver listens on the given address; a
    /// dynamic receiver is allocated an address, returned alongside the
    /// delivery stream (the "on address" notification).
    pub fn open_receiver(
        &self,
        address: Option<&str>,
    ) -> (String, mpsc::UnboundedReceiver<Delivery>) {
        let address = address
            .map(str::to_string)
            .unwrap_or_else(|| format!("dyn/{}", Uuid::new_v4()));
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.receivers.insert(address.clone(), tx);
        (address, rx)
    }

    /// Remove a receiver; messages to its address are dropped afterwards.
    pub fn close_receiver(&self, address: &str) {
        self.inner.receivers.remove(address);
    }

    /// Respond to a delivery that carried a reply context.
    pub fn respond(
        &self,
        delivery: &Delivery,
        body: Value,
        app_props: Value,
    ) -> TransportResult<()> {
        let reply_to = delivery
            .reply_to
            .as_ref()
            .ok_or_else(|| TransportError::Codec("delivery carries no reply address".into()))?;
        self.post(Envelope {
            to: reply_to.clone(),
            reply_to: None,
            correlation_id: delivery.correlation_id,
            app_props,
            body,
        })
    }

    /// Close the session and stop its pump tasks.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.receivers.clear();
        self.inner.in_flight.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn post(&self, envelope: Envelope) -> TransportResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.inner
            .outbound
            .send(envelope)
            .map_err(|_| TransportError::Closed)
    }
}

impl SessionInner {
    /// Route one inbound envelope: correlated replies resolve their waiter,
    /// everything else is handed to the receiver on the target address.
    fn route(&self, envelope: Envelope) {
        if envelope.to == self.reply_address {
            if let Some(correlation_id) = envelope.correlation_id {
                match self.in_flight.remove(&correlation_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send((envelope.app_props, envelope.body));
                    }
                    None => debug!(correlation_id, "late reply dropped"),
                }
                return;
            }
        }
        let delivery = Delivery {
            app_props: envelope.app_props,
            body: envelope.body,
            reply_to: envelope.reply_to,
            correlation_id: envelope.correlation_id,
        };
        match self.receivers.get(&envelope.to) {
            Some(receiver) => {
                if receiver.send(delivery).is_err() {
                    debug!(address = %envelope.to, "receiver gone; delivery dropped");
                }
            }
            None => debug!(address = %envelope.to, "no receiver; delivery dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_routes_to_static_receiver() {
        let (a, b) = Session::pair();
        let (_, mut rx) = b.open_receiver(Some("svc/echo"));

        a.send_message("svc/echo", json!({"n": 1}), Value::Null)
            .unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.body["n"], 1);
        assert!(delivery.reply_to.is_none());
    }

    #[tokio::test]
    async fn request_reply_correlates() {
        let (a, b) = Session::pair();
        let (_, mut rx) = b.open_receiver(Some("svc/echo"));

        let responder = b.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let body = json!({"echo": delivery.body});
                responder.respond(&delivery, body, Value::Null).unwrap();
            }
        });

        let (_, body) = a
            .request("svc/echo", json!({"n": 7}), Value::Null, DEFAULT_REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(body["echo"]["n"], 7);
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_independently() {
        let (a, b) = Session::pair();
        let (_, mut rx) = b.open_receiver(Some("svc/id"));

        let responder = b.clone();
        tokio::spawn(async move {
            // Reply in reverse arrival order to exercise correlation.
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            responder
                .respond(&second, second.body.clone(), Value::Null)
                .unwrap();
            responder
                .respond(&first, first.body.clone(), Value::Null)
                .unwrap();
        });

        let fut1 = a.request("svc/id", json!(1), Value::Null, DEFAULT_REQUEST_TIMEOUT);
        let fut2 = a.request("svc/id", json!(2), Value::Null, DEFAULT_REQUEST_TIMEOUT);
        let (r1, r2) = tokio::join!(fut1, fut2);
        assert_eq!(r1.unwrap().1, json!(1));
        assert_eq!(r2.unwrap().1, json!(2));
    }

    #[tokio::test]
    async fn timeout_clears_the_waiter() {
        let (a, _b) = Session::pair();
        let result = a
            .request(
                "svc/void",
                json!({}),
                Value::Null,
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(a.inner.in_flight.is_empty());
    }

    #[tokio::test]
    async fn dynamic_receiver_reports_its_address() {
        let (a, b) = Session::pair();
        let (address, mut rx) = b.open_receiver(None);
        assert!(address.starts_with("dyn/"));

        a.send_message(&address, json!("hi"), Value::Null).unwrap();
        assert_eq!(rx.recv().await.unwrap().body, json!("hi"));
    }

    #[tokio::test]
    async fn closed_session_refuses_sends() {
        let (a, _b) = Session::pair();
        a.close();
        assert!(matches!(
            a.send_message("x", Value::Null, Value::Null),
            Err(TransportError::Closed)
        ));
    }
}
