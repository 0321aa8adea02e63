//! Inbound session acceptance.

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::session::Session;
use crate::TransportResult;

/// Accepts inbound connections and wraps each in a [`Session`].
pub struct SessionListener {
    local_addr: std::net::SocketAddr,
    incoming: mpsc::UnboundedReceiver<Session>,
}

impl SessionListener {
    /// Bind and start accepting.
    pub async fn bind(addr: &str) -> TransportResult<SessionListener> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "transport listening");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "inbound session");
                        if tx.send(Session::from_stream(stream)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("accept failed: {e}");
                    }
                }
            }
        });

        Ok(SessionListener {
            local_addr,
            incoming: rx,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Next inbound session; None when the listener task has stopped.
    pub async fn accept(&mut self) -> Option<Session> {
        self.incoming.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn tcp_round_trip() {
        let mut listener = SessionListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();

        let client = Session::connect(&addr).await.unwrap();
        let server = listener.accept().await.unwrap();
        let (_, mut rx) = server.open_receiver(Some("svc/ping"));

        client
            .send_message("svc/ping", json!({"ping": true}), Value::Null)
            .unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.body["ping"], true);
    }
}
