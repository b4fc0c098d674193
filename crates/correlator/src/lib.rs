//! Request/response matching on top of the fire-and-forget UDP transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use protocol::{encode_request, ProtocolError, ReplyBody, CORRELATION_ID_CEILING};
use types::Endpoint;
use udp_transport::{HandlerId, Transport, TransportError};

/// Upper bound (exclusive) for the random counter seed.
const RESEED_SPAN: u64 = 1_000;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("device rejected {method}: {message}")]
    Device {
        method: String,
        code: Option<i64>,
        message: String,
    },
    #[error("protocol error in {method} reply: {message}")]
    Protocol { method: String, message: String },
    #[error("request encoding failed: {0}")]
    Encode(#[from] ProtocolError),
    #[error("no free correlation identifier")]
    IdsExhausted,
}

impl RequestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Timeout { .. })
    }
}

/// An in-flight request as tracked by the correlator.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub created_at: Instant,
}

#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Transport,
    ids: Mutex<RequestIds>,
}

impl Correlator {
    pub fn new(transport: Transport) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                ids: Mutex::new(RequestIds::seeded()),
            }),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Sends `method` and waits for the reply carrying the same identifier.
    ///
    /// With an addressed `target` the request is unicast, otherwise broadcast.
    /// A target's source tag also has to match the reply's `src`.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        target: Option<&Endpoint>,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let transport = &self.inner.transport;
        let id = self.inner.ids().allocate(method)?;
        let mut pending = PendingGuard {
            inner: &self.inner,
            id,
            handler: None,
        };

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let expected_src = target
            .map(|endpoint| endpoint.source_tag.clone())
            .filter(|tag| !tag.is_empty());
        pending.handler = Some(transport.on(move |frame, _| {
            if frame.id != Some(id) {
                return;
            }
            if let Some(src) = &expected_src {
                if &frame.src != src {
                    return;
                }
            }
            if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(frame.body.clone());
            }
        }));

        let payload = encode_request(id, method, &params)?;
        let device_port = transport.config().device_port;
        match target.and_then(|endpoint| endpoint.socket_addr(device_port)) {
            Some(addr) => transport.send_to(&payload, addr).await?,
            None => transport.broadcast(&payload, None).await?,
        }
        metrics::counter!("correlator_requests_total").increment(1);
        debug!(id, method, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => interpret(method, body),
            // The handler was dropped unanswered: the transport was torn down.
            Ok(Err(_)) => Err(RequestError::Transport(TransportError::NotConnected)),
            Err(_) => {
                metrics::counter!("correlator_timeouts_total").increment(1);
                let timeout_ms = timeout.as_millis() as u64;
                warn!(id, method, timeout_ms, "request timed out");
                Err(RequestError::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.ids().pending.len()
    }

    pub fn pending(&self) -> Vec<PendingRequest> {
        self.inner.ids().pending.values().cloned().collect()
    }
}

impl Inner {
    fn ids(&self) -> std::sync::MutexGuard<'_, RequestIds> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn interpret(method: &str, body: ReplyBody) -> Result<Value, RequestError> {
    match body {
        ReplyBody::Result(value) => Ok(value),
        ReplyBody::Error { code, message } => Err(RequestError::Device {
            method: method.to_string(),
            code,
            message,
        }),
        ReplyBody::Empty => Err(RequestError::Protocol {
            method: method.to_string(),
            message: "unexpected reply shape".to_string(),
        }),
    }
}

/// Releases the identifier and the reply handler however the request ends.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
    handler: Option<HandlerId>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            self.inner.transport.off(handler);
        }
        self.inner.ids().pending.remove(&self.id);
    }
}

/// Identifier source: a counter below [`CORRELATION_ID_CEILING`] that reseeds
/// randomly on wrap and never hands out an identifier still pending.
struct RequestIds {
    next: u64,
    pending: HashMap<u64, PendingRequest>,
}

impl RequestIds {
    fn seeded() -> Self {
        Self {
            next: random_seed(),
            pending: HashMap::new(),
        }
    }

    fn allocate(&mut self, method: &str) -> Result<u64, RequestError> {
        for _ in 0..CORRELATION_ID_CEILING {
            if self.next == 0 || self.next >= CORRELATION_ID_CEILING {
                self.next = random_seed();
            }
            let candidate = self.next;
            self.next += 1;
            if self.pending.contains_key(&candidate) {
                continue;
            }
            self.pending.insert(
                candidate,
                PendingRequest {
                    id: candidate,
                    method: method.to_string(),
                    created_at: Instant::now(),
                },
            );
            return Ok(candidate);
        }
        Err(RequestError::IdsExhausted)
    }
}

fn random_seed() -> u64 {
    rand::thread_rng().gen_range(1..RESEED_SPAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_wraps_below_ceiling() {
        let mut ids = RequestIds {
            next: CORRELATION_ID_CEILING - 1,
            pending: HashMap::new(),
        };
        assert_eq!(ids.allocate("a").unwrap(), CORRELATION_ID_CEILING - 1);
        let wrapped = ids.allocate("b").unwrap();
        assert!(wrapped >= 1 && wrapped < RESEED_SPAN);
    }

    #[test]
    fn pending_identifiers_are_skipped() {
        let mut ids = RequestIds {
            next: 10,
            pending: HashMap::new(),
        };
        assert_eq!(ids.allocate("a").unwrap(), 10);
        ids.next = 10;
        assert_eq!(ids.allocate("b").unwrap(), 11);
        ids.pending.remove(&10);
        ids.next = 10;
        assert_eq!(ids.allocate("c").unwrap(), 10);
    }
}
