//! The per-connection session task.
//!
//! One task per [`Connection`] owns the socket: connect, drive the open
//! socket, settle the outcome, and either stop or sleep and retry.

use std::sync::Arc;

use tether_core::{Envelope, MessageKind};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionState, Inner};
use crate::events::ConnectionEvent;
use crate::heartbeat::Heartbeat;
use crate::reconnect::next_delay;
use crate::transport::{
    Frame, Transport, TransportError, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL,
};

/// How an open socket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    /// `disconnect()` was called.
    Cancelled,
    /// The peer closed with code 1000.
    PeerClosed,
    /// Anything else: abnormal close, stream end, I/O error, heartbeat miss.
    Lost,
}

struct Closure {
    end: End,
    code: Option<u16>,
    reason: String,
    /// Messages taken from the queue or channel but never written.
    unsent: Vec<String>,
}

impl Closure {
    fn lost(code: Option<u16>, reason: impl Into<String>, unsent: Vec<String>) -> Self {
        Self {
            end: End::Lost,
            code,
            reason: reason.into(),
            unsent,
        }
    }
}

enum Next {
    Stop,
    Retry(u32),
}

pub(crate) async fn run(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<(), TransportError>>,
) {
    let conn = Connection::from_inner(Arc::clone(&inner));
    let mut ready = Some(ready);
    let mut first = true;

    loop {
        if !first && !transition(&inner, &cancel, ConnectionState::Connecting) {
            return;
        }
        first = false;

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = inner.connector.connect(&inner.url, &inner.options.protocols) => result,
        };

        let next = match attempt {
            Ok(transport) => {
                let Some((backlog, mut rx)) = open(&inner, &cancel) else {
                    let mut transport = transport;
                    let _ = transport.close(CLOSE_NORMAL, "client disconnect").await;
                    return;
                };

                tracing::info!(connection = %inner.name, url = %inner.url, "Connected");
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
                conn.dispatch(ConnectionEvent::Connected {
                    connection: inner.name.clone(),
                });

                let closure = drive(&inner, &conn, transport, backlog, &mut rx, &cancel).await;
                let (code, reason, clean) = (
                    closure.code,
                    closure.reason.clone(),
                    closure.end != End::Lost,
                );
                let next = settle(&inner, &cancel, closure, Some(&mut rx));

                if clean {
                    tracing::info!(connection = %inner.name, ?code, reason = %reason, "Socket closed");
                } else {
                    tracing::warn!(connection = %inner.name, ?code, reason = %reason, "Connection lost");
                }
                conn.dispatch(ConnectionEvent::Disconnected {
                    connection: inner.name.clone(),
                    code,
                    reason,
                    clean,
                });
                next
            }
            Err(e) => {
                tracing::warn!(connection = %inner.name, url = %inner.url, error = %e, "Connect failed");
                let message = e.to_string();
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e));
                }
                conn.dispatch(ConnectionEvent::Error {
                    connection: inner.name.clone(),
                    message,
                });
                settle(&inner, &cancel, Closure::lost(None, "connect failed", Vec::new()), None)
            }
        };

        let attempt = match next {
            Next::Stop => return,
            Next::Retry(attempt) => attempt,
        };

        let max_attempts = inner.options.max_reconnect_attempts;
        let delay = next_delay(inner.options.reconnect_interval, attempt, &inner.options.backoff);
        tracing::info!(
            connection = %inner.name,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting",
        );
        conn.dispatch(ConnectionEvent::ReconnectAttempt {
            connection: inner.name.clone(),
            attempt,
            max_attempts,
        });

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

/// Set `state` unless the session has been cancelled.
fn transition(inner: &Inner, cancel: &CancellationToken, state: ConnectionState) -> bool {
    let mut link = inner.link.lock();
    if cancel.is_cancelled() {
        return false;
    }
    link.state = state;
    true
}

/// Mark the socket open: hand back the queued backlog and install the
/// outbound channel in one step so later sends land behind the backlog.
fn open(
    inner: &Inner,
    cancel: &CancellationToken,
) -> Option<(Vec<String>, mpsc::UnboundedReceiver<String>)> {
    let mut link = inner.link.lock();
    if cancel.is_cancelled() {
        return None;
    }
    let (tx, rx) = mpsc::unbounded_channel();
    link.state = ConnectionState::Connected;
    link.reconnect_attempts = 0;
    link.outbound = Some(tx);
    let backlog = link.queue.drain(..).collect();
    Some((backlog, rx))
}

/// Put unsent messages back at the front of the queue and decide whether to
/// reconnect.
fn settle(
    inner: &Inner,
    cancel: &CancellationToken,
    closure: Closure,
    rx: Option<&mut mpsc::UnboundedReceiver<String>>,
) -> Next {
    let mut link = inner.link.lock();

    link.outbound = None;
    let mut unsent = closure.unsent;
    if let Some(rx) = rx {
        rx.close();
        while let Ok(text) = rx.try_recv() {
            unsent.push(text);
        }
    }
    if !unsent.is_empty() {
        tracing::debug!(connection = %inner.name, count = unsent.len(), "Requeued unsent messages");
    }
    for text in unsent.into_iter().rev() {
        link.queue.push_front(text);
    }

    if cancel.is_cancelled() || closure.end == End::Cancelled {
        return Next::Stop;
    }
    if closure.end == End::PeerClosed {
        link.state = ConnectionState::Disconnected;
        return Next::Stop;
    }

    let max_attempts = inner.options.max_reconnect_attempts;
    if link.reconnect_attempts >= max_attempts {
        link.state = ConnectionState::Disconnected;
        tracing::warn!(
            connection = %inner.name,
            max_attempts,
            "Reconnect attempts exhausted",
        );
        return Next::Stop;
    }

    link.reconnect_attempts += 1;
    link.state = ConnectionState::Reconnecting;
    Next::Retry(link.reconnect_attempts)
}

/// Pump one open socket until it closes.
async fn drive(
    inner: &Inner,
    conn: &Connection,
    mut transport: Box<dyn Transport>,
    backlog: Vec<String>,
    rx: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> Closure {
    let mut backlog = backlog.into_iter();
    while let Some(text) = backlog.next() {
        if let Err(e) = transport.send_text(text.clone()).await {
            let mut unsent = vec![text];
            unsent.extend(backlog);
            return Closure::lost(None, e.to_string(), unsent);
        }
    }

    let mut heartbeat = Heartbeat::new(
        inner.options.heartbeat_interval,
        inner.options.heartbeat_timeout,
        Instant::now(),
    );

    loop {
        let ping_at = heartbeat.next_ping();
        let pong_deadline = heartbeat.pong_deadline();
        let ping_due = heartbeat.is_enabled() && !heartbeat.awaiting_pong();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = transport.close(CLOSE_NORMAL, "client disconnect").await;
                return Closure {
                    end: End::Cancelled,
                    code: Some(CLOSE_NORMAL),
                    reason: "client disconnect".into(),
                    unsent: Vec::new(),
                };
            }

            _ = sleep_until(pong_deadline.unwrap_or(ping_at)), if pong_deadline.is_some() => {
                tracing::warn!(connection = %inner.name, "Heartbeat timeout");
                conn.dispatch(ConnectionEvent::HeartbeatTimeout {
                    connection: inner.name.clone(),
                });
                let _ = transport.close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout").await;
                return Closure::lost(Some(CLOSE_HEARTBEAT_TIMEOUT), "heartbeat timeout", Vec::new());
            }

            _ = sleep_until(ping_at), if ping_due => {
                if let Ok(text) = Envelope::ping().to_wire() {
                    if let Err(e) = transport.send_text(text).await {
                        return Closure::lost(None, e.to_string(), Vec::new());
                    }
                }
                heartbeat.ping_sent(Instant::now());
                inner.link.lock().last_ping_at = Some(chrono::Utc::now());
                tracing::trace!(connection = %inner.name, "Ping sent");
            }

            Some(text) = rx.recv() => {
                if let Err(e) = transport.send_text(text.clone()).await {
                    return Closure::lost(None, e.to_string(), vec![text]);
                }
            }

            frame = transport.next_frame() => match frame {
                Some(Ok(Frame::Text(text))) => {
                    if let Err(e) = inbound(inner, conn, &mut heartbeat, transport.as_mut(), &text).await {
                        return Closure::lost(None, e.to_string(), Vec::new());
                    }
                }
                Some(Ok(Frame::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if let Err(e) = inbound(inner, conn, &mut heartbeat, transport.as_mut(), &text).await {
                            return Closure::lost(None, e.to_string(), Vec::new());
                        }
                    }
                    Err(_) => {
                        tracing::trace!(connection = %inner.name, "Ignoring non-UTF-8 binary frame");
                    }
                },
                Some(Ok(frame @ Frame::Close(_))) => {
                    let end = if frame.is_clean_close() { End::PeerClosed } else { End::Lost };
                    let (code, reason) = match frame {
                        Frame::Close(Some(info)) => (Some(info.code), info.reason),
                        _ => (None, String::new()),
                    };
                    return Closure {
                        end,
                        code,
                        reason,
                        unsent: Vec::new(),
                    };
                }
                Some(Err(e)) => {
                    conn.dispatch(ConnectionEvent::Error {
                        connection: inner.name.clone(),
                        message: e.to_string(),
                    });
                    return Closure::lost(None, e.to_string(), Vec::new());
                }
                None => return Closure::lost(None, "connection lost", Vec::new()),
            },
        }
    }
}

/// Handle one inbound text frame. Protocol messages (pong, ping, matched
/// ack) are consumed here; everything else becomes a message event.
async fn inbound(
    inner: &Inner,
    conn: &Connection,
    heartbeat: &mut Heartbeat,
    transport: &mut dyn Transport,
    text: &str,
) -> Result<(), TransportError> {
    let envelope = Envelope::from_wire(text);

    match &envelope.kind {
        Some(MessageKind::Pong) => {
            if let Some(rtt) = heartbeat.pong_received(Instant::now()) {
                inner.link.lock().latency = Some(rtt);
                tracing::trace!(connection = %inner.name, rtt_ms = rtt.as_millis() as u64, "Pong received");
            }
            return Ok(());
        }
        Some(MessageKind::Ping) => {
            if let Ok(reply) = Envelope::pong().to_wire() {
                transport.send_text(reply).await?;
            }
            return Ok(());
        }
        Some(MessageKind::Ack) => {
            if let Some(id) = &envelope.id {
                if inner.pending.resolve(id, envelope.clone()) {
                    return Ok(());
                }
                tracing::debug!(connection = %inner.name, id = %id, "Unmatched acknowledgment");
            }
        }
        _ => {}
    }

    conn.dispatch(ConnectionEvent::Message {
        connection: inner.name.clone(),
        envelope: envelope.clone(),
    });
    if let Some(kind) = envelope.kind.clone() {
        conn.dispatch(ConnectionEvent::Typed {
            connection: inner.name.clone(),
            kind,
            envelope,
        });
    }
    Ok(())
}
