//! Pattern-based dispatch of inbound messages.
//!
//! A [`Router`] threads each message through its middleware chain, then
//! hands it to the first route whose pattern matches the message tag. When
//! nothing matches, or the matching handler fails, the default handler runs.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tether_core::Envelope;

use crate::connection::Connection;
use crate::events::{catch_panic, ConnectionEvent, EventHandler};

pub type RouteHandler = Arc<dyn Fn(&Envelope, &Connection) -> anyhow::Result<()> + Send + Sync>;
pub type Middleware =
    Arc<dyn Fn(Envelope, &Connection) -> anyhow::Result<Envelope> + Send + Sync>;

/// What a route matches against.
#[derive(Clone)]
pub enum RoutePattern {
    /// The tag equals this string.
    Exact(String),
    /// The tag matches this expression.
    Regex(Regex),
    /// Every message, typed or not.
    Any,
}

impl RoutePattern {
    pub fn exact(tag: impl Into<String>) -> Self {
        RoutePattern::Exact(tag.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(RoutePattern::Regex(Regex::new(pattern)?))
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        match (self, envelope.tag()) {
            (RoutePattern::Any, _) => true,
            (RoutePattern::Exact(expected), Some(tag)) => expected == tag,
            (RoutePattern::Regex(re), Some(tag)) => re.is_match(tag),
            (_, None) => false,
        }
    }

    /// The pattern source, used to identify routes for removal.
    pub fn as_str(&self) -> &str {
        match self {
            RoutePattern::Exact(tag) => tag,
            RoutePattern::Regex(re) => re.as_str(),
            RoutePattern::Any => "*",
        }
    }
}

impl fmt::Debug for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutePattern::Exact(tag) => write!(f, "Exact({tag:?})"),
            RoutePattern::Regex(re) => write!(f, "Regex({:?})", re.as_str()),
            RoutePattern::Any => f.write_str("Any"),
        }
    }
}

impl From<&str> for RoutePattern {
    fn from(tag: &str) -> Self {
        RoutePattern::Exact(tag.to_string())
    }
}

impl From<Regex> for RoutePattern {
    fn from(re: Regex) -> Self {
        RoutePattern::Regex(re)
    }
}

/// Result of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A route handler ran successfully.
    Handled,
    /// The default handler ran, because nothing matched or the matching
    /// handler failed.
    Defaulted,
    /// A handler failed and no default handler caught it.
    Failed,
    /// Nothing matched and there is no default handler.
    Unhandled,
}

#[derive(Default)]
pub struct Router {
    routes: RwLock<Vec<(RoutePattern, RouteHandler)>>,
    middleware: RwLock<Vec<Middleware>>,
    default_handler: RwLock<Option<RouteHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route. Routes are tried in registration order.
    pub fn add_route<F>(&self, pattern: impl Into<RoutePattern>, handler: F)
    where
        F: Fn(&Envelope, &Connection) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.routes.write().push((pattern.into(), Arc::new(handler)));
    }

    /// Remove every route whose pattern source equals `pattern`. Returns how
    /// many were removed.
    pub fn remove_route(&self, pattern: &str) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|(p, _)| p.as_str() != pattern);
        before - routes.len()
    }

    pub fn use_middleware<F>(&self, middleware: F)
    where
        F: Fn(Envelope, &Connection) -> anyhow::Result<Envelope> + Send + Sync + 'static,
    {
        self.middleware.write().push(Arc::new(middleware));
    }

    pub fn set_default_handler<F>(&self, handler: F)
    where
        F: Fn(&Envelope, &Connection) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        *self.default_handler.write() = Some(Arc::new(handler));
    }

    pub fn clear_default_handler(&self) {
        *self.default_handler.write() = None;
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Dispatch one message.
    ///
    /// Middleware and handler failures (errors or panics) are logged per
    /// invocation and never propagate.
    pub fn route(&self, envelope: Envelope, conn: &Connection) -> RouteOutcome {
        let middleware: Vec<Middleware> = self.middleware.read().clone();
        let mut envelope = envelope;
        for (index, mw) in middleware.iter().enumerate() {
            let input = envelope.clone();
            match catch_panic(|| mw(input, conn)) {
                Ok(Ok(transformed)) => envelope = transformed,
                Ok(Err(e)) => {
                    tracing::warn!(connection = %conn.name(), index, error = %e, "Middleware failed");
                }
                Err(panic) => {
                    tracing::error!(connection = %conn.name(), index, panic = %panic, "Middleware panicked");
                }
            }
        }

        let handler = self
            .routes
            .read()
            .iter()
            .find(|(pattern, _)| pattern.matches(&envelope))
            .map(|(pattern, handler)| (pattern.as_str().to_string(), Arc::clone(handler)));

        let default = self.default_handler.read().clone();

        let fell_through = match handler {
            Some((pattern, handler)) => match invoke(&handler, &envelope, conn) {
                Ok(()) => return RouteOutcome::Handled,
                Err(reason) => {
                    tracing::warn!(
                        connection = %conn.name(),
                        pattern = %pattern,
                        error = %reason,
                        "Route handler failed",
                    );
                    true
                }
            },
            None => false,
        };

        match default {
            Some(default) => match invoke(&default, &envelope, conn) {
                Ok(()) => RouteOutcome::Defaulted,
                Err(reason) => {
                    tracing::warn!(connection = %conn.name(), error = %reason, "Default handler failed");
                    RouteOutcome::Failed
                }
            },
            None if fell_through => RouteOutcome::Failed,
            None => {
                tracing::debug!(connection = %conn.name(), tag = ?envelope.tag(), "No route matched");
                RouteOutcome::Unhandled
            }
        }
    }

    /// Route every `Message` event of `conn` through this router.
    pub fn attach(self: &Arc<Self>, conn: &Connection) {
        conn.add_handler(crate::events::EventKind::Message, self.event_handler());
    }

    /// An event handler that routes `Message` events; suitable for
    /// [`Registry::add_global_handler`](crate::Registry::add_global_handler).
    pub fn event_handler(self: &Arc<Self>) -> EventHandler {
        let router = Arc::clone(self);
        Arc::new(move |event: &ConnectionEvent, conn: &Connection| {
            if let ConnectionEvent::Message { envelope, .. } = event {
                router.route(envelope.clone(), conn);
            }
        })
    }
}

fn invoke(handler: &RouteHandler, envelope: &Envelope, conn: &Connection) -> Result<(), String> {
    match catch_panic(|| handler(envelope, conn)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(panic) => Err(format!("panicked: {panic}")),
    }
}
