//! Group transport backends.
//!
//! The connection core consumes a [`Backend`] capability: broadcast an
//! ordered message, receive an event stream of messages and membership
//! views, leave the group. Backends guarantee total order of messages inside
//! a primary configuration and FIFO order per source otherwise. History
//! positions are not the transport's business; members agree on them through
//! the state exchange the connection core runs over the ordered stream.
//!
//! The built-in [`dummy`] backend is an in-process hub: every endpoint
//! created from one [`DummyHub`](dummy::DummyHub) belongs to the same group,
//! broadcasts loop back to all endpoints in a single total order, and tests
//! can inject non-primary configurations, partitions, and backend failures.
//! A standalone `dummy://` URL yields a single-member group that is
//! immediately primary.
//!
//! Real network backends register a factory in a [`BackendRegistry`]; the
//! registry is an ordinary value, not process-wide state.

pub mod dummy;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use starling_types::{MemberId, View};
use thiserror::Error;

/// Errors from the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("backend is closed")]
    Closed,
    #[error("malformed backend url '{0}', expected type://address")]
    BadUrl(String),
    #[error("unsupported backend type '{0}'")]
    Unsupported(String),
    #[error("fatal backend failure: {0}")]
    Fatal(String),
}

/// Events delivered by a backend, in order, on a single stream.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An ordered message from a group member (possibly ourselves).
    Message { source: MemberId, bytes: Vec<u8> },
    /// A new membership view was installed.
    View(View),
    /// The backend failed irrecoverably; no further events follow.
    Failed { reason: String },
}

/// The group transport capability consumed by a connection.
///
/// Implementations must be usable from multiple threads: application
/// threads broadcast while the delivery thread drains the event stream.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Broadcast one ordered message to the group, ourselves included.
    fn broadcast(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// The event stream. Disconnects after `close`.
    fn events(&self) -> Receiver<TransportEvent>;

    /// Leave the group and end the event stream.
    fn close(&self);
}

/// A parsed `type://address` backend URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendUrl {
    pub scheme: String,
    pub address: String,
}

impl BackendUrl {
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let (scheme, address) = url
            .split_once("://")
            .ok_or_else(|| TransportError::BadUrl(url.to_string()))?;
        if scheme.is_empty() {
            return Err(TransportError::BadUrl(url.to_string()));
        }
        Ok(BackendUrl {
            scheme: scheme.to_string(),
            address: address.to_string(),
        })
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}

/// Constructor for a backend from a URL and the local member id.
pub type BackendFactory =
    Arc<dyn Fn(&BackendUrl, &MemberId) -> Result<Box<dyn Backend>, TransportError> + Send + Sync>;

/// Maps backend URL schemes to factories.
///
/// `with_defaults` knows the in-process `dummy` backend; network backends
/// (`gcomm`, legacy `spread`) live in external crates and are registered by
/// the embedding application. Connecting through an unregistered scheme
/// fails, which is how unknown URL types fail `create`.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("dummy", |_url, my_id| {
            let hub = dummy::DummyHub::new();
            Ok(Box::new(hub.endpoint(my_id.clone())?) as Box<dyn Backend>)
        });
        registry
    }

    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&BackendUrl, &MemberId) -> Result<Box<dyn Backend>, TransportError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(scheme.to_string(), Arc::new(factory));
    }

    /// Whether a factory is registered for `scheme`.
    pub fn supports(&self, scheme: &str) -> bool {
        self.factories.contains_key(scheme)
    }

    pub fn connect(&self, url: &str, my_id: &MemberId) -> Result<Box<dyn Backend>, TransportError> {
        let url = BackendUrl::parse(url)?;
        self.connect_url(&url, my_id)
    }

    pub fn connect_url(
        &self,
        url: &BackendUrl,
        my_id: &MemberId,
    ) -> Result<Box<dyn Backend>, TransportError> {
        let factory = self
            .factories
            .get(&url.scheme)
            .ok_or_else(|| TransportError::Unsupported(url.scheme.clone()))?;
        factory(url, my_id)
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("schemes", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> MemberId {
        MemberId::new(name).unwrap()
    }

    #[test]
    fn url_parsing() {
        let url = BackendUrl::parse("dummy://whatever").unwrap();
        assert_eq!(url.scheme, "dummy");
        assert_eq!(url.address, "whatever");
        assert_eq!(url.to_string(), "dummy://whatever");

        assert!(BackendUrl::parse("no-scheme").is_err());
        assert!(BackendUrl::parse("://addr").is_err());
    }

    #[test]
    fn registry_rejects_unknown_schemes() {
        let registry = BackendRegistry::with_defaults();
        let err = registry
            .connect("carrier-pigeon://coop", &member("a"))
            .unwrap_err();
        assert_eq!(err, TransportError::Unsupported("carrier-pigeon".into()));
    }

    #[test]
    fn registry_connects_dummy() {
        let registry = BackendRegistry::with_defaults();
        let backend = registry.connect("dummy://", &member("solo")).unwrap();
        // A standalone dummy group is immediately primary with one member.
        let event = backend.events().recv().unwrap();
        match event {
            TransportEvent::View(view) => {
                assert!(view.primary);
                assert_eq!(view.members.len(), 1);
                assert_eq!(view.my_idx, 0);
            }
            other => panic!("expected a view, got {other:?}"),
        }
        backend.close();
    }
}
