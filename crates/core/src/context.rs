//! Typed request context passed to every storage operation.

use tokio_util::sync::CancellationToken;

/// Carries the effective namespace of a request and its cancellation signal.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub namespace: Option<String>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), cancel: CancellationToken::new() }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Namespace if set and non-empty.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    /// Context for a sub-operation, cancelled together with this one.
    pub fn child(&self) -> Self {
        Self { namespace: self.namespace.clone(), cancel: self.cancel.child_token() }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
