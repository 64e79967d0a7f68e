//! Immutable, derivable, cancellable context carrier.
//!
//! A [`Context`] is a chain of reference-counted nodes. Every derivation
//! (`with_cancel`, `with_deadline`, attaching a value) allocates a new node
//! pointing at its parent; no node is ever mutated after construction, so a
//! context can be cloned and shared across tasks without locking.
//!
//! Cancellation follows the chain downwards: cancelling a scope cancels every
//! context derived from it, while cancelling a child leaves its parent alone.
//! Deadlines only ever tighten as the chain grows.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::keys::ScopeKey;

/// Reason a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The context, or one of its ancestors, was cancelled.
    #[error("context cancelled")]
    Cancelled,
    /// The context's deadline has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Opaque value stored under a [`ScopeKey`].
pub(crate) type ScopedValue = Arc<dyn Any + Send + Sync>;

struct Node {
    parent: Option<Context>,
    entry: Option<(ScopeKey, ScopedValue)>,
    token: CancellationToken,
    deadline: Option<Instant>,
}

/// Request- and connection-scoped carrier of cancellation, deadline, and
/// metadata.
///
/// Cloning is cheap (one `Arc` increment) and yields a handle to the same
/// node. Metadata is read through the typed accessors in
/// [`metadata`](crate::metadata).
#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

impl Context {
    /// Returns an empty root context that is never cancelled and has no
    /// deadline.
    #[must_use]
    pub fn background() -> Self {
        Self {
            node: Arc::new(Node {
                parent: None,
                entry: None,
                token: CancellationToken::new(),
                deadline: None,
            }),
        }
    }

    /// Derives a child with its own cancellation scope.
    ///
    /// The returned [`CancelHandle`] cancels the child and everything derived
    /// from it. Cancelling `self` still cancels the child.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let token = self.node.token.child_token();
        let child = self.derive(None, token.clone(), self.node.deadline);
        (child, CancelHandle { token })
    }

    /// Derives a child that is done once `deadline` passes.
    ///
    /// A parent deadline that is earlier than `deadline` is kept.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> (Self, CancelHandle) {
        let effective = match self.node.deadline {
            Some(parent) if parent <= deadline => parent,
            _ => deadline,
        };
        let token = self.node.token.child_token();
        let child = self.derive(None, token.clone(), Some(effective));
        (child, CancelHandle { token })
    }

    /// Shorthand for [`with_deadline`](Self::with_deadline) relative to now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns the effective deadline of this context, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.node.deadline
    }

    /// Returns `true` once this context is cancelled or past its deadline.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Returns why this context is done, or `None` while it is still live.
    #[must_use]
    pub fn err(&self) -> Option<ContextError> {
        if self.node.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.node.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Checkpoint for long-running work.
    ///
    /// # Errors
    ///
    /// Returns the [`ContextError`] once the context is done.
    pub fn check(&self) -> Result<(), ContextError> {
        self.err().map_or(Ok(()), Err)
    }

    /// Completes once the context is cancelled or its deadline passes, and
    /// reports which of the two happened.
    pub async fn done(&self) -> ContextError {
        match self.node.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.node.token.cancelled() => ContextError::Cancelled,
                    () = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.node.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Attaches `value` under `key`, sharing this context's cancellation
    /// scope and deadline.
    pub(crate) fn with_value(&self, key: ScopeKey, value: ScopedValue) -> Self {
        self.derive(Some((key, value)), self.node.token.clone(), self.node.deadline)
    }

    /// Walks the chain towards the root and returns the nearest value stored
    /// under `key`.
    pub(crate) fn value(&self, key: ScopeKey) -> Option<&ScopedValue> {
        let mut current = self;
        loop {
            if let Some((k, v)) = &current.node.entry {
                if *k == key {
                    return Some(v);
                }
            }
            current = current.node.parent.as_ref()?;
        }
    }

    /// Typed view over [`value`](Self::value). A value of the wrong type reads
    /// as absent.
    pub(crate) fn value_ref<T: Any + Send + Sync>(&self, key: ScopeKey) -> Option<&T> {
        self.value(key).and_then(|v| (**v).downcast_ref::<T>())
    }

    /// Returns `true` when both handles point at the same node.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    fn derive(
        &self,
        entry: Option<(ScopeKey, ScopedValue)>,
        token: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            node: Arc::new(Node {
                parent: Some(self.clone()),
                entry,
                token,
                deadline,
            }),
        }
    }

    fn keys(&self) -> Vec<ScopeKey> {
        let mut keys = Vec::new();
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let Some((k, _)) = &ctx.node.entry {
                keys.push(*k);
            }
            current = ctx.node.parent.as_ref();
        }
        keys
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("keys", &self.keys())
            .field("deadline", &self.node.deadline)
            .field("err", &self.err())
            .finish()
    }
}

/// Cancels the scope created by [`Context::with_cancel`] or
/// [`Context::with_deadline`].
///
/// Held only by the code that created the scope; contexts handed to handlers
/// cannot cancel themselves.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Cancels the scope and every context derived from it. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the scope has been cancelled, either directly or
    /// through an ancestor.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
