//! Live request contexts keyed by stream id, and the GOAWAY fence.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::{CancelToken, Cause};

/// A GOAWAY whose id is not a client-initiated bidirectional stream id, or
/// that raises a previously received limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InvalidGoaway {
    pub(crate) id: u64,
    pub(crate) previous: Option<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    contexts: HashMap<u64, CancelToken>,
    goaway: Option<u64>,
}

/// The only structure mutated by more than one task per connection. The
/// lock is never held across an await.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track `token` under `stream_id` until the returned guard drops.
    ///
    /// A stream opened at or above an already received GOAWAY id is canceled
    /// immediately.
    pub(crate) fn register(self: &Arc<Self>, stream_id: u64, token: CancelToken) -> Registration {
        let mut inner = self.inner.lock();
        if inner.goaway.is_some_and(|limit| stream_id >= limit) {
            token.cancel_with(Cause::Goaway);
        }
        inner.contexts.insert(stream_id, token);
        Registration {
            registry: Arc::clone(self),
            stream_id,
        }
    }

    pub(crate) fn goaway_received(&self) -> bool {
        self.inner.lock().goaway.is_some()
    }

    pub(crate) fn goaway_id(&self) -> Option<u64> {
        self.inner.lock().goaway
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    /// Validate a GOAWAY id and cancel every request at or above it.
    ///
    /// Returns how many requests this GOAWAY canceled.
    pub(crate) fn apply_goaway(&self, id: u64) -> Result<usize, InvalidGoaway> {
        let mut inner = self.inner.lock();
        let previous = inner.goaway;
        if id % 4 != 0 || previous.is_some_and(|last| id > last) {
            return Err(InvalidGoaway { id, previous });
        }
        inner.goaway = Some(id);
        let canceled = inner
            .contexts
            .iter()
            .filter(|(stream_id, _)| **stream_id >= id)
            .filter(|(_, token)| token.cancel_with(Cause::Goaway))
            .count();
        Ok(canceled)
    }
}

/// Removes its stream's context from the registry exactly once, on drop.
#[derive(Debug)]
pub(crate) struct Registration {
    registry: Arc<Registry>,
    stream_id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.inner.lock().contexts.remove(&self.stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(registry: &Arc<Registry>, ids: &[u64]) -> Vec<(CancelToken, Registration)> {
        ids.iter()
            .map(|&id| {
                let token = CancelToken::new();
                let registration = registry.register(id, token.clone());
                (token, registration)
            })
            .collect()
    }

    #[test]
    fn goaway_cancels_only_streams_at_or_above_id() {
        let registry = Registry::new();
        let live = tokens(&registry, &[0, 4, 8, 12]);

        assert_eq!(registry.apply_goaway(8), Ok(2));
        let causes: Vec<_> = live.iter().map(|(t, _)| t.cause()).collect();
        assert_eq!(
            causes,
            vec![None, None, Some(Cause::Goaway), Some(Cause::Goaway)]
        );
    }

    #[test]
    fn goaway_ids_must_not_increase() {
        let registry = Registry::new();
        assert_eq!(registry.apply_goaway(16), Ok(0));
        assert_eq!(registry.apply_goaway(16), Ok(0));
        assert_eq!(registry.apply_goaway(8), Ok(0));
        assert_eq!(
            registry.apply_goaway(12),
            Err(InvalidGoaway {
                id: 12,
                previous: Some(8)
            })
        );
        assert_eq!(registry.goaway_id(), Some(8));
    }

    #[test]
    fn goaway_id_must_be_client_bidi() {
        let registry = Registry::new();
        assert!(registry.apply_goaway(6).is_err());
        assert!(!registry.goaway_received());
    }

    #[test]
    fn already_canceled_requests_keep_their_cause() {
        let registry = Registry::new();
        let live = tokens(&registry, &[4]);
        live[0].0.cancel();
        assert_eq!(registry.apply_goaway(0), Ok(0));
        assert_eq!(live[0].0.cause(), Some(Cause::Canceled));
    }

    #[test]
    fn registration_after_goaway_is_canceled() {
        let registry = Registry::new();
        registry.apply_goaway(4).unwrap();
        let live = tokens(&registry, &[0, 4]);
        assert_eq!(live[0].0.cause(), None);
        assert_eq!(live[1].0.cause(), Some(Cause::Goaway));
    }

    #[test]
    fn dropping_registration_unregisters() {
        let registry = Registry::new();
        let live = tokens(&registry, &[0, 4]);
        assert_eq!(registry.len(), 2);
        drop(live);
        assert_eq!(registry.len(), 0);
    }
}
