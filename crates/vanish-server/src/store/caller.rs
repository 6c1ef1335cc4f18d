use tokio::sync::oneshot::{self, error::TryRecvError};

/// Tells a store write whether whoever asked for it is still waiting.
///
/// Checked right before commit. If the caller has gone the transaction is
/// aborted, so a secret is never burned (or minted) with nobody to receive it.
#[derive(Debug)]
pub struct Caller(Option<oneshot::Receiver<()>>);

/// Held by the requesting side. Dropping it marks the [`Caller`] as gone.
#[must_use = "the caller counts as gone once this is dropped"]
#[derive(Debug)]
pub struct Waiting {
    _alive: oneshot::Sender<()>,
}

impl Caller {
    /// Tied to the returned [`Waiting`] handle.
    pub fn attached() -> (Self, Waiting) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(rx)), Waiting { _alive: tx })
    }

    /// Never goes away. For background work and direct store use.
    pub fn detached() -> Self {
        Self(None)
    }

    pub fn is_gone(&mut self) -> bool {
        match &mut self.0 {
            None => false,
            Some(rx) => matches!(rx.try_recv(), Err(TryRecvError::Closed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gone_once_handle_dropped() {
        let (mut caller, waiting) = Caller::attached();
        assert!(!caller.is_gone());
        drop(waiting);
        assert!(caller.is_gone());
        assert!(!Caller::detached().is_gone());
    }
}
