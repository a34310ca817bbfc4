//! Cooperative cancellation.
//!
//! An [`InterruptFlag`] is shared between the session worker, the connection
//! registry and the session handle. Any of them may raise it; only the worker
//! reads it, at step boundaries. The flag never lowers once raised and keeps
//! the reason it was first raised with.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;

/// Why a session was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InterruptReason {
    /// The owning connection went away.
    Disconnected,
    /// A newer command on the same connection replaced this session.
    Superseded,
    /// Explicit interrupt from an operator or the handle owner.
    Requested,
    /// The event stream was dropped while the worker was still producing.
    ConsumerGone,
    /// The manager is shutting down.
    Shutdown,
}

#[derive(Debug, Default)]
struct FlagState {
    reason: OnceLock<InterruptReason>,
    token: CancellationToken,
}

/// Irreversible, thread-safe cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    inner: Arc<FlagState>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Returns `true` only for the call that actually raised it.
    pub fn raise(&self, reason: InterruptReason) -> bool {
        let first = self.inner.reason.set(reason).is_ok();
        if first {
            self.inner.token.cancel();
        }
        first
    }

    pub fn is_raised(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    /// The reason of the first `raise`, if any.
    pub fn reason(&self) -> Option<InterruptReason> {
        self.inner.reason.get().copied()
    }

    /// Resolves once the flag is raised.
    pub async fn raised(&self) {
        self.inner.token.cancelled().await
    }

    pub fn ptr_eq(&self, other: &InterruptFlag) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Outside condition that, once it stops holding, should interrupt a session.
///
/// Implemented by the connection registry's watch handle so the worker can
/// notice a dead or superseded connection even if nobody raised the flag.
pub trait LivenessProbe: Send + Sync {
    /// `None` while the session may keep running, otherwise why it must stop.
    fn check(&self) -> Option<InterruptReason>;
}

/// What the worker polls between steps.
#[derive(Clone)]
pub struct InterruptCheck {
    flag: InterruptFlag,
    probe: Option<Arc<dyn LivenessProbe>>,
}

impl InterruptCheck {
    pub fn new(flag: InterruptFlag) -> Self {
        Self { flag, probe: None }
    }

    pub fn with_probe(flag: InterruptFlag, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            flag,
            probe: Some(probe),
        }
    }

    pub fn flag(&self) -> &InterruptFlag {
        &self.flag
    }

    /// Returns the interrupt reason if the session must stop.
    ///
    /// A failing probe raises the flag, so later polls and other holders of
    /// the flag see the same reason.
    pub fn poll(&self) -> Option<InterruptReason> {
        if let Some(reason) = self.flag.reason() {
            return Some(reason);
        }
        if let Some(reason) = self.probe.as_ref().and_then(|p| p.check()) {
            self.flag.raise(reason);
            return self.flag.reason();
        }
        None
    }
}

impl std::fmt::Debug for InterruptCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptCheck")
            .field("flag", &self.flag)
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn first_reason_wins() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_raised());
        assert!(flag.raise(InterruptReason::Superseded));
        assert!(!flag.raise(InterruptReason::Disconnected));
        assert_eq!(flag.reason(), Some(InterruptReason::Superseded));
    }

    #[test]
    fn clones_share_state() {
        let flag = InterruptFlag::new();
        let other = flag.clone();
        other.raise(InterruptReason::Requested);
        assert!(flag.is_raised());
        assert!(flag.ptr_eq(&other));
        assert!(!flag.ptr_eq(&InterruptFlag::new()));
    }

    struct Toggle(AtomicBool);

    impl LivenessProbe for Toggle {
        fn check(&self) -> Option<InterruptReason> {
            (!self.0.load(Ordering::SeqCst)).then_some(InterruptReason::Disconnected)
        }
    }

    #[test]
    fn failing_probe_raises_flag() {
        let probe = Arc::new(Toggle(AtomicBool::new(true)));
        let flag = InterruptFlag::new();
        let check = InterruptCheck::with_probe(flag.clone(), probe.clone());
        assert_eq!(check.poll(), None);

        probe.0.store(false, Ordering::SeqCst);
        assert_eq!(check.poll(), Some(InterruptReason::Disconnected));
        assert_eq!(flag.reason(), Some(InterruptReason::Disconnected));

        probe.0.store(true, Ordering::SeqCst);
        assert_eq!(check.poll(), Some(InterruptReason::Disconnected));
    }

    #[tokio::test]
    async fn raised_resolves() {
        let flag = InterruptFlag::new();
        let waiter = flag.clone();
        let task = tokio::spawn(async move { waiter.raised().await });
        flag.raise(InterruptReason::Shutdown);
        task.await.unwrap();
    }
}
