//! Screen-capture permission: requesting, caching, and invalidating it
//! is an out-of-band concern (permission UI is explicitly out of scope
//! for the core); this module only defines the seam `SessionController`
//! calls through.

use std::sync::atomic::{AtomicBool, Ordering};

/// Result of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    Denied,
}

/// Requests, caches, and invalidates screen-capture permission.
/// Implemented outside the core pipeline by a platform-specific prompt;
/// `SessionController` only needs `request`/`cached`/`clear_cache`.
#[async_trait::async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Prompt for (or otherwise obtain) permission out of band. Only
    /// called when [`Self::cached`] is `false`.
    async fn request(&self) -> PermissionOutcome;

    /// Whether a previously granted permission is still considered valid.
    fn cached(&self) -> bool;

    /// Invalidate any cached grant, e.g. after the capture resource is lost.
    fn clear_cache(&self);
}

/// Reference implementation: grants unconditionally and caches the
/// grant for the remainder of the process. Suitable for headless or
/// test environments; a desktop integration replaces this with a real
/// portal-backed prompt.
#[derive(Debug, Default)]
pub struct AutoGrantPermissionProvider {
    granted: AtomicBool,
}

impl AutoGrantPermissionProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PermissionProvider for AutoGrantPermissionProvider {
    async fn request(&self) -> PermissionOutcome {
        self.granted.store(true, Ordering::Release);
        PermissionOutcome::Granted
    }

    fn cached(&self) -> bool {
        self.granted.load(Ordering::Acquire)
    }

    fn clear_cache(&self) {
        self.granted.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_and_caches() {
        let provider = AutoGrantPermissionProvider::new();
        assert!(!provider.cached());
        assert_eq!(provider.request().await, PermissionOutcome::Granted);
        assert!(provider.cached());
    }

    #[test]
    fn clear_cache_resets() {
        let provider = AutoGrantPermissionProvider::new();
        provider.granted.store(true, Ordering::Release);
        provider.clear_cache();
        assert!(!provider.cached());
    }
}
