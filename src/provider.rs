//! Location provider capability.
//!
//! The tracker never talks to OS location APIs directly. Hosts implement
//! [`GeoFixProvider`] on top of whatever the platform offers; the tracker only
//! asks for "one fix now" or "a stream of fixes".

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use log::{debug, info};

use crate::error::{Result, TrackerError};
use crate::RawFix;

/// Location permission as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

impl PermissionStatus {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionStatus::Granted)
    }
}

/// Source of raw location fixes.
///
/// `get_fix` has no timeout on the tracker side; a provider that never answers
/// stalls only the tick or background run that asked.
pub trait GeoFixProvider: Send + Sync {
    fn is_service_enabled(&self) -> BoxFuture<'_, bool>;

    fn has_permission(&self) -> BoxFuture<'_, PermissionStatus>;

    /// Ask the user for permission. May show UI; never called from the background run.
    fn request_permission(&self) -> BoxFuture<'_, PermissionStatus>;

    /// Acquire a single fix.
    fn get_fix(&self) -> BoxFuture<'_, Result<RawFix>>;

    /// Push subscription to location changes. Ends when the provider stops
    /// producing fixes.
    fn subscribe(&self) -> BoxStream<'static, Result<RawFix>>;
}

/// Check that the location service is on and permission is granted.
///
/// With `request_if_needed` a denied permission is requested once before
/// giving up.
pub async fn ensure_ready(provider: &dyn GeoFixProvider, request_if_needed: bool) -> Result<()> {
    if !provider.is_service_enabled().await {
        info!("[Provider] Location service disabled");
        return Err(TrackerError::ProviderUnavailable);
    }

    let mut permission = provider.has_permission().await;
    if !permission.is_granted() && request_if_needed {
        debug!("[Provider] Requesting location permission");
        permission = provider.request_permission().await;
    }

    if !permission.is_granted() {
        info!("[Provider] Location permission denied");
        return Err(TrackerError::PermissionDenied);
    }
    Ok(())
}

/// Acquire one fix and reject coordinates no sample could hold.
pub async fn acquire_fix(provider: &dyn GeoFixProvider) -> Result<RawFix> {
    let fix = provider.get_fix().await?;
    if !fix.point().is_valid() {
        return Err(TrackerError::InvalidCoordinates {
            latitude: fix.latitude,
            longitude: fix.longitude,
        });
    }
    Ok(fix)
}


#[cfg(test)]
mod tests {
    use super::mock::MockProvider;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_ready_when_granted() {
        let provider = MockProvider::granted();
        assert!(ensure_ready(&provider, false).await.is_ok());
        assert_eq!(provider.permission_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_service_disabled() {
        let provider = MockProvider::granted();
        provider.service_enabled.store(false, Ordering::SeqCst);
        assert_eq!(
            ensure_ready(&provider, true).await,
            Err(TrackerError::ProviderUnavailable)
        );
    }

    #[tokio::test]
    async fn test_permission_requested_once() {
        let provider = MockProvider::granted();
        *provider.permission.lock().unwrap() = PermissionStatus::Denied;
        provider.grant_on_request.store(false, Ordering::SeqCst);

        assert_eq!(
            ensure_ready(&provider, true).await,
            Err(TrackerError::PermissionDenied)
        );
        assert_eq!(provider.permission_requests.load(Ordering::SeqCst), 1);

        // Without a prompt the request is never made
        assert_eq!(
            ensure_ready(&provider, false).await,
            Err(TrackerError::PermissionDenied)
        );
        assert_eq!(provider.permission_requests.load(Ordering::SeqCst), 1);

        provider.grant_on_request.store(true, Ordering::SeqCst);
        assert!(ensure_ready(&provider, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_fix_rejects_invalid_coordinates() {
        let provider = MockProvider::granted();
        provider.push_fix(Ok(RawFix::new(37.0, -122.0, 1)));
        provider.push_fix(Ok(RawFix::new(f64::NAN, 0.0, 2)));

        assert_eq!(acquire_fix(&provider).await.unwrap().latitude, 37.0);
        assert!(matches!(
            acquire_fix(&provider).await,
            Err(TrackerError::InvalidCoordinates { .. })
        ));
        assert!(matches!(
            acquire_fix(&provider).await,
            Err(TrackerError::FixAcquisitionFailed { .. })
        ));
    }
}
