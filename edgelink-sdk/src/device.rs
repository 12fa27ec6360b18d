//! Host-provided collaborators: device location and device/network info
//!
//! Reading sensors and looking up carrier names is the host's job; the SDK
//! only asks at call time and never caches answers across calls.

use crate::models::{DeviceInfoDynamic, DeviceInfoStatic, Location};
use async_trait::async_trait;
use tracing::warn;

/// Current device position, push or pull backed
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// `None` when no fix is available.
    async fn current_location(&self) -> Option<Location>;
}

/// Device and radio details
pub trait DeviceInfoProvider: Send + Sync {
    fn device_info_static(&self) -> DeviceInfoStatic;

    fn device_info_dynamic(&self) -> DeviceInfoDynamic;

    /// `"{mcc}-{mnc}"` of the attached carrier, when on a cellular network.
    fn mcc_mnc(&self) -> Option<String> {
        None
    }
}

/// Location to use right now, falling back to `default` when the provider
/// has nothing usable.
pub async fn location_or_default(provider: &dyn LocationProvider, default: &Location) -> Location {
    match provider.current_location().await {
        Some(location) if !location.is_unavailable() => location,
        Some(_) => {
            warn!("location provider returned (0,0), using default location");
            default.clone()
        }
        None => {
            warn!("location unavailable, using default location");
            default.clone()
        }
    }
}

/// Provider that always answers the same coordinates
#[derive(Debug, Clone)]
pub struct StaticLocation(pub Location);

#[async_trait]
impl LocationProvider for StaticLocation {
    async fn current_location(&self) -> Option<Location> {
        let mut location = self.0.clone();
        location.timestamp = chrono::Utc::now();
        Some(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoFix;

    #[async_trait]
    impl LocationProvider for NoFix {
        async fn current_location(&self) -> Option<Location> {
            None
        }
    }

    #[tokio::test]
    async fn test_location_fallbacks() {
        let default = Location::new(48.85, 2.35);

        let got = location_or_default(&NoFix, &default).await;
        assert_eq!(got.latitude, 48.85);

        let zero = StaticLocation(Location::new(0.0, 0.0));
        let got = location_or_default(&zero, &default).await;
        assert_eq!(got.longitude, 2.35);

        let real = StaticLocation(Location::new(37.33, -121.88));
        let got = location_or_default(&real, &default).await;
        assert_eq!(got.latitude, 37.33);
    }
}
