//! Host capability interfaces, consumed as black boxes: runtime permissions,
//! radio power state, and best-effort location.

/// Runtime permission checks. A denied permission skips the operation and
/// logs a Permission event; the engine never re-requests on its own.
pub trait Permissions {
    fn can_scan(&self) -> bool;
    fn can_connect(&self) -> bool;
    fn can_advertise(&self) -> bool;
    fn can_location(&self) -> bool;
}

/// Radio power state as reported by the host.
pub trait RadioState {
    fn is_enabled(&self) -> bool;
}

/// Best-effort last-known position, `(lat, lon)`.
pub trait LocationSource {
    fn last_known(&self) -> Option<(f64, f64)>;
}

/// Host without a permission model: everything granted, radio on.
pub struct GrantAll;

impl Permissions for GrantAll {
    fn can_scan(&self) -> bool {
        true
    }
    fn can_connect(&self) -> bool {
        true
    }
    fn can_advertise(&self) -> bool {
        true
    }
    fn can_location(&self) -> bool {
        true
    }
}

impl RadioState for GrantAll {
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Host with no position source.
pub struct NoLocation;

impl LocationSource for NoLocation {
    fn last_known(&self) -> Option<(f64, f64)> {
        None
    }
}
