//! Windows virtual interfaces.
//!
//! [`WintunInterface`] is preferred. The driver library is loaded explicitly
//! into a [`WintunLibrary`] capability object and passed to the interface, so
//! nothing is resolved lazily behind the caller's back. When Wintun is not
//! available the TAP-Windows driver is used through [`TapInterface`].
//!
//! Both backends address the adapter with `netsh` and, when a gateway is
//! given, install full-tunnel routes which are removed again on close.

pub mod netsh;
pub mod tap;
pub mod wintun;

pub use tap::TapInterface;
pub use wintun::{WintunInterface, WintunLibrary};

use crate::{InterfaceConfig, TunResult, VirtualInterface};
use std::sync::Arc;

/// Create the best available Windows interface for `config`.
///
/// # Errors
///
/// Returns the TAP error when neither backend can be opened.
pub fn create_interface(config: &InterfaceConfig) -> TunResult<Arc<dyn VirtualInterface>> {
    let wintun = WintunLibrary::load_default()
        .and_then(|library| WintunInterface::create(Arc::new(library), &config.name, config.mtu));

    match wintun {
        Ok(iface) => Ok(Arc::new(iface)),
        Err(e) => {
            tracing::warn!(error = %e, "Wintun unavailable, falling back to TAP driver");
            let tap = TapInterface::open(&config.name, config.mtu)?;
            Ok(Arc::new(tap))
        }
    }
}
