//! usb-bulk-echo tester library
//!
//! Shares the module tree between the `usb-bulk-echo` binary and the
//! integration tests in `tests/`.

pub mod config;
pub mod shell;
pub mod usb;

use anyhow::Result;
use bulk::{AllowedDeviceId, Registry, UsbBackend};
use config::TesterConfig;
use tracing::info;

/// Build a registry from the configured allow-list plus `extra` entries
pub fn build_registry<B: UsbBackend>(
    backend: B,
    config: &TesterConfig,
    extra: &[AllowedDeviceId],
) -> Result<Registry<B>> {
    let registry = Registry::with_capacity(backend, config.usb.max_devices);
    for id in config.allowed_ids()?.into_iter().chain(extra.iter().copied()) {
        registry.add_allowed_device(id.vendor_id, id.product_id);
    }
    info!(
        "Allow-list: {}",
        registry
            .allowed_devices()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(registry)
}
