use std::sync::atomic::AtomicBool;

use libvb::Subsystem;

pub mod cstr;
#[cfg(feature = "libvirt")]
mod libvirt;
#[cfg(test)]
mod test;

#[cfg(feature = "libvirt")]
pub use libvirt::{Libvirt, VirtError};

/// Open a libvirt connection as a subsystem.
#[cfg(feature = "libvirt")]
pub fn connect(uri: &str) -> anyhow::Result<Box<dyn Subsystem>> {
    Ok(Box::new(Libvirt::connect(uri)?))
}

#[cfg(not(feature = "libvirt"))]
pub fn connect(uri: &str) -> anyhow::Result<Box<dyn Subsystem>> {
    anyhow::bail!("cannot connect to {}: built without the `libvirt` feature", uri)
}

/// Deliver subsystem events on the calling thread until `stop` is set.
#[cfg(feature = "libvirt")]
pub fn run_event_loop(stop: &AtomicBool) -> anyhow::Result<()> {
    libvirt::run_event_loop(stop)
}

#[cfg(not(feature = "libvirt"))]
pub fn run_event_loop(_stop: &AtomicBool) -> anyhow::Result<()> {
    anyhow::bail!("no event loop: built without the `libvirt` feature")
}
