//! Abstraction over OS differences.

mod portable;

pub use portable::SystemPlatform;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;

/// The platform of the target.
#[cfg(target_os = "linux")]
pub type DefaultPlatform = LinuxPlatform;

/// The platform of the target.
#[cfg(not(target_os = "linux"))]
pub type DefaultPlatform = SystemPlatform;
