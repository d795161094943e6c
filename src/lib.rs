//! Kernel mode-setting core for a display server.
//!
//! The entry point is [`device::Device`], which is attached to a DRM device
//! through the [`kernel::KmsKernel`] trait.

#![allow(clippy::len_zero, clippy::new_without_default, clippy::too_many_arguments)]

pub mod bo;
pub mod color;
pub mod config;
pub mod cursor;
pub mod device;
pub mod event_loop;
pub mod kernel;
pub mod lease;
pub mod logger;
pub mod modeset;
pub mod props;
pub mod resources;
pub mod shared_flip;
#[cfg(test)]
mod test_kernel;
pub mod utils;
pub mod vblank;
pub mod video;
