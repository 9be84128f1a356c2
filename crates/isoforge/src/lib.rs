//! # Isoforge
//!
//! Isoforge edits the contents of read-only live ISO images by
//! constructing a writable overlay view, letting editing actions
//! mutate that view, and re-authoring the image (or materializing a
//! directory) from the accumulated changes. Sub-filesystems packed
//! inside the image (squashfs modules) are exposed lazily as their own
//! nested writable trees and repacked only if they were actually
//! modified.
//!
//! ## Usage
//!
//! ```no_run
//! use isoforge::workspace::{Destination, Workspace};
//!
//! # fn example() -> isoforge_common::IsoforgeResult<()> {
//! let mut ws = Workspace::new("ubuntu.iso")?;
//! ws.mount_source(false)?;
//!
//! let rootfs = ws.edit_subfilesystem("rootfs", true)?;
//! std::fs::write(rootfs.join("etc/motd"), "edited\n")?;
//!
//! let outcome = ws.finalize(&Destination::Image("custom.iso".into()))?;
//! ws.teardown()?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod actions;
pub mod cli;
pub mod workspace;

pub use workspace::Workspace;
