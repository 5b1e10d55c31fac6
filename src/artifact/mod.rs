//! Image assembly.
//!
//! - [`filesystem`] - directory copying, archive unpacking, atomic moves
//! - [`squashfs`] - compressed image creation (mksquashfs)
//! - [`sysroot`] - root tree materialization from built artifacts

pub mod filesystem;
pub mod squashfs;
pub mod sysroot;

pub use squashfs::SquashfsOptions;
pub use sysroot::{Assembler, PackageCredit, SystemImage};
