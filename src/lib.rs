// Library crate for projectfs: the mirror, its remote interface and the FUSE binding.

pub mod config;
pub mod error;
pub mod fuse;
pub mod remote;
pub mod vfs;
