//! Manifest-driven build orchestrator for immutable OS images.
//!
//! A TOML manifest lists packages (prebuilt archives, git repositories or local
//! PKGBUILD directories), a kernel and an initrd script. osforge resolves every
//! source into a content-addressed cache, builds packages in containers at
//! most once per fingerprint, builds the kernel, assembles everything into a
//! squashfs image and can boot it under QEMU.
//!
//! # Architecture
//!
//! ```text
//! Manifest ──► source (resolve + fingerprint) ──► cache ◄── build::package
//!                                                   ▲          build::kernel
//!                                                   │          build::initrd
//!                                                   │
//!                     pipeline (join barrier) ──► artifact::sysroot ──► qemu
//! ```
//!
//! - [`manifest`] - typed, validated system description
//! - [`fingerprint`] - source and build fingerprints, content hashing
//! - [`source`] - binary, git and local source resolution
//! - [`cache`] - content-addressed store with in-flight deduplication and GC
//! - [`build`] - container contract plus package, kernel and initrd builders
//! - [`artifact`] - sysroot materialization and squashfs packing
//! - [`firmware`] - pinned OVMF and EFI boot loader downloads
//! - [`qemu`] - development VM
//! - [`pipeline`] - the operations behind each CLI subcommand
//!
//! # Example
//!
//! ```rust,ignore
//! use osforge::{pipeline::Pipeline, Config, Manifest};
//!
//! let manifest = Manifest::load("manifest.toml".as_ref())?;
//! let config = Config::load(None, ".".as_ref())?;
//! let pipeline = Pipeline::new(&manifest, &config)?;
//! let report = pipeline.build()?;
//! let image = pipeline.assemble(&report)?;
//! println!("{}", image.image_path.display());
//! ```

pub mod artifact;
pub mod build;
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod firmware;
pub mod layout;
pub mod manifest;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod qemu;
pub mod source;

pub use config::Config;
pub use error::{Error, Result};
pub use layout::OutputLayout;
pub use manifest::Manifest;
