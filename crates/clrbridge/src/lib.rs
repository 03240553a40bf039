//! Runtime discovery and DAC bridge for .NET targets.
//!
//! A [`TargetSession`] enumerates the modules of a live process or dump,
//! recognizes runtime modules and describes the DAC each one needs. The
//! [`dac`] module finds and validates that DAC; [`bridge`] loads it and hands
//! it a synthetic data target that reads through the session.
//!
//! ```no_run
//! # fn run(reader: std::sync::Arc<dyn clrbridge::TargetReader>) -> clrbridge::Result<()> {
//! use clrbridge::{ResolveOptions, TargetSession};
//!
//! let session = TargetSession::new(reader);
//! for runtime in session.runtimes()? {
//!     let clr = session.create_runtime(runtime, &ResolveOptions::new())?;
//!     clr.flush()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod clr;
pub mod dac;
pub mod error;
pub mod image;
pub mod layout;
pub mod runtime;
pub mod target;

#[cfg(test)]
pub(crate) mod mock;

pub use clr::ClrRuntime;
pub use dac::{
    BinaryLocator, BinaryRequest, DacInfo, DacResolver, DirectoryLocator, NullLocator,
    ResolveOptions, ResolvedDac,
};
pub use error::{Error, Result};
pub use image::{BinaryInspector, FileInspector, ImageInfo};
pub use layout::{DomainLocalModuleLayout, ObjectLayout, RuntimeBuild};
pub use runtime::{ClrFlavor, RuntimeDescriptor, TargetPlatform, VersionInfo};
pub use target::{Architecture, ModuleInfo, ModuleRecord, TargetReader, TargetSession};
