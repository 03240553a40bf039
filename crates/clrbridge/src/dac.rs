//! DAC (Data Access Component) identity and resolution.
//!
//! Every runtime build ships a DAC compiled against its exact internal data
//! structures. This module derives the file names a matching DAC goes by,
//! looks for one next to the runtime, falls back to a [`BinaryLocator`], and
//! validates whatever it finds before anything is loaded.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::image::{BinaryInspector, ImageInfo};
use crate::runtime::{ClrFlavor, RuntimeDescriptor, TargetPlatform, VersionInfo};
use crate::target::{Architecture, ModuleRecord};
use crate::{Error, Result};

// =============================================================================
// Naming
// =============================================================================

/// File name of the DAC as it sits next to the runtime.
pub fn logical_file_name(
    flavor: ClrFlavor,
    platform: TargetPlatform,
    target_arch: Architecture,
) -> &'static str {
    match (flavor, platform) {
        (ClrFlavor::Desktop, _) => "mscordacwks.dll",
        (ClrFlavor::Core, TargetPlatform::Windows) => "mscordaccore.dll",
        (ClrFlavor::Core, TargetPlatform::Linux) => "libmscordaccore.so",
        (ClrFlavor::Core, TargetPlatform::MacOS) => "libmscordaccore.dylib",
        (ClrFlavor::Native, _) => match target_arch {
            Architecture::X86 => "mrt100dac_winx86.dll",
            _ => "mrt100dac_winamd64.dll",
        },
    }
}

/// File name a symbol store indexes the DAC under.
///
/// `{dac}_{host}_{target}_{major}.{minor}.{revision}.{patch:02}.dll`, where
/// host is the architecture the DAC itself runs on. Core runtimes use the
/// `mscordaccore` stem on every platform. Native runtimes are requested by
/// their logical name.
pub fn request_file_name(
    flavor: ClrFlavor,
    platform: TargetPlatform,
    target_arch: Architecture,
    host_arch: Architecture,
    version: VersionInfo,
) -> String {
    let dac = match (flavor, platform) {
        (ClrFlavor::Desktop, _) => "mscordacwks",
        (ClrFlavor::Core, _) => "mscordaccore",
        (ClrFlavor::Native, _) => {
            return logical_file_name(flavor, platform, target_arch).to_string();
        }
    };

    format!(
        "{}_{}_{}_{}.{}.{}.{:02}.dll",
        dac,
        host_arch.name(),
        target_arch.name(),
        version.major,
        version.minor,
        version.revision,
        version.patch
    )
}

// =============================================================================
// DacInfo
// =============================================================================

/// Identity of the DAC matching one runtime.
///
/// The timestamp and size are those of the runtime module; symbol stores key
/// the DAC by its runtime's image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DacInfo {
    /// Name used for the same-directory lookup
    pub file_name: String,
    /// Exact name for remote lookup, stamped with the host architecture
    pub request_file_name: String,
    /// Remote lookup name stamped with the target architecture twice
    pub platform_agnostic_name: String,
    pub file_size: u64,
    pub timestamp: u32,
    pub version: VersionInfo,
    pub target_architecture: Architecture,
}

impl DacInfo {
    pub fn new(
        flavor: ClrFlavor,
        platform: TargetPlatform,
        target_arch: Architecture,
        host_arch: Architecture,
        module: &ModuleRecord,
    ) -> Self {
        let version = module.version();
        Self {
            file_name: logical_file_name(flavor, platform, target_arch).to_string(),
            request_file_name: request_file_name(flavor, platform, target_arch, host_arch, version),
            platform_agnostic_name: request_file_name(
                flavor,
                platform,
                target_arch,
                target_arch,
                version,
            ),
            file_size: module.size,
            timestamp: module.timestamp,
            version,
            target_architecture: target_arch,
        }
    }

    /// Request sent to a [`BinaryLocator`] for this DAC.
    pub fn binary_request(&self) -> BinaryRequest {
        BinaryRequest {
            file_name: self.request_file_name.clone(),
            timestamp: self.timestamp,
            file_size: self.file_size,
            version: self.version,
        }
    }
}

/// A DAC candidate next to the runtime module whose version equals the
/// runtime's.
pub(crate) fn find_local_dac(
    module: &ModuleRecord,
    dac: &DacInfo,
    inspector: &dyn BinaryInspector,
) -> Option<PathBuf> {
    let dir = module.directory()?;
    let candidate = Path::new(dir).join(&dac.file_name);

    match inspector.inspect(&candidate) {
        Ok(image) if image.file_version == Some(module.version()) => Some(candidate),
        Ok(image) => {
            debug!(
                "Local DAC {} has version {:?}, runtime is {}",
                candidate.display(),
                image.file_version,
                module.version()
            );
            None
        }
        Err(e) => {
            debug!("No local DAC at {}: {}", candidate.display(), e);
            None
        }
    }
}

// =============================================================================
// Locators
// =============================================================================

/// What a locator is asked to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRequest {
    pub file_name: String,
    pub timestamp: u32,
    pub file_size: u64,
    pub version: VersionInfo,
}

impl fmt::Display for BinaryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (timestamp {:08x}, size {:#x})",
            self.file_name, self.timestamp, self.file_size
        )
    }
}

/// Finds binaries the target references but the host does not have locally.
///
/// Retries and caching belong to the implementation.
pub trait BinaryLocator: Send + Sync {
    fn locate(&self, request: &BinaryRequest) -> Result<Option<PathBuf>>;
}

/// Locator that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLocator;

impl BinaryLocator for NullLocator {
    fn locate(&self, _request: &BinaryRequest) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Searches a fixed list of directories by file name.
#[derive(Debug, Clone, Default)]
pub struct DirectoryLocator {
    directories: Vec<PathBuf>,
}

impl DirectoryLocator {
    pub fn new<I, P>(directories: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            directories: directories.into_iter().map(Into::into).collect(),
        }
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }
}

impl BinaryLocator for DirectoryLocator {
    fn locate(&self, request: &BinaryRequest) -> Result<Option<PathBuf>> {
        for dir in &self.directories {
            let candidate = dir.join(&request.file_name);
            if candidate.is_file() {
                debug!("Located {} in {}", request.file_name, dir.display());
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Options controlling DAC resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Use this file instead of searching
    pub dac_path: Option<PathBuf>,
    /// Accept a DAC whose version differs from the runtime's
    pub ignore_mismatch: bool,
}

impl ResolveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dac_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dac_path = Some(path.into());
        self
    }

    pub fn ignore_mismatch(mut self, ignore: bool) -> Self {
        self.ignore_mismatch = ignore;
        self
    }
}

/// A DAC file that passed validation.
#[derive(Debug, Clone)]
pub struct ResolvedDac {
    pub path: PathBuf,
    pub image: ImageInfo,
}

/// Finds and validates the DAC for a runtime.
pub struct DacResolver<'a> {
    inspector: &'a dyn BinaryInspector,
    locator: &'a dyn BinaryLocator,
    /// Pointer width of the target
    pointer_size: u32,
}

impl<'a> DacResolver<'a> {
    pub fn new(
        inspector: &'a dyn BinaryInspector,
        locator: &'a dyn BinaryLocator,
        pointer_size: u32,
    ) -> Self {
        Self {
            inspector,
            locator,
            pointer_size,
        }
    }

    pub fn resolve(
        &self,
        descriptor: &RuntimeDescriptor,
        options: &ResolveOptions,
    ) -> Result<ResolvedDac> {
        let path = self.find(descriptor, options)?;
        let image = self.inspector.inspect(&path)?;

        if image.pointer_size != self.pointer_size {
            return Err(Error::ArchitectureMismatch {
                expected: self.pointer_size,
                actual: image.pointer_size,
            });
        }

        if !options.ignore_mismatch && image.file_version != Some(descriptor.version) {
            return Err(Error::VersionMismatch {
                path,
                expected: descriptor.version,
                actual: image
                    .file_version
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "unknown".into()),
            });
        }

        info!("Using DAC {} for {}", path.display(), descriptor);
        Ok(ResolvedDac { path, image })
    }

    fn find(&self, descriptor: &RuntimeDescriptor, options: &ResolveOptions) -> Result<PathBuf> {
        if let Some(path) = &options.dac_path {
            if !path.is_file() {
                return Err(Error::NotFound(path.display().to_string()));
            }
            debug!("DAC override {}", path.display());
            return Ok(path.clone());
        }

        if let Some(local) = &descriptor.local_dac
            && local.is_file()
        {
            debug!("Local DAC {}", local.display());
            return Ok(local.clone());
        }

        let request = descriptor.dac.binary_request();
        match self.locator.locate(&request) {
            Ok(Some(path)) => {
                debug!("Locator returned {}", path.display());
                Ok(path)
            }
            Ok(None) => Err(Error::NotFound(request.file_name)),
            Err(e) => {
                warn!("Locator failed for {}: {}", request, e);
                Err(Error::NotFound(request.file_name))
            }
        }
    }
}
