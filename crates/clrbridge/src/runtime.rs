//! Runtime detection: flavor classification, versions, and discovery.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::dac::{self, DacInfo};
use crate::image::BinaryInspector;
use crate::target::{Architecture, ModuleRecord};
use crate::{Error, Result};

// =============================================================================
// Flavors and platforms
// =============================================================================

/// Category of managed runtime build.
///
/// Declaration order is the priority order; runtime lists sort it reversed so
/// Core runtimes come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClrFlavor {
    /// .NET Framework (clr.dll, mscorwks.dll)
    Desktop,
    /// .NET Native / Project N (mrt100_app.dll)
    Native,
    /// .NET Core / .NET 5+ (coreclr.dll, libcoreclr.so)
    Core,
}

impl fmt::Display for ClrFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClrFlavor::Desktop => "Desktop",
            ClrFlavor::Native => "Native",
            ClrFlavor::Core => "Core",
        })
    }
}

/// Operating system the runtime module was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetPlatform {
    Windows,
    Linux,
    MacOS,
}

/// Classify a module file name as a runtime module.
///
/// Matches the file stem case-insensitively. The extension only decides the
/// platform of `libcoreclr`.
pub fn classify_module(file_name: &str) -> Option<(ClrFlavor, TargetPlatform)> {
    let lower = file_name.to_ascii_lowercase();
    let (stem, ext) = match lower.rfind('.') {
        Some(idx) => (&lower[..idx], &lower[idx + 1..]),
        None => (lower.as_str(), ""),
    };

    match stem {
        "clr" | "mscorwks" => Some((ClrFlavor::Desktop, TargetPlatform::Windows)),
        "coreclr" => Some((ClrFlavor::Core, TargetPlatform::Windows)),
        "libcoreclr" => {
            let platform = if ext == "dylib" {
                TargetPlatform::MacOS
            } else {
                TargetPlatform::Linux
            };
            Some((ClrFlavor::Core, platform))
        }
        "mrt100_app" => Some((ClrFlavor::Native, TargetPlatform::Windows)),
        _ => None,
    }
}

// =============================================================================
// Versions
// =============================================================================

/// Four-part file version: major.minor.revision.patch.
///
/// `revision` is the third component (the build number), `patch` the fourth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    pub patch: u32,
}

impl VersionInfo {
    pub const fn new(major: u32, minor: u32, revision: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            revision,
            patch,
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.patch
        )
    }
}

impl FromStr for VersionInfo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<u32> = s
            .trim()
            .split('.')
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::InvalidData(format!("bad version string {:?}", s)))?;

        match parts.as_slice() {
            [major, minor, revision, patch] => Ok(Self::new(*major, *minor, *revision, *patch)),
            _ => Err(Error::InvalidData(format!(
                "expected four version components in {:?}",
                s
            ))),
        }
    }
}

// =============================================================================
// RuntimeDescriptor
// =============================================================================

/// A runtime found in the target.
#[derive(Debug, Clone)]
pub struct RuntimeDescriptor {
    pub flavor: ClrFlavor,
    pub platform: TargetPlatform,
    pub version: VersionInfo,
    /// The runtime module itself
    pub module: ModuleRecord,
    /// Identity of the DAC matching this runtime
    pub dac: DacInfo,
    /// A DAC next to the runtime module whose version matched, if any
    pub local_dac: Option<PathBuf>,
}

impl RuntimeDescriptor {
    fn identity(&self) -> (ClrFlavor, VersionInfo, &str, u64) {
        (
            self.flavor,
            self.version,
            &self.module.path,
            self.module.base_address,
        )
    }
}

impl PartialEq for RuntimeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for RuntimeDescriptor {}

impl PartialOrd for RuntimeDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RuntimeDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        // Flavor is intentionally reversed.
        other
            .flavor
            .cmp(&self.flavor)
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.module.path.cmp(&other.module.path))
            .then_with(|| self.module.base_address.cmp(&other.module.base_address))
    }
}

impl fmt::Display for RuntimeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.flavor, self.version)
    }
}

/// Result of runtime discovery over one module snapshot.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSnapshot {
    pub runtimes: Vec<RuntimeDescriptor>,
    pub native: Option<ModuleRecord>,
}

// =============================================================================
// Discovery
// =============================================================================

/// Scan a module snapshot for runtime modules.
pub fn discover_runtimes(
    modules: &[ModuleRecord],
    target_arch: Architecture,
    host_arch: Architecture,
    inspector: &dyn BinaryInspector,
) -> RuntimeSnapshot {
    let mut snapshot = RuntimeSnapshot::default();

    for module in modules {
        let Some((flavor, platform)) = classify_module(module.file_name()) else {
            continue;
        };

        if flavor == ClrFlavor::Native {
            debug!("Native runtime module at {:#x}", module.base_address);
            snapshot.native = Some(module.clone());
            continue;
        }

        if module.file_version.is_none() {
            warn!(
                "Runtime module {} has no version information",
                module.path
            );
        }

        let version = module.version();
        let dac = DacInfo::new(flavor, platform, target_arch, host_arch, module);
        let local_dac = dac::find_local_dac(module, &dac, inspector);

        debug!(
            "Found {} runtime {} at {:#x} (local DAC: {:?})",
            flavor, version, module.base_address, local_dac
        );

        snapshot.runtimes.push(RuntimeDescriptor {
            flavor,
            platform,
            version,
            module: module.clone(),
            dac,
            local_dac,
        });
    }

    snapshot.runtimes.sort();
    snapshot.runtimes.dedup();
    snapshot
}
