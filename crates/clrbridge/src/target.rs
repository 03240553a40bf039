//! Target session: module enumeration and raw memory access.
//!
//! A [`TargetSession`] wraps an externally supplied [`TargetReader`] (live
//! process or dump) and caches the module list and discovered runtimes for the
//! session's lifetime. The target is assumed to be quiescent while a session
//! is in use; neither snapshot is ever refreshed.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::{debug, warn};

use crate::bridge::DacLibrary;
use crate::dac::{BinaryLocator, NullLocator};
use crate::image::{BinaryInspector, FileInspector};
use crate::runtime::{self, RuntimeDescriptor, RuntimeSnapshot, VersionInfo};
use crate::{Error, Result};

// =============================================================================
// Architecture
// =============================================================================

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x01c4;
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xAA64;

/// Processor architecture of a target or binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Unknown,
    X86,
    Amd64,
    Arm,
    Arm64,
}

impl Architecture {
    /// Architecture of the running host.
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Architecture::Amd64
        } else if cfg!(target_arch = "x86") {
            Architecture::X86
        } else if cfg!(target_arch = "aarch64") {
            Architecture::Arm64
        } else if cfg!(target_arch = "arm") {
            Architecture::Arm
        } else {
            Architecture::Unknown
        }
    }

    /// Name used in DAC request file names.
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Unknown => "unknown",
            Architecture::X86 => "x86",
            Architecture::Amd64 => "amd64",
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
        }
    }

    /// PE machine type reported to the DAC through `GetMachineType`.
    pub fn machine_type(&self) -> u16 {
        match self {
            Architecture::Unknown => 0,
            Architecture::X86 => IMAGE_FILE_MACHINE_I386,
            Architecture::Amd64 => IMAGE_FILE_MACHINE_AMD64,
            Architecture::Arm => IMAGE_FILE_MACHINE_ARMNT,
            Architecture::Arm64 => IMAGE_FILE_MACHINE_ARM64,
        }
    }

    pub fn from_machine_type(machine: u16) -> Self {
        match machine {
            IMAGE_FILE_MACHINE_I386 => Architecture::X86,
            IMAGE_FILE_MACHINE_AMD64 => Architecture::Amd64,
            IMAGE_FILE_MACHINE_ARMNT => Architecture::Arm,
            IMAGE_FILE_MACHINE_ARM64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        }
    }

    pub fn pointer_size(&self) -> Option<u32> {
        match self {
            Architecture::X86 | Architecture::Arm => Some(4),
            Architecture::Amd64 | Architecture::Arm64 => Some(8),
            Architecture::Unknown => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Modules
// =============================================================================

/// A module as reported by the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Full path of the image as the target saw it
    pub path: String,
    pub base_address: u64,
    pub size: u64,
    /// COFF timestamp (0 when unknown)
    pub timestamp: u32,
    pub file_version: Option<VersionInfo>,
}

/// A module in the session's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleRecord {
    pub path: String,
    pub base_address: u64,
    pub size: u64,
    pub timestamp: u32,
    pub file_version: Option<VersionInfo>,
    /// Whether the file name matches a known runtime module
    pub is_runtime: bool,
}

impl ModuleRecord {
    fn from_info(info: ModuleInfo) -> Self {
        let is_runtime = runtime::classify_module(file_name_of(&info.path)).is_some();
        Self {
            path: info.path,
            base_address: info.base_address,
            size: info.size,
            timestamp: info.timestamp,
            file_version: info.file_version,
            is_runtime,
        }
    }

    /// File name portion of the path. Both separators are honored since dumps
    /// from Windows targets are routinely opened on other hosts.
    pub fn file_name(&self) -> &str {
        file_name_of(&self.path)
    }

    /// Directory portion of the path, if any.
    pub fn directory(&self) -> Option<&str> {
        let idx = self.path.rfind(['\\', '/'])?;
        Some(&self.path[..idx])
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address - self.base_address < self.size
    }

    /// Version of the module, or 0.0.0.0 when the reader could not supply one.
    pub fn version(&self) -> VersionInfo {
        self.file_version.unwrap_or_default()
    }
}

pub(crate) fn file_name_of(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Whether a path is usable on the host filesystem.
#[cfg(windows)]
pub fn is_valid_host_path(path: &str) -> bool {
    !path
        .chars()
        .any(|c| matches!(c, '"' | '<' | '>' | '|') || (c as u32) < 0x20)
}

/// Whether a path is usable on the host filesystem.
#[cfg(not(windows))]
pub fn is_valid_host_path(path: &str) -> bool {
    !path.contains('\0')
}

// =============================================================================
// TargetReader
// =============================================================================

/// Memory and module access for a live process or a snapshot.
///
/// Implementations are supplied by the host. Reads are synchronous and may
/// block on I/O.
pub trait TargetReader: Send + Sync {
    /// Read target memory into `buf`, returning the number of bytes read.
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<usize>;

    fn pointer_size(&self) -> u32;

    fn architecture(&self) -> Architecture;

    fn enumerate_modules(&self) -> Result<Vec<ModuleInfo>>;

    /// Whether the target is a dump rather than a live process.
    fn is_snapshot(&self) -> bool;

    /// Whether `read_memory` may be called from several threads at once.
    /// When false, callers serialize access themselves.
    fn supports_concurrent_reads(&self) -> bool {
        false
    }

    /// Fill `context` with the register context of a thread.
    fn thread_context(
        &self,
        _thread_id: u32,
        _context_flags: u32,
        _context: &mut [u8],
    ) -> Result<()> {
        Err(Error::Unsupported("thread context"))
    }

    fn close(&self) {}
}

// =============================================================================
// TargetSession
// =============================================================================

/// A discovery session over one target.
pub struct TargetSession {
    reader: Arc<dyn TargetReader>,
    inspector: Arc<dyn BinaryInspector>,
    locator: Arc<dyn BinaryLocator>,
    modules: OnceLock<Vec<ModuleRecord>>,
    runtimes: OnceLock<RuntimeSnapshot>,
    /// Held while the module list is being filled
    modules_init: Mutex<()>,
    /// Held while runtimes are being discovered; taken before `modules_init`
    runtimes_init: Mutex<()>,
    /// DAC libraries in order of acquisition
    libraries: Mutex<Vec<Arc<DacLibrary>>>,
}

impl TargetSession {
    pub fn new(reader: Arc<dyn TargetReader>) -> Self {
        Self {
            reader,
            inspector: Arc::new(FileInspector),
            locator: Arc::new(NullLocator),
            modules: OnceLock::new(),
            runtimes: OnceLock::new(),
            modules_init: Mutex::new(()),
            runtimes_init: Mutex::new(()),
            libraries: Mutex::new(Vec::new()),
        }
    }

    /// Replace the binary inspector used to read DAC file headers.
    pub fn with_inspector(mut self, inspector: Arc<dyn BinaryInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    /// Replace the locator consulted when no local DAC matches.
    pub fn with_locator(mut self, locator: Arc<dyn BinaryLocator>) -> Self {
        self.locator = locator;
        self
    }

    pub fn reader(&self) -> &Arc<dyn TargetReader> {
        &self.reader
    }

    pub fn inspector(&self) -> &Arc<dyn BinaryInspector> {
        &self.inspector
    }

    pub fn locator(&self) -> &Arc<dyn BinaryLocator> {
        &self.locator
    }

    pub fn architecture(&self) -> Architecture {
        self.reader.architecture()
    }

    pub fn pointer_size(&self) -> u32 {
        self.reader.pointer_size()
    }

    pub fn is_snapshot(&self) -> bool {
        self.reader.is_snapshot()
    }

    pub fn supports_concurrent_reads(&self) -> bool {
        self.reader.supports_concurrent_reads()
    }

    /// Modules sorted by base address.
    ///
    /// Computed once, on first call. Concurrent first callers wait for the
    /// one enumeration in flight. A failed enumeration is not cached.
    pub fn modules(&self) -> Result<&[ModuleRecord]> {
        if let Some(modules) = self.modules.get() {
            return Ok(modules);
        }

        let _init = lock_init(&self.modules_init);
        if let Some(modules) = self.modules.get() {
            return Ok(modules);
        }
        let modules = self.load_modules()?;
        Ok(self.modules.get_or_init(|| modules))
    }

    fn load_modules(&self) -> Result<Vec<ModuleRecord>> {
        let mut modules: Vec<ModuleRecord> = self
            .reader
            .enumerate_modules()?
            .into_iter()
            .filter(|m| {
                let valid = is_valid_host_path(&m.path);
                if !valid {
                    debug!("Skipping module with invalid path {:?}", m.path);
                }
                valid
            })
            .map(ModuleRecord::from_info)
            .collect();

        modules.sort_by(|a, b| {
            a.base_address
                .cmp(&b.base_address)
                .then_with(|| a.path.cmp(&b.path))
        });
        modules.dedup_by(|a, b| a.base_address == b.base_address && a.path == b.path);

        debug!("Enumerated {} modules", modules.len());
        Ok(modules)
    }

    /// Runtimes present in the target, Core first then Desktop, each by
    /// ascending version.
    pub fn runtimes(&self) -> Result<&[RuntimeDescriptor]> {
        Ok(&self.runtime_snapshot()?.runtimes)
    }

    /// The Native AOT runtime module, if the target has one. It has no DAC of
    /// its own and is never part of [`runtimes`](Self::runtimes).
    pub fn native_runtime(&self) -> Result<Option<&ModuleRecord>> {
        Ok(self.runtime_snapshot()?.native.as_ref())
    }

    fn runtime_snapshot(&self) -> Result<&RuntimeSnapshot> {
        if let Some(snapshot) = self.runtimes.get() {
            return Ok(snapshot);
        }

        let _init = lock_init(&self.runtimes_init);
        if let Some(snapshot) = self.runtimes.get() {
            return Ok(snapshot);
        }
        let modules = self.modules()?;
        let snapshot = runtime::discover_runtimes(
            modules,
            self.architecture(),
            Architecture::host(),
            self.inspector.as_ref(),
        );
        Ok(self.runtimes.get_or_init(|| snapshot))
    }

    /// Module whose image range contains `address`.
    pub fn find_module(&self, address: u64) -> Result<Option<&ModuleRecord>> {
        let modules = self.modules()?;
        let idx = modules.partition_point(|m| m.base_address <= address);
        Ok(idx
            .checked_sub(1)
            .map(|i| &modules[i])
            .filter(|m| m.contains(address)))
    }

    /// Module whose file name matches `name`, ignoring case.
    pub fn module_by_name(&self, name: &str) -> Result<Option<&ModuleRecord>> {
        let name = file_name_of(name);
        Ok(self
            .modules()?
            .iter()
            .find(|m| m.file_name().eq_ignore_ascii_case(name)))
    }

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------

    pub fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        self.reader.read_memory(address, buf)
    }

    /// Read exactly `buf.len()` bytes.
    pub fn read_exact(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let read = self.reader.read_memory(address, buf)?;
        if read != buf.len() {
            return Err(Error::MemoryReadFailed {
                address,
                message: format!("short read: {} of {} bytes", read, buf.len()),
            });
        }
        Ok(())
    }

    pub fn read_u32(&self, address: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, address: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a target pointer, widened to 64 bits.
    pub fn read_pointer(&self, address: u64) -> Result<u64> {
        match self.pointer_size() {
            4 => self.read_u32(address).map(u64::from),
            _ => self.read_u64(address),
        }
    }

    // -------------------------------------------------------------------------
    // DAC libraries
    // -------------------------------------------------------------------------

    /// Keep a loaded DAC alive for the rest of the session.
    pub(crate) fn add_library(&self, library: Arc<DacLibrary>) {
        match self.libraries.lock() {
            Ok(mut libraries) => libraries.push(library),
            Err(poisoned) => poisoned.into_inner().push(library),
        }
    }

    pub fn library_count(&self) -> usize {
        match self.libraries.lock() {
            Ok(libraries) => libraries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// The guarded data lives outside the mutex, so a panic during a fill leaves
/// nothing half-written.
fn lock_init(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for TargetSession {
    fn drop(&mut self) {
        let libraries = match self.libraries.get_mut() {
            Ok(libraries) => libraries,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Some(library) = libraries.pop() {
            if Arc::strong_count(&library) > 1 {
                warn!("DAC {} still referenced at session teardown", library);
            }
            drop(library);
        }
        self.reader.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTarget;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn module(path: &str, base: u64) -> ModuleInfo {
        ModuleInfo {
            path: path.to_string(),
            base_address: base,
            size: 0x1000,
            timestamp: 0,
            file_version: None,
        }
    }

    #[test]
    fn test_modules_sorted_by_base() {
        let target = MockTarget::builder()
            .module(module(r"C:\app\b.dll", 0x3000))
            .module(module(r"C:\app\a.dll", 0x1000))
            .module(module(r"C:\app\c.dll", 0x2000))
            .build();
        let session = TargetSession::new(Arc::new(target));

        let bases: Vec<u64> = session
            .modules()
            .unwrap()
            .iter()
            .map(|m| m.base_address)
            .collect();
        assert_eq!(bases, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_modules_cached_once() {
        let target = Arc::new(
            MockTarget::builder()
                .module(module(r"C:\app\a.dll", 0x1000))
                .build(),
        );
        let session = TargetSession::new(target.clone());

        let first = session.modules().unwrap().to_vec();
        let second = session.modules().unwrap().to_vec();
        assert_eq!(first, second);
        assert_eq!(target.enumerate_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_modules_deduplicated() {
        let target = MockTarget::builder()
            .module(module(r"C:\app\a.dll", 0x1000))
            .module(module(r"C:\app\a.dll", 0x1000))
            .module(module(r"C:\app\a.dll", 0x5000))
            .build();
        let session = TargetSession::new(Arc::new(target));

        assert_eq!(session.modules().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_path_skipped() {
        let target = MockTarget::builder()
            .module(module("bad\0name.dll", 0x1000))
            .module(module(r"C:\app\good.dll", 0x2000))
            .build();
        let session = TargetSession::new(Arc::new(target));

        let modules = session.modules().unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].file_name(), "good.dll");
    }

    #[test]
    fn test_concurrent_first_access() {
        let mut builder = MockTarget::builder().enumerate_delay(Duration::from_millis(50));
        for i in 0..64u64 {
            builder = builder.module(module(&format!("/usr/lib/m{i}.so"), 0x10000 * (64 - i)));
        }
        let target = Arc::new(builder.build());
        let session = Arc::new(TargetSession::new(target.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.modules().unwrap().to_vec())
            })
            .collect();

        let results: Vec<Vec<ModuleRecord>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results {
            assert_eq!(r.len(), 64);
            assert_eq!(r, &results[0]);
        }
        assert_eq!(target.enumerate_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_runtime_discovery_runs_once() {
        let target = Arc::new(
            MockTarget::builder()
                .enumerate_delay(Duration::from_millis(50))
                .module(module("/usr/share/dotnet/libcoreclr.so", 0x7f10_0000_0000))
                .build(),
        );
        let session = Arc::new(TargetSession::new(target.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.runtimes().unwrap().as_ptr() as usize)
            })
            .collect();

        let addresses: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addresses.iter().all(|&a| a == addresses[0]));
        assert_eq!(session.runtimes().unwrap().len(), 1);
        assert_eq!(target.enumerate_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_find_module() {
        let target = MockTarget::builder()
            .module(module(r"C:\app\a.dll", 0x1000))
            .module(module(r"C:\app\b.dll", 0x4000))
            .build();
        let session = TargetSession::new(Arc::new(target));

        assert_eq!(
            session.find_module(0x1800).unwrap().unwrap().file_name(),
            "a.dll"
        );
        assert_eq!(
            session.find_module(0x4000).unwrap().unwrap().file_name(),
            "b.dll"
        );
        assert!(session.find_module(0x2800).unwrap().is_none());
        assert!(session.find_module(0x500).unwrap().is_none());
    }

    #[test]
    fn test_module_by_name_ignores_case() {
        let target = MockTarget::builder()
            .module(module(r"C:\Windows\Microsoft.NET\Framework64\v4.0.30319\clr.dll", 0x1000))
            .build();
        let session = TargetSession::new(Arc::new(target));

        let found = session.module_by_name("CLR.DLL").unwrap().unwrap();
        assert_eq!(found.base_address, 0x1000);
        assert!(found.is_runtime);
        assert_eq!(
            found.directory(),
            Some(r"C:\Windows\Microsoft.NET\Framework64\v4.0.30319")
        );
    }

    #[test]
    fn test_read_pointer_respects_pointer_size() {
        let target = MockTarget::builder()
            .pointer_size(4)
            .memory(0x1000, vec![0x78, 0x56, 0x34, 0x12, 0xFF, 0xFF, 0xFF, 0xFF])
            .build();
        let session = TargetSession::new(Arc::new(target));

        assert_eq!(session.read_pointer(0x1000).unwrap(), 0x12345678);
        assert!(session.read_u64(0x1004).is_err());
    }

    #[test]
    fn test_drop_closes_reader() {
        let target = Arc::new(MockTarget::builder().build());
        let session = TargetSession::new(target.clone());
        drop(session);
        assert!(target.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_architecture_machine_round_trip() {
        for arch in [
            Architecture::X86,
            Architecture::Amd64,
            Architecture::Arm,
            Architecture::Arm64,
        ] {
            assert_eq!(Architecture::from_machine_type(arch.machine_type()), arch);
        }
        assert_eq!(Architecture::Amd64.pointer_size(), Some(8));
        assert_eq!(Architecture::Unknown.pointer_size(), None);
    }
}
