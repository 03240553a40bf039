//! The loaded DAC and the process interface it hands out.

use std::ffi::c_void;
use std::fmt;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use tracing::{debug, info};
use uguid::Guid;

use super::com::{ComObject, ComRef, HResult};
use super::data_target::{DataTargetContext, IID_ICLR_DATA_TARGET, data_target_builder};
use super::library::NativeLibrary;
use super::{IID_ISOS_DAC_INTERFACE, IID_IXCLR_DATA_PROCESS};
use crate::image::ImageInfo;
use crate::target::TargetSession;
use crate::{Error, Result};

/// `CLRDataCreateInstance` export of every DAC.
type ClrDataCreateInstanceFn =
    unsafe extern "system" fn(*const Guid, *mut c_void, *mut *mut c_void) -> HResult;

/// `DAC_PAL_InitializeDLL` export of non-Windows DACs.
#[cfg(not(windows))]
type PalInitializeFn = unsafe extern "C" fn() -> i32;

type FlushFn = unsafe extern "system" fn(*mut c_void) -> HResult;
type RequestFn =
    unsafe extern "system" fn(*mut c_void, u32, u32, *const u8, u32, *mut u8) -> HResult;

const FLUSH_SLOT: usize = 3;
const REQUEST_SLOT: usize = 33;

// =============================================================================
// ClrDataProcess
// =============================================================================

/// The DAC's `IXCLRDataProcess` interface.
pub struct ClrDataProcess {
    com: ComRef,
}

impl ClrDataProcess {
    pub fn as_raw(&self) -> *mut c_void {
        self.com.as_raw()
    }

    /// Drop the DAC's cached view of target memory.
    pub fn flush(&self) -> Result<()> {
        let hr = unsafe {
            let flush: FlushFn = std::mem::transmute(self.com.slot(FLUSH_SLOT));
            flush(self.as_raw())
        };
        hr.ok("IXCLRDataProcess::Flush")
    }

    /// Issue a private DAC request.
    pub fn request(&self, code: u32, input: &[u8], output: &mut [u8]) -> Result<()> {
        let hr = unsafe {
            let request: RequestFn = std::mem::transmute(self.com.slot(REQUEST_SLOT));
            request(
                self.as_raw(),
                code,
                input.len() as u32,
                if input.is_empty() {
                    ptr::null()
                } else {
                    input.as_ptr()
                },
                output.len() as u32,
                if output.is_empty() {
                    ptr::null_mut()
                } else {
                    output.as_mut_ptr()
                },
            )
        };
        hr.ok("IXCLRDataProcess::Request")
    }

    pub fn query_interface(&self, iid: &Guid) -> Result<ComRef> {
        self.com.query_interface(iid)
    }

    /// `ISOSDacInterface`, present on DACs for 4.5 and later runtimes.
    pub fn sos_interface(&self) -> Option<ComRef> {
        self.query_interface(&IID_ISOS_DAC_INTERFACE).ok()
    }
}

// =============================================================================
// DacLibrary
// =============================================================================

/// A mapped DAC module. Synthetic objects the DAC can still call hold one.
pub trait DacModule: Send + Sync {
    fn path(&self) -> &Path;
}

impl DacModule for NativeLibrary {
    fn path(&self) -> &Path {
        NativeLibrary::path(self)
    }
}

/// A loaded DAC with the data target it was created against.
///
/// Teardown releases the process interface, then the host's reference to the
/// data target, then the module. Every synthetic object also holds the module,
/// so it stays mapped until the DAC has released its last callback object.
///
/// A DAC adopted through [`from_process`](Self::from_process) has neither a
/// data target nor a module of its own; the host that created it owns both.
pub struct DacLibrary {
    process: Option<ClrDataProcess>,
    data_target: Option<ComObject<DataTargetContext>>,
    module: Option<Arc<dyn DacModule>>,
}

impl DacLibrary {
    /// Load the DAC at `path` and create its process interface.
    ///
    /// `image` is the already validated header of `path`.
    pub fn load(
        session: &TargetSession,
        path: &Path,
        image: &ImageInfo,
        runtime_base: u64,
    ) -> Result<Self> {
        let host_pointer_size = std::mem::size_of::<usize>() as u32;
        if image.pointer_size != host_pointer_size {
            return Err(Error::ArchitectureMismatch {
                expected: host_pointer_size,
                actual: image.pointer_size,
            });
        }

        let library = Arc::new(NativeLibrary::load(path)?);
        initialize_pal(&library)?;

        let create = library
            .symbol("CLRDataCreateInstance")
            .ok_or_else(|| {
                Error::Library(format!("{}: missing CLRDataCreateInstance", path.display()))
            })?;
        let create: ClrDataCreateInstanceFn = unsafe { std::mem::transmute(create) };

        let dac = Self::create(session, runtime_base, library, |iid, target, out| unsafe {
            create(iid, target, out)
        })?;
        info!("Loaded DAC {}", path.display());
        Ok(dac)
    }

    /// Build the data target, hand it to `create_instance` and wrap the
    /// `IXCLRDataProcess` it returns.
    pub(crate) fn create<F>(
        session: &TargetSession,
        runtime_base: u64,
        module: Arc<dyn DacModule>,
        create_instance: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Guid, *mut c_void, &mut *mut c_void) -> HResult,
    {
        let mut builder = data_target_builder(session, runtime_base)?;
        builder.retain(module.clone());
        let data_target = builder.build()?;

        let iface = data_target
            .as_interface(&IID_ICLR_DATA_TARGET)
            .ok_or_else(|| Error::InvalidState("data target has no ICLRDataTarget".into()))?;

        let mut out: *mut c_void = ptr::null_mut();
        create_instance(&IID_IXCLR_DATA_PROCESS, iface, &mut out).ok("CLRDataCreateInstance")?;

        let com = unsafe { ComRef::from_raw(out) }
            .ok_or_else(|| Error::InvalidState("CLRDataCreateInstance returned null".into()))?;

        Ok(Self {
            process: Some(ClrDataProcess { com }),
            data_target: Some(data_target),
            module: Some(module),
        })
    }

    /// Adopt a process interface the host created from its own DAC.
    ///
    /// `process` may be any interface of the DAC's process object.
    pub fn from_process(process: &ComRef) -> Result<Self> {
        let com = process.query_interface(&IID_IXCLR_DATA_PROCESS)?;
        Ok(Self {
            process: Some(ClrDataProcess { com }),
            data_target: None,
            module: None,
        })
    }

    /// Path of the DAC module, unless it belongs to the host.
    pub fn path(&self) -> Option<&Path> {
        self.module.as_deref().map(|module| module.path())
    }

    pub fn process(&self) -> Result<&ClrDataProcess> {
        self.process
            .as_ref()
            .ok_or_else(|| Error::InvalidState("DAC library is disposed".into()))
    }

    /// References currently held on the data target, the host's included.
    pub fn data_target_refs(&self) -> u32 {
        self.data_target.as_ref().map_or(0, |dt| dt.ref_count())
    }
}

impl fmt::Display for DacLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path() {
            Some(path) => write!(f, "{}", path.display()),
            None => f.write_str("<host DAC>"),
        }
    }
}

impl Drop for DacLibrary {
    fn drop(&mut self) {
        debug!("Releasing DAC {}", self);
        drop(self.process.take());
        drop(self.data_target.take());
        drop(self.module.take());
    }
}

#[cfg(not(windows))]
fn initialize_pal(library: &NativeLibrary) -> Result<()> {
    let Some(init) = library.symbol("DAC_PAL_InitializeDLL") else {
        return Ok(());
    };

    let init: PalInitializeFn = unsafe { std::mem::transmute(init) };
    let result = unsafe { init() };
    if result != 0 {
        return Err(Error::Hresult {
            context: "DAC_PAL_InitializeDLL",
            hr: result as u32,
        });
    }
    debug!("Initialized DAC PAL");
    Ok(())
}

#[cfg(windows)]
fn initialize_pal(_library: &NativeLibrary) -> Result<()> {
    Ok(())
}
