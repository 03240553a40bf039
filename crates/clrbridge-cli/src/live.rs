//! Live process reader.
//!
//! Reads a running process through `ReadProcessMemory` and enumerates its
//! modules with the process status API. Module timestamps come from the
//! mapped PE header, file versions from the image on disk.

use std::ffi::c_void;
use std::path::Path;

use clrbridge::image::{BinaryInspector, FileInspector, pe_header_timestamp};
use clrbridge::{Architecture, Error, ModuleInfo, Result, TargetReader};
use tracing::debug;
use windows::Win32::Foundation::{CloseHandle, HANDLE, HMODULE};
use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows::Win32::System::ProcessStatus::{
    EnumProcessModulesEx, GetModuleFileNameExW, GetModuleInformation, LIST_MODULES_ALL,
    MODULEINFO,
};
use windows::Win32::System::Threading::{
    IsWow64Process, OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};
use windows::core::BOOL;

/// Bytes read from each module base to find its COFF timestamp.
const HEADER_PAGE: usize = 0x1000;

/// A process opened for reading.
pub struct ProcessReader {
    handle: HANDLE,
    pid: u32,
    architecture: Architecture,
}

// The handle is only passed to thread-safe kernel calls.
unsafe impl Send for ProcessReader {}
unsafe impl Sync for ProcessReader {}

impl ProcessReader {
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe {
            OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid)
        }
        .map_err(|e| Error::Library(format!("OpenProcess({pid}) failed: {e}")))?;

        let mut wow64 = BOOL::default();
        let architecture = match unsafe { IsWow64Process(handle, &mut wow64) } {
            Ok(()) if wow64.as_bool() => Architecture::X86,
            _ => Architecture::host(),
        };

        debug!("Opened process {} ({})", pid, architecture);
        Ok(Self {
            handle,
            pid,
            architecture,
        })
    }

    fn module_handles(&self) -> Result<Vec<HMODULE>> {
        let mut modules = vec![HMODULE::default(); 256];
        loop {
            let mut needed = 0u32;
            unsafe {
                EnumProcessModulesEx(
                    self.handle,
                    modules.as_mut_ptr(),
                    std::mem::size_of_val(modules.as_slice()) as u32,
                    &mut needed,
                    LIST_MODULES_ALL,
                )
            }
            .map_err(|e| Error::Library(format!("EnumProcessModulesEx failed: {e}")))?;

            let count = needed as usize / std::mem::size_of::<HMODULE>();
            if count <= modules.len() {
                modules.truncate(count);
                return Ok(modules);
            }
            modules.resize(count, HMODULE::default());
        }
    }

    fn module_info(&self, module: HMODULE) -> Option<ModuleInfo> {
        let mut path_buf = [0u16; 1024];
        let len = unsafe { GetModuleFileNameExW(Some(self.handle), Some(module), &mut path_buf) };
        if len == 0 {
            return None;
        }
        let path = String::from_utf16_lossy(&path_buf[..len as usize]);

        let mut info = MODULEINFO::default();
        if let Err(e) = unsafe {
            GetModuleInformation(
                self.handle,
                module,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            )
        } {
            debug!("GetModuleInformation({}) failed: {}", path, e);
            return None;
        }

        let base_address = info.lpBaseOfDll as u64;
        let mut header = vec![0u8; HEADER_PAGE];
        let timestamp = match self.read_memory(base_address, &mut header) {
            Ok(n) => pe_header_timestamp(&header[..n]).unwrap_or(0),
            Err(_) => 0,
        };

        let file_version = FileInspector
            .inspect(Path::new(&path))
            .ok()
            .and_then(|image| image.file_version);

        Some(ModuleInfo {
            path,
            base_address,
            size: u64::from(info.SizeOfImage),
            timestamp,
            file_version,
        })
    }
}

impl TargetReader for ProcessReader {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        let mut bytes_read = 0usize;
        let result = unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                Some(&mut bytes_read),
            )
        };

        match result {
            Ok(()) => Ok(bytes_read),
            Err(_) if bytes_read > 0 => Ok(bytes_read),
            Err(e) => Err(Error::MemoryReadFailed {
                address,
                message: e.to_string(),
            }),
        }
    }

    fn pointer_size(&self) -> u32 {
        self.architecture.pointer_size().unwrap_or(8)
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn enumerate_modules(&self) -> Result<Vec<ModuleInfo>> {
        Ok(self
            .module_handles()?
            .into_iter()
            .filter_map(|module| self.module_info(module))
            .collect())
    }

    fn is_snapshot(&self) -> bool {
        false
    }

    fn supports_concurrent_reads(&self) -> bool {
        true
    }
}

impl Drop for ProcessReader {
    fn drop(&mut self) {
        debug!("Closing process {}", self.pid);
        let _ = unsafe { CloseHandle(self.handle) };
    }
}
