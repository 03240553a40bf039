//! Loading native libraries.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result};

/// A loaded native module, unloaded on drop.
pub struct NativeLibrary {
    handle: *mut c_void,
    path: PathBuf,
}

// Module handles are process-wide and may be used from any thread.
unsafe impl Send for NativeLibrary {}
unsafe impl Sync for NativeLibrary {}

impl NativeLibrary {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> *mut c_void {
        self.handle
    }
}

#[cfg(windows)]
impl NativeLibrary {
    pub fn load(path: &Path) -> Result<Self> {
        use std::os::windows::ffi::OsStrExt;
        use windows::Win32::System::LibraryLoader::LoadLibraryW;
        use windows::core::PCWSTR;

        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let module = unsafe { LoadLibraryW(PCWSTR(wide.as_ptr())) }
            .map_err(|e| Error::Library(format!("{}: {}", path.display(), e)))?;

        debug!("Loaded {} at {:p}", path.display(), module.0);
        Ok(Self {
            handle: module.0,
            path: path.to_path_buf(),
        })
    }

    /// Address of an exported symbol.
    pub fn symbol(&self, name: &str) -> Option<*const c_void> {
        use windows::Win32::Foundation::HMODULE;
        use windows::Win32::System::LibraryLoader::GetProcAddress;
        use windows::core::PCSTR;

        let name = std::ffi::CString::new(name).ok()?;
        let proc =
            unsafe { GetProcAddress(HMODULE(self.handle), PCSTR(name.as_ptr() as *const u8)) }?;
        Some(proc as *const c_void)
    }

    fn unload(&self) {
        use windows::Win32::Foundation::{FreeLibrary, HMODULE};

        if let Err(e) = unsafe { FreeLibrary(HMODULE(self.handle)) } {
            debug!("FreeLibrary({}) failed: {}", self.path.display(), e);
        }
    }
}

#[cfg(unix)]
impl NativeLibrary {
    pub fn load(path: &Path) -> Result<Self> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::Library(format!("{}: path contains NUL", path.display())))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(Error::Library(format!("{}: {}", path.display(), dl_error())));
        }

        debug!("Loaded {} at {:p}", path.display(), handle);
        Ok(Self {
            handle,
            path: path.to_path_buf(),
        })
    }

    /// Address of an exported symbol.
    pub fn symbol(&self, name: &str) -> Option<*const c_void> {
        let name = std::ffi::CString::new(name).ok()?;
        let sym = unsafe { libc::dlsym(self.handle, name.as_ptr()) };
        if sym.is_null() {
            None
        } else {
            Some(sym as *const c_void)
        }
    }

    fn unload(&self) {
        if unsafe { libc::dlclose(self.handle) } != 0 {
            debug!("dlclose({}) failed: {}", self.path.display(), dl_error());
        }
    }
}

#[cfg(unix)]
fn dl_error() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown error".into()
    } else {
        unsafe { std::ffi::CStr::from_ptr(msg) }
            .to_string_lossy()
            .into_owned()
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        debug!("Unloading {}", self.path.display());
        self.unload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_library() {
        let err = NativeLibrary::load(Path::new("/nonexistent/libmscordaccore.so")).err();
        assert!(matches!(err, Some(Error::Library(_))));
    }

    #[test]
    fn test_load_non_library_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libmscordaccore.so");
        std::fs::write(&path, b"not a shared object").unwrap();

        let err = NativeLibrary::load(&path).err();
        assert!(matches!(err, Some(Error::Library(_))));
    }
}
