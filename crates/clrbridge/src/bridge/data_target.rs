//! `ICLRDataTarget` and its companion interfaces, implemented over a target
//! session for the DAC to call back into.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};
use uguid::{Guid, guid};

use super::com::{ComObjectBuilder, HResult, context};
use crate::dac::{BinaryLocator, BinaryRequest};
use crate::image;
use crate::runtime::VersionInfo;
use crate::target::{ModuleRecord, TargetReader, TargetSession, file_name_of};
use crate::{Error, Result};

pub const IID_ICLR_DATA_TARGET: Guid = guid!("3e11ccee-d08b-43e5-af01-32717a64da03");
pub const IID_ICLR_METADATA_LOCATOR: Guid = guid!("aa8fa804-bc05-4642-b2c5-c353ed22fc63");
pub const IID_ICLR_RUNTIME_LOCATOR: Guid = guid!("b760bf44-9377-4597-8be7-58083bdc5146");

/// Address type used across the DAC interfaces
pub type ClrDataAddress = u64;

/// State shared by every callback of one data target.
pub struct DataTargetContext {
    reader: Arc<dyn TargetReader>,
    locator: Arc<dyn BinaryLocator>,
    modules: Vec<ModuleRecord>,
    pointer_size: u32,
    machine_type: u16,
    runtime_base: u64,
}

impl DataTargetContext {
    pub fn runtime_base(&self) -> u64 {
        self.runtime_base
    }

    fn image_base(&self, name: &str) -> Option<u64> {
        let name = file_name_of(name);
        self.modules
            .iter()
            .find(|m| m.file_name().eq_ignore_ascii_case(name))
            .map(|m| m.base_address)
    }

    fn read(&self, address: u64, buf: &mut [u8]) -> Option<usize> {
        let address = if self.pointer_size == 4 {
            address & 0xFFFF_FFFF
        } else {
            address
        };

        match self.reader.read_memory(address, buf) {
            Ok(read) if read > 0 => Some(read),
            Ok(_) => None,
            Err(e) => {
                trace!("ReadVirtual {:#x} failed: {}", address, e);
                None
            }
        }
    }

    fn metadata(
        &self,
        image_path: &str,
        timestamp: u32,
        size: u32,
        rva: u32,
        max_len: usize,
    ) -> Result<image::Metadata> {
        let path = self.find_image(image_path, timestamp, size)?;
        image::read_metadata(&path, rva, max_len)
    }

    fn find_image(&self, image_path: &str, timestamp: u32, size: u32) -> Result<PathBuf> {
        let request = BinaryRequest {
            file_name: file_name_of(image_path).to_string(),
            timestamp,
            file_size: size as u64,
            version: VersionInfo::default(),
        };

        match self.locator.locate(&request) {
            Ok(Some(path)) => return Ok(path),
            Ok(None) => {}
            Err(e) => debug!("Locator failed for {}: {}", request, e),
        }

        // The image the target loaded may also be present on this host.
        let local = Path::new(image_path);
        if local.is_file() {
            return Ok(local.to_path_buf());
        }
        Err(Error::NotFound(request.file_name))
    }
}

/// Builder for a data target over `session`, with every interface sealed.
///
/// Callers may `retain` further values before building.
pub fn data_target_builder(
    session: &TargetSession,
    runtime_base: u64,
) -> Result<ComObjectBuilder<DataTargetContext>> {
    let context = DataTargetContext {
        reader: session.reader().clone(),
        locator: session.locator().clone(),
        modules: session.modules()?.to_vec(),
        pointer_size: session.pointer_size(),
        machine_type: session.architecture().machine_type(),
        runtime_base,
    };

    let mut builder = ComObjectBuilder::new(context);

    builder
        .add_interface(IID_ICLR_DATA_TARGET)
        .add_method(dt_get_machine_type as GetU32Fn)?
        .add_method(dt_get_pointer_size as GetU32Fn)?
        .add_method(dt_get_image_base as GetImageBaseFn)?
        .add_method(dt_read_virtual as ReadVirtualFn)?
        .add_method(dt_write_virtual as WriteVirtualFn)?
        .add_method(dt_get_tls_value as GetTlsValueFn)?
        .add_method(dt_set_tls_value as SetTlsValueFn)?
        .add_method(dt_get_current_thread_id as GetU32Fn)?
        .add_method(dt_get_thread_context as GetThreadContextFn)?
        .add_method(dt_set_thread_context as SetThreadContextFn)?
        .add_method(dt_request as RequestFn)?
        .complete()?;

    builder
        .add_interface(IID_ICLR_METADATA_LOCATOR)
        .add_method(ml_get_metadata as GetMetadataFn)?
        .complete()?;

    builder
        .add_interface(IID_ICLR_RUNTIME_LOCATOR)
        .add_method(rl_get_runtime_base as GetRuntimeBaseFn)?
        .complete()?;

    Ok(builder)
}

// =============================================================================
// Signatures
// =============================================================================

type GetU32Fn = unsafe extern "system" fn(*mut c_void, *mut u32) -> HResult;
type GetImageBaseFn =
    unsafe extern "system" fn(*mut c_void, *const u16, *mut ClrDataAddress) -> HResult;
type ReadVirtualFn =
    unsafe extern "system" fn(*mut c_void, ClrDataAddress, *mut u8, u32, *mut u32) -> HResult;
type WriteVirtualFn =
    unsafe extern "system" fn(*mut c_void, ClrDataAddress, *const u8, u32, *mut u32) -> HResult;
type GetTlsValueFn =
    unsafe extern "system" fn(*mut c_void, u32, u32, *mut ClrDataAddress) -> HResult;
type SetTlsValueFn = unsafe extern "system" fn(*mut c_void, u32, u32, ClrDataAddress) -> HResult;
type GetThreadContextFn =
    unsafe extern "system" fn(*mut c_void, u32, u32, u32, *mut u8) -> HResult;
type SetThreadContextFn = unsafe extern "system" fn(*mut c_void, u32, u32, *const u8) -> HResult;
type RequestFn =
    unsafe extern "system" fn(*mut c_void, u32, u32, *const u8, u32, *mut u8) -> HResult;
type GetMetadataFn = unsafe extern "system" fn(
    *mut c_void,
    *const u16,
    u32,
    u32,
    *const Guid,
    u32,
    u32,
    u32,
    *mut u8,
    *mut u32,
) -> HResult;
type GetRuntimeBaseFn = unsafe extern "system" fn(*mut c_void, *mut ClrDataAddress) -> HResult;

unsafe fn wide_str(ptr: *const u16) -> String {
    let len = unsafe {
        let mut len = 0;
        while *ptr.add(len) != 0 {
            len += 1;
        }
        len
    };
    String::from_utf16_lossy(unsafe { std::slice::from_raw_parts(ptr, len) })
}

// =============================================================================
// ICLRDataTarget
// =============================================================================

unsafe extern "system" fn dt_get_machine_type(
    this: *mut c_void,
    machine_type: *mut u32,
) -> HResult {
    let Some(ctx) = (unsafe { context::<DataTargetContext>(this) }) else {
        return HResult::E_POINTER;
    };
    if machine_type.is_null() {
        return HResult::E_POINTER;
    }

    unsafe { *machine_type = ctx.machine_type as u32 };
    HResult::S_OK
}

unsafe extern "system" fn dt_get_pointer_size(
    this: *mut c_void,
    pointer_size: *mut u32,
) -> HResult {
    let Some(ctx) = (unsafe { context::<DataTargetContext>(this) }) else {
        return HResult::E_POINTER;
    };
    if pointer_size.is_null() {
        return HResult::E_POINTER;
    }

    unsafe { *pointer_size = ctx.pointer_size };
    HResult::S_OK
}

unsafe extern "system" fn dt_get_image_base(
    this: *mut c_void,
    image_path: *const u16,
    base_address: *mut ClrDataAddress,
) -> HResult {
    let Some(ctx) = (unsafe { context::<DataTargetContext>(this) }) else {
        return HResult::E_POINTER;
    };
    if image_path.is_null() || base_address.is_null() {
        return HResult::E_POINTER;
    }

    let name = unsafe { wide_str(image_path) };
    match ctx.image_base(&name) {
        Some(base) => {
            unsafe { *base_address = base };
            HResult::S_OK
        }
        None => {
            debug!("GetImageBase: {} not loaded", name);
            HResult::E_FAIL
        }
    }
}

unsafe extern "system" fn dt_read_virtual(
    this: *mut c_void,
    address: ClrDataAddress,
    buffer: *mut u8,
    bytes_requested: u32,
    bytes_read: *mut u32,
) -> HResult {
    let Some(ctx) = (unsafe { context::<DataTargetContext>(this) }) else {
        return HResult::E_POINTER;
    };
    if buffer.is_null() && bytes_requested > 0 {
        return HResult::E_POINTER;
    }

    let buf = if bytes_requested == 0 {
        &mut [][..]
    } else {
        unsafe { std::slice::from_raw_parts_mut(buffer, bytes_requested as usize) }
    };

    let (hr, read) = match ctx.read(address, buf) {
        Some(read) => (HResult::S_OK, read as u32),
        None => (HResult::E_FAIL, 0),
    };
    if !bytes_read.is_null() {
        unsafe { *bytes_read = read };
    }
    hr
}

// The target is never modified.
unsafe extern "system" fn dt_write_virtual(
    _this: *mut c_void,
    _address: ClrDataAddress,
    _buffer: *const u8,
    _bytes_requested: u32,
    bytes_written: *mut u32,
) -> HResult {
    if !bytes_written.is_null() {
        unsafe { *bytes_written = 0 };
    }
    HResult::E_NOTIMPL
}

unsafe extern "system" fn dt_get_tls_value(
    _this: *mut c_void,
    _thread_id: u32,
    _index: u32,
    _value: *mut ClrDataAddress,
) -> HResult {
    HResult::E_NOTIMPL
}

unsafe extern "system" fn dt_set_tls_value(
    _this: *mut c_void,
    _thread_id: u32,
    _index: u32,
    _value: ClrDataAddress,
) -> HResult {
    HResult::E_NOTIMPL
}

unsafe extern "system" fn dt_get_current_thread_id(
    _this: *mut c_void,
    _thread_id: *mut u32,
) -> HResult {
    HResult::E_NOTIMPL
}

unsafe extern "system" fn dt_get_thread_context(
    this: *mut c_void,
    thread_id: u32,
    context_flags: u32,
    context_size: u32,
    thread_context: *mut u8,
) -> HResult {
    let Some(ctx) = (unsafe { context::<DataTargetContext>(this) }) else {
        return HResult::E_POINTER;
    };
    if thread_context.is_null() {
        return HResult::E_POINTER;
    }

    let buf = unsafe { std::slice::from_raw_parts_mut(thread_context, context_size as usize) };
    match ctx.reader.thread_context(thread_id, context_flags, buf) {
        Ok(()) => HResult::S_OK,
        Err(Error::Unsupported(_)) => HResult::E_NOTIMPL,
        Err(e) => {
            debug!("GetThreadContext({}) failed: {}", thread_id, e);
            HResult::E_FAIL
        }
    }
}

unsafe extern "system" fn dt_set_thread_context(
    _this: *mut c_void,
    _thread_id: u32,
    _context_size: u32,
    _thread_context: *const u8,
) -> HResult {
    HResult::E_NOTIMPL
}

unsafe extern "system" fn dt_request(
    _this: *mut c_void,
    _req_code: u32,
    _in_buffer_size: u32,
    _in_buffer: *const u8,
    _out_buffer_size: u32,
    _out_buffer: *mut u8,
) -> HResult {
    HResult::E_NOTIMPL
}

// =============================================================================
// ICLRMetadataLocator
// =============================================================================

unsafe extern "system" fn ml_get_metadata(
    this: *mut c_void,
    image_path: *const u16,
    image_timestamp: u32,
    image_size: u32,
    _mvid: *const Guid,
    md_rva: u32,
    _flags: u32,
    buffer_size: u32,
    buffer: *mut u8,
    data_size: *mut u32,
) -> HResult {
    let Some(ctx) = (unsafe { context::<DataTargetContext>(this) }) else {
        return HResult::E_POINTER;
    };
    if image_path.is_null() || (buffer.is_null() && buffer_size > 0) {
        return HResult::E_POINTER;
    }

    let name = unsafe { wide_str(image_path) };
    let result = ctx.metadata(
        &name,
        image_timestamp,
        image_size,
        md_rva,
        buffer_size as usize,
    );
    let metadata = match result {
        Ok(metadata) => metadata,
        Err(e) => {
            debug!("GetMetadata({}) failed: {}", name, e);
            return HResult::E_FAIL;
        }
    };

    let bytes = &metadata.bytes;
    if !bytes.is_empty() {
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer, bytes.len()) };
    }
    if !data_size.is_null() {
        // An empty buffer asks for the size only.
        let size = if buffer_size == 0 {
            metadata.total_size
        } else {
            bytes.len()
        };
        unsafe { *data_size = size as u32 };
    }
    HResult::S_OK
}

// =============================================================================
// ICLRRuntimeLocator
// =============================================================================

unsafe extern "system" fn rl_get_runtime_base(
    this: *mut c_void,
    base_address: *mut ClrDataAddress,
) -> HResult {
    let Some(ctx) = (unsafe { context::<DataTargetContext>(this) }) else {
        return HResult::E_POINTER;
    };
    if base_address.is_null() {
        return HResult::E_POINTER;
    }

    unsafe { *base_address = ctx.runtime_base };
    HResult::S_OK
}
