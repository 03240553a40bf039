//! Synthetic COM objects.
//!
//! The DAC calls back into the host through objects shaped like COM
//! interfaces: a pointer to a vtable whose first three slots are
//! `QueryInterface`, `AddRef` and `Release`. [`ComObjectBuilder`] assembles
//! such an object from plain `extern "system"` functions, one
//! [`VTableBuilder`] per interface, and hands back a [`ComObject`] holding the
//! host's reference.
//!
//! Callbacks recover their context with [`context`]. Reference counting is a
//! single atomic per object and no callback takes a lock, so the DAC may
//! reenter the host from inside a callback.

use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;
use uguid::{Guid, guid};

use crate::{Error, Result};

// =============================================================================
// HRESULT and IIDs
// =============================================================================

/// A COM status code.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HResult(pub i32);

impl HResult {
    pub const S_OK: HResult = HResult(0);
    pub const S_FALSE: HResult = HResult(1);
    pub const E_NOTIMPL: HResult = HResult(0x8000_4001_u32 as i32);
    pub const E_NOINTERFACE: HResult = HResult(0x8000_4002_u32 as i32);
    pub const E_POINTER: HResult = HResult(0x8000_4003_u32 as i32);
    pub const E_FAIL: HResult = HResult(0x8000_4005_u32 as i32);
    pub const E_INVALIDARG: HResult = HResult(0x8007_0057_u32 as i32);

    pub fn is_ok(self) -> bool {
        self.0 >= 0
    }

    pub fn code(self) -> u32 {
        self.0 as u32
    }

    /// Convert a failure code into [`Error::Hresult`].
    pub fn ok(self, context: &'static str) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(Error::Hresult {
                context,
                hr: self.code(),
            })
        }
    }
}

impl fmt::Debug for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HResult(0x{:08X})", self.code())
    }
}

pub const IID_IUNKNOWN: Guid = guid!("00000000-0000-0000-c000-000000000046");

// =============================================================================
// Method signatures
// =============================================================================

/// ABI category of a parameter or return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiKind {
    /// Pointers and pointer-sized integers
    Address,
    Integer,
    Float,
    Status,
}

/// A type that may appear in a vtable method signature.
pub trait AbiParam {
    const KIND: AbiKind;
}

impl<T> AbiParam for *mut T {
    const KIND: AbiKind = AbiKind::Address;
}

impl<T> AbiParam for *const T {
    const KIND: AbiKind = AbiKind::Address;
}

impl AbiParam for HResult {
    const KIND: AbiKind = AbiKind::Status;
}

macro_rules! abi_param {
    ($kind:ident: $($ty:ty),*) => {
        $(impl AbiParam for $ty {
            const KIND: AbiKind = AbiKind::$kind;
        })*
    };
}

abi_param!(Address: usize, isize);
abi_param!(Integer: u8, u16, u32, u64, i8, i16, i32, i64);
abi_param!(Float: f32, f64);

/// An `extern "system"` function that can occupy a vtable slot.
pub trait ComMethod: Copy {
    fn params() -> Vec<AbiKind>;
    fn ret() -> AbiKind;
    fn as_ptr(self) -> *const c_void;
}

macro_rules! com_method {
    ($($arg:ident),*) => {
        impl<R: AbiParam, $($arg: AbiParam),*> ComMethod for unsafe extern "system" fn($($arg),*) -> R {
            fn params() -> Vec<AbiKind> {
                vec![$($arg::KIND),*]
            }

            fn ret() -> AbiKind {
                R::KIND
            }

            fn as_ptr(self) -> *const c_void {
                self as *const c_void
            }
        }
    };
}

com_method!();
com_method!(A0);
com_method!(A0, A1);
com_method!(A0, A1, A2);
com_method!(A0, A1, A2, A3);
com_method!(A0, A1, A2, A3, A4);
com_method!(A0, A1, A2, A3, A4, A5);
com_method!(A0, A1, A2, A3, A4, A5, A6);
com_method!(A0, A1, A2, A3, A4, A5, A6, A7);
com_method!(A0, A1, A2, A3, A4, A5, A6, A7, A8);
com_method!(A0, A1, A2, A3, A4, A5, A6, A7, A8, A9);

fn validate_method<F: ComMethod>(slot: usize) -> Result<()> {
    let params = F::params();
    match params.first() {
        Some(AbiKind::Address) => {}
        Some(kind) => {
            return Err(Error::InvalidMethodSignature {
                slot,
                reason: format!("first parameter must be the object pointer, found {:?}", kind),
            });
        }
        None => {
            return Err(Error::InvalidMethodSignature {
                slot,
                reason: "missing object pointer parameter".into(),
            });
        }
    }

    if F::ret() != AbiKind::Status {
        return Err(Error::InvalidMethodSignature {
            slot,
            reason: format!("return type must be HResult, found {:?}", F::ret()),
        });
    }

    Ok(())
}

// =============================================================================
// Object layout
// =============================================================================

/// What an interface pointer points at. The DAC only ever reads `vtbl`.
#[repr(C)]
struct RawInterface {
    vtbl: *const *const c_void,
    owner: *const c_void,
}

struct ComInner<T> {
    ref_count: AtomicU32,
    context: T,
    /// Interface objects in registration order, with their vtables
    interfaces: Vec<(Guid, Box<RawInterface>, Box<[*const c_void]>)>,
    /// Values kept alive for the object's lifetime
    _arena: Vec<Box<dyn Any + Send + Sync>>,
}

impl<T> ComInner<T> {
    fn find(&self, iid: &Guid) -> Option<*mut c_void> {
        let (_, iface, _) = if *iid == IID_IUNKNOWN {
            self.interfaces.first()?
        } else {
            self.interfaces.iter().find(|(id, _, _)| id == iid)?
        };
        Some(&**iface as *const RawInterface as *mut c_void)
    }
}

unsafe fn inner<'a, T>(this: *mut c_void) -> Option<&'a ComInner<T>> {
    if this.is_null() {
        return None;
    }
    let iface = unsafe { &*(this as *const RawInterface) };
    let owner = iface.owner as *const ComInner<T>;
    if owner.is_null() {
        None
    } else {
        Some(unsafe { &*owner })
    }
}

/// Context of the object behind an interface pointer.
///
/// # Safety
/// `this` must be an interface pointer produced by a [`ComObject<T>`] of the
/// same `T` that is still alive.
pub unsafe fn context<'a, T>(this: *mut c_void) -> Option<&'a T> {
    unsafe { inner::<T>(this) }.map(|inner| &inner.context)
}

/// Read a vtable slot of a COM interface pointer.
///
/// # Safety
/// `this` must point to a live COM object with at least `slot + 1` entries.
pub unsafe fn vtable_slot(this: *mut c_void, slot: usize) -> *const c_void {
    unsafe {
        let vtbl = *(this as *const *const *const c_void);
        *vtbl.add(slot)
    }
}

// =============================================================================
// IUnknown
// =============================================================================

unsafe extern "system" fn com_query_interface<T>(
    this: *mut c_void,
    riid: *const Guid,
    ppv_object: *mut *mut c_void,
) -> HResult {
    if ppv_object.is_null() {
        return HResult::E_POINTER;
    }
    unsafe { *ppv_object = ptr::null_mut() };

    if riid.is_null() {
        return HResult::E_INVALIDARG;
    }
    let Some(inner) = (unsafe { inner::<T>(this) }) else {
        return HResult::E_POINTER;
    };

    match inner.find(unsafe { &*riid }) {
        Some(iface) => {
            inner.ref_count.fetch_add(1, Ordering::SeqCst);
            unsafe { *ppv_object = iface };
            HResult::S_OK
        }
        None => HResult::E_NOINTERFACE,
    }
}

unsafe extern "system" fn com_add_ref<T>(this: *mut c_void) -> u32 {
    match unsafe { inner::<T>(this) } {
        Some(inner) => inner.ref_count.fetch_add(1, Ordering::SeqCst) + 1,
        None => 0,
    }
}

unsafe extern "system" fn com_release<T>(this: *mut c_void) -> u32 {
    let Some(inner) = (unsafe { inner::<T>(this) }) else {
        return 0;
    };
    unsafe { release_inner(inner as *const ComInner<T>) }
}

/// Drop one reference; frees the object on the 1 -> 0 transition.
unsafe fn release_inner<T>(inner: *const ComInner<T>) -> u32 {
    let previous = unsafe { &*inner }.ref_count.fetch_sub(1, Ordering::SeqCst);
    if previous == 1 {
        trace!("Disposing synthetic COM object {:p}", inner);
        drop(unsafe { Box::from_raw(inner as *mut ComInner<T>) });
    }
    previous.saturating_sub(1)
}

// =============================================================================
// Builders
// =============================================================================

/// Assembles a [`ComObject`] exposing one or more interfaces.
pub struct ComObjectBuilder<T> {
    context: T,
    interfaces: Vec<(Guid, Box<[*const c_void]>)>,
    arena: Vec<Box<dyn Any + Send + Sync>>,
    unsealed: usize,
}

impl<T: Send + Sync + 'static> ComObjectBuilder<T> {
    pub fn new(context: T) -> Self {
        Self {
            context,
            interfaces: Vec::new(),
            arena: Vec::new(),
            unsealed: 0,
        }
    }

    /// Keep `value` alive until the object is disposed.
    pub fn retain<V: Any + Send + Sync>(&mut self, value: V) -> &mut Self {
        self.arena.push(Box::new(value));
        self
    }

    /// Start the vtable for interface `iid`.
    pub fn add_interface(&mut self, iid: Guid) -> VTableBuilder<'_, T> {
        VTableBuilder {
            owner: self,
            iid,
            methods: Vec::new(),
            sealed: false,
        }
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// Create the object with a reference count of 1, owned by the returned
    /// handle.
    pub fn build(self) -> Result<ComObject<T>> {
        if self.unsealed > 0 {
            return Err(Error::InvalidState(format!(
                "{} interface(s) were never completed",
                self.unsealed
            )));
        }
        if self.interfaces.is_empty() {
            return Err(Error::InvalidState("object has no interfaces".into()));
        }

        let interfaces = self
            .interfaces
            .into_iter()
            .map(|(iid, vtable)| {
                let iface = Box::new(RawInterface {
                    vtbl: vtable.as_ptr(),
                    owner: ptr::null(),
                });
                (iid, iface, vtable)
            })
            .collect();

        let raw = Box::into_raw(Box::new(ComInner {
            ref_count: AtomicU32::new(1),
            context: self.context,
            interfaces,
            _arena: self.arena,
        }));

        // Nothing else can see the object until this returns.
        unsafe {
            for (_, iface, _) in (*raw).interfaces.iter_mut() {
                iface.owner = raw as *const c_void;
            }
        }

        trace!("Created synthetic COM object {:p}", raw);
        Ok(ComObject {
            inner: unsafe { NonNull::new_unchecked(raw) },
        })
    }
}

/// Builds the vtable of one interface.
///
/// Methods are appended in slot order after the `IUnknown` triad. A builder
/// dropped without [`complete`](Self::complete) makes the owning object fail
/// to build.
pub struct VTableBuilder<'b, T: Send + Sync + 'static> {
    owner: &'b mut ComObjectBuilder<T>,
    iid: Guid,
    methods: Vec<*const c_void>,
    sealed: bool,
}

impl<T: Send + Sync + 'static> VTableBuilder<'_, T> {
    /// Append the next method.
    pub fn add_method<F: ComMethod>(&mut self, method: F) -> Result<&mut Self> {
        if self.sealed {
            return Err(Error::InvalidState("vtable is already complete".into()));
        }

        validate_method::<F>(3 + self.methods.len())?;
        self.methods.push(method.as_ptr());
        Ok(self)
    }

    /// Write the table and register it with the owning object.
    pub fn complete(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Error::InvalidState("vtable is already complete".into()));
        }
        if self.owner.interfaces.iter().any(|(iid, _)| *iid == self.iid) {
            return Err(Error::InvalidState(format!(
                "interface {} registered twice",
                self.iid
            )));
        }

        let query_interface: unsafe extern "system" fn(
            *mut c_void,
            *const Guid,
            *mut *mut c_void,
        ) -> HResult = com_query_interface::<T>;
        let add_ref: unsafe extern "system" fn(*mut c_void) -> u32 = com_add_ref::<T>;
        let release: unsafe extern "system" fn(*mut c_void) -> u32 = com_release::<T>;

        let mut vtable = Vec::with_capacity(3 + self.methods.len());
        vtable.push(query_interface as *const c_void);
        vtable.push(add_ref as *const c_void);
        vtable.push(release as *const c_void);
        vtable.append(&mut self.methods);

        self.owner
            .interfaces
            .push((self.iid, vtable.into_boxed_slice()));
        self.sealed = true;
        Ok(())
    }
}

impl<T: Send + Sync + 'static> Drop for VTableBuilder<'_, T> {
    fn drop(&mut self) {
        if !self.sealed {
            self.owner.unsealed += 1;
        }
    }
}

// =============================================================================
// ComObject
// =============================================================================

/// The host's reference to a synthetic COM object.
///
/// Dropping it releases that reference; the object itself lives until the
/// DAC has released every reference it took.
pub struct ComObject<T> {
    inner: NonNull<ComInner<T>>,
}

// The object is immutable after build apart from its atomic count, and the
// context and arena are themselves Send + Sync.
unsafe impl<T: Send + Sync> Send for ComObject<T> {}
unsafe impl<T: Send + Sync> Sync for ComObject<T> {}

impl<T> ComObject<T> {
    fn inner(&self) -> &ComInner<T> {
        unsafe { self.inner.as_ref() }
    }

    pub fn context(&self) -> &T {
        &self.inner().context
    }

    /// Interface pointer for `iid` without taking a reference.
    pub fn as_interface(&self, iid: &Guid) -> Option<*mut c_void> {
        self.inner().find(iid)
    }

    /// Interface pointer for `iid` with a new reference the caller must
    /// release through the vtable.
    pub fn query_interface(&self, iid: &Guid) -> Option<*mut c_void> {
        let iface = self.inner().find(iid)?;
        self.inner().ref_count.fetch_add(1, Ordering::SeqCst);
        Some(iface)
    }

    pub fn ref_count(&self) -> u32 {
        self.inner().ref_count.load(Ordering::SeqCst)
    }
}

impl<T> Drop for ComObject<T> {
    fn drop(&mut self) {
        unsafe { release_inner(self.inner.as_ptr() as *const ComInner<T>) };
    }
}

// =============================================================================
// Foreign interfaces
// =============================================================================

type QueryInterfaceFn =
    unsafe extern "system" fn(*mut c_void, *const Guid, *mut *mut c_void) -> HResult;
type ReleaseFn = unsafe extern "system" fn(*mut c_void) -> u32;

/// An owned reference to an interface implemented on the other side, such as
/// one returned by the DAC. Released on drop.
pub struct ComRef {
    ptr: NonNull<c_void>,
}

// COM objects handed out by the DAC are free-threaded.
unsafe impl Send for ComRef {}
unsafe impl Sync for ComRef {}

impl ComRef {
    /// Take ownership of one reference to `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live COM interface pointer whose reference the caller
    /// owns.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }

    /// Method pointer at `slot` of this interface's vtable.
    ///
    /// # Safety
    /// The interface must have at least `slot + 1` entries.
    pub unsafe fn slot(&self, slot: usize) -> *const c_void {
        unsafe { vtable_slot(self.as_raw(), slot) }
    }

    pub fn query_interface(&self, iid: &Guid) -> Result<ComRef> {
        let mut out: *mut c_void = ptr::null_mut();
        let hr = unsafe {
            let qi: QueryInterfaceFn = std::mem::transmute(self.slot(0));
            qi(self.as_raw(), iid, &mut out)
        };
        hr.ok("QueryInterface")?;
        unsafe { ComRef::from_raw(out) }
            .ok_or_else(|| Error::InvalidState("QueryInterface returned null".into()))
    }
}

impl Drop for ComRef {
    fn drop(&mut self) {
        unsafe {
            let release: ReleaseFn = std::mem::transmute(self.slot(2));
            release(self.as_raw());
        }
    }
}
