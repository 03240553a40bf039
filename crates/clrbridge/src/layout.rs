//! Per-build structure layouts.
//!
//! The DAC fills fixed-offset structures whose shape changed across runtime
//! builds. Each [`RuntimeBuild`] maps its raw bytes onto one logical view.
//! Fields a build does not carry are `None` in the view and read as 0 through
//! the accessors.

use crate::runtime::{ClrFlavor, VersionInfo};
use crate::{Error, Result};

/// Structure layout family of a runtime build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeBuild {
    /// Desktop 2.x
    DesktopV2,
    /// Desktop 4.0 before the 4.5 in-place update
    DesktopV4,
    /// Desktop 4.5 and later, and every Core runtime
    V45,
}

/// Desktop 4.0 builds at or above this patch number are 4.5 in-place updates.
const V45_MIN_PATCH: u32 = 10000;

impl RuntimeBuild {
    pub fn select(flavor: ClrFlavor, version: VersionInfo) -> Result<Self> {
        match flavor {
            ClrFlavor::Core => Ok(RuntimeBuild::V45),
            ClrFlavor::Desktop => match version.major {
                0 | 1 => Err(Error::UnsupportedLayout { flavor, version }),
                2 => Ok(RuntimeBuild::DesktopV2),
                4 if version.minor == 0 && version.patch < V45_MIN_PATCH => {
                    Ok(RuntimeBuild::DesktopV4)
                }
                _ => Ok(RuntimeBuild::V45),
            },
            ClrFlavor::Native => Err(Error::UnsupportedLayout { flavor, version }),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, RuntimeBuild::DesktopV2 | RuntimeBuild::DesktopV4)
    }

    /// Size of the raw object data structure.
    pub fn object_data_size(&self) -> usize {
        if self.is_legacy() {
            LEGACY_OBJECT_SIZE
        } else {
            V45_OBJECT_SIZE
        }
    }

    /// Size of the raw domain-local module structure.
    pub fn domain_local_module_size(&self) -> usize {
        DOMAIN_LOCAL_MODULE_SIZE
    }

    pub fn object_data(&self, raw: &[u8]) -> Result<ObjectLayout> {
        let r = Raw::new(raw, self.object_data_size(), "object data")?;
        if self.is_legacy() {
            Ok(ObjectLayout {
                ee_class: Some(r.u64(0)),
                method_table: Some(r.u64(8)),
                object_type: Some(r.u32(16)),
                size: Some(r.u32(20) as u64),
                element_type: Some(r.u32(24)),
                rank: Some(r.u32(28)),
                num_components: Some(r.u32(32) as u64),
                component_size: Some(r.u32(36) as u64),
                array_bounds_pointer: Some(r.u64(40)),
                array_lower_bounds_pointer: Some(r.u64(48)),
                element_type_handle: Some(r.u64(56)),
                data_pointer: Some(r.u64(64)),
                rcw_pointer: None,
                ccw_pointer: None,
            })
        } else {
            Ok(ObjectLayout {
                ee_class: None,
                method_table: Some(r.u64(0)),
                object_type: Some(r.u32(8)),
                size: Some(r.u64(16)),
                element_type_handle: Some(r.u64(24)),
                element_type: Some(r.u32(32)),
                rank: Some(r.u32(36)),
                num_components: Some(r.u64(40)),
                component_size: Some(r.u64(48)),
                data_pointer: Some(r.u64(56)),
                array_bounds_pointer: Some(r.u64(64)),
                array_lower_bounds_pointer: Some(r.u64(72)),
                rcw_pointer: Some(r.u64(80)),
                ccw_pointer: Some(r.u64(88)),
            })
        }
    }

    /// Map domain-local module data. `pointer_size` is the DAC's; the legacy
    /// module id is pointer sized and sign-extended to 64 bits.
    pub fn domain_local_module(
        &self,
        raw: &[u8],
        pointer_size: u32,
    ) -> Result<DomainLocalModuleLayout> {
        let r = Raw::new(raw, DOMAIN_LOCAL_MODULE_SIZE, "domain local module data")?;
        let (app_domain, module_id) = if self.is_legacy() {
            // Legacy DACs hand the id back as a signed native int.
            let module_id = if pointer_size == 4 {
                r.u32(0) as i32 as i64 as u64
            } else {
                r.u64(0)
            };
            (r.u64(8), module_id)
        } else {
            (r.u64(0), r.u64(8))
        };

        Ok(DomainLocalModuleLayout {
            app_domain_address: Some(app_domain),
            module_id: Some(module_id),
            class_data: Some(r.u64(16)),
            dynamic_class_table: Some(r.u64(24)),
            gc_static_data_start: Some(r.u64(32)),
            non_gc_static_data_start: Some(r.u64(40)),
        })
    }
}

const LEGACY_OBJECT_SIZE: usize = 72;
const V45_OBJECT_SIZE: usize = 96;
const DOMAIN_LOCAL_MODULE_SIZE: usize = 48;

struct Raw<'a>(&'a [u8]);

impl<'a> Raw<'a> {
    fn new(raw: &'a [u8], size: usize, what: &str) -> Result<Self> {
        if raw.len() < size {
            return Err(Error::InvalidData(format!(
                "{} needs {} bytes, got {}",
                what,
                size,
                raw.len()
            )));
        }
        Ok(Self(raw))
    }

    fn u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.0[offset..offset + 4]);
        u32::from_le_bytes(b)
    }

    fn u64(&self, offset: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[offset..offset + 8]);
        u64::from_le_bytes(b)
    }
}

// =============================================================================
// Logical views
// =============================================================================

/// Object data in build-independent form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectLayout {
    pub ee_class: Option<u64>,
    pub method_table: Option<u64>,
    pub object_type: Option<u32>,
    pub size: Option<u64>,
    pub element_type: Option<u32>,
    pub element_type_handle: Option<u64>,
    pub rank: Option<u32>,
    pub num_components: Option<u64>,
    pub component_size: Option<u64>,
    pub data_pointer: Option<u64>,
    pub array_bounds_pointer: Option<u64>,
    pub array_lower_bounds_pointer: Option<u64>,
    pub rcw_pointer: Option<u64>,
    pub ccw_pointer: Option<u64>,
}

impl ObjectLayout {
    pub fn element_type(&self) -> u32 {
        self.element_type.unwrap_or(0)
    }

    pub fn element_type_handle(&self) -> u64 {
        self.element_type_handle.unwrap_or(0)
    }

    pub fn rcw_pointer(&self) -> u64 {
        self.rcw_pointer.unwrap_or(0)
    }

    pub fn ccw_pointer(&self) -> u64 {
        self.ccw_pointer.unwrap_or(0)
    }

    pub fn data_pointer(&self) -> u64 {
        self.data_pointer.unwrap_or(0)
    }

    pub fn method_table(&self) -> u64 {
        self.method_table.unwrap_or(0)
    }

    pub fn ee_class(&self) -> u64 {
        self.ee_class.unwrap_or(0)
    }

    pub fn size(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    pub fn rank(&self) -> u32 {
        self.rank.unwrap_or(0)
    }

    pub fn num_components(&self) -> u64 {
        self.num_components.unwrap_or(0)
    }

    pub fn component_size(&self) -> u64 {
        self.component_size.unwrap_or(0)
    }
}

/// Domain-local module data in build-independent form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainLocalModuleLayout {
    pub app_domain_address: Option<u64>,
    pub module_id: Option<u64>,
    pub class_data: Option<u64>,
    pub dynamic_class_table: Option<u64>,
    pub gc_static_data_start: Option<u64>,
    pub non_gc_static_data_start: Option<u64>,
}

impl DomainLocalModuleLayout {
    pub fn app_domain_address(&self) -> u64 {
        self.app_domain_address.unwrap_or(0)
    }

    pub fn module_id(&self) -> u64 {
        self.module_id.unwrap_or(0)
    }

    pub fn class_data(&self) -> u64 {
        self.class_data.unwrap_or(0)
    }

    pub fn dynamic_class_table(&self) -> u64 {
        self.dynamic_class_table.unwrap_or(0)
    }

    pub fn gc_static_data_start(&self) -> u64 {
        self.gc_static_data_start.unwrap_or(0)
    }

    pub fn non_gc_static_data_start(&self) -> u64 {
        self.non_gc_static_data_start.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u32, minor: u32, revision: u32, patch: u32) -> VersionInfo {
        VersionInfo::new(major, minor, revision, patch)
    }

    fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn test_select() {
        use ClrFlavor::*;

        assert_eq!(RuntimeBuild::select(Core, v(1, 0, 0, 0)).unwrap(), RuntimeBuild::V45);
        assert_eq!(RuntimeBuild::select(Core, v(8, 0, 1, 0)).unwrap(), RuntimeBuild::V45);
        assert_eq!(
            RuntimeBuild::select(Desktop, v(2, 0, 50727, 3053)).unwrap(),
            RuntimeBuild::DesktopV2
        );
        assert_eq!(
            RuntimeBuild::select(Desktop, v(4, 0, 30319, 1)).unwrap(),
            RuntimeBuild::DesktopV4
        );
        assert_eq!(
            RuntimeBuild::select(Desktop, v(4, 0, 30319, 42000)).unwrap(),
            RuntimeBuild::V45
        );
        assert_eq!(
            RuntimeBuild::select(Desktop, v(4, 8, 4515, 0)).unwrap(),
            RuntimeBuild::V45
        );
        assert_eq!(
            RuntimeBuild::select(Desktop, v(5, 0, 0, 0)).unwrap(),
            RuntimeBuild::V45
        );

        assert!(matches!(
            RuntimeBuild::select(Desktop, v(1, 1, 4322, 0)),
            Err(Error::UnsupportedLayout { .. })
        ));
        assert!(matches!(
            RuntimeBuild::select(Native, v(1, 0, 0, 0)),
            Err(Error::UnsupportedLayout { .. })
        ));
    }

    #[test]
    fn test_legacy_object_data() {
        let mut raw = vec![0u8; 72];
        put_u64(&mut raw, 0, 0x1111);
        put_u64(&mut raw, 8, 0x2222);
        put_u32(&mut raw, 20, 24);
        put_u32(&mut raw, 24, 0x1D);
        put_u32(&mut raw, 32, 10);
        put_u64(&mut raw, 56, 0x3333);
        put_u64(&mut raw, 64, 0x4444);

        let data = RuntimeBuild::DesktopV4.object_data(&raw).unwrap();
        assert_eq!(data.ee_class(), 0x1111);
        assert_eq!(data.method_table(), 0x2222);
        assert_eq!(data.size(), 24);
        assert_eq!(data.element_type(), 0x1D);
        assert_eq!(data.num_components(), 10);
        assert_eq!(data.element_type_handle(), 0x3333);
        assert_eq!(data.data_pointer(), 0x4444);
        assert_eq!(data.rcw_pointer, None);
        assert_eq!(data.ccw_pointer, None);
    }

    #[test]
    fn test_v45_object_data() {
        let mut raw = vec![0u8; 96];
        put_u64(&mut raw, 0, 0x2222);
        put_u64(&mut raw, 16, 48);
        put_u64(&mut raw, 24, 0x3333);
        put_u32(&mut raw, 32, 0x14);
        put_u32(&mut raw, 36, 2);
        put_u64(&mut raw, 56, 0x4444);
        put_u64(&mut raw, 80, 0x5555);
        put_u64(&mut raw, 88, 0x6666);

        let data = RuntimeBuild::V45.object_data(&raw).unwrap();
        assert_eq!(data.method_table(), 0x2222);
        assert_eq!(data.size(), 48);
        assert_eq!(data.element_type_handle(), 0x3333);
        assert_eq!(data.element_type(), 0x14);
        assert_eq!(data.rank(), 2);
        assert_eq!(data.data_pointer(), 0x4444);
        assert_eq!(data.rcw_pointer(), 0x5555);
        assert_eq!(data.ccw_pointer(), 0x6666);
        assert_eq!(data.ee_class, None);
    }

    #[test]
    fn test_absent_fields_read_zero() {
        for build in [
            RuntimeBuild::DesktopV2,
            RuntimeBuild::DesktopV4,
            RuntimeBuild::V45,
        ] {
            let raw = vec![0xFFu8; build.object_data_size()];
            let data = build.object_data(&raw).unwrap();
            if data.rcw_pointer.is_none() {
                assert_eq!(data.rcw_pointer(), 0);
            }
            if data.ccw_pointer.is_none() {
                assert_eq!(data.ccw_pointer(), 0);
            }
            if data.ee_class.is_none() {
                assert_eq!(data.ee_class(), 0);
            }
        }

        let empty = ObjectLayout::default();
        assert_eq!(empty.element_type(), 0);
        assert_eq!(empty.element_type_handle(), 0);
        assert_eq!(empty.rcw_pointer(), 0);
        assert_eq!(empty.ccw_pointer(), 0);
        assert_eq!(empty.data_pointer(), 0);

        let empty = DomainLocalModuleLayout::default();
        assert_eq!(empty.app_domain_address(), 0);
        assert_eq!(empty.module_id(), 0);
        assert_eq!(empty.class_data(), 0);
        assert_eq!(empty.dynamic_class_table(), 0);
        assert_eq!(empty.gc_static_data_start(), 0);
        assert_eq!(empty.non_gc_static_data_start(), 0);
    }

    #[test]
    fn test_short_buffer_is_invalid_data() {
        let raw = vec![0u8; 80];
        assert!(RuntimeBuild::DesktopV2.object_data(&raw).is_ok());
        assert!(matches!(
            RuntimeBuild::V45.object_data(&raw),
            Err(Error::InvalidData(_))
        ));
        assert!(matches!(
            RuntimeBuild::V45.domain_local_module(&raw[..40], 8),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_domain_local_module() {
        let mut raw = vec![0u8; 48];
        put_u64(&mut raw, 0, 0xAAAA);
        put_u64(&mut raw, 8, 0xBBBB);
        put_u64(&mut raw, 16, 0x10);
        put_u64(&mut raw, 24, 0x18);
        put_u64(&mut raw, 32, 0x20);
        put_u64(&mut raw, 40, 0x28);

        let modern = RuntimeBuild::V45.domain_local_module(&raw, 8).unwrap();
        assert_eq!(modern.app_domain_address(), 0xAAAA);
        assert_eq!(modern.module_id(), 0xBBBB);
        assert_eq!(modern.non_gc_static_data_start(), 0x28);

        let legacy = RuntimeBuild::DesktopV2.domain_local_module(&raw, 8).unwrap();
        assert_eq!(legacy.module_id(), 0xAAAA);
        assert_eq!(legacy.app_domain_address(), 0xBBBB);
        assert_eq!(legacy.class_data(), 0x10);

        put_u64(&mut raw, 0, 0xFFFF_FFFF_0000_1234);
        let legacy32 = RuntimeBuild::DesktopV4.domain_local_module(&raw, 4).unwrap();
        assert_eq!(legacy32.module_id(), 0x1234);
    }

    #[test]
    fn test_legacy_module_id_sign_extends_on_32_bit() {
        let mut raw = vec![0u8; 48];
        put_u32(&mut raw, 0, 0x8000_0010);
        put_u32(&mut raw, 4, 0xDEAD_BEEF);

        let legacy32 = RuntimeBuild::DesktopV2.domain_local_module(&raw, 4).unwrap();
        assert_eq!(legacy32.module_id(), 0xFFFF_FFFF_8000_0010);

        put_u32(&mut raw, 0, 0x7FFF_FFFF);
        let legacy32 = RuntimeBuild::DesktopV4.domain_local_module(&raw, 4).unwrap();
        assert_eq!(legacy32.module_id(), 0x7FFF_FFFF);

        let modern = RuntimeBuild::V45.domain_local_module(&raw, 4).unwrap();
        assert_eq!(modern.app_domain_address(), 0xDEAD_BEEF_7FFF_FFFF);
    }
}
