//! Hand-off from discovery to a runtime engine.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bridge::{ClrDataProcess, ComRef, DacLibrary, HResult};
use crate::dac::{BinaryRequest, DacResolver, ResolveOptions, ResolvedDac};
use crate::layout::{DomainLocalModuleLayout, ObjectLayout, RuntimeBuild};
use crate::runtime::RuntimeDescriptor;
use crate::target::TargetSession;
use crate::{Error, Result};

/// Private request for the static GC heap details of a legacy runtime.
const GCHEAPDETAILS_STATIC_DATA: u32 = 0xF000_002D;
/// Reply buffer for [`GCHEAPDETAILS_STATIC_DATA`]; large enough for either
/// legacy reply.
const HEAP_DETAILS_REPLY_SIZE: usize = 0x200;

/// A runtime with a loaded, validated DAC and its layout family.
pub struct ClrRuntime {
    descriptor: RuntimeDescriptor,
    dac: Arc<DacLibrary>,
    layout: RuntimeBuild,
    pointer_size: u32,
}

impl ClrRuntime {
    pub fn descriptor(&self) -> &RuntimeDescriptor {
        &self.descriptor
    }

    pub fn dac(&self) -> &Arc<DacLibrary> {
        &self.dac
    }

    pub fn process(&self) -> Result<&ClrDataProcess> {
        self.dac.process()
    }

    pub fn layout(&self) -> RuntimeBuild {
        self.layout
    }

    /// Map object data returned by the DAC.
    pub fn object_data(&self, raw: &[u8]) -> Result<ObjectLayout> {
        self.layout.object_data(raw)
    }

    /// Map domain-local module data returned by the DAC.
    pub fn domain_local_module(&self, raw: &[u8]) -> Result<DomainLocalModuleLayout> {
        self.layout.domain_local_module(raw, self.pointer_size)
    }

    /// Drop the DAC's cached view of target memory.
    pub fn flush(&self) -> Result<()> {
        self.dac.process()?.flush()
    }
}

impl TargetSession {
    /// Find and validate the DAC for `descriptor` without loading it.
    pub fn resolve_dac(
        &self,
        descriptor: &RuntimeDescriptor,
        options: &ResolveOptions,
    ) -> Result<ResolvedDac> {
        DacResolver::new(
            self.inspector().as_ref(),
            self.locator().as_ref(),
            self.pointer_size(),
        )
        .resolve(descriptor, options)
    }

    /// Resolve, load and wrap the DAC for `descriptor`.
    ///
    /// The loaded DAC is also kept by the session and released when the
    /// session is dropped.
    pub fn create_runtime(
        &self,
        descriptor: &RuntimeDescriptor,
        options: &ResolveOptions,
    ) -> Result<ClrRuntime> {
        let layout = RuntimeBuild::select(descriptor.flavor, descriptor.version)?;
        let resolved = self.resolve_dac(descriptor, options)?;
        if self.is_snapshot() {
            self.prefetch_runtime_image(descriptor);
        }

        let dac = Arc::new(DacLibrary::load(
            self,
            &resolved.path,
            &resolved.image,
            descriptor.module.base_address,
        )?);
        self.add_library(dac.clone());

        debug!("Created {} runtime with {:?} layout", descriptor, layout);
        Ok(ClrRuntime {
            descriptor: descriptor.clone(),
            dac,
            layout,
            pointer_size: self.pointer_size(),
        })
    }

    /// Wrap a process interface the host already created from its own DAC.
    ///
    /// The layout family is taken from what the DAC answers rather than from
    /// the runtime version. The interface is kept by the session until it is
    /// dropped.
    pub fn create_runtime_from_process(
        &self,
        descriptor: &RuntimeDescriptor,
        process: &ComRef,
    ) -> Result<ClrRuntime> {
        let dac = Arc::new(DacLibrary::from_process(process)?);
        let layout = detect_layout(dac.process()?);
        self.add_library(dac.clone());

        debug!("Adopted {} runtime with {:?} layout", descriptor, layout);
        Ok(ClrRuntime {
            descriptor: descriptor.clone(),
            dac,
            layout,
            pointer_size: self.pointer_size(),
        })
    }

    /// Ask the locator for the runtime image itself. Dumps rarely carry it,
    /// and the DAC reads the runtime's metadata through the locator later.
    fn prefetch_runtime_image(&self, descriptor: &RuntimeDescriptor) {
        let module = &descriptor.module;
        let request = BinaryRequest {
            file_name: module.file_name().to_string(),
            timestamp: module.timestamp,
            file_size: module.size,
            version: descriptor.version,
        };

        match self.locator().locate(&request) {
            Ok(Some(path)) => debug!("Prefetched {} to {}", request, path.display()),
            Ok(None) => debug!("Runtime image {} is not available", request),
            Err(e) => warn!("Prefetching {} failed: {}", request, e),
        }
    }
}

/// Layout family of a live DAC. Only DACs for 4.5 and later expose
/// `ISOSDacInterface`; of the older ones, only 4.0 rejects the static heap
/// details request as an invalid argument.
fn detect_layout(process: &ClrDataProcess) -> RuntimeBuild {
    if process.sos_interface().is_some() {
        return RuntimeBuild::V45;
    }

    let mut reply = [0u8; HEAP_DETAILS_REPLY_SIZE];
    match process.request(GCHEAPDETAILS_STATIC_DATA, &[], &mut reply) {
        Err(Error::Hresult { hr, .. }) if hr == HResult::E_INVALIDARG.code() => {
            RuntimeBuild::DesktopV4
        }
        _ => RuntimeBuild::DesktopV2,
    }
}

impl RuntimeDescriptor {
    /// Same as [`TargetSession::create_runtime`].
    pub fn create_runtime(
        &self,
        session: &TargetSession,
        options: &ResolveOptions,
    ) -> Result<ClrRuntime> {
        session.create_runtime(self, options)
    }

    /// Same as [`TargetSession::create_runtime_from_process`].
    pub fn create_runtime_from_process(
        &self,
        session: &TargetSession,
        process: &ComRef,
    ) -> Result<ClrRuntime> {
        session.create_runtime_from_process(self, process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::process::tests::{fake_process, process_ref};
    use crate::dac::BinaryLocator;
    use crate::image::tests::write_elf;
    use crate::mock::MockTarget;
    use crate::runtime::{ClrFlavor, TargetPlatform, VersionInfo};
    use crate::target::ModuleInfo;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLocator {
        requests: Mutex<Vec<BinaryRequest>>,
    }

    impl BinaryLocator for RecordingLocator {
        fn locate(&self, request: &BinaryRequest) -> Result<Option<PathBuf>> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(None)
        }
    }

    fn first_runtime(session: &TargetSession) -> RuntimeDescriptor {
        session.runtimes().unwrap()[0].clone()
    }

    fn desktop_session() -> TargetSession {
        let target = MockTarget::builder()
            .module(module(
                r"C:\Windows\Microsoft.NET\Framework64\v4.0.30319\clr.dll",
                0x7ff8_0000_0000,
                Some(VersionInfo::new(4, 8, 4515, 0)),
            ))
            .build();
        TargetSession::new(Arc::new(target))
    }

    fn module(path: &str, base: u64, version: Option<VersionInfo>) -> ModuleInfo {
        ModuleInfo {
            path: path.into(),
            base_address: base,
            size: 0x70_0000,
            timestamp: 0,
            file_version: version,
        }
    }

    #[test]
    fn test_discovery_to_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let version = VersionInfo::new(8, 0, 1, 0);
        write_elf(dir.path(), "libmscordaccore.so", 8, Some("8.0.1.0"));
        let runtime_path = dir.path().join("libcoreclr.so");

        let target = MockTarget::builder()
            .live()
            .module(module("/usr/lib/libc.so.6", 0x7f00_0000_0000, None))
            .module(module(
                runtime_path.to_str().unwrap(),
                0x7f10_0000_0000,
                Some(version),
            ))
            .build();
        let session = TargetSession::new(Arc::new(target));

        let runtimes = session.runtimes().unwrap();
        assert_eq!(runtimes.len(), 1);
        let runtime = &runtimes[0];
        assert_eq!(runtime.flavor, ClrFlavor::Core);
        assert_eq!(runtime.platform, TargetPlatform::Linux);
        assert_eq!(runtime.version, version);
        assert_eq!(runtime.dac.file_name, "libmscordaccore.so");
        assert_eq!(
            runtime.local_dac.as_deref(),
            Some(dir.path().join("libmscordaccore.so").as_path())
        );
        assert!(session.native_runtime().unwrap().is_none());

        let resolved = session
            .resolve_dac(runtime, &ResolveOptions::new())
            .unwrap();
        assert_eq!(resolved.image.file_version, Some(version));
        assert_eq!(
            RuntimeBuild::select(runtime.flavor, runtime.version).unwrap(),
            RuntimeBuild::V45
        );
    }

    #[test]
    fn test_create_runtime_fails_before_loading_unsupported_layout() {
        let target = MockTarget::builder()
            .architecture(crate::target::Architecture::X86)
            .module(module(
                r"C:\Windows\Microsoft.NET\Framework\v1.1.4322\mscorwks.dll",
                0x7900_0000,
                Some(VersionInfo::new(1, 1, 4322, 2032)),
            ))
            .build();
        let session = TargetSession::new(Arc::new(target));
        let runtime = session.runtimes().unwrap()[0].clone();

        let err = runtime
            .create_runtime(&session, &ResolveOptions::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedLayout { .. }));
        assert_eq!(session.library_count(), 0);
    }

    #[test]
    fn test_create_runtime_without_dac_is_not_found() {
        let target = MockTarget::builder()
            .module(module(
                "/nonexistent/dotnet/libcoreclr.so",
                0x7f10_0000_0000,
                Some(VersionInfo::new(8, 0, 1, 0)),
            ))
            .build();
        let session = TargetSession::new(Arc::new(target));
        let runtime = session.runtimes().unwrap()[0].clone();

        let err = session
            .create_runtime(&runtime, &ResolveOptions::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(session.library_count(), 0);
    }

    #[test]
    fn test_create_runtime_load_failure_keeps_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let host_pointer_size = std::mem::size_of::<usize>() as u32;
        let dac = write_elf(
            dir.path(),
            "libmscordaccore.so",
            host_pointer_size,
            Some("8.0.1.0"),
        );

        let target = MockTarget::builder()
            .pointer_size(host_pointer_size)
            .module(module(
                "/nonexistent/dotnet/libcoreclr.so",
                0x7f10_0000,
                Some(VersionInfo::new(8, 0, 1, 0)),
            ))
            .build();
        let session = TargetSession::new(Arc::new(target));
        let runtime = session.runtimes().unwrap()[0].clone();

        // A header-only ELF passes validation but is not loadable.
        let err = session
            .create_runtime(&runtime, &ResolveOptions::new().dac_path(&dac))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Library(_)));
        assert_eq!(session.library_count(), 0);
    }

    #[test]
    fn test_runtime_from_process_with_sos_interface_is_v45() {
        let session = desktop_session();
        let runtime = first_runtime(&session);
        let object = fake_process(HResult::S_OK, true);

        let clr = session
            .create_runtime_from_process(&runtime, &process_ref(&object))
            .unwrap();
        assert_eq!(clr.layout(), RuntimeBuild::V45);
        assert!(object.context().requests.lock().unwrap().is_empty());
        assert_eq!(clr.dac().path(), None);
        assert_eq!(session.library_count(), 1);
    }

    #[test]
    fn test_runtime_from_process_rejecting_heap_details_is_desktop_v4() {
        let session = desktop_session();
        let runtime = first_runtime(&session);
        let object = fake_process(HResult::E_INVALIDARG, false);

        let clr = runtime
            .create_runtime_from_process(&session, &process_ref(&object))
            .unwrap();
        assert_eq!(clr.layout(), RuntimeBuild::DesktopV4);
        assert_eq!(
            *object.context().requests.lock().unwrap(),
            vec![GCHEAPDETAILS_STATIC_DATA]
        );
        assert_eq!(clr.descriptor().module.path, runtime.module.path);
    }

    #[test]
    fn test_runtime_from_process_answering_heap_details_is_desktop_v2() {
        let session = desktop_session();
        let runtime = first_runtime(&session);
        let object = fake_process(HResult::S_OK, false);

        let clr = session
            .create_runtime_from_process(&runtime, &process_ref(&object))
            .unwrap();
        assert_eq!(clr.layout(), RuntimeBuild::DesktopV2);
        assert_eq!(object.context().requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_create_runtime_prefetches_runtime_image_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let host_pointer_size = std::mem::size_of::<usize>() as u32;
        let dac = write_elf(
            dir.path(),
            "libmscordaccore.so",
            host_pointer_size,
            Some("8.0.1.0"),
        );

        for live in [false, true] {
            let mut builder = MockTarget::builder().pointer_size(host_pointer_size);
            if live {
                builder = builder.live();
            }
            let target = builder
                .module(module(
                    "/nonexistent/dotnet/libcoreclr.so",
                    0x7f10_0000,
                    Some(VersionInfo::new(8, 0, 1, 0)),
                ))
                .build();
            let locator = Arc::new(RecordingLocator::default());
            let session = TargetSession::new(Arc::new(target)).with_locator(locator.clone());
            let runtime = first_runtime(&session);

            // Loading the header-only DAC fails after the prefetch.
            assert!(
                session
                    .create_runtime(&runtime, &ResolveOptions::new().dac_path(&dac))
                    .is_err()
            );

            let requests = locator.requests.lock().unwrap();
            if live {
                assert!(requests.is_empty());
            } else {
                assert_eq!(requests.len(), 1);
                assert_eq!(requests[0].file_name, "libcoreclr.so");
                assert_eq!(requests[0].file_size, 0x70_0000);
                assert_eq!(requests[0].version, VersionInfo::new(8, 0, 1, 0));
            }
        }
    }
}
