//! Native bridge to the DAC.
//!
//! - [`com`]: synthetic COM objects the DAC can call
//! - [`data_target`]: `ICLRDataTarget` and companions over a session
//! - [`library`]: native module loading
//! - [`process`]: the loaded DAC and its `IXCLRDataProcess`

pub mod com;
pub mod data_target;
pub mod library;
pub mod process;

use uguid::{Guid, guid};

pub use com::{ComObject, ComObjectBuilder, ComRef, HResult, VTableBuilder};
pub use data_target::{IID_ICLR_DATA_TARGET, IID_ICLR_METADATA_LOCATOR, IID_ICLR_RUNTIME_LOCATOR};
pub use library::NativeLibrary;
pub use process::{ClrDataProcess, DacLibrary};

pub const IID_IXCLR_DATA_PROCESS: Guid = guid!("5c552ab6-fc09-4cb3-8e36-22fa03c798b7");
pub const IID_ISOS_DAC_INTERFACE: Guid = guid!("436f00f2-b42a-4b9f-870c-e73db66ae930");
