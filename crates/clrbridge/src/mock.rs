//! Mock target reader for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::target::{Architecture, ModuleInfo, TargetReader};
use crate::{Error, Result};

/// In-memory target with a fixed module list and sparse memory regions.
pub struct MockTarget {
    pub architecture: Architecture,
    pub pointer_size: u32,
    pub snapshot: bool,
    pub modules: Vec<ModuleInfo>,
    /// (base address, bytes)
    pub regions: Vec<(u64, Vec<u8>)>,
    /// Time each module enumeration takes
    pub enumerate_delay: Duration,
    pub enumerate_calls: AtomicUsize,
    pub closed: AtomicBool,
}

impl MockTarget {
    pub fn builder() -> MockTargetBuilder {
        MockTargetBuilder::default()
    }
}

impl TargetReader for MockTarget {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        for (base, data) in &self.regions {
            if address >= *base && address < base + data.len() as u64 {
                let offset = (address - base) as usize;
                let len = buf.len().min(data.len() - offset);
                buf[..len].copy_from_slice(&data[offset..offset + len]);
                return Ok(len);
            }
        }

        Err(Error::MemoryReadFailed {
            address,
            message: "unmapped".into(),
        })
    }

    fn pointer_size(&self) -> u32 {
        self.pointer_size
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn enumerate_modules(&self) -> Result<Vec<ModuleInfo>> {
        self.enumerate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.enumerate_delay.is_zero() {
            std::thread::sleep(self.enumerate_delay);
        }
        Ok(self.modules.clone())
    }

    fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    fn supports_concurrent_reads(&self) -> bool {
        true
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockTargetBuilder {
    architecture: Architecture,
    pointer_size: u32,
    snapshot: bool,
    modules: Vec<ModuleInfo>,
    regions: Vec<(u64, Vec<u8>)>,
    enumerate_delay: Duration,
}

impl Default for MockTargetBuilder {
    fn default() -> Self {
        Self {
            architecture: Architecture::Amd64,
            pointer_size: 8,
            snapshot: true,
            modules: Vec::new(),
            regions: Vec::new(),
            enumerate_delay: Duration::ZERO,
        }
    }
}

impl MockTargetBuilder {
    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        if let Some(size) = architecture.pointer_size() {
            self.pointer_size = size;
        }
        self
    }

    pub fn pointer_size(mut self, pointer_size: u32) -> Self {
        self.pointer_size = pointer_size;
        self
    }

    pub fn live(mut self) -> Self {
        self.snapshot = false;
        self
    }

    pub fn module(mut self, module: ModuleInfo) -> Self {
        self.modules.push(module);
        self
    }

    pub fn memory(mut self, base: u64, data: Vec<u8>) -> Self {
        self.regions.push((base, data));
        self
    }

    pub fn enumerate_delay(mut self, delay: Duration) -> Self {
        self.enumerate_delay = delay;
        self
    }

    pub fn build(self) -> MockTarget {
        MockTarget {
            architecture: self.architecture,
            pointer_size: self.pointer_size,
            snapshot: self.snapshot,
            modules: self.modules,
            regions: self.regions,
            enumerate_delay: self.enumerate_delay,
            enumerate_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }
}
