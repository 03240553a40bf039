//! Binary inspection for DAC candidates.
//!
//! PE images are read with `pelite`. ELF images only need their class and
//! machine fields, which are read directly from the header, plus the version
//! marker the runtime build embeds in its read-only data.

use std::fs;
use std::path::Path;

use memchr::memmem;
use pelite::image::IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR;

use crate::runtime::VersionInfo;
use crate::target::{
    IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_ARM64, IMAGE_FILE_MACHINE_ARMNT,
    IMAGE_FILE_MACHINE_I386,
};
use crate::{Error, Result};

/// Header facts about a binary on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// 4 or 8
    pub pointer_size: u32,
    /// PE machine type (ELF machines are mapped onto the PE constants)
    pub machine: u16,
    pub file_version: Option<VersionInfo>,
    /// COFF timestamp, 0 for ELF
    pub timestamp: u32,
    pub size_of_image: u64,
}

/// Reads header facts from a binary.
pub trait BinaryInspector: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<ImageInfo>;
}

/// Inspects files on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileInspector;

impl BinaryInspector for FileInspector {
    fn inspect(&self, path: &Path) -> Result<ImageInfo> {
        let bytes = fs::read(path)?;
        inspect_bytes(&bytes).map_err(|message| Error::InvalidImage {
            path: path.to_path_buf(),
            message,
        })
    }
}

fn inspect_bytes(bytes: &[u8]) -> std::result::Result<ImageInfo, String> {
    if bytes.starts_with(ELF_MAGIC) {
        inspect_elf(bytes)
    } else if bytes.starts_with(b"MZ") {
        inspect_pe(bytes)
    } else {
        Err("unrecognized file format".into())
    }
}

// =============================================================================
// PE
// =============================================================================

macro_rules! pe_info {
    ($pe:expr, $pointer_size:expr) => {{
        let pe = $pe;
        let file_header = pe.file_header();
        let file_version = pe
            .resources()
            .ok()
            .and_then(|resources| resources.version_info().ok())
            .and_then(|info| {
                info.fixed().map(|fixed| {
                    let v = &fixed.dwFileVersion;
                    VersionInfo::new(v.Major as u32, v.Minor as u32, v.Patch as u32, v.Build as u32)
                })
            });

        ImageInfo {
            pointer_size: $pointer_size,
            machine: file_header.Machine,
            file_version,
            timestamp: file_header.TimeDateStamp,
            size_of_image: pe.optional_header().SizeOfImage as u64,
        }
    }};
}

fn inspect_pe(bytes: &[u8]) -> std::result::Result<ImageInfo, String> {
    use pelite::pe32::Pe as _;
    use pelite::pe64::Pe as _;

    match pelite::pe64::PeFile::from_bytes(bytes) {
        Ok(pe) => Ok(pe_info!(pe, 8)),
        Err(pelite::Error::PeMagic) => {
            let pe = pelite::pe32::PeFile::from_bytes(bytes).map_err(|e| e.to_string())?;
            Ok(pe_info!(pe, 4))
        }
        Err(e) => Err(e.to_string()),
    }
}

/// CLI metadata copied out of a managed PE file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// At most the requested number of bytes
    pub bytes: Vec<u8>,
    /// Size of the whole region on disk
    pub total_size: usize,
}

/// Read CLI metadata from a managed PE file.
///
/// With `rva` of 0 the metadata directory of the COR20 header is read;
/// otherwise the `max_len` bytes starting at `rva`. At most `max_len` bytes are
/// copied, so a `max_len` of 0 only reports the size.
pub fn read_metadata(path: &Path, rva: u32, max_len: usize) -> Result<Metadata> {
    let bytes = fs::read(path)?;
    metadata_from_bytes(&bytes, rva, max_len).map_err(|message| Error::InvalidImage {
        path: path.to_path_buf(),
        message,
    })
}

macro_rules! pe_metadata {
    ($pe:expr, $bytes:expr, $rva:expr, $max_len:expr) => {{
        let pe = $pe;
        let (start, size) = if $rva != 0 {
            ($rva, $max_len)
        } else {
            let (dir_rva, dir_size) = pe
                .data_directory()
                .get(IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR)
                .map(|dir| (dir.VirtualAddress, dir.Size))
                .ok_or_else(|| "no CLI header".to_string())?;
            if dir_rva == 0 || dir_size < 16 {
                return Err("no CLI header".into());
            }
            let offset = pe
                .rva_to_file_offset(dir_rva)
                .map_err(|e| e.to_string())?;
            let header = $bytes
                .get(offset..offset + 16)
                .ok_or_else(|| "truncated CLI header".to_string())?;
            let md_rva = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
            let md_size = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
            (md_rva, md_size as usize)
        };

        let offset = pe.rva_to_file_offset(start).map_err(|e| e.to_string())?;
        if offset >= $bytes.len() {
            return Err(format!("metadata at rva {:#x} is outside the file", start));
        }
        let total_size = size.min($bytes.len() - offset);
        let len = total_size.min($max_len);
        Ok(Metadata {
            bytes: $bytes[offset..offset + len].to_vec(),
            total_size,
        })
    }};
}

fn metadata_from_bytes(
    bytes: &[u8],
    rva: u32,
    max_len: usize,
) -> std::result::Result<Metadata, String> {
    use pelite::pe32::Pe as _;
    use pelite::pe64::Pe as _;

    match pelite::pe64::PeFile::from_bytes(bytes) {
        Ok(pe) => pe_metadata!(pe, bytes, rva, max_len),
        Err(pelite::Error::PeMagic) => {
            let pe = pelite::pe32::PeFile::from_bytes(bytes).map_err(|e| e.to_string())?;
            pe_metadata!(pe, bytes, rva, max_len)
        }
        Err(e) => Err(e.to_string()),
    }
}

/// COFF timestamp from the first bytes of a mapped PE image.
///
/// Only the DOS and NT headers are needed, so this works on a header page read
/// out of a live process.
pub fn pe_header_timestamp(header: &[u8]) -> Option<u32> {
    if !header.starts_with(b"MZ") {
        return None;
    }
    let e_lfanew = u32::from_le_bytes(header.get(0x3C..0x40)?.try_into().ok()?) as usize;
    let nt = header.get(e_lfanew..e_lfanew.checked_add(12)?)?;
    if &nt[..4] != b"PE\0\0" {
        return None;
    }
    Some(u32::from_le_bytes(nt[8..12].try_into().ok()?))
}

// =============================================================================
// ELF
// =============================================================================

const ELF_MAGIC: &[u8] = b"\x7fELF";
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;

const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

const VERSION_MARKER: &[u8] = b"@(#)Version ";

fn inspect_elf(bytes: &[u8]) -> std::result::Result<ImageInfo, String> {
    if bytes.len() < 20 {
        return Err("truncated ELF header".into());
    }

    let pointer_size = match bytes[4] {
        ELFCLASS32 => 4,
        ELFCLASS64 => 8,
        other => return Err(format!("unknown ELF class {}", other)),
    };

    let machine = match u16::from_le_bytes([bytes[18], bytes[19]]) {
        EM_386 => IMAGE_FILE_MACHINE_I386,
        EM_X86_64 => IMAGE_FILE_MACHINE_AMD64,
        EM_ARM => IMAGE_FILE_MACHINE_ARMNT,
        EM_AARCH64 => IMAGE_FILE_MACHINE_ARM64,
        _ => 0,
    };

    Ok(ImageInfo {
        pointer_size,
        machine,
        file_version: elf_version_marker(bytes),
        timestamp: 0,
        size_of_image: bytes.len() as u64,
    })
}

/// Parse the `@(#)Version a.b.c.d` string embedded in runtime binaries.
fn elf_version_marker(bytes: &[u8]) -> Option<VersionInfo> {
    let start = memmem::find(bytes, VERSION_MARKER)? + VERSION_MARKER.len();
    let rest = &bytes[start..];
    let end = rest
        .iter()
        .position(|b| !(b.is_ascii_digit() || *b == b'.'))
        .unwrap_or(rest.len());

    std::str::from_utf8(&rest[..end]).ok()?.parse().ok()
}
