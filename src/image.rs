//! Module image manifests.
//!
//! A manifest is a JSON file describing what to load into a fresh context:
//!
//! ```json
//! {
//!   "segments": [
//!     { "ordinal": 1, "code": true, "hex": "9A FF FF 00 00",
//!       "relocations": [{ "offset": 1, "kind": "import", "module": 9, "function": 2 }] },
//!     { "ordinal": 2, "file": "data.bin" }
//!   ],
//!   "entry": { "cs": 1, "ip": 0 },
//!   "ds": 2,
//!   "max_steps": 1000
//! }
//! ```
//!
//! Segment bytes come either inline as hex or from a file relative to the
//! manifest.

use crate::cpu::execute::{Cpu, CpuError, ExternalFunctions, ExternalMemory};
use crate::cpu::memory::{Memory, MemoryError, RelocationRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Default step budget when a manifest does not name one.
pub const DEFAULT_MAX_STEPS: u64 = 10_000;

/// Everything needed to register one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentImage {
    pub ordinal: u16,
    pub is_code: bool,
    pub data: Vec<u8>,
    #[serde(default)]
    pub relocations: Vec<RelocationRecord>,
}

/// Where execution starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub cs: u16,
    pub ip: u16,
}

/// A segment entry as written in the manifest.
#[derive(Debug, Clone, Deserialize)]
struct SegmentEntry {
    ordinal: u16,
    #[serde(default)]
    code: bool,
    hex: Option<String>,
    file: Option<PathBuf>,
    #[serde(default)]
    relocations: Vec<RelocationRecord>,
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    segments: Vec<SegmentEntry>,
    entry: EntryPoint,
    ds: Option<u16>,
    #[serde(default = "default_max_steps")]
    max_steps: u64,
}

fn default_max_steps() -> u64 {
    DEFAULT_MAX_STEPS
}

/// A fully resolved module image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    pub segments: Vec<SegmentImage>,
    pub entry: EntryPoint,
    pub ds: Option<u16>,
    pub max_steps: u64,
}

impl ModuleImage {
    /// Parse a manifest, reading any segment files relative to `base_dir`.
    pub fn from_json(json: &str, base_dir: &Path) -> Result<Self, ImageError> {
        let manifest: Manifest =
            serde_json::from_str(json).map_err(|e| ImageError::ParseError(e.to_string()))?;

        let mut segments = Vec::with_capacity(manifest.segments.len());
        for entry in manifest.segments {
            let data = match (&entry.hex, &entry.file) {
                (Some(hex), None) => parse_hex(hex).map_err(|message| ImageError::BadHex {
                    ordinal: entry.ordinal,
                    message,
                })?,
                (None, Some(file)) => {
                    let path = base_dir.join(file);
                    std::fs::read(&path).map_err(|e| {
                        ImageError::IoError(format!("{}: {}", path.display(), e))
                    })?
                }
                _ => return Err(ImageError::MissingData(entry.ordinal)),
            };

            segments.push(SegmentImage {
                ordinal: entry.ordinal,
                is_code: entry.code,
                data,
                relocations: entry.relocations,
            });
        }

        Ok(Self {
            segments,
            entry: manifest.entry,
            ds: manifest.ds,
            max_steps: manifest.max_steps,
        })
    }

    /// Register every segment with `mem`.
    pub fn install(&self, mem: &mut Memory) -> Result<(), MemoryError> {
        for segment in &self.segments {
            debug!(
                ordinal = segment.ordinal,
                bytes = segment.data.len(),
                "installing segment"
            );
            mem.register_segment(
                segment.ordinal,
                &segment.data,
                segment.is_code,
                segment.relocations.clone(),
            )?;
        }
        Ok(())
    }

    /// Install the segments into `cpu` and point it at the entry.
    pub fn boot<F, M>(&self, cpu: &mut Cpu<F, M>) -> Result<(), CpuError>
    where
        F: ExternalFunctions,
        M: ExternalMemory,
    {
        self.install(&mut cpu.mem)?;
        cpu.regs.cs = self.entry.cs;
        cpu.regs.ip = self.entry.ip;
        if let Some(ds) = self.ds {
            cpu.regs.ds = ds;
        }
        Ok(())
    }
}

/// Load a manifest from disk.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<ModuleImage, ImageError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .map_err(|e| ImageError::IoError(format!("{}: {}", path.display(), e)))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    ModuleImage::from_json(&json, base_dir)
}

/// Parse hex digits, ignoring whitespace.
fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits ({})", digits.len()));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            if !pair.iter().all(|c| c.is_ascii_hexdigit()) {
                return Err(format!("invalid hex byte `{}`", byte));
            }
            u8::from_str_radix(&byte, 16).map_err(|_| format!("invalid hex byte `{}`", byte))
        })
        .collect()
}

/// Errors that can occur while loading a module image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("manifest parse error: {0}")]
    ParseError(String),

    #[error("segment {ordinal}: {message}")]
    BadHex { ordinal: u16, message: String },

    #[error("segment {0} needs exactly one of `hex` or `file`")]
    MissingData(u16),
}
