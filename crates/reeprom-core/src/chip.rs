//! EEPROM chip descriptors and the descriptor registry
//!
//! Descriptors are small records describing one EEPROM model: capacity,
//! internal address width, page size, and write-cycle duration. They are
//! either built in ([`ChipRegistry::builtin`]) or loaded from `.ron` files
//! ([`ChipRegistry::load_dir`]).

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Internal memory address width of an EEPROM, in bytes.
///
/// Small devices (up to the 24C16 family) take a single address byte;
/// larger devices take two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AddressWidth {
    /// One address byte
    One,
    /// Two address bytes
    Two,
}

impl AddressWidth {
    /// Width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            AddressWidth::One => 1,
            AddressWidth::Two => 2,
        }
    }
}

impl TryFrom<u8> for AddressWidth {
    type Error = String;

    fn try_from(v: u8) -> core::result::Result<Self, String> {
        match v {
            1 => Ok(AddressWidth::One),
            2 => Ok(AddressWidth::Two),
            other => Err(format!("address width must be 1 or 2, got {}", other)),
        }
    }
}

impl From<AddressWidth> for u8 {
    fn from(w: AddressWidth) -> u8 {
        w.bytes() as u8
    }
}

/// Descriptor for one EEPROM chip model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipDescriptor {
    /// Unique identifier (e.g. "24c256")
    pub id: String,
    /// Human-readable name (e.g. "24C256 (256 Kbit)")
    pub name: String,
    /// Total capacity in bytes
    pub size_bytes: u32,
    /// Internal memory address width
    pub address_width: AddressWidth,
    /// Maximum contiguous bytes per page write. Need not divide
    /// `size_bytes`; a trailing partial page is permitted.
    pub page_size: u32,
    /// Time the device needs after a write before it acknowledges again
    pub write_cycle_ms: u32,
    /// Free-form notes
    #[serde(default)]
    pub notes: String,
}

impl ChipDescriptor {
    /// Validate field ranges, failing with
    /// [`InvalidDescriptor`](Error::InvalidDescriptor).
    ///
    /// Called when a descriptor is registered and again when a job is
    /// created against it, so an out-of-range record can never reach the
    /// engine.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidDescriptor("empty chip id".into()));
        }
        if self.size_bytes == 0 {
            return Err(Error::InvalidDescriptor(format!(
                "{}: size_bytes must be > 0",
                self.id
            )));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidDescriptor(format!(
                "{}: page_size must be > 0",
                self.id
            )));
        }
        if self.page_size > self.size_bytes {
            return Err(Error::InvalidDescriptor(format!(
                "{}: page_size {} exceeds capacity {}",
                self.id, self.page_size, self.size_bytes
            )));
        }
        Ok(())
    }
}

/// Error type for descriptor file loading.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// I/O error reading descriptor files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// RON parsing error
    #[error("parse error: {0}")]
    Parse(#[from] ron::error::SpannedError),
    /// Descriptor failed validation
    #[error(transparent)]
    Invalid(#[from] Error),
}

/// In-memory mapping from chip id to descriptor.
///
/// Read-mostly: registration happens before any queue activity, lookups are
/// shared across jobs.
#[derive(Debug, Clone, Default)]
pub struct ChipRegistry {
    chips: BTreeMap<String, ChipDescriptor>,
}

impl ChipRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry populated with common 24Cxx parts.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        let parts: &[(&str, &str, u32, AddressWidth, u32)] = &[
            ("24c01", "24C01 (1 Kbit)", 128, AddressWidth::One, 8),
            ("24c02", "24C02 (2 Kbit)", 256, AddressWidth::One, 8),
            ("24c04", "24C04 (4 Kbit)", 512, AddressWidth::One, 16),
            ("24c08", "24C08 (8 Kbit)", 1024, AddressWidth::One, 16),
            ("24c16", "24C16 (16 Kbit)", 2048, AddressWidth::One, 16),
            ("24c32", "24C32 (32 Kbit)", 4096, AddressWidth::Two, 32),
            ("24c64", "24C64 (64 Kbit)", 8192, AddressWidth::Two, 32),
            ("24c128", "24C128 (128 Kbit)", 16384, AddressWidth::Two, 64),
            ("24c256", "24C256 (256 Kbit)", 32768, AddressWidth::Two, 64),
            ("24c512", "24C512 (512 Kbit)", 65536, AddressWidth::Two, 128),
        ];
        for &(id, name, size, width, page) in parts {
            let desc = ChipDescriptor {
                id: id.into(),
                name: name.into(),
                size_bytes: size,
                address_width: width,
                page_size: page,
                write_cycle_ms: 5,
                notes: String::new(),
            };
            // Builtin entries are known-valid.
            reg.register(desc).unwrap();
        }
        reg
    }

    /// Register a descriptor, validating it first.
    ///
    /// Re-registering an existing id replaces the old entry.
    pub fn register(&mut self, desc: ChipDescriptor) -> Result<()> {
        desc.validate()?;
        self.chips.insert(desc.id.clone(), desc);
        Ok(())
    }

    /// Look up a descriptor by id.
    pub fn get(&self, id: &str) -> Result<&ChipDescriptor> {
        self.chips
            .get(id)
            .ok_or_else(|| Error::UnknownChip(id.into()))
    }

    /// All registered descriptors, sorted by id.
    pub fn list(&self) -> impl Iterator<Item = &ChipDescriptor> {
        self.chips.values()
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.chips.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }

    /// Load all `*.ron` descriptor files from a directory.
    ///
    /// Returns the number of descriptors loaded. Files that fail to parse or
    /// validate abort the load.
    pub fn load_dir<P: AsRef<Path>>(&mut self, dir: P) -> core::result::Result<usize, LoadError> {
        let mut loaded = 0;
        for entry in fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ron") {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            let desc: ChipDescriptor = ron::from_str(&text)?;
            log::debug!("loaded descriptor {} from {:?}", desc.id, path);
            self.register(desc)?;
            loaded += 1;
        }
        Ok(loaded)
    }
}
