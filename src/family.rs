//! Static parameters of every supported board family.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A board model. Each family has a fixed flash size and HalfKay framing.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BoardFamily {
    Teensy2,
    Teensy2PlusPlus,
    TeensyLc,
    Teensy30,
    Teensy31,
    Teensy32,
    Teensy35,
    Teensy36,
    Teensy40,
}

/// Whether a transaction's address field counts bytes or whole blocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressKind {
    ByteOffset,
    BlockIndex,
}

/// Byte placement of the address field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Describes how a family encodes the target address at the start of an upload transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddressEncoding {
    pub kind: AddressKind,

    /// Number of address bytes at the start of the header.
    pub width: usize,

    pub order: ByteOrder,
}

impl AddressEncoding {
    pub const fn byte_offset(width: usize) -> Self {
        AddressEncoding {
            kind: AddressKind::ByteOffset,
            width,
            order: ByteOrder::Little,
        }
    }

    pub const fn block_index(width: usize) -> Self {
        AddressEncoding {
            kind: AddressKind::BlockIndex,
            width,
            order: ByteOrder::Little,
        }
    }

    /// Writes the address of the block starting at image `offset` into the transaction header.
    /// Bits that do not fit into `width` bytes are dropped.
    pub fn encode(&self, offset: usize, block_size: usize, header: &mut [u8]) {
        let value = match self.kind {
            AddressKind::ByteOffset => offset,
            AddressKind::BlockIndex => offset / block_size,
        } as u64;
        let bytes = value.to_le_bytes();
        let field = &mut header[..self.width];

        match self.order {
            ByteOrder::Little => field.copy_from_slice(&bytes[..self.width]),
            ByteOrder::Big => {
                for (i, byte) in field.iter_mut().enumerate() {
                    *byte = bytes[self.width - 1 - i];
                }
            }
        }
    }
}

/// Reset vector and startup code pattern which identify images built for a family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ImageSignature {
    /// Expected value of the reset handler pointer in the vector table.
    pub reset_handler: u32,

    /// Word expected somewhere between the reset handler and the end of the vector area.
    pub magic: u32,
}

/// Immutable flash and protocol parameters of a board family.
#[derive(Debug)]
pub struct DeviceProfile {
    pub family: BoardFamily,

    /// Human readable board name, e.g. "Teensy 3.6".
    pub name: &'static str,

    /// Microcontroller part number.
    pub mcu: &'static str,

    /// Size of the flash available for the application (in bytes).
    pub flash_size: usize,

    /// Image bytes written per upload transaction.
    pub block_size: usize,

    /// Header bytes preceding the payload within a transaction.
    pub data_offset: usize,

    pub address: AddressEncoding,

    /// HID usage code the bootloader reports for this family.
    pub bootloader_usage: u16,

    /// USB device revision reported while the board runs its application, if it is unique.
    pub runtime_revision: Option<u16>,

    pub signature: Option<ImageSignature>,
}

impl DeviceProfile {
    /// Length of one upload transaction (header plus payload).
    pub fn report_len(&self) -> usize {
        self.block_size + self.data_offset
    }

    /// Number of blocks covering the whole flash.
    pub fn block_count(&self) -> usize {
        (self.flash_size + self.block_size - 1) / self.block_size
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Board: {}", self.name)?;
        writeln!(f, "MCU: {}", self.mcu)?;
        writeln!(f, "Flash size: {} KiB", self.flash_size / 1024)?;
        writeln!(
            f,
            "Upload block: {} bytes after a {} byte header",
            self.block_size, self.data_offset
        )
    }
}

const ARM_ADDRESS: AddressEncoding = AddressEncoding::byte_offset(3);

static PROFILES: [DeviceProfile; 9] = [
    DeviceProfile {
        family: BoardFamily::Teensy2,
        name: "Teensy 2",
        mcu: "ATMEGA32U4",
        flash_size: 31 * 1024,
        block_size: 128,
        data_offset: 2,
        address: AddressEncoding::byte_offset(2),
        bootloader_usage: 0x1b,
        runtime_revision: None,
        signature: None,
    },
    DeviceProfile {
        family: BoardFamily::Teensy2PlusPlus,
        name: "Teensy 2++",
        mcu: "AT90USB1286",
        flash_size: 124 * 1024,
        block_size: 256,
        data_offset: 2,
        address: AddressEncoding::block_index(2),
        bootloader_usage: 0x1c,
        runtime_revision: None,
        signature: None,
    },
    DeviceProfile {
        family: BoardFamily::TeensyLc,
        name: "Teensy LC",
        mcu: "MKL26Z64",
        flash_size: 62 * 1024,
        block_size: 512,
        data_offset: 64,
        address: ARM_ADDRESS,
        bootloader_usage: 0x20,
        runtime_revision: Some(0x0273),
        signature: Some(ImageSignature {
            reset_handler: 0xc1,
            magic: 0x0000_3f82,
        }),
    },
    DeviceProfile {
        family: BoardFamily::Teensy30,
        name: "Teensy 3.0",
        mcu: "MK20DX128",
        flash_size: 128 * 1024,
        block_size: 1024,
        data_offset: 64,
        address: ARM_ADDRESS,
        bootloader_usage: 0x1d,
        runtime_revision: Some(0x0274),
        signature: Some(ImageSignature {
            reset_handler: 0xf9,
            magic: 0x0004_3f82,
        }),
    },
    DeviceProfile {
        family: BoardFamily::Teensy31,
        name: "Teensy 3.1",
        mcu: "MK20DX256",
        flash_size: 256 * 1024,
        block_size: 1024,
        data_offset: 64,
        address: ARM_ADDRESS,
        bootloader_usage: 0x1e,
        // 3.1 and 3.2 share a revision while running; it resolves to 3.2.
        runtime_revision: None,
        signature: Some(ImageSignature {
            reset_handler: 0x1bd,
            magic: 0x0004_3f82,
        }),
    },
    DeviceProfile {
        family: BoardFamily::Teensy32,
        name: "Teensy 3.2",
        mcu: "MK20DX256",
        flash_size: 256 * 1024,
        block_size: 1024,
        data_offset: 64,
        address: ARM_ADDRESS,
        bootloader_usage: 0x21,
        runtime_revision: Some(0x0275),
        signature: Some(ImageSignature {
            reset_handler: 0x1bd,
            magic: 0x0004_3f82,
        }),
    },
    DeviceProfile {
        family: BoardFamily::Teensy35,
        name: "Teensy 3.5",
        mcu: "MK64FX512",
        flash_size: 512 * 1024,
        block_size: 1024,
        data_offset: 64,
        address: ARM_ADDRESS,
        bootloader_usage: 0x1f,
        runtime_revision: Some(0x0276),
        signature: Some(ImageSignature {
            reset_handler: 0x199,
            magic: 0x0004_3f82,
        }),
    },
    DeviceProfile {
        family: BoardFamily::Teensy36,
        name: "Teensy 3.6",
        mcu: "MK66FX1M0",
        flash_size: 1024 * 1024,
        block_size: 1024,
        data_offset: 64,
        address: ARM_ADDRESS,
        bootloader_usage: 0x22,
        runtime_revision: Some(0x0277),
        signature: Some(ImageSignature {
            reset_handler: 0x1d1,
            magic: 0x0004_3f82,
        }),
    },
    DeviceProfile {
        family: BoardFamily::Teensy40,
        name: "Teensy 4.0",
        mcu: "IMXRT1062",
        flash_size: 2048 * 1024,
        block_size: 1024,
        data_offset: 64,
        address: ARM_ADDRESS,
        bootloader_usage: 0x24,
        runtime_revision: Some(0x0279),
        signature: None,
    },
];

/// Looks up the parameters of a board family.
pub fn resolve_profile(family: BoardFamily) -> Result<&'static DeviceProfile> {
    PROFILES
        .iter()
        .find(|profile| profile.family == family)
        .ok_or_else(|| Error::UnsupportedDevice(format!("{:?}", family)))
}

impl BoardFamily {
    /// Identifies a board running HalfKay by the usage code of its HID interface.
    pub fn from_bootloader_usage(usage: u16) -> Result<Self> {
        PROFILES
            .iter()
            .find(|profile| profile.bootloader_usage == usage)
            .map(|profile| profile.family)
            .ok_or_else(|| Error::UnsupportedDevice(format!("HID usage 0x{:02x}", usage)))
    }

    /// Identifies a board running its application by its USB device revision.
    pub fn from_runtime_revision(revision: u16) -> Result<Self> {
        PROFILES
            .iter()
            .find(|profile| profile.runtime_revision == Some(revision))
            .map(|profile| profile.family)
            .ok_or_else(|| Error::UnsupportedDevice(format!("device revision {:04x}", revision)))
    }

    pub fn profile(self) -> Result<&'static DeviceProfile> {
        resolve_profile(self)
    }
}

impl fmt::Display for BoardFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match resolve_profile(*self) {
            Ok(profile) => f.write_str(profile.name),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

impl FromStr for BoardFamily {
    type Err = Error;

    /// Accepts names like `teensy40`, `Teensy 3.6`, `lc` or `2++`.
    fn from_str(name: &str) -> Result<Self> {
        let normalized: String = name
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !matches!(c, ' ' | '.' | '_' | '-'))
            .collect();
        let short = normalized.strip_prefix("teensy").unwrap_or(&normalized);

        match short {
            "2" => Ok(BoardFamily::Teensy2),
            "2++" | "2pp" => Ok(BoardFamily::Teensy2PlusPlus),
            "lc" => Ok(BoardFamily::TeensyLc),
            "30" => Ok(BoardFamily::Teensy30),
            "31" => Ok(BoardFamily::Teensy31),
            "32" => Ok(BoardFamily::Teensy32),
            "35" => Ok(BoardFamily::Teensy35),
            "36" => Ok(BoardFamily::Teensy36),
            "40" => Ok(BoardFamily::Teensy40),
            _ => Err(Error::UnsupportedDevice(name.to_string())),
        }
    }
}
