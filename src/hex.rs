//! Decoding of Intel HEX firmware files into flash images.
//!
//! See <https://en.wikipedia.org/wiki/Intel_HEX> for the file format. Only the record types
//! found in images for the supported boards are understood: data (00), end of file (01),
//! extended segment address (02) and extended linear address (04).

use crate::error::{Error, FormatError, Result};
use crate::family::BoardFamily;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::iter::Enumerate;
use std::path::Path;
use std::slice::Chunks;
use std::str;

/// Value of unwritten flash.
pub const ERASE_VALUE: u8 = 0xff;

/// Upper linear base address some toolchains emit for flash bank zero.
const FLASH_BANK_ALIAS: u32 = 0x6000_0000;

/// End of the vector area searched by [`FirmwareImage::is_likely_valid_for`].
///
/// [`FirmwareImage::is_likely_valid_for`]: struct.FirmwareImage.html#method.is_likely_valid_for
const VECTOR_AREA_END: usize = 0x400;

/// Data bytes per record written by [`FirmwareImage::write_hex`].
///
/// [`FirmwareImage::write_hex`]: struct.FirmwareImage.html#method.write_hex
const HEX_RECORD_LEN: usize = 16;

/// A flash image decoded from an Intel HEX file. Its length always equals the flash size it was
/// decoded for and bytes not covered by the file hold [`ERASE_VALUE`].
///
/// [`ERASE_VALUE`]: constant.ERASE_VALUE.html
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

/// Line-by-line Intel HEX decoder.
///
/// # Examples
///
/// ```rust
/// use halfkay::HexDecoder;
///
/// let mut decoder = HexDecoder::new(64);
/// assert!(!decoder.decode_line(":0400100001020304E2")?);
/// assert!(decoder.decode_line(":00000001FF")?);
///
/// let image = decoder.finish()?;
/// assert_eq!(&image.as_bytes()[0x10..0x14], &[1, 2, 3, 4]);
/// # Ok::<(), halfkay::Error>(())
/// ```
pub struct HexDecoder {
    data: Vec<u8>,
    upper_linear_base: u32,
    segment_base: u32,
    line: usize,
    done: bool,
}

struct Record {
    kind: u8,
    address: u16,
    data: Vec<u8>,
}

impl HexDecoder {
    /// Creates a decoder producing an image of `flash_size` erased bytes.
    pub fn new(flash_size: usize) -> Self {
        HexDecoder {
            data: vec![ERASE_VALUE; flash_size],
            upper_linear_base: 0,
            segment_base: 0,
            line: 0,
            done: false,
        }
    }

    /// Whether the end of file record has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decodes a single line (with or without its line terminator). Returns `true` once the end
    /// of file record has been decoded; later lines are ignored.
    pub fn decode_line(&mut self, line: &str) -> Result<bool> {
        if self.done {
            return Ok(true);
        }
        self.line += 1;

        self.apply(line.trim_end_matches(&['\r', '\n'][..]))
            .map_err(|kind| Error::Format {
                line: self.line,
                kind,
            })?;

        Ok(self.done)
    }

    /// Returns the decoded image. Fails if the end of file record was never seen.
    pub fn finish(self) -> Result<FirmwareImage> {
        if !self.done {
            return Err(Error::Format {
                line: self.line,
                kind: FormatError::MissingEndOfFile,
            });
        }

        Ok(FirmwareImage { data: self.data })
    }

    fn apply(&mut self, line: &str) -> std::result::Result<(), FormatError> {
        // A blank line ends the input.
        if line.is_empty() {
            return Err(FormatError::MissingEndOfFile);
        }

        let record = parse_record(line)?;
        match record.kind {
            0x00 => {
                let offset = u64::from(self.upper_linear_base)
                    + u64::from(self.segment_base)
                    + u64::from(record.address);
                let end = offset + record.data.len() as u64;
                if end > self.data.len() as u64 {
                    return Err(FormatError::ExceedsFlash {
                        offset,
                        len: record.data.len(),
                        flash_size: self.data.len(),
                    });
                }
                self.data[offset as usize..end as usize].copy_from_slice(&record.data);
            }
            0x01 => self.done = true,
            0x02 => {
                self.upper_linear_base = 0;
                self.segment_base = u32::from(extended_address(&record)?) << 4;
            }
            0x04 => {
                self.segment_base = 0;
                self.upper_linear_base = u32::from(extended_address(&record)?) << 16;
                if self.upper_linear_base == FLASH_BANK_ALIAS {
                    self.upper_linear_base = 0;
                }
            }
            kind => return Err(FormatError::UnsupportedRecord(kind)),
        }

        Ok(())
    }
}

/// Splits a line shaped `:LLAAAATT[DD...]CC` into its fields and verifies the checksum.
fn parse_record(line: &str) -> std::result::Result<Record, FormatError> {
    let chars = line.as_bytes();
    if chars.len() < 11 {
        return Err(FormatError::TooShort);
    }
    if chars[0] != b':' {
        return Err(FormatError::MissingColon);
    }

    let declared = usize::from(hex_byte(&chars[1..3])?);
    if chars.len() != 11 + 2 * declared {
        return Err(FormatError::LengthMismatch {
            declared,
            actual: chars.len(),
        });
    }

    let raw = chars[1..]
        .chunks(2)
        .map(hex_byte)
        .collect::<std::result::Result<Vec<u8>, _>>()?;
    let (found, body) = match raw.split_last() {
        Some(split) => split,
        None => return Err(FormatError::TooShort),
    };
    let expected = checksum(body);
    if expected != *found {
        return Err(FormatError::Checksum {
            expected,
            found: *found,
        });
    }

    Ok(Record {
        kind: body[3],
        address: u16::from_be_bytes([body[1], body[2]]),
        data: body[4..].to_vec(),
    })
}

fn hex_byte(pair: &[u8]) -> std::result::Result<u8, FormatError> {
    let digit = |c: u8| char::from(c).to_digit(16).ok_or(FormatError::InvalidDigit);
    Ok((digit(pair[0])? << 4 | digit(pair[1])?) as u8)
}

/// Two's complement of the low byte of the sum of all bytes.
fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
        .wrapping_neg()
}

fn extended_address(record: &Record) -> std::result::Result<u16, FormatError> {
    match record.data[..] {
        [high, low] => Ok(u16::from_be_bytes([high, low])),
        _ => Err(FormatError::BadExtendedAddress),
    }
}

fn read_le_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn write_record<W: Write>(
    out: &mut W,
    kind: u8,
    address: u16,
    data: &[u8],
) -> io::Result<()> {
    let mut header = vec![data.len() as u8];
    header.extend_from_slice(&address.to_be_bytes());
    header.push(kind);

    write!(out, ":")?;
    for byte in header.iter().chain(data) {
        write!(out, "{:02X}", byte)?;
    }
    header.extend_from_slice(data);
    writeln!(out, "{:02X}", checksum(&header))
}

impl FirmwareImage {
    /// Decodes Intel HEX text from a reader into an image of `flash_size` bytes.
    pub fn decode<R: BufRead>(mut reader: R, flash_size: usize) -> Result<Self> {
        let mut decoder = HexDecoder::new(flash_size);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            if reader.read_until(b'\n', &mut buffer)? == 0 {
                break;
            }

            // Anything outside ASCII cannot be a hex digit
            let line = str::from_utf8(&buffer).map_err(|_| Error::Format {
                line: decoder.line + 1,
                kind: FormatError::InvalidDigit,
            })?;
            if decoder.decode_line(line)? {
                break;
            }
        }
        decoder.finish()
    }

    /// Decodes Intel HEX text held in memory.
    pub fn parse(text: &str, flash_size: usize) -> Result<Self> {
        Self::decode(text.as_bytes(), flash_size)
    }

    /// Reads and decodes an Intel HEX file.
    pub fn open<P: AsRef<Path>>(path: P, flash_size: usize) -> Result<Self> {
        let file = File::open(path)?;
        Self::decode(BufReader::new(file), flash_size)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Iterates over the blocks worth uploading: the first block, then every block holding at
    /// least one byte different from [`ERASE_VALUE`].
    ///
    /// [`ERASE_VALUE`]: constant.ERASE_VALUE.html
    pub fn blocks(&self, block_size: usize) -> Blocks<'_> {
        Blocks {
            chunks: self.data.chunks(block_size).enumerate(),
            block_size,
        }
    }

    /// Guesses whether this image was built for the given board family by looking for the
    /// family's startup code behind the reset handler.
    ///
    /// A `true` result can be trusted. `false` only means the check could not confirm it, which
    /// is always the case for families without a known signature.
    pub fn is_likely_valid_for(&self, family: BoardFamily) -> bool {
        let signature = match family.profile().ok().and_then(|profile| profile.signature) {
            Some(signature) => signature,
            None => return false,
        };
        if self.data.len() < VECTOR_AREA_END {
            return false;
        }

        match read_le_u32(&self.data, 4) {
            Some(reset_handler)
                if reset_handler == signature.reset_handler
                    && (reset_handler as usize) < VECTOR_AREA_END =>
            {
                (reset_handler as usize..VECTOR_AREA_END)
                    .any(|offset| read_le_u32(&self.data, offset) == Some(signature.magic))
            }
            _ => false,
        }
    }

    /// Writes the image back out as Intel HEX. Rows consisting only of [`ERASE_VALUE`] are left
    /// out.
    ///
    /// [`ERASE_VALUE`]: constant.ERASE_VALUE.html
    pub fn write_hex<W: Write>(&self, mut out: W) -> io::Result<()> {
        let mut upper = None;
        for (row, chunk) in self.data.chunks(HEX_RECORD_LEN).enumerate() {
            if chunk.iter().all(|byte| *byte == ERASE_VALUE) {
                continue;
            }

            let offset = row * HEX_RECORD_LEN;
            let high = (offset >> 16) as u16;
            if upper != Some(high) {
                write_record(&mut out, 0x04, 0, &high.to_be_bytes())?;
                upper = Some(high);
            }
            write_record(&mut out, 0x00, offset as u16, chunk)?;
        }
        write_record(&mut out, 0x01, 0, &[])
    }
}

/// A slice of the image uploaded in one transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Block<'a> {
    /// Position of the block's first byte in the image.
    pub offset: usize,

    /// Image bytes of the block. Shorter than the block size only at the end of the image.
    pub data: &'a [u8],
}

/// Iterator returned by [`FirmwareImage::blocks`].
///
/// [`FirmwareImage::blocks`]: struct.FirmwareImage.html#method.blocks
#[derive(Clone)]
pub struct Blocks<'a> {
    chunks: Enumerate<Chunks<'a, u8>>,
    block_size: usize,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Block<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (index, data) = self.chunks.next()?;

            // The first block is always sent, it triggers the chip erase
            if index == 0 || data.iter().any(|byte| *byte != ERASE_VALUE) {
                return Some(Block {
                    offset: index * self.block_size,
                    data,
                });
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.chunks.size_hint().1)
    }
}
