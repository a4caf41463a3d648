use crate::error::{Error, Result};
use crate::family::DeviceProfile;
use crate::hex::{Block, Blocks, FirmwareImage};
use crate::transport::ReportWriter;
use log::{debug, info, warn};
use std::thread;
use std::time::Duration;

/// Pause before the single retry of a failed report write.
pub(crate) const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Time the board needs to erase the whole chip after receiving the first block.
pub(crate) const ERASE_DELAY: Duration = Duration::from_secs(5);

/// Time the board needs to program any later block.
pub(crate) const PROGRAM_DELAY: Duration = Duration::from_millis(500);

/// A long-running transfer which reports its progress one step at a time. Each item holds the
/// number of bytes processed so far, out of [`total`]. The iterator is fused after an error.
///
/// [`total`]: #tymethod.total
pub trait Operation: Iterator<Item = Result<usize>> {
    fn total(&self) -> usize;

    fn execute(&mut self) -> Result<()> {
        if let Some(Err(error)) = self.last() {
            Err(error)
        } else {
            Ok(())
        }
    }
}

/// Writes an image block by block. Erased blocks are skipped, except for the first one which
/// makes the board erase its flash.
pub struct Program<'i, 'w, W: ReportWriter> {
    writer: &'w mut W,
    profile: &'static DeviceProfile,
    blocks: Blocks<'i>,
    report: Vec<u8>,
    length: usize,
    pace: fn(Duration),
    done: bool,
}

impl<W: ReportWriter> Operation for Program<'_, '_, W> {
    fn total(&self) -> usize {
        self.length
    }
}

impl<W: ReportWriter> Iterator for Program<'_, '_, W> {
    type Item = Result<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let block = match self.blocks.next() {
            Some(block) => block,
            None => {
                self.done = true;
                return None;
            }
        };

        if block.offset == 0 {
            info!("Erasing {} flash memory", self.profile.name);
        }
        self.fill(block);

        Some(match self.send() {
            Ok(()) => {
                (self.pace)(if block.offset == 0 {
                    ERASE_DELAY
                } else {
                    PROGRAM_DELAY
                });
                Ok(block.offset + block.data.len())
            }
            Err(error) => {
                // Ensure that the iterator is fused after an error occurs
                self.done = true;
                Err(error)
            }
        })
    }
}

impl<'i, 'w, W: ReportWriter> Program<'i, 'w, W> {
    /// Prepares programming `image` with the framing of `profile`. Fails if the device's reports
    /// cannot hold a whole block.
    pub fn new(
        writer: &'w mut W,
        image: &'i FirmwareImage,
        profile: &'static DeviceProfile,
    ) -> Result<Self> {
        let available = writer.report_len();
        if profile.report_len() > available {
            return Err(Error::ReportTooSmall {
                needed: profile.report_len(),
                available,
            });
        }

        let blocks = image.blocks(profile.block_size);
        debug!(
            "Writing {} of {} blocks, the others are erased",
            blocks.clone().count(),
            profile.block_count()
        );

        Ok(Self {
            writer,
            profile,
            blocks,
            report: vec![0; available],
            length: image.len(),
            pace: thread::sleep,
            done: image.is_empty(),
        })
    }

    /// Replaces the sleep between blocks.
    pub(crate) fn with_pace(mut self, pace: fn(Duration)) -> Self {
        self.pace = pace;
        self
    }

    /// Builds the report for a block: address header, then the block's bytes. Everything else is
    /// zero.
    fn fill(&mut self, block: Block<'_>) {
        let data_offset = self.profile.data_offset;

        self.report.iter_mut().for_each(|byte| *byte = 0);
        self.profile.address.encode(
            block.offset,
            self.profile.block_size,
            &mut self.report[..data_offset],
        );
        self.report[data_offset..data_offset + block.data.len()].copy_from_slice(block.data);
    }

    /// Writes the current report, retrying once after a short delay.
    fn send(&mut self) -> Result<()> {
        match self.writer.write_report(&self.report) {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!("Report write failed ({}), retrying", error);
                thread::sleep(RETRY_DELAY);
                self.writer.write_report(&self.report)
            }
        }
    }
}
