//! Firmware image loading and pre-flight checks
//!
//! Images are validated before any connection so a bad file never reaches
//! the boxes. On the openmote-b (CC2538) the customer configuration area
//! (CCA) lives in the last flash page and holds the bootloader backdoor
//! configuration. An image that clears the backdoor bricks the mote for the
//! testbed, so it is rejected here.

use crate::error::{DispatchError, DispatchResult};
use crate::models::BoardType;
use base64::Engine;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Upper 16 bits of the CCA address (0x0027FFD4)
const CCA_UPPER_ADDRESS: u16 = 0x0027;
/// Lower 16 bits of the backdoor configuration word
const CCA_BACKDOOR_ADDRESS: u16 = 0xFFD4;
/// Backdoor and bootloader enabled, active low on PA6 (CC2538 UG 8.6.2)
const BACKDOOR_ENABLED: &str = "FFFFFFF6";

const RECORD_DATA: u8 = 0x00;
const RECORD_EXTENDED_LINEAR_ADDRESS: u8 = 0x04;

#[derive(Debug, Clone)]
pub struct FirmwareImage {
    name: String,
    bytes: Vec<u8>,
}

impl FirmwareImage {
    /// Read and check the image named by `--hexfile`
    pub fn load(path: Option<&Path>, board: BoardType) -> DispatchResult<Self> {
        let path = path.ok_or_else(|| {
            DispatchError::MissingFirmware("provide a firmware image with --hexfile".into())
        })?;
        let invalid = |reason: String| DispatchError::InvalidFirmware {
            path: path.display().to_string(),
            reason,
        };

        // Raw images are sized from the metadata so an oversized file is never read
        if is_bin(path) {
            let size = fs::metadata(path)
                .map_err(|e| DispatchError::MissingFirmware(format!("{}: {}", path.display(), e)))?
                .len();
            check_bin_size(size, board).map_err(invalid)?;
        }

        let bytes = fs::read(path)
            .map_err(|e| DispatchError::MissingFirmware(format!("{}: {}", path.display(), e)))?;

        if !is_bin(path) {
            check_ihex(&bytes).map_err(invalid)?;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        debug!("Loaded firmware {} ({} bytes) for {}", name, bytes.len(), board);

        Ok(Self { name, bytes })
    }

    /// File name sent as the `description` field
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

fn is_bin(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("bin"))
}

/// Flashing at an offset is not supported: the image must stop before the CCA page
fn check_bin_size(size: u64, board: BoardType) -> Result<(), String> {
    let max_size = board.flash_size() - board.flash_page_size();
    if size >= max_size {
        return Err(format!(
            "{} bytes would overwrite the customer configuration area (limit {} bytes)",
            size, max_size
        ));
    }
    Ok(())
}

fn check_ihex(bytes: &[u8]) -> Result<(), String> {
    let text = std::str::from_utf8(bytes).map_err(|_| "not an Intel HEX text file".to_string())?;
    if has_bootloader_backdoor(text) {
        Ok(())
    } else {
        Err("bootloader backdoor is not enabled in the customer configuration area".into())
    }
}

/// Scan Intel HEX records for the CCA backdoor configuration word
fn has_bootloader_backdoor(hex: &str) -> bool {
    let mut upper_address: Option<u16> = None;

    for line in hex.lines() {
        let Some(record) = line.trim().strip_prefix(':') else {
            continue;
        };
        if record.len() < 8 || !record.is_ascii() {
            continue;
        }

        let (Ok(count), Ok(address), Ok(kind)) = (
            u8::from_str_radix(&record[0..2], 16),
            u16::from_str_radix(&record[2..6], 16),
            u8::from_str_radix(&record[6..8], 16),
        ) else {
            continue;
        };
        let data = record.get(8..8 + count as usize * 2).unwrap_or("");

        match kind {
            RECORD_EXTENDED_LINEAR_ADDRESS => {
                upper_address = u16::from_str_radix(data, 16).ok();
            }
            RECORD_DATA
                if upper_address == Some(CCA_UPPER_ADDRESS)
                    && address == CCA_BACKDOOR_ADDRESS
                    && count > 4 =>
            {
                if data
                    .get(0..8)
                    .is_some_and(|word| word.eq_ignore_ascii_case(BACKDOOR_ENABLED))
                {
                    return true;
                }
            }
            _ => {}
        }
    }

    false
}
