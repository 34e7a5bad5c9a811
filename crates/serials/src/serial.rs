use core::str::FromStr;

use serde::{Deserialize, Serialize};

use stocktake_core::DomainError;

/// Width of the formatted serial value. Fixed so that serials sort
/// lexicographically in counter order and scanners can validate length.
pub const SERIAL_WIDTH: usize = 12;

/// Prefix used when a serial is rendered as a printed label code.
const LABEL_PREFIX: &str = "SN-";

/// One serial value from the shared numbering space.
///
/// Stored as the raw counter value; rendered as a fixed-width, zero-padded
/// decimal string. The printed barcode encodes the same value with a label
/// prefix, which is why scans can arrive in either form (`ScanMode`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerialNumber(u64);

impl SerialNumber {
    pub fn from_counter(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The raw serial string, e.g. `000000001234`.
    pub fn as_sn(&self) -> String {
        format!("{:0width$}", self.0, width = SERIAL_WIDTH)
    }

    /// The label code as printed on a barcode tag, e.g. `SN-000000001234`.
    pub fn as_label_code(&self) -> String {
        format!("{LABEL_PREFIX}{}", self.as_sn())
    }

    /// Parse a scanned code according to the scan mode.
    pub fn parse(code: &str, mode: ScanMode) -> Result<Self, DomainError> {
        let digits = match mode {
            ScanMode::Sn => code,
            ScanMode::Barcode => code
                .strip_prefix(LABEL_PREFIX)
                .ok_or_else(|| DomainError::validation("barcode is missing the label prefix"))?,
        };

        if digits.len() != SERIAL_WIDTH {
            return Err(DomainError::validation(format!(
                "serial must be {SERIAL_WIDTH} digits, got {}",
                digits.len()
            )));
        }

        digits
            .parse::<u64>()
            .map(Self)
            .map_err(|_| DomainError::validation("serial must be numeric"))
    }
}

impl core::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.as_sn())
    }
}

impl FromStr for SerialNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, ScanMode::Sn)
    }
}

/// How a scanned code should be resolved.
///
/// Both modes resolve to the same underlying stock unit; they exist as
/// separate modes because some stock is tracked by SN without a separately
/// printed barcode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Match the printed label code (`SN-…`).
    Barcode,
    /// Match the raw serial value.
    Sn,
}
