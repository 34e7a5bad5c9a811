//! Printable-label expansion.
//!
//! Printing is a pure view over already-issued serials: expanding a record
//! into N label copies never allocates new serials and never touches the
//! counter.

use serde::{Deserialize, Serialize};

use crate::serial::SerialNumber;

/// One label to be sent to a printer.
///
/// Several labels may carry the same serial (reprints, multi-copy tags for
/// bulk units); the serial itself stays unique in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintableLabel {
    pub serial: SerialNumber,
    /// The code a scanner will read back, e.g. `SN-000000001234`.
    pub code: String,
    /// 1-based copy index within this print run.
    pub copy: u32,
}

/// Expand serial records into printable labels, `copies_per_record` labels
/// per serial (minimum 1). Duplicates labels, never serials.
pub fn expand_for_printing(
    serials: impl IntoIterator<Item = SerialNumber>,
    copies_per_record: u32,
) -> Vec<PrintableLabel> {
    let copies = copies_per_record.max(1);

    serials
        .into_iter()
        .flat_map(|serial| {
            (1..=copies).map(move |copy| PrintableLabel {
                serial,
                code: serial.as_label_code(),
                copy,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serials(values: &[u64]) -> Vec<SerialNumber> {
        values.iter().copied().map(SerialNumber::from_counter).collect()
    }

    #[test]
    fn default_expansion_is_one_label_per_serial() {
        let labels = expand_for_printing(serials(&[1, 2, 3]), 1);
        assert_eq!(labels.len(), 3);
        assert!(labels.iter().all(|l| l.copy == 1));
    }

    #[test]
    fn expansion_duplicates_labels_not_serials() {
        let labels = expand_for_printing(serials(&[7, 8]), 3);
        assert_eq!(labels.len(), 6);

        // Same serial repeated per copy; no new serial values appear.
        let mut distinct: Vec<u64> = labels.iter().map(|l| l.serial.value()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct, vec![7, 8]);

        let copies: Vec<u32> = labels
            .iter()
            .filter(|l| l.serial.value() == 7)
            .map(|l| l.copy)
            .collect();
        assert_eq!(copies, vec![1, 2, 3]);
    }

    #[test]
    fn zero_copies_is_clamped_to_one() {
        let labels = expand_for_printing(serials(&[5]), 0);
        assert_eq!(labels.len(), 1);
    }
}
