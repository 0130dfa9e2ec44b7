// Payload encoding for measurement data travelling through payload segments.

use crate::error::{CommError, CommResult};
use crate::ipc::SlotKind;

const BLOCK_HEADER_SIZE: usize = 16;

/// A block of samples. One column is a 1D trace; more columns form rows of
/// a 2D scan.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementBlock {
    /// Index of the first row within the run.
    pub start: u64,
    pub columns: u32,
    pub values: Vec<f64>,
}

impl MeasurementBlock {
    pub fn trace(start: u64, values: Vec<f64>) -> Self {
        Self {
            start,
            columns: 1,
            values,
        }
    }

    pub fn rows(&self) -> usize {
        if self.columns == 0 {
            0
        } else {
            self.values.len() / self.columns as usize
        }
    }

    pub fn slot_kind(&self) -> SlotKind {
        if self.columns <= 1 {
            SlotKind::Data1D
        } else {
            SlotKind::Data2D
        }
    }

    /// `start: u64`, `columns: u32`, 4 reserved bytes, then the values, all
    /// little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE + self.values.len() * 8);
        out.extend_from_slice(&self.start.to_le_bytes());
        out.extend_from_slice(&self.columns.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        for value in &self.values {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> CommResult<Self> {
        if bytes.len() < BLOCK_HEADER_SIZE || (bytes.len() - BLOCK_HEADER_SIZE) % 8 != 0 {
            return Err(CommError::Malformed(format!(
                "measurement block of {} bytes",
                bytes.len()
            )));
        }
        let (head, body) = bytes.split_at(BLOCK_HEADER_SIZE);
        let mut start = [0u8; 8];
        start.copy_from_slice(&head[..8]);
        let mut columns = [0u8; 4];
        columns.copy_from_slice(&head[8..12]);
        let columns = u32::from_le_bytes(columns);

        let values: Vec<f64> = body
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();
        if columns == 0 || values.len() % columns as usize != 0 {
            return Err(CommError::Malformed(format!(
                "{} values do not fill rows of {} columns",
                values.len(),
                columns
            )));
        }
        Ok(Self {
            start: u64::from_le_bytes(start),
            columns,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_keeps_its_shape() {
        let block = MeasurementBlock {
            start: 40,
            columns: 3,
            values: vec![0.5, 1.5, 2.5, -1.0, -2.0, -3.0],
        };
        let decoded = MeasurementBlock::decode(&block.encode()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.rows(), 2);
        assert_eq!(decoded.slot_kind(), SlotKind::Data2D);
        assert_eq!(MeasurementBlock::trace(0, vec![1.0]).slot_kind(), SlotKind::Data1D);
    }

    #[test]
    fn ragged_blocks_are_rejected() {
        let mut bytes = MeasurementBlock {
            start: 0,
            columns: 2,
            values: vec![1.0, 2.0],
        }
        .encode();
        bytes.extend_from_slice(&3.0f64.to_le_bytes());
        assert!(matches!(
            MeasurementBlock::decode(&bytes),
            Err(CommError::Malformed(_))
        ));
        assert!(MeasurementBlock::decode(&bytes[..10]).is_err());
    }
}
