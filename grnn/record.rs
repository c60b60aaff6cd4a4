//! Fixed-width binary records for the persisted pair set.
//!
//! A pair record for training rows `i` and `j` holds, in order: row `i` (C values, label
//! included), row `j` (C values), the stage-1 pseudo-label of `i`, and that of `j`. Every
//! value is an `f64` in host byte order. The matching target record holds the single
//! residual `pseudo[i] - pseudo[j]`.

use ndarray::ArrayView1;

pub const F64_BYTES: usize = std::mem::size_of::<f64>();
pub const TARGET_RECORD_BYTES: usize = F64_BYTES;

/// Shape of a pair record for a table with `cols` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairLayout {
    cols: usize,
}

impl PairLayout {
    pub fn new(cols: usize) -> Self {
        Self { cols }
    }

    /// Recovers the layout from a record width in bytes, if the width is well formed.
    /// A table needs at least one column, so records narrower than 4 values are rejected.
    pub fn from_record_bytes(bytes: usize) -> Option<Self> {
        if bytes % F64_BYTES != 0 {
            return None;
        }
        let width = bytes / F64_BYTES;
        if width < 4 || (width - 2) % 2 != 0 {
            return None;
        }
        Some(Self::new((width - 2) / 2))
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of `f64` values per record.
    pub fn width(&self) -> usize {
        2 * self.cols + 2
    }

    pub fn record_bytes(&self) -> usize {
        self.width() * F64_BYTES
    }
}

/// One pair record. Allocated once and refilled for every pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairRecord {
    layout: PairLayout,
    values: Vec<f64>,
}

impl PairRecord {
    pub fn zeroed(layout: PairLayout) -> Self {
        Self {
            layout,
            values: vec![0.0; layout.width()],
        }
    }

    pub fn layout(&self) -> PairLayout {
        self.layout
    }

    /// Overwrites every field. Both rows must have exactly `layout.cols()` values.
    pub fn fill(
        &mut self,
        left: ArrayView1<f64>,
        right: ArrayView1<f64>,
        left_pseudo: f64,
        right_pseudo: f64,
    ) {
        let cols = self.layout.cols;
        debug_assert_eq!(left.len(), cols);
        debug_assert_eq!(right.len(), cols);
        let (rows, pseudo) = self.values.split_at_mut(2 * cols);
        let (left_slot, right_slot) = rows.split_at_mut(cols);
        left_slot.iter_mut().zip(left).for_each(|(dst, &v)| *dst = v);
        right_slot.iter_mut().zip(right).for_each(|(dst, &v)| *dst = v);
        pseudo[0] = left_pseudo;
        pseudo[1] = right_pseudo;
    }

    pub fn left(&self) -> &[f64] {
        &self.values[..self.layout.cols]
    }

    pub fn right(&self) -> &[f64] {
        &self.values[self.layout.cols..2 * self.layout.cols]
    }

    /// Both rows, concatenated.
    pub fn rows(&self) -> &[f64] {
        &self.values[..2 * self.layout.cols]
    }

    pub fn left_pseudo(&self) -> f64 {
        self.values[2 * self.layout.cols]
    }

    pub fn right_pseudo(&self) -> f64 {
        self.values[2 * self.layout.cols + 1]
    }

    /// The stage-2 training target for this pair.
    pub fn residual(&self) -> f64 {
        self.left_pseudo() - self.right_pseudo()
    }

    /// All fields in record order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Serializes into `buf`, which must be exactly `layout.record_bytes()` long.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.layout.record_bytes());
        for (chunk, value) in buf.chunks_exact_mut(F64_BYTES).zip(&self.values) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
    }

    /// Deserializes from `buf`, which must be exactly `layout.record_bytes()` long.
    pub fn decode_from(&mut self, buf: &[u8]) {
        debug_assert_eq!(buf.len(), self.layout.record_bytes());
        for (value, chunk) in self.values.iter_mut().zip(buf.chunks_exact(F64_BYTES)) {
            *value = f64::from_ne_bytes(read_f64_bytes(chunk));
        }
    }
}

fn read_f64_bytes(chunk: &[u8]) -> [u8; F64_BYTES] {
    let mut bytes = [0u8; F64_BYTES];
    bytes.copy_from_slice(chunk);
    bytes
}

/// The residual stored alongside a pair record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetRecord(pub f64);

impl TargetRecord {
    pub fn encode(self) -> [u8; TARGET_RECORD_BYTES] {
        self.0.to_ne_bytes()
    }

    pub fn decode(bytes: [u8; TARGET_RECORD_BYTES]) -> Self {
        Self(f64::from_ne_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn layout_width_counts_both_rows_and_pseudo_labels() {
        let layout = PairLayout::new(3);
        assert_eq!(layout.width(), 8);
        assert_eq!(layout.record_bytes(), 64);
        assert_eq!(PairLayout::from_record_bytes(64), Some(layout));
        assert_eq!(PairLayout::from_record_bytes(60), None);
        assert_eq!(PairLayout::from_record_bytes(24), None);
        assert_eq!(PairLayout::from_record_bytes(16), None);
        assert_eq!(PairLayout::from_record_bytes(32), Some(PairLayout::new(1)));
    }

    #[test]
    fn fields_are_laid_out_in_order() {
        let mut record = PairRecord::zeroed(PairLayout::new(2));
        record.fill(array![1.0, 2.0].view(), array![3.0, 4.0].view(), 5.5, 1.5);
        assert_eq!(record.values(), &[1.0, 2.0, 3.0, 4.0, 5.5, 1.5]);
        assert_eq!(record.left(), &[1.0, 2.0]);
        assert_eq!(record.right(), &[3.0, 4.0]);
        assert_eq!(record.rows(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(record.residual(), 4.0);

        let mut bytes = vec![0u8; record.layout().record_bytes()];
        record.encode_into(&mut bytes);
        assert_eq!(&bytes[32..40], &5.5f64.to_ne_bytes());

        let mut decoded = PairRecord::zeroed(PairLayout::new(2));
        decoded.decode_from(&bytes);
        assert_eq!(decoded, record);
    }

    #[test]
    fn target_record_is_one_native_f64() {
        let bytes = TargetRecord(-2.25).encode();
        assert_eq!(bytes, (-2.25f64).to_ne_bytes());
        assert_eq!(TargetRecord::decode(bytes), TargetRecord(-2.25));
    }
}
