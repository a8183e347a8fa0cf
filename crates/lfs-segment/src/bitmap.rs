//! Fixed-length bitmap over a byte vector, LSB-first within each byte.
//!
//! The byte layout matches the persisted `SitRecord::valid_map` so entries
//! can be journaled without conversion.

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bitmap {
    bytes: Vec<u8>,
    len: u32,
}

impl Bitmap {
    /// All-zero bitmap of `len` bits.
    #[must_use]
    pub fn new(len: u32) -> Self {
        Self {
            bytes: vec![0_u8; len.div_ceil(8) as usize],
            len,
        }
    }

    /// Bitmap of `len` bits from persisted bytes. Short input is zero-padded;
    /// bits past `len` are masked off.
    #[must_use]
    pub fn from_bytes(bytes: &[u8], len: u32) -> Self {
        let mut map = Self::new(len);
        let n = map.bytes.len().min(bytes.len());
        map.bytes[..n].copy_from_slice(&bytes[..n]);
        map.mask_tail();
        map
    }

    fn mask_tail(&mut self) {
        let rem = self.len % 8;
        if rem != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= (1_u8 << rem) - 1;
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn get(&self, idx: u32) -> bool {
        idx < self.len && bitmap_get(&self.bytes, idx)
    }

    /// Set bit `idx`, returning its previous value. Out-of-range is a no-op
    /// reporting `false`.
    pub fn test_and_set(&mut self, idx: u32) -> bool {
        if idx >= self.len {
            return false;
        }
        let byte = &mut self.bytes[(idx / 8) as usize];
        let mask = 1_u8 << (idx % 8);
        let prev = *byte & mask != 0;
        *byte |= mask;
        prev
    }

    /// Clear bit `idx`, returning its previous value.
    pub fn test_and_clear(&mut self, idx: u32) -> bool {
        if idx >= self.len {
            return false;
        }
        let byte = &mut self.bytes[(idx / 8) as usize];
        let mask = 1_u8 << (idx % 8);
        let prev = *byte & mask != 0;
        *byte &= !mask;
        prev
    }

    pub fn set(&mut self, idx: u32) {
        let _ = self.test_and_set(idx);
    }

    pub fn clear(&mut self, idx: u32) {
        let _ = self.test_and_clear(idx);
    }

    /// Clear bits `[start, end)`, returning how many were set.
    pub fn clear_range(&mut self, start: u32, end: u32) -> u32 {
        (start..end.min(self.len))
            .filter(|&idx| self.test_and_clear(idx))
            .count() as u32
    }

    pub fn clear_all(&mut self) {
        self.bytes.fill(0);
    }

    pub fn set_all(&mut self) {
        self.bytes.fill(0xFF);
        self.mask_tail();
    }

    pub fn copy_from(&mut self, other: &Self) {
        debug_assert_eq!(self.len, other.len);
        self.bytes.copy_from_slice(&other.bytes);
    }

    #[must_use]
    pub fn count_ones(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// First set bit at or after `from`.
    #[must_use]
    pub fn next_set(&self, from: u32) -> Option<u32> {
        self.scan(from, |byte| byte)
    }

    /// First clear bit at or after `from`.
    #[must_use]
    pub fn next_zero(&self, from: u32) -> Option<u32> {
        self.scan(from, |byte| !byte)
    }

    /// Last clear bit at or before `from`.
    #[must_use]
    pub fn prev_zero(&self, from: u32) -> Option<u32> {
        if self.len == 0 {
            return None;
        }
        let mut idx = from.min(self.len - 1);
        loop {
            if !self.get(idx) {
                return Some(idx);
            }
            idx = idx.checked_sub(1)?;
        }
    }

    fn scan(&self, from: u32, view: impl Fn(u8) -> u8) -> Option<u32> {
        if from >= self.len {
            return None;
        }
        let mut byte_idx = (from / 8) as usize;
        let mut bits = view(self.bytes[byte_idx]) & (0xFF_u8 << (from % 8));
        loop {
            if bits != 0 {
                let idx = byte_idx as u32 * 8 + bits.trailing_zeros();
                return (idx < self.len).then_some(idx);
            }
            byte_idx += 1;
            if byte_idx >= self.bytes.len() {
                return None;
            }
            bits = view(self.bytes[byte_idx]);
        }
    }

    /// Iterate set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = u32> + '_ {
        let mut next = self.next_set(0);
        std::iter::from_fn(move || {
            let cur = next?;
            next = cur.checked_add(1).and_then(|n| self.next_set(n));
            Some(cur)
        })
    }

    /// Maximal runs of set bits as `(start, len)`.
    pub fn runs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let mut cursor = 0_u32;
        std::iter::from_fn(move || {
            let start = self.next_set(cursor)?;
            let end = self.next_zero(start).unwrap_or(self.len);
            cursor = end;
            Some((start, end - start))
        })
    }
}
