//! Fixed-capacity history ring
//!
//! Entries are addressed by monotonically increasing logical indices. The
//! retrievable window is `[position, limit)`; appending past capacity moves
//! `position` forward instead of deleting anything, so readers can page
//! through history with plain integer cursors.

/// Circular buffer over cloneable handles (typically `Arc<T>`)
#[derive(Debug)]
pub struct Ring<T> {
    values: Vec<Option<T>>,
    position: usize,
    limit: usize,
}

/// Result of a windowed read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingRead {
    /// Number of records copied into the output slice
    pub copied: usize,
    /// Effective start index after clamping to `position`
    pub start: usize,
    /// False when nothing at or after `start` is available yet
    pub ok: bool,
}

impl<T: Clone> Ring<T> {
    /// Create a ring retaining at most `capacity` records
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Ring {
            values: vec![None; capacity],
            position: 0,
            limit: 0,
        }
    }

    /// Oldest index still retrievable
    pub fn position(&self) -> usize {
        self.position
    }

    /// One past the newest appended index
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Append records in order, evicting the oldest when over capacity
    pub fn append(&mut self, records: &[T]) {
        let capacity = self.values.len();
        let appended = records.len();
        let kept = if appended > capacity {
            &records[appended - capacity..]
        } else {
            records
        };

        // Logical index of the first kept record
        let first = self.limit + (appended - kept.len());
        for (offset, record) in kept.iter().enumerate() {
            self.values[(first + offset) % capacity] = Some(record.clone());
        }

        self.limit += appended;
        if self.limit - self.position > capacity {
            self.position = self.limit - capacity;
        }
    }

    /// Copy records starting at `max(index, position)` into `out`
    pub fn get(&self, index: usize, out: &mut [T]) -> RingRead {
        let start = index.max(self.position);
        if start >= self.limit {
            return RingRead {
                copied: 0,
                start,
                ok: false,
            };
        }

        let capacity = self.values.len();
        let count = out.len().min(self.limit - start);
        for (offset, slot) in out.iter_mut().take(count).enumerate() {
            if let Some(value) = &self.values[(start + offset) % capacity] {
                *slot = value.clone();
            }
        }

        RingRead {
            copied: count,
            start,
            ok: true,
        }
    }

    /// Append up to `max` records starting at `max(index, position)` to `out`
    pub fn get_into(&self, index: usize, max: usize, out: &mut Vec<T>) -> RingRead {
        let start = index.max(self.position);
        if start >= self.limit {
            return RingRead {
                copied: 0,
                start,
                ok: false,
            };
        }

        let capacity = self.values.len();
        let before = out.len();
        out.extend(
            (start..self.limit)
                .take(max)
                .filter_map(|i| self.values[i % capacity].clone()),
        );

        RingRead {
            copied: out.len() - before,
            start,
            ok: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(ring: &Ring<char>, index: usize, len: usize) -> (Vec<char>, RingRead) {
        let mut out = vec![' '; len];
        let read = ring.get(index, &mut out);
        out.truncate(read.copied);
        (out, read)
    }

    #[test]
    fn test_empty_ring_has_nothing() {
        let ring: Ring<char> = Ring::new(4);
        let (out, read) = read_all(&ring, 0, 4);
        assert!(out.is_empty());
        assert!(!read.ok);
        assert_eq!(ring.position(), 0);
        assert_eq!(ring.limit(), 0);
    }

    #[test]
    fn test_eviction_advances_position() {
        let mut ring = Ring::new(3);
        for c in ['A', 'B', 'C', 'D'] {
            ring.append(&[c]);
        }

        assert_eq!(ring.position(), 1);
        assert_eq!(ring.limit(), 4);

        let (out, read) = read_all(&ring, 0, 4);
        assert_eq!(out, vec!['B', 'C', 'D']);
        assert_eq!(read.copied, 3);
        assert_eq!(read.start, 1);
        assert!(read.ok);
    }

    #[test]
    fn test_oversized_batch_keeps_tail() {
        let mut ring = Ring::new(3);
        ring.append(&['A', 'B', 'C', 'D', 'E']);

        assert_eq!(ring.limit(), 5);
        assert_eq!(ring.position(), 2);
        let (out, _) = read_all(&ring, 0, 8);
        assert_eq!(out, vec!['C', 'D', 'E']);
    }

    #[test]
    fn test_batch_wraps_storage() {
        let mut ring = Ring::new(4);
        ring.append(&['A', 'B', 'C']);
        ring.append(&['D', 'E', 'F']);

        assert_eq!(ring.position(), 2);
        let (out, _) = read_all(&ring, 0, 4);
        assert_eq!(out, vec!['C', 'D', 'E', 'F']);
    }

    #[test]
    fn test_read_at_limit_is_not_available() {
        let mut ring = Ring::new(3);
        ring.append(&['A', 'B']);

        let (out, read) = read_all(&ring, 2, 4);
        assert!(out.is_empty());
        assert!(!read.ok);
        assert_eq!(read.start, 2);
    }

    #[test]
    fn test_incremental_polling() {
        let mut ring = Ring::new(8);
        ring.append(&['A', 'B']);

        let (first, read) = read_all(&ring, 0, 8);
        assert_eq!(first, vec!['A', 'B']);
        let cursor = read.start + read.copied;
        assert_eq!(cursor, ring.limit());

        ring.append(&['C']);
        let (next, _) = read_all(&ring, cursor, 8);
        assert_eq!(next, vec!['C']);
    }

    #[test]
    fn test_output_bounds_copy() {
        let mut ring = Ring::new(8);
        ring.append(&['A', 'B', 'C', 'D']);

        let (out, read) = read_all(&ring, 1, 2);
        assert_eq!(out, vec!['B', 'C']);
        assert_eq!(read.copied, 2);
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut ring = Ring::new(5);
        let mut next = 0u32;
        for batch in [1usize, 3, 7, 2, 5, 11, 1] {
            let records: Vec<u32> = (next..next + batch as u32).collect();
            next += batch as u32;
            ring.append(&records);

            assert!(ring.limit() - ring.position() <= ring.capacity());
            let mut out = vec![0u32; 16];
            let read = ring.get(0, &mut out);
            assert_eq!(read.start, ring.position());
            assert_eq!(out[0], ring.position() as u32);
        }
    }

    #[test]
    fn test_get_into_appends() {
        let mut ring = Ring::new(3);
        ring.append(&['A', 'B', 'C', 'D']);

        let mut out = vec!['z'];
        let read = ring.get_into(0, 10, &mut out);
        assert_eq!(out, vec!['z', 'B', 'C', 'D']);
        assert_eq!(read.copied, 3);

        let mut out = Vec::new();
        assert_eq!(ring.get_into(3, 10, &mut out).copied, 1);
        assert_eq!(out, vec!['D']);
        assert!(!ring.get_into(4, 10, &mut out).ok);
    }
}
