//! CPU-side batching of buffer writes

use ash::vk;

/// One write waiting in the shadow buffer; all fields are in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    /// Where the data starts in the shadow buffer (and in the staging buffer)
    pub shadow_offset: u64,
    /// Where the data lands in the destination buffer
    pub dst_offset: u64,
    /// Number of bytes written
    pub length: u64,
}

impl PendingWrite {
    /// First byte past the written range in the destination
    pub fn dst_end(&self) -> u64 {
        self.dst_offset + self.length
    }

    /// Copy region from a staging buffer holding the whole shadow buffer
    pub fn region(&self) -> vk::BufferCopy {
        vk::BufferCopy {
            src_offset: self.shadow_offset,
            dst_offset: self.dst_offset,
            size: self.length,
        }
    }
}

/// Packed bytes of every pending write plus where each one goes
///
/// Destination ranges never overlap: a new write trims or splits the earlier
/// writes it covers, so the last write to a byte wins. The trimmed bytes stay
/// in the shadow buffer and are simply not copied.
#[derive(Debug, Default)]
pub(crate) struct ShadowBatch {
    bytes: Vec<u8>,
    writes: Vec<PendingWrite>,
    /// Destination end of the most recent write
    last_end: u64,
}

impl ShadowBatch {
    pub fn push(&mut self, data: &[u8], dst_offset: u64) {
        if data.is_empty() {
            return;
        }
        let length = data.len() as u64;
        self.carve(dst_offset, dst_offset + length);
        self.writes.push(PendingWrite {
            shadow_offset: self.bytes.len() as u64,
            dst_offset,
            length,
        });
        self.bytes.extend_from_slice(data);
        self.last_end = dst_offset + length;
    }

    /// Remove `[start, end)` from every pending write
    fn carve(&mut self, start: u64, end: u64) {
        if !self.writes.iter().any(|w| w.dst_offset < end && w.dst_end() > start) {
            return;
        }

        let mut kept = Vec::with_capacity(self.writes.len() + 1);
        for write in self.writes.drain(..) {
            if write.dst_end() <= start || write.dst_offset >= end {
                kept.push(write);
                continue;
            }
            if write.dst_offset < start {
                kept.push(PendingWrite {
                    length: start - write.dst_offset,
                    ..write
                });
            }
            if write.dst_end() > end {
                let skipped = end - write.dst_offset;
                kept.push(PendingWrite {
                    shadow_offset: write.shadow_offset + skipped,
                    dst_offset: end,
                    length: write.dst_end() - end,
                });
            }
        }
        self.writes = kept;
    }

    /// Destination end of the last write pushed, in bytes
    pub fn last_end(&self) -> u64 {
        self.last_end
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn writes(&self) -> &[PendingWrite] {
        &self.writes
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn max_dst_end(&self) -> u64 {
        self.writes.iter().map(PendingWrite::dst_end).max().unwrap_or(0)
    }

    pub fn regions(&self) -> Vec<vk::BufferCopy> {
        self.writes.iter().map(PendingWrite::region).collect()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.writes.clear();
        self.last_end = 0;
    }
}
