//! Ring Buffer Tracker: device-side circular buffer bookkeeping.
//!
//! All addresses are in the coprocessor's address space. The tracker never
//! touches the bus; callers feed it raw descriptor values and get back copy
//! plans made of 8-byte aligned segments.

use serde::{Deserialize, Serialize};

const ALIGN: u32 = 8;

/// High-order pattern every mapped buffer descriptor carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveTag {
    pub mask: u32,
    pub pattern: u32,
}

impl LiveTag {
    pub const DEFAULT: LiveTag = LiveTag {
        mask: 0xffe0_0000,
        pattern: 0x4fe0_0000,
    };

    pub fn matches(&self, value: u32) -> bool {
        value & self.mask == self.pattern
    }
}

impl Default for LiveTag {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Bytes producible walking forward from `read_ptr` to `write_ptr`,
/// wrapping from `limit` back to `base`.
pub fn available_bytes(write_ptr: u32, read_ptr: u32, base: u32, limit: u32) -> u32 {
    if write_ptr >= read_ptr {
        write_ptr - read_ptr
    } else {
        limit.saturating_sub(read_ptr) + write_ptr.saturating_sub(base)
    }
}

/// Folds `ptr` (possibly past `limit`) back into `[base, limit)`.
fn wrap_into(ptr: u64, base: u32, limit: u32) -> u32 {
    let span = (limit - base) as u64;
    (base as u64 + (ptr - base as u64) % span) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u32,
    pub len: u32,
}

/// One period's worth of reads, split at `limit` when it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPlan {
    pub first: Segment,
    pub second: Option<Segment>,
    pub next_read_ptr: u32,
}

impl CopyPlan {
    pub fn segments(&self) -> impl Iterator<Item = Segment> {
        std::iter::once(self.first).chain(self.second)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RingBuffer {
    pub base: u32,
    pub limit: u32,
    pub read_ptr: u32,
    /// Register the device publishes its producer cursor at.
    pub write_ptr_addr: u32,
    pub size: u32,
    pub consumed: u64,
}

impl RingBuffer {
    /// Builds tracker state from freshly read, tag-validated descriptors.
    ///
    /// `limit` is rounded up to 8 first; the skip window is then applied to
    /// the write pointer, wrapped into `[base, limit)` and rounded down to 8.
    /// Returns `None` when the values cannot describe a usable ring.
    pub fn from_geometry(
        base: u32,
        limit: u32,
        write_ptr: u32,
        write_ptr_addr: u32,
        skip: u32,
    ) -> Option<Self> {
        let limit = limit.checked_next_multiple_of(ALIGN)?;
        if base % ALIGN != 0 || base >= limit || write_ptr < base || write_ptr > limit {
            return None;
        }

        let read_ptr = wrap_into(write_ptr as u64 + skip as u64, base, limit);
        let read_ptr = read_ptr - read_ptr % ALIGN;

        Some(Self {
            base,
            limit,
            read_ptr,
            write_ptr_addr,
            size: (limit - base).saturating_sub(skip),
            consumed: 0,
        })
    }

    pub fn is_startable(&self) -> bool {
        self.base != 0 && self.limit != 0 && self.read_ptr != 0 && self.size != 0
    }

    pub fn capacity(&self) -> u32 {
        self.limit - self.base
    }

    /// Trims `size` down to a whole number of periods.
    pub fn align_to_period(&mut self, period: u32) {
        if period != 0 {
            self.size -= self.size % period;
        }
    }

    /// Once the initial backlog is drained every copy has to be checked
    /// against the producer cursor first.
    pub fn needs_producer_check(&self) -> bool {
        self.consumed >= self.size as u64
    }

    pub fn available(&self, write_ptr: u32) -> u32 {
        available_bytes(write_ptr, self.read_ptr, self.base, self.limit)
    }

    pub fn plan_copy(&self, period: u32) -> Option<CopyPlan> {
        if period == 0 || period % ALIGN != 0 || period > self.capacity() {
            return None;
        }
        let end = self.read_ptr as u64 + period as u64;
        if end <= self.limit as u64 {
            let next = if end == self.limit as u64 {
                self.base
            } else {
                end as u32
            };
            Some(CopyPlan {
                first: Segment {
                    addr: self.read_ptr,
                    len: period,
                },
                second: None,
                next_read_ptr: next,
            })
        } else {
            let first_len = self.limit - self.read_ptr;
            let rest = period - first_len;
            Some(CopyPlan {
                first: Segment {
                    addr: self.read_ptr,
                    len: first_len,
                },
                second: Some(Segment {
                    addr: self.base,
                    len: rest,
                }),
                next_read_ptr: self.base + rest,
            })
        }
    }

    pub fn commit(&mut self, plan: &CopyPlan) {
        let copied: u32 = plan.segments().map(|s| s.len).sum();
        self.read_ptr = plan.next_read_ptr;
        self.consumed += copied as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0x4fe0_0000;
    const LIMIT: u32 = 0x4fe1_0000;
    const WP_REG: u32 = 0x1800_020c;

    #[test]
    fn tag_accepts_both_memory_banks() {
        let tag = LiveTag::DEFAULT;
        assert!(tag.matches(0x4fe0_1000));
        assert!(tag.matches(0x4ff0_1000));
        assert!(!tag.matches(0x1800_0200));
        assert!(!tag.matches(0));
    }

    #[test]
    fn straddling_copy_splits_at_limit() {
        let ring = RingBuffer::from_geometry(BASE, LIMIT, 0x4fe0_fff0, WP_REG, 0).unwrap();
        let plan = ring.plan_copy(4096).unwrap();
        assert_eq!(plan.first, Segment { addr: 0x4fe0_fff0, len: 16 });
        assert_eq!(plan.second, Some(Segment { addr: BASE, len: 4080 }));
        assert_eq!(plan.next_read_ptr, 0x4fe0_0ff0);
    }

    #[test]
    fn copy_landing_on_limit_restarts_at_base() {
        let ring = RingBuffer::from_geometry(BASE, LIMIT, LIMIT - 4096, WP_REG, 0).unwrap();
        let plan = ring.plan_copy(4096).unwrap();
        assert_eq!(plan.second, None);
        assert_eq!(plan.next_read_ptr, BASE);
    }

    #[test]
    fn skip_window_wraps_past_limit() {
        let ring = RingBuffer::from_geometry(BASE, LIMIT, LIMIT - 0x100, WP_REG, 0x300).unwrap();
        assert_eq!(ring.read_ptr, BASE + 0x200);
        assert_eq!(ring.size, 0x10000 - 0x300);
    }

    #[test]
    fn limit_rounds_up_and_read_ptr_rounds_down() {
        let ring = RingBuffer::from_geometry(BASE, LIMIT - 3, BASE + 0x105, WP_REG, 0).unwrap();
        assert_eq!(ring.limit, LIMIT);
        assert_eq!(ring.read_ptr, BASE + 0x100);
    }

    #[test]
    fn rejects_impossible_geometry() {
        assert!(RingBuffer::from_geometry(LIMIT, BASE, BASE, WP_REG, 0).is_none());
        assert!(RingBuffer::from_geometry(BASE, LIMIT, BASE - 8, WP_REG, 0).is_none());
        assert!(RingBuffer::from_geometry(BASE + 4, LIMIT, BASE + 8, WP_REG, 0).is_none());
    }

    #[test]
    fn oversized_skip_is_not_startable() {
        let ring = RingBuffer::from_geometry(BASE, LIMIT, BASE, WP_REG, 0x20000).unwrap();
        assert_eq!(ring.size, 0);
        assert!(!ring.is_startable());
    }

    #[test]
    fn producer_check_after_backlog() {
        let mut ring = RingBuffer::from_geometry(BASE, LIMIT, BASE, WP_REG, 0x100).unwrap();
        ring.align_to_period(4096);
        assert_eq!(ring.size, 0xf000);
        assert!(!ring.needs_producer_check());
        for _ in 0..15 {
            let plan = ring.plan_copy(4096).unwrap();
            ring.commit(&plan);
        }
        assert!(ring.needs_producer_check());
    }

    #[test]
    fn available_wraps() {
        assert_eq!(available_bytes(BASE + 0x100, BASE + 0x80, BASE, LIMIT), 0x80);
        assert_eq!(available_bytes(BASE + 0x100, LIMIT - 0x80, BASE, LIMIT), 0x180);
        assert_eq!(available_bytes(BASE, BASE, BASE, LIMIT), 0);
    }
}
