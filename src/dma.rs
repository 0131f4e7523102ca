//! # DMA Descriptor Pool
//!
//! ## Overview
//!
//! Each host instance owns a fixed arena of hardware descriptor slots.
//! The chain builder splits scatter/gather fragments at the backend's
//! per-descriptor maximum, flags the first and last descriptors, and
//! refuses chains that would not fit the pool — the transfer engine then
//! decides between PIO fallback and a hard [`Error::NotSupported`].
//!
//! Slots are four 32-bit words, enough for every supported descriptor
//! format (ADMA2 uses two, the DesignWare IDMAC all four). Backends encode
//! their own layout into the slots; the pool only owns the memory and the
//! checked indices.

use heapless::Vec;

use crate::host::Error;

/// Capacity of the descriptor pool, in descriptors.
pub const MAX_DESCRIPTORS: usize = 64;

/// One hardware descriptor slot.
///
/// The alignment satisfies every supported DMA engine; unused words stay
/// zero.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(16))]
pub struct DescriptorSlot {
    /// Raw descriptor words in engine layout.
    pub words: [u32; 4],
}

impl DescriptorSlot {
    const EMPTY: Self = DescriptorSlot { words: [0; 4] };
}

/// One link of a descriptor chain, before backend encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    /// Bus address of the fragment.
    pub addr: u32,
    /// Fragment length in bytes; never exceeds the backend's
    /// per-descriptor maximum.
    pub len: u32,
    /// First descriptor of the chain.
    pub first: bool,
    /// Last descriptor of the chain.
    pub last: bool,
    /// Bus address of the following slot, for engines that chain through
    /// explicit next pointers.
    pub next: u32,
}

/// Fixed-capacity descriptor arena owned by one host instance.
pub(crate) struct DescriptorPool {
    slots: [DescriptorSlot; MAX_DESCRIPTORS],
    used: usize,
}

/// Totals of a built descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChainStats {
    pub descriptors: usize,
    pub total_bytes: u32,
}

impl DescriptorPool {
    pub(crate) const fn new() -> Self {
        DescriptorPool {
            slots: [DescriptorSlot::EMPTY; MAX_DESCRIPTORS],
            used: 0,
        }
    }

    /// Base address of the slot array, for the backend's chain-base
    /// register.
    pub(crate) fn base_ptr(&self) -> *const u8 {
        self.slots.as_ptr().cast()
    }

    pub(crate) fn slot_size() -> u32 {
        core::mem::size_of::<DescriptorSlot>() as u32
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    /// Splits `fragments` at `max_len`, encodes each piece through
    /// `encode`, and returns the chain totals.
    ///
    /// `base_phys` is the bus address of slot zero, used to pre-compute
    /// the next-pointer of every entry. Chains longer than
    /// `max_descriptors` (or the pool) fail with [`Error::NotSupported`]
    /// without touching the pool.
    pub(crate) fn build_chain(
        &mut self,
        fragments: &[(u32, u32)],
        max_len: u32,
        max_descriptors: usize,
        base_phys: u32,
        mut encode: impl FnMut(&ChainEntry, &mut DescriptorSlot),
    ) -> Result<ChainStats, Error> {
        debug_assert!(max_len > 0);
        let limit = max_descriptors.min(MAX_DESCRIPTORS);

        let mut pieces: Vec<(u32, u32), MAX_DESCRIPTORS> = Vec::new();
        let mut total_bytes = 0u32;
        for &(addr, len) in fragments {
            if len == 0 {
                return Err(Error::Invalid);
            }
            let mut offset = 0;
            while offset < len {
                let piece = (len - offset).min(max_len);
                if pieces.len() >= limit {
                    return Err(Error::NotSupported);
                }
                pieces.push((addr + offset, piece)).ok();
                total_bytes += piece;
                offset += piece;
            }
        }
        if pieces.is_empty() {
            return Err(Error::Invalid);
        }

        self.used = 0;
        let count = pieces.len();
        for (index, &(addr, len)) in pieces.iter().enumerate() {
            let entry = ChainEntry {
                addr,
                len,
                first: index == 0,
                last: index == count - 1,
                next: base_phys + (index as u32 + 1) * Self::slot_size(),
            };
            encode(&entry, &mut self.slots[index]);
            self.used += 1;
        }

        Ok(ChainStats {
            descriptors: count,
            total_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(pool: &DescriptorPool) -> &[DescriptorSlot] {
        &pool.slots[..pool.used()]
    }

    /// Raw encoder storing the entry fields verbatim, flags in word 0.
    fn raw_encode(entry: &ChainEntry, slot: &mut DescriptorSlot) {
        slot.words = [
            (entry.first as u32) | (entry.last as u32) << 1,
            entry.addr,
            entry.len,
            entry.next,
        ];
    }

    #[test]
    fn descriptor_count_is_ceil_of_len_over_max() {
        let mut pool = DescriptorPool::new();
        // 10000 bytes at 4096 per descriptor -> 3 descriptors.
        let stats = pool
            .build_chain(&[(0x1000_0000, 10_000)], 4096, 32, 0, raw_encode)
            .unwrap();
        assert_eq!(stats.descriptors, 3);
        assert_eq!(stats.total_bytes, 10_000);

        let slots = collect(&pool);
        assert_eq!(slots[0].words[2], 4096);
        assert_eq!(slots[1].words[2], 4096);
        assert_eq!(slots[2].words[2], 10_000 - 2 * 4096);
    }

    #[test]
    fn first_and_last_flags_bracket_the_chain() {
        let mut pool = DescriptorPool::new();
        pool.build_chain(
            &[(0x100, 512), (0x2000, 512), (0x4000, 512)],
            4096,
            32,
            0,
            raw_encode,
        )
        .unwrap();
        let slots = collect(&pool);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].words[0], 0b01);
        assert_eq!(slots[1].words[0], 0b00);
        assert_eq!(slots[2].words[0], 0b10);
    }

    #[test]
    fn single_fragment_is_first_and_last() {
        let mut pool = DescriptorPool::new();
        pool.build_chain(&[(0x100, 64)], 4096, 32, 0, raw_encode)
            .unwrap();
        assert_eq!(collect(&pool)[0].words[0], 0b11);
    }

    #[test]
    fn overflowing_the_limit_is_not_supported() {
        let mut pool = DescriptorPool::new();
        let err = pool
            .build_chain(&[(0, 5 * 4096)], 4096, 4, 0, raw_encode)
            .unwrap_err();
        assert_eq!(err, Error::NotSupported);
    }

    #[test]
    fn split_addresses_are_contiguous() {
        let mut pool = DescriptorPool::new();
        pool.build_chain(&[(0x8000, 8192)], 4096, 32, 0x100, raw_encode)
            .unwrap();
        let slots = collect(&pool);
        assert_eq!(slots[0].words[1], 0x8000);
        assert_eq!(slots[1].words[1], 0x8000 + 4096);
        // Next pointers step through the pool's bus addresses.
        assert_eq!(slots[0].words[3], 0x100 + DescriptorPool::slot_size());
    }

    #[test]
    fn empty_fragment_is_invalid() {
        let mut pool = DescriptorPool::new();
        assert_eq!(
            pool.build_chain(&[(0, 0)], 4096, 32, 0, raw_encode),
            Err(Error::Invalid)
        );
    }
}
