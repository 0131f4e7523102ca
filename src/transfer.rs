//! Data-transfer planning and PIO stepping.
//!
//! `setup` decides how a data command moves its payload: the chained DMA
//! engine when the fragment list fits the descriptor constraints, the
//! single-buffer engine for one-fragment transfers, or PIO through the
//! FIFO. DMA construction failure falls back to PIO only when every
//! fragment is CPU-addressable — physical-only buffers that miss DMA are
//! a hard error for that transaction.

use enumset::EnumSet;
use heapless::Vec;

use crate::backend::{Backend, DmaKind};
use crate::command::{AutoStop, DataDirection, DataRequest, MAX_SEGMENTS};
use crate::dma::{ChainEntry, DescriptorPool, DescriptorSlot};
use crate::event::HostEvent;
use crate::host::Error;
use crate::platform::Platform;
use crate::scatter::{SgAddr, SgCursor, SgEntry};

/// DMA engines the host allows for this transfer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DmaPolicy {
    pub chained: bool,
    pub single: bool,
}

/// Outcome of transfer planning, consumed by the command dispatcher.
pub(crate) struct TransferPlan {
    /// The frame's use-DMA decision.
    pub use_dma: bool,
    /// Extra events the transfer needs unmasked.
    pub events: EnumSet<HostEvent>,
}

/// Per-transfer engine state, stepped by the interrupt handler.
pub(crate) enum TransferState {
    Pio(SgCursor),
    Dma {
        kind: DmaKind,
        total: u32,
        descriptors: usize,
        last_addr: u32,
    },
}

impl TransferState {
    /// Bytes the transfer will have moved once complete.
    pub(crate) fn planned_total(&self, fallback: u32) -> u32 {
        match self {
            TransferState::Pio(_) => fallback,
            TransferState::Dma { total, .. } => *total,
        }
    }
}

/// Plans the data phase and programs the backend for it.
pub(crate) fn setup<B: Backend>(
    backend: &mut B,
    pool: &mut DescriptorPool,
    data: &DataRequest,
    policy: DmaPolicy,
) -> Result<(TransferPlan, TransferState), Error> {
    if !data.is_consistent() {
        return Err(Error::Invalid);
    }
    let profile = backend.profile();
    let all_virtual = data.sg.iter().all(SgEntry::is_virtual);

    let mut state = None;
    if policy.chained || policy.single {
        state = try_dma(backend, pool, data, policy)?;
    }

    let state = match state {
        Some(state) => state,
        // DMA out of the picture: PIO needs CPU-visible buffers.
        None if all_virtual => {
            let cursor =
                SgCursor::new(&data.sg, data.total_len()).ok_or(Error::NotSupported)?;
            TransferState::Pio(cursor)
        }
        None => return Err(Error::NotSupported),
    };

    let mut events = EnumSet::only(HostEvent::TransferComplete);
    match &state {
        TransferState::Pio(_) => {
            events |= match data.direction {
                DataDirection::Read => HostEvent::BufferReadReady,
                DataDirection::Write => HostEvent::BufferWriteReady,
            };
        }
        TransferState::Dma {
            kind: DmaKind::SingleBuffer,
            ..
        } => {
            events |= HostEvent::DmaBoundary;
        }
        TransferState::Dma { .. } => {}
    }
    if data.auto_stop != AutoStop::None && profile.signals_auto_cmd_done {
        events |= HostEvent::AutoCommandDone;
    }

    backend.set_block(data.block_size, data.block_count);

    Ok((
        TransferPlan {
            use_dma: matches!(state, TransferState::Dma { .. }),
            events,
        },
        state,
    ))
}

/// Attempts DMA construction; `Ok(None)` means "fall back if you can".
fn try_dma<B: Backend>(
    backend: &mut B,
    pool: &mut DescriptorPool,
    data: &DataRequest,
    policy: DmaPolicy,
) -> Result<Option<TransferState>, Error> {
    let profile = backend.profile();
    let all_virtual = data.sg.iter().all(SgEntry::is_virtual);

    // Translate fragments up front; an untranslatable virtual buffer just
    // disqualifies DMA, an untranslatable chain with physical-only
    // fragments is the caller's hard error.
    let mut fragments: Vec<(u32, u32), MAX_SEGMENTS> = Vec::new();
    for entry in &data.sg {
        let phys = match entry.addr {
            SgAddr::Phys(addr) => Some(addr),
            SgAddr::Virt(ptr) => backend.platform().virt_to_phys(ptr),
        };
        let Some(phys) = phys else {
            return if all_virtual {
                Ok(None)
            } else {
                Err(Error::NotSupported)
            };
        };
        fragments.push((phys, entry.len)).map_err(|_| Error::NotSupported)?;
    }

    if policy.chained && profile.max_descriptors > 0 {
        if let Some(base_phys) = backend.platform().virt_to_phys(pool.base_ptr()) {
            let encoder = |entry: &ChainEntry, slot: &mut DescriptorSlot| {
                backend.encode_descriptor(entry, slot)
            };
            match pool.build_chain(
                &fragments,
                profile.desc_max_len,
                profile.max_descriptors,
                base_phys,
                encoder,
            ) {
                Ok(stats) => {
                    backend.start_dma(DmaKind::Chained, base_phys);
                    return Ok(Some(TransferState::Dma {
                        kind: DmaKind::Chained,
                        total: stats.total_bytes,
                        descriptors: stats.descriptors,
                        last_addr: base_phys,
                    }));
                }
                Err(Error::NotSupported) => {}
                Err(err) => return Err(err),
            }
        }
    }

    if policy.single && profile.dma_boundary.is_some() && fragments.len() == 1 {
        let (addr, len) = fragments[0];
        backend.start_dma(DmaKind::SingleBuffer, addr);
        return Ok(Some(TransferState::Dma {
            kind: DmaKind::SingleBuffer,
            total: len,
            descriptors: 0,
            last_addr: addr,
        }));
    }

    if all_virtual {
        Ok(None)
    } else {
        Err(Error::NotSupported)
    }
}

/// Drains up to the watermark from the read FIFO into the scatter list.
pub(crate) fn pio_read<B: Backend>(
    backend: &mut B,
    sg: &[SgEntry],
    cursor: &mut SgCursor,
    watermark_words: usize,
) {
    for _ in 0..watermark_words {
        if cursor.is_done() {
            break;
        }
        let take = cursor.remaining().min(4) as usize;
        let word = backend.fifo_read();
        cursor.push_bytes(sg, &word.to_le_bytes()[..take]);
    }
}

/// Drains whatever the FIFO still holds after transfer-complete.
///
/// On reads, completion can be signaled while sub-watermark residue sits
/// in the FIFO; the byte counter only reaches the payload size after this.
pub(crate) fn pio_drain_residue<B: Backend>(
    backend: &mut B,
    sg: &[SgEntry],
    cursor: &mut SgCursor,
) {
    while !cursor.is_done() {
        let take = cursor.remaining().min(4) as usize;
        let word = backend.fifo_read();
        cursor.push_bytes(sg, &word.to_le_bytes()[..take]);
    }
}

/// Fills the write FIFO up to the watermark from the scatter list.
pub(crate) fn pio_write<B: Backend>(
    backend: &mut B,
    sg: &[SgEntry],
    cursor: &mut SgCursor,
    watermark_words: usize,
) {
    for _ in 0..watermark_words {
        if cursor.is_done() {
            break;
        }
        let take = cursor.remaining().min(4) as usize;
        let mut bytes = [0u8; 4];
        cursor.pull_bytes(sg, &mut bytes[..take]);
        backend.fifo_write(u32::from_le_bytes(bytes));
    }
}
