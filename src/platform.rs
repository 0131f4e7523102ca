//! # Platform Seam
//!
//! ## Overview
//!
//! Everything the engine needs from the surrounding system goes through
//! [`Platform`]: synchronous 8/16/32-bit access to the controller's mapped
//! register window, bounded delays, and virtual-to-physical translation for
//! scatter/gather buffers and the descriptor pool.
//!
//! Register offsets are always relative to the start of the window; each
//! backend carries its own offset tables. Interrupt attach/detach stays
//! outside the crate — the platform calls
//! [`Host::handle_interrupt`](crate::host::Host::handle_interrupt) from
//! whatever dispatch context it provides.

use embedded_hal::delay::DelayNs;

/// Access to one controller's register window and platform services.
///
/// Implementations are expected to perform volatile accesses against a
/// window that is mapped once per controller instance and never shared
/// between instances.
pub trait Platform: DelayNs {
    /// Reads an 8-bit register at `offset` bytes into the window.
    fn read8(&mut self, offset: usize) -> u8;

    /// Reads a 16-bit register at `offset` bytes into the window.
    fn read16(&mut self, offset: usize) -> u16;

    /// Reads a 32-bit register at `offset` bytes into the window.
    fn read32(&mut self, offset: usize) -> u32;

    /// Writes an 8-bit register at `offset` bytes into the window.
    fn write8(&mut self, offset: usize, value: u8);

    /// Writes a 16-bit register at `offset` bytes into the window.
    fn write16(&mut self, offset: usize, value: u16);

    /// Writes a 32-bit register at `offset` bytes into the window.
    fn write32(&mut self, offset: usize, value: u32);

    /// Translates a virtual buffer address to the bus address the DMA
    /// engine sees.
    ///
    /// Returns `None` when the buffer is not reachable by the controller;
    /// the transfer engine then falls back to PIO where it can.
    fn virt_to_phys(&self, ptr: *const u8) -> Option<u32>;

    /// Modifies a 32-bit register read-modify-write style.
    fn modify32(&mut self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let value = self.read32(offset);
        self.write32(offset, f(value));
    }

    /// Modifies a 16-bit register read-modify-write style.
    fn modify16(&mut self, offset: usize, f: impl FnOnce(u16) -> u16) {
        let value = self.read16(offset);
        self.write16(offset, f(value));
    }

    /// Modifies an 8-bit register read-modify-write style.
    fn modify8(&mut self, offset: usize, f: impl FnOnce(u8) -> u8) {
        let value = self.read8(offset);
        self.write8(offset, f(value));
    }
}
