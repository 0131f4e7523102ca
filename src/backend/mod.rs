//! # Backend Adapters
//!
//! ## Overview
//!
//! The engine drives every controller family through [`Backend`]: a
//! register-level capability interface with one implementation per
//! supported controller, selected once at construction. Backends make no
//! protocol decisions — they translate the engine's normalized commands,
//! event masks, and DMA chains into their own register layouts, and
//! normalize raw interrupt status back into
//! [`HostEvent`](crate::event::HostEvent) sets.
//!
//! Everything that genuinely differs between the controllers but is data
//! rather than behavior — descriptor limits, divider strategy, tuning
//! policy, FIFO watermark, poll bounds, settle delays — lives in the
//! backend's static [`Profile`] table.

use enumset::{EnumSet, EnumSetType};

use crate::clock::DividerStrategy;
use crate::command::CommandFrame;
use crate::config::{BusMode, BusWidth, CardState, DriverType, SignalVoltage, TimingMode, VddLevel};
use crate::dma::{ChainEntry, DescriptorSlot};
use crate::event::HostEvent;
use crate::host::Error;
use crate::platform::Platform;
use crate::tuning::{TuningFallback, TuningPolicy};

pub mod dwmshc;
pub mod mmchs;
pub mod sdhci;
pub mod usdhc;

/// A controller capability advertised at init.
#[derive(Debug, EnumSetType)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Capability {
    /// High-speed (50/52 MHz) timing.
    HighSpeed,
    /// 8-bit data bus.
    BusWidth8,
    /// Chained-descriptor DMA engine (ADMA2/IDMAC).
    ChainedDma,
    /// Single-buffer DMA engine (SDMA-style).
    SingleBufferDma,
    /// UHS-I SDR50.
    Sdr50,
    /// UHS-I SDR104.
    Sdr104,
    /// UHS-I DDR50.
    Ddr50,
    /// eMMC HS200.
    Hs200,
    /// 1.8 V signalling.
    Voltage18,
    /// 3.0 V supply.
    Voltage30,
    /// 3.3 V supply.
    Voltage33,
    /// SDR50 requires tuning on this controller.
    TuningForSdr50,
    /// Driver-strength selection.
    DriverStrength,
    /// Preset-value registers.
    PresetValues,
}

/// Scope of a controller reset.
#[derive(Debug, EnumSetType)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResetScope {
    /// Full controller reset.
    Host,
    /// Command path only.
    Command,
    /// Data path only.
    Data,
    /// Data FIFO.
    Fifo,
    /// DMA engine.
    Dma,
}

/// DMA engine selected for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaKind {
    /// Descriptor-chain engine; the base address points at the chain.
    Chained,
    /// Single-buffer engine; the base address points at the payload and
    /// boundary events carry the transfer forward.
    SingleBuffer,
}

/// Static per-controller configuration table.
///
/// Magic numbers are data, not engine logic; every entry here is a fact
/// about the silicon, not a tunable.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Controller family name, for diagnostics.
    pub name: &'static str,
    /// Descriptor-chain depth; 0 when only single-buffer DMA exists.
    pub max_descriptors: usize,
    /// Longest payload one descriptor can carry, in bytes.
    pub desc_max_len: u32,
    /// Single-buffer DMA address boundary, when that engine exists.
    pub dma_boundary: Option<u32>,
    /// Divider search strategy.
    pub divider: DividerStrategy,
    /// Halve the card clock ahead of the divider in DDR modes.
    pub ddr_prediv: bool,
    /// DDR timing pairs with the 8-bit bus on this controller.
    pub ddr_forces_8bit: bool,
    /// Long responses arrive pre-aligned (no 8-bit cross-word shift).
    pub long_response_preshifted: bool,
    /// The controller raises a dedicated auto-command-done event.
    pub signals_auto_cmd_done: bool,
    /// Number of sampling phases swept during tuning.
    pub tuning_range: u8,
    /// Phase-selection policy.
    pub tuning_policy: TuningPolicy,
    /// Behavior when no phase passes.
    pub tuning_fallback: TuningFallback,
    /// Untuned default sampling phase.
    pub default_sample_phase: u8,
    /// FIFO watermark, in 32-bit words, drained per buffer-ready event.
    pub fifo_watermark_words: usize,
    /// Bound for register polls, in iterations.
    pub poll_iterations: u32,
    /// Delay between poll iterations, in microseconds.
    pub poll_step_us: u32,
    /// Settle delay after an abort reset, in microseconds.
    pub abort_settle_us: u32,
    /// Duration of the initialization stream window, in microseconds.
    pub init_stream_us: u32,
    /// Powering down must not drop the primary rail (soldered eMMC).
    pub keeps_emmc_rail: bool,
}

/// Register-level adapter for one controller family.
///
/// The trait mirrors the fixed callback tables of the reference firmware:
/// one function per hardware concern, assigned per family, dispatched
/// through a single polymorphic reference held by the engine.
pub trait Backend {
    /// Platform providing this controller's register window.
    type Platform: Platform;

    /// The controller's platform services.
    fn platform(&mut self) -> &mut Self::Platform;

    /// The controller's static configuration table.
    fn profile(&self) -> &'static Profile;

    /// Brings the controller to a known state and probes capabilities.
    fn init(&mut self) -> Result<EnumSet<Capability>, Error>;

    /// Quiesces the controller at detach.
    fn deinit(&mut self);

    /// Whether the command line (and data line, when asked) is free.
    fn lines_idle(&mut self, check_data: bool) -> bool;

    /// Clears stale completion/error status ahead of a new command.
    fn clear_transaction_status(&mut self);

    /// Programs argument and command registers, in that order; the
    /// command-register write starts the transaction.
    fn write_command(&mut self, frame: &CommandFrame);

    /// Raw response word `index` (0 = least significant).
    fn response_word(&mut self, index: usize) -> u32;

    /// Response word of the automatic companion command.
    fn auto_response_word(&mut self) -> u32;

    /// Programs the exact block size/count pair.
    fn set_block(&mut self, size: u16, count: u16);

    /// Sets which events may interrupt.
    fn set_event_mask(&mut self, events: EnumSet<HostEvent>);

    /// Reads, clears, and normalizes pending interrupt status.
    fn pending_events(&mut self) -> EnumSet<HostEvent>;

    /// Encodes one chain link into a descriptor slot.
    fn encode_descriptor(&self, entry: &ChainEntry, slot: &mut DescriptorSlot);

    /// Programs the DMA base address and arms the selected engine.
    fn start_dma(&mut self, kind: DmaKind, base: u32);

    /// Supplies the next system address after a boundary stop.
    fn resume_dma(&mut self, next: u32);

    /// Force-stops the DMA engine.
    fn stop_dma(&mut self);

    /// Whether the DMA engine has gone idle.
    fn dma_idle(&mut self) -> bool;

    /// Pops one word from the read FIFO.
    fn fifo_read(&mut self) -> u32;

    /// Pushes one word into the write FIFO.
    fn fifo_write(&mut self, word: u32);

    /// Triggers a scoped reset and waits for it to self-clear.
    fn reset(&mut self, scope: EnumSet<ResetScope>) -> Result<(), Error>;

    /// Programs the clock divider (division ratio, 1 = bypass) with the
    /// card clock stopped.
    fn set_clock_divider(&mut self, divider: u32);

    /// Gates or enables the internal clock.
    fn internal_clock(&mut self, enable: bool);

    /// Whether the internal clock reports stable.
    fn clock_stable(&mut self) -> bool;

    /// Gates or enables the card clock.
    fn card_clock(&mut self, enable: bool);

    /// Sequences bus power; `None` powers down.
    fn set_power(&mut self, vdd: Option<VddLevel>);

    /// Sets the data bus width.
    fn set_bus_width(&mut self, width: BusWidth);

    /// Sets the timing mode bits.
    fn set_timing(&mut self, timing: TimingMode);

    /// Sets the command-line drive mode.
    fn set_bus_mode(&mut self, mode: BusMode);

    /// Instructs the signalling regulator.
    fn set_signal_voltage(&mut self, voltage: SignalVoltage);

    /// Current DAT[3:0] line levels, for voltage-switch confirmation.
    fn data_line_level(&mut self) -> u8;

    /// Sets the UHS-I driver strength.
    fn set_driver_type(&mut self, drive: DriverType);

    /// Enables or disables preset-value operation.
    fn set_preset_enable(&mut self, enable: bool);

    /// Programs the tuning sample phase.
    fn set_sample_phase(&mut self, phase: u8);

    /// Card slot state.
    fn card_state(&mut self) -> CardState;

    /// Arms the 74-clock initialization stream for the next command.
    fn arm_init_stream(&mut self);
}

/// Decodes raw interrupt status through a backend's bit table.
pub(crate) fn decode_events(raw: u32, table: &[(u32, HostEvent)]) -> EnumSet<HostEvent> {
    let mut events = EnumSet::empty();
    for &(bit, event) in table {
        if raw & bit != 0 {
            events |= event;
        }
    }
    events
}

/// Encodes an event set into raw enable bits through a backend's table.
pub(crate) fn encode_events(events: EnumSet<HostEvent>, table: &[(u32, HostEvent)]) -> u32 {
    let mut raw = 0;
    for &(bit, event) in table {
        if events.contains(event) {
            raw |= bit;
        }
    }
    raw
}
