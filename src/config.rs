//! # Host Configuration
//!
//! ## Overview
//!
//! [`Config`] carries the construction-time settings of a
//! [`Host`](crate::host::Host): the reference clock feeding the divider,
//! and the DMA-mode selector. Everything else (bus width, timing, voltage,
//! ...) is runtime state changed through the host's control calls.

use fugit::HertzU32;

/// Host controller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Reference clock feeding the controller's divider.
    pub clock_source: HertzU32,
    /// DMA-mode selector applied to data commands.
    pub dma: DmaSelect,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            clock_source: HertzU32::MHz(200),
            dma: DmaSelect::Auto,
        }
    }
}

impl Config {
    /// Assigns the reference clock feeding the divider.
    pub fn with_clock_source(mut self, clock_source: HertzU32) -> Self {
        self.clock_source = clock_source;
        self
    }

    /// Assigns the DMA-mode selector.
    pub fn with_dma(mut self, dma: DmaSelect) -> Self {
        self.dma = dma;
        self
    }
}

/// Selects how data commands move their payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaSelect {
    /// Use the best DMA engine the backend advertises, falling back to
    /// PIO when a transfer does not fit the descriptor constraints.
    Auto,
    /// Restrict DMA to the single-buffer engine (SDMA-style) even when a
    /// chained engine is available.
    SingleBuffer,
    /// Never use DMA; all data moves through the FIFO.
    Pio,
}

/// Data bus width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusWidth {
    /// 1-bit bus (DAT0 only).
    One,
    /// 4-bit bus.
    Four,
    /// 8-bit bus (eMMC).
    Eight,
}

/// Command-line drive mode.
///
/// Open-drain is only used during the MMC identification phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusMode {
    /// Open-drain command line.
    OpenDrain,
    /// Push-pull command line.
    PushPull,
}

/// Bus timing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimingMode {
    /// Default speed, 3.3 V signalling.
    Legacy,
    /// High speed (50 MHz SD / 52 MHz MMC), 3.3 V signalling.
    HighSpeed,
    /// UHS-I SDR12.
    Sdr12,
    /// UHS-I SDR25.
    Sdr25,
    /// UHS-I SDR50.
    Sdr50,
    /// UHS-I SDR104.
    Sdr104,
    /// UHS-I DDR50.
    Ddr50,
    /// eMMC HS200.
    Hs200,
}

impl TimingMode {
    /// Whether the mode samples on both clock edges.
    pub fn is_ddr(self) -> bool {
        matches!(self, TimingMode::Ddr50)
    }

    /// Whether the mode requires sample-point tuning.
    ///
    /// SDR50 only tunes when the controller's capabilities demand it.
    pub fn requires_tuning(self) -> bool {
        matches!(self, TimingMode::Sdr104 | TimingMode::Hs200)
    }
}

/// I/O signalling voltage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SignalVoltage {
    /// 3.3 V signalling.
    V33,
    /// 3.0 V signalling.
    V30,
    /// 1.8 V signalling (UHS modes).
    V18,
}

/// Supply voltage handed to [`Host::set_power`](crate::host::Host::set_power).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VddLevel {
    /// 1.8 V rail.
    V18,
    /// 3.0 V rail.
    V30,
    /// 3.3 V rail.
    V33,
}

/// UHS-I output driver strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverType {
    /// Type A (33 Ω).
    A,
    /// Type B (50 Ω, default).
    B,
    /// Type C (66 Ω).
    C,
    /// Type D (100 Ω).
    D,
}

/// Card slot state as reported by
/// [`Host::card_detect`](crate::host::Host::card_detect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardState {
    /// No card in the slot.
    Removed,
    /// Card present, writable.
    Inserted,
    /// Card present with the write-protect switch set.
    WriteProtected,
}

impl CardState {
    /// Whether a card is present at all.
    pub fn is_present(self) -> bool {
        !matches!(self, CardState::Removed)
    }
}
