//! # Synopsys DesignWare MSHC Backend
//!
//! ## Overview
//!
//! Adapter for the DesignWare mobile-storage host. The controller chains
//! data through its internal DMA (IDMAC) dual-buffer descriptors, moves
//! PIO data through a central FIFO with a programmable watermark, and
//! clocks the card through a power-of-two divider chain that is only
//! latched by an update-clock command.
//!
//! Long responses arrive pre-aligned (no cross-word shift), the
//! controller raises a dedicated auto-command-done event, and tuning uses
//! the rotated-median policy — a failed sweep degrades to the default
//! sample phase instead of failing bring-up.

use embedded_hal::delay::DelayNs;
use enumset::EnumSet;

use crate::backend::{
    decode_events, encode_events, Backend, Capability, DmaKind, Profile, ResetScope,
};
use crate::clock::DividerStrategy;
use crate::command::{AutoStop, CommandFrame, DataDirection, ResponseKind};
use crate::config::{BusMode, BusWidth, CardState, DriverType, SignalVoltage, TimingMode, VddLevel};
use crate::dma::{ChainEntry, DescriptorSlot};
use crate::event::HostEvent;
use crate::host::Error;
use crate::platform::Platform;
use crate::tuning::{TuningFallback, TuningPolicy};

/// DesignWare MSHC register map.
#[allow(dead_code)]
pub(crate) mod regs {
    pub const CTRL: usize = 0x00;
    pub const PWREN: usize = 0x04;
    pub const CLKDIV: usize = 0x08;
    pub const CLKENA: usize = 0x10;
    pub const TMOUT: usize = 0x14;
    pub const CTYPE: usize = 0x18;
    pub const BLKSIZ: usize = 0x1c;
    pub const BYTCNT: usize = 0x20;
    pub const INTMASK: usize = 0x24;
    pub const CMDARG: usize = 0x28;
    pub const CMD: usize = 0x2c;
    pub const RESP0: usize = 0x30;
    pub const MINTSTS: usize = 0x40;
    pub const RINTSTS: usize = 0x44;
    pub const STATUS: usize = 0x48;
    pub const FIFOTH: usize = 0x4c;
    pub const CDETECT: usize = 0x50;
    pub const WRTPRT: usize = 0x54;
    pub const UHS_REG: usize = 0x74;
    pub const BMOD: usize = 0x80;
    pub const DBADDR: usize = 0x88;
    pub const IDSTS: usize = 0x8c;
    pub const IDINTEN: usize = 0x90;
    /// Extended UHS register; the sample-phase field lives here.
    pub const UHS_REG_EXT: usize = 0x108;
    pub const FIFO: usize = 0x200;
}

pub(crate) mod bits {
    // CTRL
    pub const CTRL_CONTROLLER_RESET: u32 = 1 << 0;
    pub const CTRL_FIFO_RESET: u32 = 1 << 1;
    pub const CTRL_DMA_RESET: u32 = 1 << 2;
    pub const CTRL_INT_ENABLE: u32 = 1 << 4;
    pub const CTRL_DMA_ENABLE: u32 = 1 << 5;
    pub const CTRL_USE_IDMAC: u32 = 1 << 25;

    // CMD
    pub const CMD_RESPONSE_EXPECT: u32 = 1 << 6;
    pub const CMD_RESPONSE_LONG: u32 = 1 << 7;
    pub const CMD_CHECK_RESPONSE_CRC: u32 = 1 << 8;
    pub const CMD_DATA_EXPECTED: u32 = 1 << 9;
    pub const CMD_WRITE: u32 = 1 << 10;
    pub const CMD_AUTO_STOP: u32 = 1 << 12;
    pub const CMD_WAIT_PRVDATA: u32 = 1 << 13;
    pub const CMD_STOP_ABORT: u32 = 1 << 14;
    pub const CMD_SEND_INITIALIZATION: u32 = 1 << 15;
    pub const CMD_UPDATE_CLOCK_ONLY: u32 = 1 << 21;
    pub const CMD_USE_HOLD_REG: u32 = 1 << 29;
    pub const CMD_START: u32 = 1 << 31;

    // CLKENA
    pub const CLKENA_CCLK_ENABLE: u32 = 1 << 0;

    // STATUS
    pub const STATUS_DATA_3_HIGH: u32 = 1 << 8;
    pub const STATUS_DATA_BUSY: u32 = 1 << 9;

    // BMOD
    pub const BMOD_SWR: u32 = 1 << 0;
    pub const BMOD_DE: u32 = 1 << 7;

    // IDSTS
    pub const IDSTS_FSM_MASK: u32 = 0xf << 13;

    // UHS_REG
    pub const UHS_VOLT_18: u32 = 1 << 0;
    pub const UHS_DDR: u32 = 1 << 16;

    // RINTSTS / INTMASK
    pub const INT_CARD_DETECT: u32 = 1 << 0;
    pub const INT_RESPONSE_ERROR: u32 = 1 << 1;
    pub const INT_CMD_DONE: u32 = 1 << 2;
    pub const INT_DATA_OVER: u32 = 1 << 3;
    pub const INT_TX_REQUEST: u32 = 1 << 4;
    pub const INT_RX_REQUEST: u32 = 1 << 5;
    pub const INT_RESPONSE_CRC: u32 = 1 << 6;
    pub const INT_DATA_CRC: u32 = 1 << 7;
    pub const INT_RESPONSE_TIMEOUT: u32 = 1 << 8;
    pub const INT_DATA_TIMEOUT: u32 = 1 << 9;
    pub const INT_HOST_TIMEOUT: u32 = 1 << 10;
    pub const INT_FIFO_ERROR: u32 = 1 << 11;
    pub const INT_HARDWARE_LOCKED: u32 = 1 << 12;
    pub const INT_START_BIT_ERROR: u32 = 1 << 13;
    pub const INT_AUTO_CMD_DONE: u32 = 1 << 14;
    pub const INT_END_BIT_ERROR: u32 = 1 << 15;
}

bitfield::bitfield! {
    /// IDMAC descriptor control/status word (DES0).
    #[derive(Clone, Copy)]
    struct IdmacControl(u32);
    disable_int, set_disable_int: 1;
    last, set_last: 2;
    first, set_first: 3;
    chained, set_chained: 4;
    owned, set_owned: 31;
}

const EVENT_MAP: &[(u32, HostEvent)] = &[
    (bits::INT_CMD_DONE, HostEvent::CommandComplete),
    (bits::INT_DATA_OVER, HostEvent::TransferComplete),
    (bits::INT_TX_REQUEST, HostEvent::BufferWriteReady),
    (bits::INT_RX_REQUEST, HostEvent::BufferReadReady),
    (bits::INT_AUTO_CMD_DONE, HostEvent::AutoCommandDone),
    (bits::INT_RESPONSE_TIMEOUT, HostEvent::ErrCommandTimeout),
    (bits::INT_RESPONSE_CRC, HostEvent::ErrCommandCrc),
    (bits::INT_END_BIT_ERROR, HostEvent::ErrCommandEndBit),
    (bits::INT_DATA_TIMEOUT, HostEvent::ErrDataTimeout),
    (bits::INT_DATA_CRC, HostEvent::ErrDataCrc),
    (bits::INT_START_BIT_ERROR, HostEvent::ErrDataEndBit),
    (bits::INT_RESPONSE_ERROR, HostEvent::ErrGeneric),
    (bits::INT_HOST_TIMEOUT, HostEvent::ErrGeneric),
    (bits::INT_FIFO_ERROR, HostEvent::ErrGeneric),
    (bits::INT_HARDWARE_LOCKED, HostEvent::ErrGeneric),
];

static PROFILE: Profile = Profile {
    name: "dw-mshc",
    max_descriptors: 32,
    desc_max_len: 4096,
    dma_boundary: None,
    divider: DividerStrategy::PowerOfTwo { max: 512 },
    ddr_prediv: true,
    ddr_forces_8bit: false,
    long_response_preshifted: true,
    signals_auto_cmd_done: true,
    tuning_range: 8,
    tuning_policy: TuningPolicy::RotatedMedian,
    tuning_fallback: TuningFallback::DegradeDefaultPhase,
    default_sample_phase: 0,
    fifo_watermark_words: 8,
    poll_iterations: 1000,
    poll_step_us: 10,
    abort_settle_us: 500,
    init_stream_us: 1000,
    keeps_emmc_rail: true,
};

/// DesignWare mobile-storage host controller.
pub struct DwMshc<P: Platform> {
    platform: P,
    send_init: bool,
}

impl<P: Platform> DwMshc<P> {
    /// Creates the adapter over a mapped register window.
    pub fn new(platform: P) -> Self {
        DwMshc {
            platform,
            send_init: false,
        }
    }

    /// Releases the register window.
    pub fn free(self) -> P {
        self.platform
    }

    /// Latches clock-register changes with an update-clock command.
    fn update_clock(&mut self) {
        self.platform.write32(
            regs::CMD,
            bits::CMD_START | bits::CMD_UPDATE_CLOCK_ONLY | bits::CMD_WAIT_PRVDATA,
        );
    }

    fn ctrl_reset_wait(&mut self, mask: u32) -> Result<(), Error> {
        self.platform.modify32(regs::CTRL, |ctrl| ctrl | mask);
        for _ in 0..PROFILE.poll_iterations {
            if self.platform.read32(regs::CTRL) & mask == 0 {
                return Ok(());
            }
            self.platform.delay_us(PROFILE.poll_step_us);
        }
        Err(Error::Timeout)
    }
}

impl<P: Platform> Backend for DwMshc<P> {
    type Platform = P;

    fn platform(&mut self) -> &mut P {
        &mut self.platform
    }

    fn profile(&self) -> &'static Profile {
        &PROFILE
    }

    fn init(&mut self) -> Result<EnumSet<Capability>, Error> {
        self.ctrl_reset_wait(
            bits::CTRL_CONTROLLER_RESET | bits::CTRL_FIFO_RESET | bits::CTRL_DMA_RESET,
        )?;
        self.platform.write32(regs::INTMASK, 0);
        self.platform.write32(regs::RINTSTS, u32::MAX);
        self.platform.write32(regs::TMOUT, 0xffff_ff40);
        // Half-FIFO watermarks.
        let watermark = PROFILE.fifo_watermark_words as u32;
        self.platform
            .write32(regs::FIFOTH, (watermark - 1) << 16 | watermark);
        self.platform
            .modify32(regs::CTRL, |ctrl| ctrl | bits::CTRL_INT_ENABLE);

        // No capability registers on this family; the feature set is a
        // synthesis-time property.
        Ok(Capability::HighSpeed
            | Capability::BusWidth8
            | Capability::ChainedDma
            | Capability::Sdr50
            | Capability::Sdr104
            | Capability::Ddr50
            | Capability::Hs200
            | Capability::Voltage18
            | Capability::Voltage33)
    }

    fn deinit(&mut self) {
        self.platform.write32(regs::INTMASK, 0);
        self.platform
            .modify32(regs::CTRL, |ctrl| ctrl & !bits::CTRL_INT_ENABLE);
        self.platform.write32(regs::PWREN, 0);
    }

    fn lines_idle(&mut self, check_data: bool) -> bool {
        if self.platform.read32(regs::CMD) & bits::CMD_START != 0 {
            return false;
        }
        !check_data || self.platform.read32(regs::STATUS) & bits::STATUS_DATA_BUSY == 0
    }

    fn clear_transaction_status(&mut self) {
        // Everything except the card-detect latch.
        self.platform
            .write32(regs::RINTSTS, !bits::INT_CARD_DETECT);
    }

    fn write_command(&mut self, frame: &CommandFrame) {
        let mut command = u32::from(frame.opcode & 0x3f)
            | bits::CMD_USE_HOLD_REG
            | bits::CMD_START;
        match frame.response {
            ResponseKind::None => {}
            ResponseKind::Short | ResponseKind::ShortBusy => {
                command |= bits::CMD_RESPONSE_EXPECT;
            }
            ResponseKind::Long => {
                command |= bits::CMD_RESPONSE_EXPECT | bits::CMD_RESPONSE_LONG;
            }
        }
        if frame.check_crc {
            command |= bits::CMD_CHECK_RESPONSE_CRC;
        }
        if frame.data_present {
            command |= bits::CMD_DATA_EXPECTED;
            if frame.direction == Some(DataDirection::Write) {
                command |= bits::CMD_WRITE;
            }
            // Pre-arming the block count has no hardware path here; only
            // the trailing auto-stop exists.
            if frame.auto_stop == AutoStop::Cmd12 {
                command |= bits::CMD_AUTO_STOP;
            }
        }
        if frame.abort {
            command |= bits::CMD_STOP_ABORT;
        } else {
            command |= bits::CMD_WAIT_PRVDATA;
        }
        if self.send_init {
            command |= bits::CMD_SEND_INITIALIZATION;
            self.send_init = false;
        }

        self.platform.write32(regs::CMDARG, frame.argument);
        self.platform.write32(regs::CMD, command);
    }

    fn response_word(&mut self, index: usize) -> u32 {
        self.platform.read32(regs::RESP0 + 4 * index)
    }

    fn auto_response_word(&mut self) -> u32 {
        // The auto-stop response lands in RESP1.
        self.platform.read32(regs::RESP0 + 4)
    }

    fn set_block(&mut self, size: u16, count: u16) {
        self.platform.write32(regs::BLKSIZ, u32::from(size));
        self.platform
            .write32(regs::BYTCNT, u32::from(size) * u32::from(count));
    }

    fn set_event_mask(&mut self, events: EnumSet<HostEvent>) {
        let mut raw = encode_events(events, EVENT_MAP);
        if events.contains(HostEvent::CardInserted) || events.contains(HostEvent::CardRemoved) {
            raw |= bits::INT_CARD_DETECT;
        }
        self.platform.write32(regs::INTMASK, raw);
    }

    fn pending_events(&mut self) -> EnumSet<HostEvent> {
        let raw = self.platform.read32(regs::MINTSTS);
        if raw != 0 {
            self.platform.write32(regs::RINTSTS, raw);
        }
        let mut events = decode_events(raw, EVENT_MAP);
        if raw & bits::INT_CARD_DETECT != 0 {
            // One latch for both edges; the debounced detect pin tells
            // them apart.
            events |= if self.card_state().is_present() {
                HostEvent::CardInserted
            } else {
                HostEvent::CardRemoved
            };
        }
        events
    }

    fn encode_descriptor(&self, entry: &ChainEntry, slot: &mut DescriptorSlot) {
        let mut control = IdmacControl(0);
        control.set_owned(true);
        control.set_chained(true);
        control.set_first(entry.first);
        control.set_last(entry.last);
        control.set_disable_int(!entry.last);
        slot.words = [
            control.0,
            entry.len & 0x1fff,
            entry.addr,
            if entry.last { 0 } else { entry.next },
        ];
    }

    fn start_dma(&mut self, _kind: DmaKind, base: u32) {
        self.platform.modify32(regs::CTRL, |ctrl| {
            ctrl | bits::CTRL_USE_IDMAC | bits::CTRL_DMA_ENABLE
        });
        self.platform
            .modify32(regs::BMOD, |bmod| bmod | bits::BMOD_DE);
        self.platform.write32(regs::DBADDR, base);
    }

    fn resume_dma(&mut self, _next: u32) {
        // Chained descriptors never stall at a boundary.
    }

    fn stop_dma(&mut self) {
        self.platform
            .modify32(regs::BMOD, |bmod| bmod & !bits::BMOD_DE);
        self.platform.modify32(regs::CTRL, |ctrl| {
            ctrl & !(bits::CTRL_USE_IDMAC | bits::CTRL_DMA_ENABLE)
        });
    }

    fn dma_idle(&mut self) -> bool {
        self.platform.read32(regs::IDSTS) & bits::IDSTS_FSM_MASK == 0
    }

    fn fifo_read(&mut self) -> u32 {
        self.platform.read32(regs::FIFO)
    }

    fn fifo_write(&mut self, word: u32) {
        self.platform.write32(regs::FIFO, word);
    }

    fn reset(&mut self, scope: EnumSet<ResetScope>) -> Result<(), Error> {
        let mut mask = 0;
        if scope.contains(ResetScope::Host) {
            mask |= bits::CTRL_CONTROLLER_RESET | bits::CTRL_FIFO_RESET | bits::CTRL_DMA_RESET;
        }
        if scope.contains(ResetScope::Command) || scope.contains(ResetScope::Data) {
            mask |= bits::CTRL_CONTROLLER_RESET | bits::CTRL_FIFO_RESET;
        }
        if scope.contains(ResetScope::Fifo) {
            mask |= bits::CTRL_FIFO_RESET;
        }
        if scope.contains(ResetScope::Dma) {
            mask |= bits::CTRL_DMA_RESET;
        }
        if mask == 0 {
            return Ok(());
        }
        if mask & bits::CTRL_DMA_RESET != 0 {
            self.platform
                .modify32(regs::BMOD, |bmod| bmod | bits::BMOD_SWR);
        }
        self.ctrl_reset_wait(mask)
    }

    fn set_clock_divider(&mut self, divider: u32) {
        // The register holds half the division ratio; zero bypasses.
        let field = if divider <= 1 { 0 } else { divider / 2 };
        self.platform.write32(regs::CLKDIV, field & 0xff);
        self.update_clock();
    }

    fn internal_clock(&mut self, _enable: bool) {
        // The controller clock is not software-gated on this family.
    }

    fn clock_stable(&mut self) -> bool {
        // The update-clock command self-clears once the divider latched.
        self.platform.read32(regs::CMD) & bits::CMD_START == 0
    }

    fn card_clock(&mut self, enable: bool) {
        self.platform.write32(
            regs::CLKENA,
            if enable { bits::CLKENA_CCLK_ENABLE } else { 0 },
        );
        self.update_clock();
    }

    fn set_power(&mut self, vdd: Option<VddLevel>) {
        match vdd {
            None => {
                if !PROFILE.keeps_emmc_rail {
                    self.platform.write32(regs::PWREN, 0);
                }
            }
            Some(_) => {
                self.platform.write32(regs::PWREN, 1);
            }
        }
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        let ctype = match width {
            BusWidth::One => 0,
            BusWidth::Four => 1,
            BusWidth::Eight => 1 << 16,
        };
        self.platform.write32(regs::CTYPE, ctype);
    }

    fn set_timing(&mut self, timing: TimingMode) {
        self.platform.modify32(regs::UHS_REG, |uhs| {
            if timing.is_ddr() {
                uhs | bits::UHS_DDR
            } else {
                uhs & !bits::UHS_DDR
            }
        });
    }

    fn set_bus_mode(&mut self, _mode: BusMode) {
        // The command line is push-pull; open-drain identification is
        // emulated by the slow identification clock.
    }

    fn set_signal_voltage(&mut self, voltage: SignalVoltage) {
        self.platform.modify32(regs::UHS_REG, |uhs| {
            if voltage == SignalVoltage::V18 {
                uhs | bits::UHS_VOLT_18
            } else {
                uhs & !bits::UHS_VOLT_18
            }
        });
    }

    fn data_line_level(&mut self) -> u8 {
        // Only DAT3 and DAT0 are observable; mirror DAT0 across the
        // middle lines once the data state machine is idle.
        let status = self.platform.read32(regs::STATUS);
        let dat3 = (status & bits::STATUS_DATA_3_HIGH != 0) as u8;
        let dat0 = (status & bits::STATUS_DATA_BUSY == 0) as u8;
        dat3 << 3 | dat0 << 2 | dat0 << 1 | dat0
    }

    fn set_driver_type(&mut self, _drive: DriverType) {
        // Pad drive strength is pinmux domain on this family.
    }

    fn set_preset_enable(&mut self, _enable: bool) {
        // No preset-value registers.
    }

    fn set_sample_phase(&mut self, phase: u8) {
        self.platform.modify32(regs::UHS_REG_EXT, |uhs| {
            (uhs & !(0x7 << 16)) | (u32::from(phase & 0x7) << 16)
        });
    }

    fn card_state(&mut self) -> CardState {
        // Detect is active-low.
        if self.platform.read32(regs::CDETECT) & 1 != 0 {
            CardState::Removed
        } else if self.platform.read32(regs::WRTPRT) & 1 != 0 {
            CardState::WriteProtected
        } else {
            CardState::Inserted
        }
    }

    fn arm_init_stream(&mut self) {
        self.send_init = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;

    fn backend() -> DwMshc<MockPlatform> {
        let mut platform = MockPlatform::new();
        platform.w1c = &[regs::RINTSTS];
        platform.fifo_offset = Some(regs::FIFO);
        DwMshc::new(platform)
    }

    #[test]
    fn idmac_descriptor_chains_until_last() {
        let dw = backend();
        let mut slot = DescriptorSlot { words: [0; 4] };
        dw.encode_descriptor(
            &ChainEntry {
                addr: 0x4000_0000,
                len: 4096,
                first: true,
                last: false,
                next: 0x2010,
            },
            &mut slot,
        );
        let control = IdmacControl(slot.words[0]);
        assert!(control.owned());
        assert!(control.first());
        assert!(!control.last());
        assert!(control.disable_int());
        assert_eq!(slot.words[1], 4096 & 0x1fff);
        assert_eq!(slot.words[3], 0x2010);

        dw.encode_descriptor(
            &ChainEntry {
                addr: 0x4000_1000,
                len: 512,
                first: false,
                last: true,
                next: 0x2020,
            },
            &mut slot,
        );
        let control = IdmacControl(slot.words[0]);
        assert!(control.last());
        assert_eq!(slot.words[3], 0);
    }

    #[test]
    fn init_stream_flag_rides_on_the_next_command_only() {
        let mut dw = backend();
        dw.arm_init_stream();
        let frame = CommandFrame::build(
            &crate::command::Command::new(0, 0, ResponseKind::None),
            false,
        );
        dw.write_command(&frame);
        let cmd = dw.platform.get32(regs::CMD);
        assert_ne!(cmd & bits::CMD_SEND_INITIALIZATION, 0);

        dw.write_command(&frame);
        let cmd = dw.platform.get32(regs::CMD);
        assert_eq!(cmd & bits::CMD_SEND_INITIALIZATION, 0);
    }

    #[test]
    fn card_detect_latch_maps_to_slot_state() {
        let mut dw = backend();
        dw.platform.set32(regs::INTMASK, u32::MAX);
        // Active-low detect: 0 means present.
        dw.platform.set32(regs::CDETECT, 0);
        dw.platform.raise(regs::MINTSTS, bits::INT_CARD_DETECT);
        let events = dw.pending_events();
        assert!(events.contains(HostEvent::CardInserted));

        dw.platform.set32(regs::CDETECT, 1);
        dw.platform.raise(regs::MINTSTS, bits::INT_CARD_DETECT);
        let events = dw.pending_events();
        assert!(events.contains(HostEvent::CardRemoved));
    }

    #[test]
    fn clock_program_issues_update_command() {
        let mut dw = backend();
        dw.set_clock_divider(8);
        assert_eq!(dw.platform.get32(regs::CLKDIV), 4);
        let cmd = dw.platform.get32(regs::CMD);
        assert_ne!(cmd & bits::CMD_UPDATE_CLOCK_ONLY, 0);
        assert_ne!(cmd & bits::CMD_START, 0);
    }
}
