//! # Generic SDHC-Standard Backend
//!
//! ## Overview
//!
//! Adapter for controllers following the SD Host Controller standard
//! register layout. Data moves through ADMA2 descriptor chains when the
//! controller advertises them, through the SDMA single-buffer engine with
//! 4 KiB boundary continuation otherwise, or through the buffer data
//! port. The divider is the v3-style 10-bit round-up divider.
//!
//! Tuning sweeps the implementation-defined sample-clock select and picks
//! the midpoint of the longest passing run; a sweep with no passing phase
//! is propagated as an I/O error after resetting the tuning circuit.

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

/// SDHC-standard register map.
#[allow(dead_code)]
pub(crate) mod regs {
    pub const SDMA_ADDRESS: usize = 0x00;
    pub const BLOCK_SIZE: usize = 0x04;
    pub const BLOCK_COUNT: usize = 0x06;
    pub const ARGUMENT: usize = 0x08;
    pub const TRANSFER_MODE: usize = 0x0c;
    pub const COMMAND: usize = 0x0e;
    pub const RESPONSE: usize = 0x10;
    pub const BUFFER_PORT: usize = 0x20;
    pub const PRESENT_STATE: usize = 0x24;
    pub const HOST_CONTROL: usize = 0x28;
    pub const POWER_CONTROL: usize = 0x29;
    pub const CLOCK_CONTROL: usize = 0x2c;
    pub const TIMEOUT_CONTROL: usize = 0x2e;
    pub const SOFTWARE_RESET: usize = 0x2f;
    pub const INT_STATUS: usize = 0x30;
    pub const INT_ENABLE: usize = 0x34;
    pub const SIGNAL_ENABLE: usize = 0x38;
    pub const HOST_CONTROL2: usize = 0x3e;
    pub const CAPABILITIES: usize = 0x40;
    pub const CAPABILITIES_1: usize = 0x44;
    pub const ADMA_ADDRESS: usize = 0x58;
    /// Implementation-defined sample-clock select (tuning phase).
    pub const TUNING_PHASE: usize = 0x118;
    pub const HOST_VERSION: usize = 0xfe;
}

pub(crate) mod bits {
    // PRESENT_STATE
    pub const PS_CMD_INHIBIT: u32 = 1 << 0;
    pub const PS_DAT_INHIBIT: u32 = 1 << 1;
    pub const PS_DAT_ACTIVE: u32 = 1 << 2;
    pub const PS_CARD_INSERTED: u32 = 1 << 16;
    pub const PS_WRITE_ENABLED: u32 = 1 << 19;
    pub const PS_DAT_LEVEL_SHIFT: u32 = 20;

    // TRANSFER_MODE
    pub const TM_DMA_ENABLE: u16 = 1 << 0;
    pub const TM_BLOCK_COUNT_ENABLE: u16 = 1 << 1;
    pub const TM_AUTO_CMD12: u16 = 1 << 2;
    pub const TM_AUTO_CMD23: u16 = 1 << 3;
    pub const TM_READ: u16 = 1 << 4;
    pub const TM_MULTI_BLOCK: u16 = 1 << 5;

    // COMMAND
    pub const CMD_RESP_NONE: u16 = 0x0;
    pub const CMD_RESP_LONG: u16 = 0x1;
    pub const CMD_RESP_SHORT: u16 = 0x2;
    pub const CMD_RESP_SHORT_BUSY: u16 = 0x3;
    pub const CMD_CRC_CHECK: u16 = 1 << 3;
    pub const CMD_INDEX_CHECK: u16 = 1 << 4;
    pub const CMD_DATA_PRESENT: u16 = 1 << 5;
    pub const CMD_TYPE_ABORT: u16 = 0x3 << 6;

    // HOST_CONTROL
    pub const HC_BUS_WIDTH_4: u8 = 1 << 1;
    pub const HC_HIGH_SPEED: u8 = 1 << 2;
    pub const HC_DMA_SELECT_MASK: u8 = 0x3 << 3;
    pub const HC_DMA_SELECT_ADMA2: u8 = 0x2 << 3;
    pub const HC_BUS_WIDTH_8: u8 = 1 << 5;

    // POWER_CONTROL
    pub const PC_BUS_POWER: u8 = 1 << 0;
    pub const PC_VDD_18: u8 = 0x5 << 1;
    pub const PC_VDD_30: u8 = 0x6 << 1;
    pub const PC_VDD_33: u8 = 0x7 << 1;

    // CLOCK_CONTROL
    pub const CC_INT_CLK_ENABLE: u16 = 1 << 0;
    pub const CC_INT_CLK_STABLE: u16 = 1 << 1;
    pub const CC_CARD_CLK_ENABLE: u16 = 1 << 2;

    // SOFTWARE_RESET
    pub const SR_ALL: u8 = 1 << 0;
    pub const SR_CMD: u8 = 1 << 1;
    pub const SR_DATA: u8 = 1 << 2;

    // HOST_CONTROL2
    pub const HC2_UHS_MODE_MASK: u16 = 0x7;
    pub const HC2_SIGNALING_18: u16 = 1 << 3;
    pub const HC2_DRIVER_SHIFT: u16 = 4;
    pub const HC2_DRIVER_MASK: u16 = 0x3 << 4;
    pub const HC2_SAMPLING_CLOCK_SELECT: u16 = 1 << 7;
    pub const HC2_PRESET_ENABLE: u16 = 1 << 15;

    // CAPABILITIES
    pub const CAP_8BIT: u32 = 1 << 18;
    pub const CAP_ADMA2: u32 = 1 << 19;
    pub const CAP_HIGH_SPEED: u32 = 1 << 21;
    pub const CAP_SDMA: u32 = 1 << 22;
    pub const CAP_VDD_33: u32 = 1 << 24;
    pub const CAP_VDD_30: u32 = 1 << 25;
    pub const CAP_VDD_18: u32 = 1 << 26;

    // CAPABILITIES_1
    pub const CAP1_SDR50: u32 = 1 << 0;
    pub const CAP1_SDR104: u32 = 1 << 1;
    pub const CAP1_DDR50: u32 = 1 << 2;
    pub const CAP1_DRIVER_A: u32 = 1 << 4;
    pub const CAP1_TUNING_FOR_SDR50: u32 = 1 << 13;

    // INT_STATUS / INT_ENABLE
    pub const INT_CMD_COMPLETE: u32 = 1 << 0;
    pub const INT_TRANSFER_COMPLETE: u32 = 1 << 1;
    pub const INT_DMA: u32 = 1 << 3;
    pub const INT_BUFFER_WRITE_READY: u32 = 1 << 4;
    pub const INT_BUFFER_READ_READY: u32 = 1 << 5;
    pub const INT_CARD_INSERTED: u32 = 1 << 6;
    pub const INT_CARD_REMOVED: u32 = 1 << 7;
    pub const INT_RETUNE: u32 = 1 << 12;
    pub const INT_ERROR: u32 = 1 << 15;
    pub const INT_CMD_TIMEOUT: u32 = 1 << 16;
    pub const INT_CMD_CRC: u32 = 1 << 17;
    pub const INT_CMD_END_BIT: u32 = 1 << 18;
    pub const INT_CMD_INDEX: u32 = 1 << 19;
    pub const INT_DATA_TIMEOUT: u32 = 1 << 20;
    pub const INT_DATA_CRC: u32 = 1 << 21;
    pub const INT_DATA_END_BIT: u32 = 1 << 22;
    pub const INT_CURRENT_LIMIT: u32 = 1 << 23;
    pub const INT_AUTO_CMD: u32 = 1 << 24;
    pub const INT_ADMA: u32 = 1 << 25;
    pub const INT_TUNING_ERROR: u32 = 1 << 26;
}

bitfield::bitfield! {
    /// ADMA2 descriptor attribute/length word.
    #[derive(Clone, Copy)]
    struct Adma2Attributes(u32);
    valid, set_valid: 0;
    end, set_end: 1;
    int, set_int: 2;
    u8, action, set_action: 5, 4;
    u16, length, set_length: 31, 16;
}

/// ADMA2 "transfer data" action code.
const ADMA2_ACT_TRAN: u8 = 0x2;

const EVENT_MAP: &[(u32, HostEvent)] = &[
    (bits::INT_CMD_COMPLETE, HostEvent::CommandComplete),
    (bits::INT_TRANSFER_COMPLETE, HostEvent::TransferComplete),
    (bits::INT_DMA, HostEvent::DmaBoundary),
    (bits::INT_BUFFER_WRITE_READY, HostEvent::BufferWriteReady),
    (bits::INT_BUFFER_READ_READY, HostEvent::BufferReadReady),
    (bits::INT_CARD_INSERTED, HostEvent::CardInserted),
    (bits::INT_CARD_REMOVED, HostEvent::CardRemoved),
    (bits::INT_RETUNE, HostEvent::RetuneRequest),
    (bits::INT_CMD_TIMEOUT, HostEvent::ErrCommandTimeout),
    (bits::INT_CMD_CRC, HostEvent::ErrCommandCrc),
    (bits::INT_CMD_END_BIT, HostEvent::ErrCommandEndBit),
    (bits::INT_CMD_INDEX, HostEvent::ErrCommandIndex),
    (bits::INT_DATA_TIMEOUT, HostEvent::ErrDataTimeout),
    (bits::INT_DATA_CRC, HostEvent::ErrDataCrc),
    (bits::INT_DATA_END_BIT, HostEvent::ErrDataEndBit),
    (bits::INT_AUTO_CMD, HostEvent::ErrAutoCommand),
    (bits::INT_CURRENT_LIMIT, HostEvent::ErrGeneric),
    (bits::INT_ADMA, HostEvent::ErrGeneric),
    (bits::INT_TUNING_ERROR, HostEvent::ErrGeneric),
];

/// Status bits belonging to the transaction in flight, cleared ahead of a
/// new command; card and re-tune bits stay untouched.
const TRANSACTION_STATUS: u32 = bits::INT_CMD_COMPLETE
    | bits::INT_TRANSFER_COMPLETE
    | bits::INT_DMA
    | bits::INT_BUFFER_WRITE_READY
    | bits::INT_BUFFER_READ_READY
    | bits::INT_ERROR
    | 0x0fff_0000;

static PROFILE: Profile = Profile {
    name: "sdhci",
    max_descriptors: 32,
    desc_max_len: 65532,
    dma_boundary: Some(4096),
    divider: DividerStrategy::RoundUp { max: 2046 },
    ddr_prediv: false,
    ddr_forces_8bit: false,
    long_response_preshifted: false,
    signals_auto_cmd_done: false,
    tuning_range: 16,
    tuning_policy: TuningPolicy::LongestRunMidpoint,
    tuning_fallback: TuningFallback::PropagateError,
    default_sample_phase: 8,
    fifo_watermark_words: 128,
    poll_iterations: 1000,
    poll_step_us: 10,
    abort_settle_us: 500,
    init_stream_us: 1000,
    keeps_emmc_rail: false,
};

/// SDHC-standard host controller.
pub struct Sdhci<P: Platform> {
    platform: P,
}

impl<P: Platform> Sdhci<P> {
    /// Creates the adapter over a mapped register window.
    pub fn new(platform: P) -> Self {
        Sdhci { platform }
    }

    /// Releases the register window.
    pub fn free(self) -> P {
        self.platform
    }

    fn reset_wait(&mut self, mask: u8) -> Result<(), Error> {
        self.platform.write8(regs::SOFTWARE_RESET, mask);
        for _ in 0..PROFILE.poll_iterations {
            if self.platform.read8(regs::SOFTWARE_RESET) & mask == 0 {
                return Ok(());
            }
            self.platform.delay_us(PROFILE.poll_step_us);
        }
        Err(Error::Timeout)
    }

    fn decode_capabilities(&mut self) -> EnumSet<Capability> {
        let caps0 = self.platform.read32(regs::CAPABILITIES);
        let caps1 = self.platform.read32(regs::CAPABILITIES_1);
        let version = self.platform.read16(regs::HOST_VERSION) & 0xff;

        let mut caps = EnumSet::empty();
        if caps0 & bits::CAP_HIGH_SPEED != 0 {
            caps |= Capability::HighSpeed;
        }
        if caps0 & bits::CAP_8BIT != 0 {
            caps |= Capability::BusWidth8;
        }
        if caps0 & bits::CAP_ADMA2 != 0 {
            caps |= Capability::ChainedDma;
        }
        if caps0 & bits::CAP_SDMA != 0 {
            caps |= Capability::SingleBufferDma;
        }
        if caps0 & bits::CAP_VDD_33 != 0 {
            caps |= Capability::Voltage33;
        }
        if caps0 & bits::CAP_VDD_30 != 0 {
            caps |= Capability::Voltage30;
        }
        if caps0 & bits::CAP_VDD_18 != 0 {
            caps |= Capability::Voltage18;
        }
        if caps1 & bits::CAP1_SDR50 != 0 {
            caps |= Capability::Sdr50;
        }
        if caps1 & bits::CAP1_SDR104 != 0 {
            // SDR104-capable silicon also captures the HS200 block.
            caps |= Capability::Sdr104 | Capability::Hs200;
        }
        if caps1 & bits::CAP1_DDR50 != 0 {
            caps |= Capability::Ddr50;
        }
        if caps1 & bits::CAP1_DRIVER_A != 0 {
            caps |= Capability::DriverStrength;
        }
        if caps1 & bits::CAP1_TUNING_FOR_SDR50 != 0 {
            caps |= Capability::TuningForSdr50;
        }
        // Preset registers arrived with spec version 3.00.
        if version >= 2 {
            caps |= Capability::PresetValues;
        }
        caps
    }
}

impl<P: Platform> Backend for Sdhci<P> {
    type Platform = P;

    fn platform(&mut self) -> &mut P {
        &mut self.platform
    }

    fn profile(&self) -> &'static Profile {
        &PROFILE
    }

    fn init(&mut self) -> Result<EnumSet<Capability>, Error> {
        self.reset_wait(bits::SR_ALL)?;
        self.platform.write32(regs::INT_ENABLE, 0);
        self.platform.write32(regs::SIGNAL_ENABLE, 0);
        self.platform.write32(regs::INT_STATUS, u32::MAX);
        // Longest data timeout the counter offers.
        self.platform.write8(regs::TIMEOUT_CONTROL, 0xe);
        Ok(self.decode_capabilities())
    }

    fn deinit(&mut self) {
        self.platform.write32(regs::INT_ENABLE, 0);
        self.platform.write32(regs::SIGNAL_ENABLE, 0);
        self.platform.write8(regs::POWER_CONTROL, 0);
    }

    fn lines_idle(&mut self, check_data: bool) -> bool {
        let mut mask = bits::PS_CMD_INHIBIT;
        if check_data {
            mask |= bits::PS_DAT_INHIBIT;
        }
        self.platform.read32(regs::PRESENT_STATE) & mask == 0
    }

    fn clear_transaction_status(&mut self) {
        self.platform.write32(regs::INT_STATUS, TRANSACTION_STATUS);
    }

    fn write_command(&mut self, frame: &CommandFrame) {
        if frame.data_present {
            let mut mode = bits::TM_BLOCK_COUNT_ENABLE;
            if frame.use_dma {
                mode |= bits::TM_DMA_ENABLE;
            }
            if frame.multi_block {
                mode |= bits::TM_MULTI_BLOCK;
            }
            if frame.direction == Some(DataDirection::Read) {
                mode |= bits::TM_READ;
            }
            match frame.auto_stop {
                AutoStop::Cmd12 => mode |= bits::TM_AUTO_CMD12,
                AutoStop::Cmd23 => mode |= bits::TM_AUTO_CMD23,
                AutoStop::None => {}
            }
            self.platform.write16(regs::TRANSFER_MODE, mode);
        }

        let mut command = match frame.response {
            ResponseKind::None => bits::CMD_RESP_NONE,
            ResponseKind::Long => bits::CMD_RESP_LONG,
            ResponseKind::Short => bits::CMD_RESP_SHORT,
            ResponseKind::ShortBusy => bits::CMD_RESP_SHORT_BUSY,
        };
        if frame.check_crc {
            command |= bits::CMD_CRC_CHECK;
        }
        if frame.check_index {
            command |= bits::CMD_INDEX_CHECK;
        }
        if frame.data_present {
            command |= bits::CMD_DATA_PRESENT;
        }
        if frame.abort {
            command |= bits::CMD_TYPE_ABORT;
        }
        command |= u16::from(frame.opcode) << 8;

        // Argument first; the command write starts the transaction.
        self.platform.write32(regs::ARGUMENT, frame.argument);
        self.platform.write16(regs::COMMAND, command);
    }

    fn response_word(&mut self, index: usize) -> u32 {
        self.platform.read32(regs::RESPONSE + 4 * index)
    }

    fn auto_response_word(&mut self) -> u32 {
        // Auto CMD12 responses land in the topmost response register.
        self.platform.read32(regs::RESPONSE + 0xc)
    }

    fn set_block(&mut self, size: u16, count: u16) {
        // Boundary field zero: 4 KiB SDMA buffer boundary.
        self.platform.write16(regs::BLOCK_SIZE, size & 0x0fff);
        self.platform.write16(regs::BLOCK_COUNT, count);
    }

    fn set_event_mask(&mut self, events: EnumSet<HostEvent>) {
        let mut raw = encode_events(events, EVENT_MAP);
        if raw & 0xffff_0000 != 0 {
            raw |= bits::INT_ERROR;
        }
        self.platform.write32(regs::INT_ENABLE, raw);
        self.platform.write32(regs::SIGNAL_ENABLE, raw);
    }

    fn pending_events(&mut self) -> EnumSet<HostEvent> {
        let enabled = self.platform.read32(regs::INT_ENABLE);
        let raw = self.platform.read32(regs::INT_STATUS) & (enabled | bits::INT_ERROR);
        if raw != 0 {
            self.platform.write32(regs::INT_STATUS, raw);
        }
        let mut events = decode_events(raw, EVENT_MAP);
        if raw & bits::INT_ERROR != 0 && events & crate::event::ERROR_EVENTS == EnumSet::empty() {
            // Sticky error flag with no classified cause.
            events |= HostEvent::ErrGeneric;
        }
        events
    }

    fn encode_descriptor(&self, entry: &ChainEntry, slot: &mut DescriptorSlot) {
        let mut attributes = Adma2Attributes(0);
        attributes.set_valid(true);
        attributes.set_end(entry.last);
        attributes.set_action(ADMA2_ACT_TRAN);
        attributes.set_length(entry.len as u16);
        slot.words = [attributes.0, entry.addr, 0, 0];
    }

    fn start_dma(&mut self, kind: DmaKind, base: u32) {
        match kind {
            DmaKind::Chained => {
                self.platform.modify8(regs::HOST_CONTROL, |hc| {
                    (hc & !bits::HC_DMA_SELECT_MASK) | bits::HC_DMA_SELECT_ADMA2
                });
                self.platform.write32(regs::ADMA_ADDRESS, base);
            }
            DmaKind::SingleBuffer => {
                self.platform
                    .modify8(regs::HOST_CONTROL, |hc| hc & !bits::HC_DMA_SELECT_MASK);
                self.platform.write32(regs::SDMA_ADDRESS, base);
            }
        }
    }

    fn resume_dma(&mut self, next: u32) {
        // Writing the next system address releases the boundary stall.
        self.platform.write32(regs::SDMA_ADDRESS, next);
    }

    fn stop_dma(&mut self) {
        self.platform
            .modify8(regs::HOST_CONTROL, |hc| hc & !bits::HC_DMA_SELECT_MASK);
    }

    fn dma_idle(&mut self) -> bool {
        self.platform.read32(regs::PRESENT_STATE) & bits::PS_DAT_ACTIVE == 0
    }

    fn fifo_read(&mut self) -> u32 {
        self.platform.read32(regs::BUFFER_PORT)
    }

    fn fifo_write(&mut self, word: u32) {
        self.platform.write32(regs::BUFFER_PORT, word);
    }

    fn reset(&mut self, scope: EnumSet<ResetScope>) -> Result<(), Error> {
        let mut mask = 0u8;
        if scope.contains(ResetScope::Host) {
            mask |= bits::SR_ALL;
        }
        if scope.contains(ResetScope::Command) {
            mask |= bits::SR_CMD;
        }
        // FIFO and DMA state reset with the data path on this controller.
        if scope.contains(ResetScope::Data)
            || scope.contains(ResetScope::Fifo)
            || scope.contains(ResetScope::Dma)
        {
            mask |= bits::SR_DATA;
        }
        if mask == 0 {
            return Ok(());
        }
        self.reset_wait(mask)
    }

    fn set_clock_divider(&mut self, divider: u32) {
        // The register holds half the division ratio, in ten bits.
        let field = if divider <= 1 {
            0
        } else {
            (divider + 1) / 2
        };
        let value = ((field as u16 & 0xff) << 8) | (((field >> 8) as u16 & 0x3) << 6);
        self.platform.write16(regs::CLOCK_CONTROL, value);
    }

    fn internal_clock(&mut self, enable: bool) {
        self.platform.modify16(regs::CLOCK_CONTROL, |cc| {
            if enable {
                cc | bits::CC_INT_CLK_ENABLE
            } else {
                cc & !bits::CC_INT_CLK_ENABLE
            }
        });
    }

    fn clock_stable(&mut self) -> bool {
        self.platform.read16(regs::CLOCK_CONTROL) & bits::CC_INT_CLK_STABLE != 0
    }

    fn card_clock(&mut self, enable: bool) {
        self.platform.modify16(regs::CLOCK_CONTROL, |cc| {
            if enable {
                cc | bits::CC_CARD_CLK_ENABLE
            } else {
                cc & !bits::CC_CARD_CLK_ENABLE
            }
        });
    }

    fn set_power(&mut self, vdd: Option<VddLevel>) {
        let value = match vdd {
            None => 0,
            Some(VddLevel::V18) => bits::PC_VDD_18 | bits::PC_BUS_POWER,
            Some(VddLevel::V30) => bits::PC_VDD_30 | bits::PC_BUS_POWER,
            Some(VddLevel::V33) => bits::PC_VDD_33 | bits::PC_BUS_POWER,
        };
        self.platform.write8(regs::POWER_CONTROL, value);
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        self.platform.modify8(regs::HOST_CONTROL, |hc| {
            let hc = hc & !(bits::HC_BUS_WIDTH_4 | bits::HC_BUS_WIDTH_8);
            match width {
                BusWidth::One => hc,
                BusWidth::Four => hc | bits::HC_BUS_WIDTH_4,
                BusWidth::Eight => hc | bits::HC_BUS_WIDTH_8,
            }
        });
    }

    fn set_timing(&mut self, timing: TimingMode) {
        let high_speed = !matches!(timing, TimingMode::Legacy | TimingMode::Sdr12);
        self.platform.modify8(regs::HOST_CONTROL, |hc| {
            if high_speed {
                hc | bits::HC_HIGH_SPEED
            } else {
                hc & !bits::HC_HIGH_SPEED
            }
        });

        let uhs = match timing {
            TimingMode::Legacy | TimingMode::Sdr12 => 0x0,
            TimingMode::HighSpeed | TimingMode::Sdr25 => 0x1,
            TimingMode::Sdr50 => 0x2,
            TimingMode::Sdr104 | TimingMode::Hs200 => 0x3,
            TimingMode::Ddr50 => 0x4,
        };
        self.platform.modify16(regs::HOST_CONTROL2, |hc2| {
            (hc2 & !bits::HC2_UHS_MODE_MASK) | uhs
        });
    }

    fn set_bus_mode(&mut self, _mode: BusMode) {
        // The standard register set has no open-drain control; the command
        // line is push-pull throughout identification.
    }

    fn set_signal_voltage(&mut self, voltage: SignalVoltage) {
        self.platform.modify16(regs::HOST_CONTROL2, |hc2| {
            if voltage == SignalVoltage::V18 {
                hc2 | bits::HC2_SIGNALING_18
            } else {
                hc2 & !bits::HC2_SIGNALING_18
            }
        });
    }

    fn data_line_level(&mut self) -> u8 {
        ((self.platform.read32(regs::PRESENT_STATE) >> bits::PS_DAT_LEVEL_SHIFT) & 0xf) as u8
    }

    fn set_driver_type(&mut self, drive: DriverType) {
        let field = match drive {
            DriverType::B => 0x0,
            DriverType::A => 0x1,
            DriverType::C => 0x2,
            DriverType::D => 0x3,
        };
        self.platform.modify16(regs::HOST_CONTROL2, |hc2| {
            (hc2 & !bits::HC2_DRIVER_MASK) | (field << bits::HC2_DRIVER_SHIFT)
        });
    }

    fn set_preset_enable(&mut self, enable: bool) {
        self.platform.modify16(regs::HOST_CONTROL2, |hc2| {
            if enable {
                hc2 | bits::HC2_PRESET_ENABLE
            } else {
                hc2 & !bits::HC2_PRESET_ENABLE
            }
        });
    }

    fn set_sample_phase(&mut self, phase: u8) {
        self.platform.write32(regs::TUNING_PHASE, u32::from(phase));
        self.platform.modify16(regs::HOST_CONTROL2, |hc2| {
            hc2 | bits::HC2_SAMPLING_CLOCK_SELECT
        });
    }

    fn card_state(&mut self) -> CardState {
        let state = self.platform.read32(regs::PRESENT_STATE);
        if state & bits::PS_CARD_INSERTED == 0 {
            CardState::Removed
        } else if state & bits::PS_WRITE_ENABLED == 0 {
            CardState::WriteProtected
        } else {
            CardState::Inserted
        }
    }

    fn arm_init_stream(&mut self) {
        // Initialization clocks run whenever the card clock is slow;
        // nothing to arm on this controller.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;

    fn backend() -> Sdhci<MockPlatform> {
        let mut platform = MockPlatform::new();
        platform.w1c = &[regs::INT_STATUS];
        platform.fifo_offset = Some(regs::BUFFER_PORT);
        Sdhci::new(platform)
    }

    #[test]
    fn bus_width_bits_read_back() {
        let mut sdhci = backend();
        sdhci.set_bus_width(BusWidth::Four);
        assert_eq!(
            sdhci.platform.mem[regs::HOST_CONTROL] & bits::HC_BUS_WIDTH_4,
            bits::HC_BUS_WIDTH_4
        );
        sdhci.set_bus_width(BusWidth::Eight);
        let hc = sdhci.platform.mem[regs::HOST_CONTROL];
        assert_eq!(hc & bits::HC_BUS_WIDTH_8, bits::HC_BUS_WIDTH_8);
        assert_eq!(hc & bits::HC_BUS_WIDTH_4, 0);
        sdhci.set_bus_width(BusWidth::One);
        let hc = sdhci.platform.mem[regs::HOST_CONTROL];
        assert_eq!(hc & (bits::HC_BUS_WIDTH_4 | bits::HC_BUS_WIDTH_8), 0);
    }

    #[test]
    fn pending_events_clear_on_read() {
        let mut sdhci = backend();
        sdhci.platform.set32(regs::INT_ENABLE, u32::MAX);
        sdhci
            .platform
            .raise(regs::INT_STATUS, bits::INT_CMD_COMPLETE | bits::INT_CARD_INSERTED);

        let events = sdhci.pending_events();
        assert!(events.contains(HostEvent::CommandComplete));
        assert!(events.contains(HostEvent::CardInserted));
        assert_eq!(sdhci.pending_events(), EnumSet::empty());
    }

    #[test]
    fn sticky_error_without_cause_is_generic() {
        let mut sdhci = backend();
        sdhci.platform.set32(regs::INT_ENABLE, 0xffff);
        sdhci.platform.raise(regs::INT_STATUS, bits::INT_ERROR);
        let events = sdhci.pending_events();
        assert!(events.contains(HostEvent::ErrGeneric));
    }

    #[test]
    fn adma2_descriptor_encodes_length_and_end() {
        let sdhci = backend();
        let mut slot = DescriptorSlot { words: [0; 4] };
        sdhci.encode_descriptor(
            &ChainEntry {
                addr: 0x1234_0000,
                len: 512,
                first: true,
                last: true,
                next: 0,
            },
            &mut slot,
        );
        let attributes = Adma2Attributes(slot.words[0]);
        assert!(attributes.valid());
        assert!(attributes.end());
        assert_eq!(attributes.action(), ADMA2_ACT_TRAN);
        assert_eq!(attributes.length(), 512);
        assert_eq!(slot.words[1], 0x1234_0000);
    }

    #[test]
    fn command_write_order_is_argument_then_command() {
        let mut sdhci = backend();
        let frame = CommandFrame::build(
            &crate::command::Command::new(17, 0xdead_beef, ResponseKind::Short),
            false,
        );
        sdhci.write_command(&frame);
        let log = &sdhci.platform.write_log;
        let arg_pos = log
            .iter()
            .position(|&(offset, _)| offset == regs::ARGUMENT)
            .unwrap();
        let cmd_pos = log
            .iter()
            .position(|&(offset, _)| offset == regs::COMMAND)
            .unwrap();
        assert!(arg_pos < cmd_pos);
        let (_, command) = log[cmd_pos];
        assert_eq!(command >> 8, 17);
        assert_ne!(command & u32::from(bits::CMD_CRC_CHECK), 0);
    }

    #[test]
    fn divider_encoding_halves_the_ratio() {
        let mut sdhci = backend();
        sdhci.set_clock_divider(8);
        let cc = sdhci.platform.get32(regs::CLOCK_CONTROL) as u16;
        assert_eq!((cc >> 8) & 0xff, 4);

        sdhci.set_clock_divider(1);
        let cc = sdhci.platform.get32(regs::CLOCK_CONTROL) as u16;
        assert_eq!((cc >> 8) & 0xff, 0);
    }

    #[test]
    fn capability_decode_covers_dma_and_uhs() {
        let mut sdhci = backend();
        sdhci.platform.set32(
            regs::CAPABILITIES,
            bits::CAP_ADMA2 | bits::CAP_SDMA | bits::CAP_HIGH_SPEED | bits::CAP_VDD_33,
        );
        sdhci
            .platform
            .set32(regs::CAPABILITIES_1, bits::CAP1_SDR104 | bits::CAP1_SDR50);
        let caps = sdhci.decode_capabilities();
        assert!(caps.contains(Capability::ChainedDma));
        assert!(caps.contains(Capability::SingleBufferDma));
        assert!(caps.contains(Capability::Sdr104));
        assert!(caps.contains(Capability::Hs200));
        assert!(caps.contains(Capability::Voltage33));
        assert!(!caps.contains(Capability::Voltage18));
    }
}
