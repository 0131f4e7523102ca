//! # NXP uSDHC Backend
//!
//! ## Overview
//!
//! Adapter for the i.MX-family uSDHC. The block descends from the SDHC
//! standard but splits the transfer-mode bits into the sticky `MIX_CTRL`
//! register, moves the divider into `SYS_CTRL` as a power-of-two
//! prescaler times a 4-bit divisor, and gates bus power through vendor
//! registers instead of a power-control byte. Data is chained through
//! ADMA2 descriptors.
//!
//! DDR timing on this controller pairs with the 8-bit bus, and the card
//! clock is pre-halved ahead of the divider. Tuning sweeps the delay-line
//! phase and takes the longest-run midpoint; a failed sweep degrades to
//! untuned sampling rather than failing bring-up.

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

/// uSDHC register map.
#[allow(dead_code)]
pub(crate) mod regs {
    pub const DS_ADDR: usize = 0x00;
    pub const BLK_ATT: usize = 0x04;
    pub const CMD_ARG: usize = 0x08;
    pub const CMD_XFR_TYP: usize = 0x0c;
    pub const CMD_RSP0: usize = 0x10;
    pub const DATA_BUFF_ACC_PORT: usize = 0x20;
    pub const PRES_STATE: usize = 0x24;
    pub const PROT_CTRL: usize = 0x28;
    pub const SYS_CTRL: usize = 0x2c;
    pub const INT_STATUS: usize = 0x30;
    pub const INT_STATUS_EN: usize = 0x34;
    pub const INT_SIGNAL_EN: usize = 0x38;
    pub const AUTOCMD12_ERR_STATUS: usize = 0x3c;
    pub const HOST_CTRL_CAP: usize = 0x40;
    pub const WTMK_LVL: usize = 0x44;
    pub const MIX_CTRL: usize = 0x48;
    pub const ADMA_SYS_ADDR: usize = 0x58;
    pub const CLK_TUNE_CTRL_STATUS: usize = 0x68;
    pub const VEND_SPEC: usize = 0xc0;
}

mod bits {
    // PRES_STATE
    pub const PS_CMD_INHIBIT: u32 = 1 << 0;
    pub const PS_DAT_INHIBIT: u32 = 1 << 1;
    pub const PS_DAT_ACTIVE: u32 = 1 << 2;
    pub const PS_CLOCK_STABLE: u32 = 1 << 3;
    pub const PS_CARD_INSERTED: u32 = 1 << 16;
    pub const PS_WRITE_ENABLED: u32 = 1 << 19;
    pub const PS_DAT_LEVEL_SHIFT: u32 = 20;

    // PROT_CTRL
    pub const PC_DTW_MASK: u32 = 0x3 << 1;
    pub const PC_DTW_4: u32 = 0x1 << 1;
    pub const PC_DTW_8: u32 = 0x2 << 1;
    pub const PC_DMASEL_MASK: u32 = 0x3 << 8;
    pub const PC_DMASEL_ADMA2: u32 = 0x2 << 8;

    // SYS_CTRL
    pub const SC_DVS_SHIFT: u32 = 4;
    pub const SC_SDCLKFS_SHIFT: u32 = 8;
    pub const SC_DIVIDER_MASK: u32 = 0xfff0;
    pub const SC_RSTA: u32 = 1 << 24;
    pub const SC_RSTC: u32 = 1 << 25;
    pub const SC_RSTD: u32 = 1 << 26;
    pub const SC_INITA: u32 = 1 << 27;

    // MIX_CTRL
    pub const MC_DMAEN: u32 = 1 << 0;
    pub const MC_BCEN: u32 = 1 << 1;
    pub const MC_AC12EN: u32 = 1 << 2;
    pub const MC_DDR_EN: u32 = 1 << 3;
    pub const MC_DTDSEL_READ: u32 = 1 << 4;
    pub const MC_MSBSEL: u32 = 1 << 5;
    pub const MC_AC23EN: u32 = 1 << 7;
    pub const MC_SMP_CLK_SEL: u32 = 1 << 23;
    pub const MC_TRANSFER_MASK: u32 = 0xff;

    // CMD_XFR_TYP
    pub const XT_RSPTYP_NONE: u32 = 0x0 << 16;
    pub const XT_RSPTYP_LONG: u32 = 0x1 << 16;
    pub const XT_RSPTYP_SHORT: u32 = 0x2 << 16;
    pub const XT_RSPTYP_SHORT_BUSY: u32 = 0x3 << 16;
    pub const XT_CCCEN: u32 = 1 << 19;
    pub const XT_CICEN: u32 = 1 << 20;
    pub const XT_DPSEL: u32 = 1 << 21;
    pub const XT_CMDTYP_ABORT: u32 = 0x3 << 22;
    pub const XT_CMDINX_SHIFT: u32 = 24;

    // VEND_SPEC
    pub const VS_VSELECT_18: u32 = 1 << 1;
    pub const VS_INTERNAL_CLK_EN: u32 = 1 << 13;
    pub const VS_CARD_CLK_EN: u32 = 1 << 14;
    pub const VS_BUS_POWER: u32 = 1 << 31;

    // CLK_TUNE_CTRL_STATUS
    pub const CT_PHASE_SHIFT: u32 = 8;
    pub const CT_PHASE_MASK: u32 = 0x7f << 8;

    // HOST_CTRL_CAP
    pub const CAP_SDR50: u32 = 1 << 0;
    pub const CAP_SDR104: u32 = 1 << 1;
    pub const CAP_DDR50: u32 = 1 << 2;
    pub const CAP_TUNING_FOR_SDR50: u32 = 1 << 13;
    pub const CAP_8BIT: u32 = 1 << 18;
    pub const CAP_ADMA2: u32 = 1 << 19;
    pub const CAP_HIGH_SPEED: u32 = 1 << 21;
    pub const CAP_VDD_33: u32 = 1 << 24;
    pub const CAP_VDD_30: u32 = 1 << 25;
    pub const CAP_VDD_18: u32 = 1 << 26;

    // INT_STATUS and enables
    pub const INT_CMD_COMPLETE: u32 = 1 << 0;
    pub const INT_TRANSFER_COMPLETE: u32 = 1 << 1;
    pub const INT_DMA: u32 = 1 << 3;
    pub const INT_BUFFER_WRITE_READY: u32 = 1 << 4;
    pub const INT_BUFFER_READ_READY: u32 = 1 << 5;
    pub const INT_CARD_INSERTED: u32 = 1 << 6;
    pub const INT_CARD_REMOVED: u32 = 1 << 7;
    pub const INT_RETUNE: u32 = 1 << 12;
    pub const INT_CMD_TIMEOUT: u32 = 1 << 16;
    pub const INT_CMD_CRC: u32 = 1 << 17;
    pub const INT_CMD_END_BIT: u32 = 1 << 18;
    pub const INT_CMD_INDEX: u32 = 1 << 19;
    pub const INT_DATA_TIMEOUT: u32 = 1 << 20;
    pub const INT_DATA_CRC: u32 = 1 << 21;
    pub const INT_DATA_END_BIT: u32 = 1 << 22;
    pub const INT_AUTO_CMD: u32 = 1 << 24;
    pub const INT_TUNING_ERROR: u32 = 1 << 26;
    pub const INT_DMA_ERROR: u32 = 1 << 28;
}

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
    (bits::INT_TUNING_ERROR, HostEvent::ErrGeneric),
    (bits::INT_DMA_ERROR, HostEvent::ErrGeneric),
];

static PROFILE: Profile = Profile {
    name: "usdhc",
    max_descriptors: 32,
    desc_max_len: 65532,
    dma_boundary: None,
    divider: DividerStrategy::RoundUp { max: 4096 },
    ddr_prediv: true,
    ddr_forces_8bit: true,
    long_response_preshifted: false,
    signals_auto_cmd_done: false,
    tuning_range: 16,
    tuning_policy: TuningPolicy::LongestRunMidpoint,
    tuning_fallback: TuningFallback::DegradeDefaultPhase,
    default_sample_phase: 0,
    fifo_watermark_words: 16,
    poll_iterations: 1000,
    poll_step_us: 10,
    abort_settle_us: 500,
    init_stream_us: 1000,
    keeps_emmc_rail: false,
};

/// i.MX-family uSDHC controller.
pub struct Usdhc<P: Platform> {
    platform: P,
}

impl<P: Platform> Usdhc<P> {
    /// Creates the adapter over a mapped register window.
    pub fn new(platform: P) -> Self {
        Usdhc { platform }
    }

    /// Releases the register window.
    pub fn free(self) -> P {
        self.platform
    }

    fn sys_ctrl_reset_wait(&mut self, mask: u32) -> Result<(), Error> {
        self.platform.modify32(regs::SYS_CTRL, |sc| sc | mask);
        for _ in 0..PROFILE.poll_iterations {
            if self.platform.read32(regs::SYS_CTRL) & mask == 0 {
                return Ok(());
            }
            self.platform.delay_us(PROFILE.poll_step_us);
        }
        Err(Error::Timeout)
    }

    /// Splits a division ratio into the prescaler/divisor register pair.
    ///
    /// The prescaler walks powers of two up to 256; the divisor covers
    /// the remaining 1..=16.
    fn encode_divider(divider: u32) -> u32 {
        let mut prescaler = 1u32;
        while prescaler < 256 && divider.div_ceil(prescaler) > 16 {
            prescaler *= 2;
        }
        let divisor = divider.div_ceil(prescaler).clamp(1, 16);
        // SDCLKFS: 0x00 = /1, 0x01 = /2, 0x02 = /4 ...; DVS: n-1.
        let sdclkfs = prescaler >> 1;
        (sdclkfs << bits::SC_SDCLKFS_SHIFT) | ((divisor - 1) << bits::SC_DVS_SHIFT)
    }
}

impl<P: Platform> Backend for Usdhc<P> {
    type Platform = P;

    fn platform(&mut self) -> &mut P {
        &mut self.platform
    }

    fn profile(&self) -> &'static Profile {
        &PROFILE
    }

    fn init(&mut self) -> Result<EnumSet<Capability>, Error> {
        self.sys_ctrl_reset_wait(bits::SC_RSTA)?;
        self.platform.write32(regs::INT_STATUS_EN, 0);
        self.platform.write32(regs::INT_SIGNAL_EN, 0);
        self.platform.write32(regs::INT_STATUS, u32::MAX);
        let watermark = PROFILE.fifo_watermark_words as u32;
        self.platform
            .write32(regs::WTMK_LVL, watermark << 16 | watermark);

        let caps0 = self.platform.read32(regs::HOST_CTRL_CAP);
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
        if caps0 & bits::CAP_SDR50 != 0 {
            caps |= Capability::Sdr50;
        }
        if caps0 & bits::CAP_SDR104 != 0 {
            caps |= Capability::Sdr104 | Capability::Hs200;
        }
        if caps0 & bits::CAP_DDR50 != 0 {
            caps |= Capability::Ddr50;
        }
        if caps0 & bits::CAP_TUNING_FOR_SDR50 != 0 {
            caps |= Capability::TuningForSdr50;
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
        Ok(caps)
    }

    fn deinit(&mut self) {
        self.platform.write32(regs::INT_STATUS_EN, 0);
        self.platform.write32(regs::INT_SIGNAL_EN, 0);
        self.platform.modify32(regs::VEND_SPEC, |vs| {
            vs & !(bits::VS_BUS_POWER | bits::VS_CARD_CLK_EN)
        });
    }

    fn lines_idle(&mut self, check_data: bool) -> bool {
        let mut mask = bits::PS_CMD_INHIBIT;
        if check_data {
            mask |= bits::PS_DAT_INHIBIT;
        }
        self.platform.read32(regs::PRES_STATE) & mask == 0
    }

    fn clear_transaction_status(&mut self) {
        self.platform.write32(
            regs::INT_STATUS,
            !(bits::INT_CARD_INSERTED | bits::INT_CARD_REMOVED | bits::INT_RETUNE),
        );
    }

    fn write_command(&mut self, frame: &CommandFrame) {
        if frame.data_present {
            self.platform.modify32(regs::MIX_CTRL, |mix| {
                let mut mix = mix & !bits::MC_TRANSFER_MASK;
                mix |= bits::MC_BCEN;
                if frame.use_dma {
                    mix |= bits::MC_DMAEN;
                }
                if frame.multi_block {
                    mix |= bits::MC_MSBSEL;
                }
                if frame.direction == Some(DataDirection::Read) {
                    mix |= bits::MC_DTDSEL_READ;
                }
                match frame.auto_stop {
                    AutoStop::Cmd12 => mix |= bits::MC_AC12EN,
                    AutoStop::Cmd23 => mix |= bits::MC_AC23EN,
                    AutoStop::None => {}
                }
                mix
            });
        }

        let mut xfr = u32::from(frame.opcode) << bits::XT_CMDINX_SHIFT;
        xfr |= match frame.response {
            ResponseKind::None => bits::XT_RSPTYP_NONE,
            ResponseKind::Long => bits::XT_RSPTYP_LONG,
            ResponseKind::Short => bits::XT_RSPTYP_SHORT,
            ResponseKind::ShortBusy => bits::XT_RSPTYP_SHORT_BUSY,
        };
        if frame.check_crc {
            xfr |= bits::XT_CCCEN;
        }
        if frame.check_index {
            xfr |= bits::XT_CICEN;
        }
        if frame.data_present {
            xfr |= bits::XT_DPSEL;
        }
        if frame.abort {
            xfr |= bits::XT_CMDTYP_ABORT;
        }

        self.platform.write32(regs::CMD_ARG, frame.argument);
        self.platform.write32(regs::CMD_XFR_TYP, xfr);
    }

    fn response_word(&mut self, index: usize) -> u32 {
        self.platform.read32(regs::CMD_RSP0 + 4 * index)
    }

    fn auto_response_word(&mut self) -> u32 {
        self.platform.read32(regs::CMD_RSP0 + 0xc)
    }

    fn set_block(&mut self, size: u16, count: u16) {
        self.platform
            .write32(regs::BLK_ATT, u32::from(count) << 16 | u32::from(size));
    }

    fn set_event_mask(&mut self, events: EnumSet<HostEvent>) {
        let raw = encode_events(events, EVENT_MAP);
        self.platform.write32(regs::INT_STATUS_EN, raw);
        self.platform.write32(regs::INT_SIGNAL_EN, raw);
    }

    fn pending_events(&mut self) -> EnumSet<HostEvent> {
        let enabled = self.platform.read32(regs::INT_STATUS_EN);
        let raw = self.platform.read32(regs::INT_STATUS) & enabled;
        if raw != 0 {
            self.platform.write32(regs::INT_STATUS, raw);
        }
        decode_events(raw, EVENT_MAP)
    }

    fn encode_descriptor(&self, entry: &ChainEntry, slot: &mut DescriptorSlot) {
        // Same ADMA2 layout as the SDHC standard: attributes and length
        // in word 0, buffer address in word 1.
        let mut attributes = 0x0021u32; // valid, act = transfer
        if entry.last {
            attributes |= 0x0002;
        }
        attributes |= (entry.len & 0xffff) << 16;
        slot.words = [attributes, entry.addr, 0, 0];
    }

    fn start_dma(&mut self, _kind: DmaKind, base: u32) {
        self.platform.modify32(regs::PROT_CTRL, |pc| {
            (pc & !bits::PC_DMASEL_MASK) | bits::PC_DMASEL_ADMA2
        });
        self.platform.write32(regs::ADMA_SYS_ADDR, base);
    }

    fn resume_dma(&mut self, next: u32) {
        self.platform.write32(regs::DS_ADDR, next);
    }

    fn stop_dma(&mut self) {
        self.platform
            .modify32(regs::PROT_CTRL, |pc| pc & !bits::PC_DMASEL_MASK);
        self.platform
            .modify32(regs::MIX_CTRL, |mix| mix & !bits::MC_DMAEN);
    }

    fn dma_idle(&mut self) -> bool {
        self.platform.read32(regs::PRES_STATE) & bits::PS_DAT_ACTIVE == 0
    }

    fn fifo_read(&mut self) -> u32 {
        self.platform.read32(regs::DATA_BUFF_ACC_PORT)
    }

    fn fifo_write(&mut self, word: u32) {
        self.platform.write32(regs::DATA_BUFF_ACC_PORT, word);
    }

    fn reset(&mut self, scope: EnumSet<ResetScope>) -> Result<(), Error> {
        let mut mask = 0;
        if scope.contains(ResetScope::Host) {
            mask |= bits::SC_RSTA;
        }
        if scope.contains(ResetScope::Command) {
            mask |= bits::SC_RSTC;
        }
        if scope.contains(ResetScope::Data)
            || scope.contains(ResetScope::Fifo)
            || scope.contains(ResetScope::Dma)
        {
            mask |= bits::SC_RSTD;
        }
        if mask == 0 {
            return Ok(());
        }
        self.sys_ctrl_reset_wait(mask)
    }

    fn set_clock_divider(&mut self, divider: u32) {
        let field = Self::encode_divider(divider);
        self.platform.modify32(regs::SYS_CTRL, |sc| {
            (sc & !bits::SC_DIVIDER_MASK) | field
        });
    }

    fn internal_clock(&mut self, enable: bool) {
        self.platform.modify32(regs::VEND_SPEC, |vs| {
            if enable {
                vs | bits::VS_INTERNAL_CLK_EN
            } else {
                vs & !bits::VS_INTERNAL_CLK_EN
            }
        });
    }

    fn clock_stable(&mut self) -> bool {
        self.platform.read32(regs::PRES_STATE) & bits::PS_CLOCK_STABLE != 0
    }

    fn card_clock(&mut self, enable: bool) {
        self.platform.modify32(regs::VEND_SPEC, |vs| {
            if enable {
                vs | bits::VS_CARD_CLK_EN
            } else {
                vs & !bits::VS_CARD_CLK_EN
            }
        });
    }

    fn set_power(&mut self, vdd: Option<VddLevel>) {
        self.platform.modify32(regs::VEND_SPEC, |vs| match vdd {
            None => vs & !(bits::VS_BUS_POWER | bits::VS_VSELECT_18),
            Some(VddLevel::V18) => vs | bits::VS_BUS_POWER | bits::VS_VSELECT_18,
            Some(_) => (vs | bits::VS_BUS_POWER) & !bits::VS_VSELECT_18,
        });
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        self.platform.modify32(regs::PROT_CTRL, |pc| {
            let pc = pc & !bits::PC_DTW_MASK;
            match width {
                BusWidth::One => pc,
                BusWidth::Four => pc | bits::PC_DTW_4,
                BusWidth::Eight => pc | bits::PC_DTW_8,
            }
        });
    }

    fn set_timing(&mut self, timing: TimingMode) {
        self.platform.modify32(regs::MIX_CTRL, |mix| {
            if timing.is_ddr() {
                mix | bits::MC_DDR_EN
            } else {
                mix & !bits::MC_DDR_EN
            }
        });
    }

    fn set_bus_mode(&mut self, _mode: BusMode) {
        // Push-pull only; MMC identification relies on the slow clock.
    }

    fn set_signal_voltage(&mut self, voltage: SignalVoltage) {
        self.platform.modify32(regs::VEND_SPEC, |vs| {
            if voltage == SignalVoltage::V18 {
                vs | bits::VS_VSELECT_18
            } else {
                vs & !bits::VS_VSELECT_18
            }
        });
    }

    fn data_line_level(&mut self) -> u8 {
        ((self.platform.read32(regs::PRES_STATE) >> bits::PS_DAT_LEVEL_SHIFT) & 0xf) as u8
    }

    fn set_driver_type(&mut self, _drive: DriverType) {
        // Pad drive strength belongs to the IOMUX on this family.
    }

    fn set_preset_enable(&mut self, _enable: bool) {
        // No preset-value registers.
    }

    fn set_sample_phase(&mut self, phase: u8) {
        self.platform.modify32(regs::CLK_TUNE_CTRL_STATUS, |ct| {
            (ct & !bits::CT_PHASE_MASK) | (u32::from(phase) << bits::CT_PHASE_SHIFT)
        });
        self.platform.modify32(regs::MIX_CTRL, |mix| {
            if phase == 0 {
                // Phase zero is the untuned default sampling point.
                mix & !bits::MC_SMP_CLK_SEL
            } else {
                mix | bits::MC_SMP_CLK_SEL
            }
        });
    }

    fn card_state(&mut self) -> CardState {
        let state = self.platform.read32(regs::PRES_STATE);
        if state & bits::PS_CARD_INSERTED == 0 {
            CardState::Removed
        } else if state & bits::PS_WRITE_ENABLED == 0 {
            CardState::WriteProtected
        } else {
            CardState::Inserted
        }
    }

    fn arm_init_stream(&mut self) {
        // Hardware clocks the 80-cycle stream and clears the bit itself.
        self.platform
            .modify32(regs::SYS_CTRL, |sc| sc | bits::SC_INITA);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;

    fn backend() -> Usdhc<MockPlatform> {
        let mut platform = MockPlatform::new();
        platform.w1c = &[regs::INT_STATUS];
        platform.fifo_offset = Some(regs::DATA_BUFF_ACC_PORT);
        Usdhc::new(platform)
    }

    #[test]
    fn divider_splits_into_prescaler_and_divisor() {
        // 8 = prescaler 1 * divisor 8.
        assert_eq!(
            Usdhc::<MockPlatform>::encode_divider(8),
            (0 << 8) | (7 << 4)
        );
        // 64 = prescaler 4 * divisor 16.
        assert_eq!(
            Usdhc::<MockPlatform>::encode_divider(64),
            (2 << 8) | (15 << 4)
        );
        // 500 -> prescaler 32, divisor 16 (ceil).
        assert_eq!(
            Usdhc::<MockPlatform>::encode_divider(500),
            (16 << 8) | (15 << 4)
        );
    }

    #[test]
    fn data_command_splits_across_mix_ctrl_and_xfr_typ() {
        let mut usdhc = backend();
        let mut buf = [0u8; 1024];
        let mut sg = heapless::Vec::new();
        sg.push(crate::scatter::SgEntry::from_slice(&mut buf)).unwrap();
        let command = crate::command::Command::new(18, 0x100, ResponseKind::Short).with_data(
            crate::command::DataRequest {
                direction: DataDirection::Read,
                block_size: 512,
                block_count: 2,
                sg,
                auto_stop: AutoStop::Cmd12,
            },
        );
        let frame = CommandFrame::build(&command, true);
        usdhc.write_command(&frame);

        let mix = usdhc.platform.get32(regs::MIX_CTRL);
        assert_ne!(mix & bits::MC_DMAEN, 0);
        assert_ne!(mix & bits::MC_MSBSEL, 0);
        assert_ne!(mix & bits::MC_DTDSEL_READ, 0);
        assert_ne!(mix & bits::MC_AC12EN, 0);

        let xfr = usdhc.platform.get32(regs::CMD_XFR_TYP);
        assert_eq!(xfr >> bits::XT_CMDINX_SHIFT, 18);
        assert_ne!(xfr & bits::XT_DPSEL, 0);
        assert_ne!(xfr & bits::XT_CCCEN, 0);
    }

    #[test]
    fn block_attributes_pack_size_and_count() {
        let mut usdhc = backend();
        usdhc.set_block(512, 8);
        assert_eq!(usdhc.platform.get32(regs::BLK_ATT), 8 << 16 | 512);
    }

    #[test]
    fn untuned_phase_clears_sample_clock_select() {
        let mut usdhc = backend();
        usdhc.set_sample_phase(5);
        assert_ne!(
            usdhc.platform.get32(regs::MIX_CTRL) & bits::MC_SMP_CLK_SEL,
            0
        );
        usdhc.set_sample_phase(0);
        assert_eq!(
            usdhc.platform.get32(regs::MIX_CTRL) & bits::MC_SMP_CLK_SEL,
            0
        );
    }
}
