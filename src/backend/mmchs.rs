//! # TI OMAP MMCHS Backend
//!
//! ## Overview
//!
//! Adapter for the OMAP high-speed MMC/SD/SDIO interface. The block keeps
//! the SDHC interrupt layout but moves configuration into its own `CON` /
//! `HCTL` / `SYSCTL` registers, drives an open-drain command line for MMC
//! identification, and clocks the init stream itself through `CON.INIT`.
//!
//! Data DMA is a single master-DMA address/length pair — there is no
//! descriptor chain, so scattered transfers that cannot be linearized
//! fall back to PIO (or fail hard for physical-only fragments). Long
//! responses arrive pre-aligned. Tuning sweeps the DLL delay taps with
//! the rotated-median policy and propagates an I/O error when no tap
//! passes.

use embedded_hal::delay::DelayNs;
use enumset::EnumSet;

use crate::backend::{
    decode_events, encode_events, Backend, Capability, DmaKind, Profile, ResetScope,
};
use crate::clock::DividerStrategy;
use crate::command::{CommandFrame, DataDirection, ResponseKind};
use crate::config::{BusMode, BusWidth, CardState, DriverType, SignalVoltage, TimingMode, VddLevel};
use crate::dma::{ChainEntry, DescriptorSlot};
use crate::event::HostEvent;
use crate::host::Error;
use crate::platform::Platform;
use crate::tuning::{TuningFallback, TuningPolicy};

/// MMCHS register map.
#[allow(dead_code)]
pub(crate) mod regs {
    pub const SYSCONFIG: usize = 0x010;
    pub const SYSSTATUS: usize = 0x014;
    pub const CON: usize = 0x02c;
    /// DLL delay-tap control (sample phase).
    pub const DLL: usize = 0x034;
    pub const BLK: usize = 0x104;
    pub const ARG: usize = 0x108;
    pub const CMD: usize = 0x10c;
    pub const RSP10: usize = 0x110;
    pub const DATA: usize = 0x120;
    pub const PSTATE: usize = 0x124;
    pub const HCTL: usize = 0x128;
    pub const SYSCTL: usize = 0x12c;
    pub const STAT: usize = 0x130;
    pub const IE: usize = 0x134;
    pub const ISE: usize = 0x138;
    pub const CAPA: usize = 0x140;
    pub const CAPA2: usize = 0x144;
    /// Master-DMA system address.
    pub const ADMASAL: usize = 0x158;
}

mod bits {
    // CON
    pub const CON_OD: u32 = 1 << 0;
    pub const CON_INIT: u32 = 1 << 1;
    pub const CON_DW8: u32 = 1 << 5;
    pub const CON_DDR: u32 = 1 << 19;

    // CMD
    pub const CMD_DE: u32 = 1 << 0;
    pub const CMD_BCE: u32 = 1 << 1;
    pub const CMD_ACEN_CMD12: u32 = 0x1 << 2;
    pub const CMD_ACEN_CMD23: u32 = 0x2 << 2;
    pub const CMD_DDIR_READ: u32 = 1 << 4;
    pub const CMD_MSBS: u32 = 1 << 5;
    pub const CMD_RSP_NONE: u32 = 0x0 << 16;
    pub const CMD_RSP_LONG: u32 = 0x1 << 16;
    pub const CMD_RSP_SHORT: u32 = 0x2 << 16;
    pub const CMD_RSP_SHORT_BUSY: u32 = 0x3 << 16;
    pub const CMD_CCCE: u32 = 1 << 19;
    pub const CMD_CICE: u32 = 1 << 20;
    pub const CMD_DP: u32 = 1 << 21;
    pub const CMD_TYPE_ABORT: u32 = 0x3 << 22;
    pub const CMD_INDEX_SHIFT: u32 = 24;

    // PSTATE
    pub const PS_CMDI: u32 = 1 << 0;
    pub const PS_DATI: u32 = 1 << 1;
    pub const PS_DLA: u32 = 1 << 2;
    pub const PS_CARD_INSERTED: u32 = 1 << 16;
    pub const PS_WRITE_ENABLED: u32 = 1 << 19;
    pub const PS_DLEV_SHIFT: u32 = 20;

    // HCTL
    pub const HCTL_DTW_4: u32 = 1 << 1;
    pub const HCTL_HSPE: u32 = 1 << 2;
    pub const HCTL_SDBP: u32 = 1 << 8;
    pub const HCTL_SDVS_MASK: u32 = 0x7 << 9;
    pub const HCTL_SDVS_18: u32 = 0x5 << 9;
    pub const HCTL_SDVS_30: u32 = 0x6 << 9;
    pub const HCTL_SDVS_33: u32 = 0x7 << 9;

    // SYSCTL
    pub const SC_ICE: u32 = 1 << 0;
    pub const SC_ICS: u32 = 1 << 1;
    pub const SC_CEN: u32 = 1 << 2;
    pub const SC_CLKD_SHIFT: u32 = 6;
    pub const SC_CLKD_MASK: u32 = 0x3ff << 6;
    pub const SC_SRA: u32 = 1 << 24;
    pub const SC_SRC: u32 = 1 << 25;
    pub const SC_SRD: u32 = 1 << 26;

    // CAPA
    pub const CAPA_HSS: u32 = 1 << 21;
    pub const CAPA_VS33: u32 = 1 << 24;
    pub const CAPA_VS30: u32 = 1 << 25;
    pub const CAPA_VS18: u32 = 1 << 26;

    // CAPA2
    pub const CAPA2_SDR50: u32 = 1 << 0;
    pub const CAPA2_SDR104: u32 = 1 << 1;
    pub const CAPA2_DDR50: u32 = 1 << 2;
    pub const CAPA2_TUNING_SDR50: u32 = 1 << 13;

    // STAT / IE / ISE
    pub const STAT_CC: u32 = 1 << 0;
    pub const STAT_TC: u32 = 1 << 1;
    pub const STAT_DMA: u32 = 1 << 3;
    pub const STAT_BWR: u32 = 1 << 4;
    pub const STAT_BRR: u32 = 1 << 5;
    pub const STAT_CINS: u32 = 1 << 6;
    pub const STAT_CREM: u32 = 1 << 7;
    pub const STAT_ERRI: u32 = 1 << 15;
    pub const STAT_CTO: u32 = 1 << 16;
    pub const STAT_CCRC: u32 = 1 << 17;
    pub const STAT_CEB: u32 = 1 << 18;
    pub const STAT_CIE: u32 = 1 << 19;
    pub const STAT_DTO: u32 = 1 << 20;
    pub const STAT_DCRC: u32 = 1 << 21;
    pub const STAT_DEB: u32 = 1 << 22;
    pub const STAT_ACE: u32 = 1 << 24;
    pub const STAT_ADMAE: u32 = 1 << 25;
    pub const STAT_CERR: u32 = 1 << 28;
    pub const STAT_BADA: u32 = 1 << 29;
}

const EVENT_MAP: &[(u32, HostEvent)] = &[
    (bits::STAT_CC, HostEvent::CommandComplete),
    (bits::STAT_TC, HostEvent::TransferComplete),
    (bits::STAT_DMA, HostEvent::DmaBoundary),
    (bits::STAT_BWR, HostEvent::BufferWriteReady),
    (bits::STAT_BRR, HostEvent::BufferReadReady),
    (bits::STAT_CINS, HostEvent::CardInserted),
    (bits::STAT_CREM, HostEvent::CardRemoved),
    (bits::STAT_CTO, HostEvent::ErrCommandTimeout),
    (bits::STAT_CCRC, HostEvent::ErrCommandCrc),
    (bits::STAT_CEB, HostEvent::ErrCommandEndBit),
    (bits::STAT_CIE, HostEvent::ErrCommandIndex),
    (bits::STAT_DTO, HostEvent::ErrDataTimeout),
    (bits::STAT_DCRC, HostEvent::ErrDataCrc),
    (bits::STAT_DEB, HostEvent::ErrDataEndBit),
    (bits::STAT_ACE, HostEvent::ErrAutoCommand),
    (bits::STAT_ADMAE, HostEvent::ErrGeneric),
    (bits::STAT_CERR, HostEvent::ErrGeneric),
    (bits::STAT_BADA, HostEvent::ErrGeneric),
];

static PROFILE: Profile = Profile {
    name: "mmchs",
    // Master DMA takes one linear region; no descriptor chain.
    max_descriptors: 0,
    desc_max_len: 0,
    dma_boundary: Some(1 << 24),
    divider: DividerStrategy::RoundUp { max: 1023 },
    ddr_prediv: false,
    ddr_forces_8bit: false,
    long_response_preshifted: true,
    signals_auto_cmd_done: false,
    tuning_range: 32,
    tuning_policy: TuningPolicy::RotatedMedian,
    tuning_fallback: TuningFallback::PropagateError,
    default_sample_phase: 0,
    fifo_watermark_words: 128,
    poll_iterations: 1000,
    poll_step_us: 10,
    abort_settle_us: 500,
    init_stream_us: 1000,
    keeps_emmc_rail: false,
};

/// OMAP high-speed MMC/SD/SDIO controller.
pub struct Mmchs<P: Platform> {
    platform: P,
    init_armed: bool,
}

impl<P: Platform> Mmchs<P> {
    /// Creates the adapter over a mapped register window.
    pub fn new(platform: P) -> Self {
        Mmchs {
            platform,
            init_armed: false,
        }
    }

    /// Releases the register window.
    pub fn free(self) -> P {
        self.platform
    }

    fn sysctl_reset_wait(&mut self, mask: u32) -> Result<(), Error> {
        self.platform.modify32(regs::SYSCTL, |sc| sc | mask);
        for _ in 0..PROFILE.poll_iterations {
            if self.platform.read32(regs::SYSCTL) & mask == 0 {
                return Ok(());
            }
            self.platform.delay_us(PROFILE.poll_step_us);
        }
        Err(Error::Timeout)
    }
}

impl<P: Platform> Backend for Mmchs<P> {
    type Platform = P;

    fn platform(&mut self) -> &mut P {
        &mut self.platform
    }

    fn profile(&self) -> &'static Profile {
        &PROFILE
    }

    fn init(&mut self) -> Result<EnumSet<Capability>, Error> {
        self.sysctl_reset_wait(bits::SC_SRA)?;
        self.platform.write32(regs::IE, 0);
        self.platform.write32(regs::ISE, 0);
        self.platform.write32(regs::STAT, u32::MAX);

        let capa = self.platform.read32(regs::CAPA);
        let capa2 = self.platform.read32(regs::CAPA2);
        // The 8-bit path is wired through CON.DW8 on every instance.
        let mut caps = Capability::BusWidth8 | Capability::SingleBufferDma;
        if capa & bits::CAPA_HSS != 0 {
            caps |= Capability::HighSpeed;
        }
        if capa & bits::CAPA_VS33 != 0 {
            caps |= Capability::Voltage33;
        }
        if capa & bits::CAPA_VS30 != 0 {
            caps |= Capability::Voltage30;
        }
        if capa & bits::CAPA_VS18 != 0 {
            caps |= Capability::Voltage18;
        }
        if capa2 & bits::CAPA2_SDR50 != 0 {
            caps |= Capability::Sdr50;
        }
        if capa2 & bits::CAPA2_SDR104 != 0 {
            caps |= Capability::Sdr104 | Capability::Hs200;
        }
        if capa2 & bits::CAPA2_DDR50 != 0 {
            caps |= Capability::Ddr50;
        }
        if capa2 & bits::CAPA2_TUNING_SDR50 != 0 {
            caps |= Capability::TuningForSdr50;
        }
        Ok(caps)
    }

    fn deinit(&mut self) {
        self.platform.write32(regs::IE, 0);
        self.platform.write32(regs::ISE, 0);
        self.platform
            .modify32(regs::HCTL, |hctl| hctl & !bits::HCTL_SDBP);
    }

    fn lines_idle(&mut self, check_data: bool) -> bool {
        let mut mask = bits::PS_CMDI;
        if check_data {
            mask |= bits::PS_DATI;
        }
        self.platform.read32(regs::PSTATE) & mask == 0
    }

    fn clear_transaction_status(&mut self) {
        self.platform
            .write32(regs::STAT, !(bits::STAT_CINS | bits::STAT_CREM));
    }

    fn write_command(&mut self, frame: &CommandFrame) {
        let mut command = u32::from(frame.opcode) << bits::CMD_INDEX_SHIFT;
        command |= match frame.response {
            ResponseKind::None => bits::CMD_RSP_NONE,
            ResponseKind::Long => bits::CMD_RSP_LONG,
            ResponseKind::Short => bits::CMD_RSP_SHORT,
            ResponseKind::ShortBusy => bits::CMD_RSP_SHORT_BUSY,
        };
        if frame.check_crc {
            command |= bits::CMD_CCCE;
        }
        if frame.check_index {
            command |= bits::CMD_CICE;
        }
        if frame.data_present {
            command |= bits::CMD_DP | bits::CMD_BCE;
            if frame.use_dma {
                command |= bits::CMD_DE;
            }
            if frame.multi_block {
                command |= bits::CMD_MSBS;
            }
            if frame.direction == Some(DataDirection::Read) {
                command |= bits::CMD_DDIR_READ;
            }
            match frame.auto_stop {
                crate::command::AutoStop::Cmd12 => command |= bits::CMD_ACEN_CMD12,
                crate::command::AutoStop::Cmd23 => command |= bits::CMD_ACEN_CMD23,
                crate::command::AutoStop::None => {}
            }
        }
        if frame.abort {
            command |= bits::CMD_TYPE_ABORT;
        }

        self.platform.write32(regs::ARG, frame.argument);
        self.platform.write32(regs::CMD, command);

        if self.init_armed {
            // The INIT stream stops with the first real command.
            self.platform
                .modify32(regs::CON, |con| con & !bits::CON_INIT);
            self.init_armed = false;
        }
    }

    fn response_word(&mut self, index: usize) -> u32 {
        self.platform.read32(regs::RSP10 + 4 * index)
    }

    fn auto_response_word(&mut self) -> u32 {
        self.platform.read32(regs::RSP10 + 0xc)
    }

    fn set_block(&mut self, size: u16, count: u16) {
        self.platform
            .write32(regs::BLK, u32::from(count) << 16 | u32::from(size));
    }

    fn set_event_mask(&mut self, events: EnumSet<HostEvent>) {
        let raw = encode_events(events, EVENT_MAP);
        self.platform.write32(regs::IE, raw);
        self.platform.write32(regs::ISE, raw);
    }

    fn pending_events(&mut self) -> EnumSet<HostEvent> {
        let enabled = self.platform.read32(regs::IE);
        let raw = self.platform.read32(regs::STAT) & (enabled | bits::STAT_ERRI);
        if raw != 0 {
            self.platform.write32(regs::STAT, raw);
        }
        let mut events = decode_events(raw, EVENT_MAP);
        if raw & bits::STAT_ERRI != 0 && events & crate::event::ERROR_EVENTS == EnumSet::empty() {
            events |= HostEvent::ErrGeneric;
        }
        events
    }

    fn encode_descriptor(&self, entry: &ChainEntry, slot: &mut DescriptorSlot) {
        // No descriptor engine; keep the fields for diagnostics only.
        slot.words = [entry.len, entry.addr, 0, 0];
    }

    fn start_dma(&mut self, _kind: DmaKind, base: u32) {
        self.platform.write32(regs::ADMASAL, base);
    }

    fn resume_dma(&mut self, next: u32) {
        self.platform.write32(regs::ADMASAL, next);
    }

    fn stop_dma(&mut self) {
        self.platform.write32(regs::ADMASAL, 0);
    }

    fn dma_idle(&mut self) -> bool {
        self.platform.read32(regs::PSTATE) & bits::PS_DLA == 0
    }

    fn fifo_read(&mut self) -> u32 {
        self.platform.read32(regs::DATA)
    }

    fn fifo_write(&mut self, word: u32) {
        self.platform.write32(regs::DATA, word);
    }

    fn reset(&mut self, scope: EnumSet<ResetScope>) -> Result<(), Error> {
        let mut mask = 0;
        if scope.contains(ResetScope::Host) {
            mask |= bits::SC_SRA;
        }
        if scope.contains(ResetScope::Command) {
            mask |= bits::SC_SRC;
        }
        if scope.contains(ResetScope::Data)
            || scope.contains(ResetScope::Fifo)
            || scope.contains(ResetScope::Dma)
        {
            mask |= bits::SC_SRD;
        }
        if mask == 0 {
            return Ok(());
        }
        self.sysctl_reset_wait(mask)
    }

    fn set_clock_divider(&mut self, divider: u32) {
        self.platform.modify32(regs::SYSCTL, |sc| {
            (sc & !(bits::SC_CLKD_MASK | bits::SC_ICE | bits::SC_CEN))
                | ((divider & 0x3ff) << bits::SC_CLKD_SHIFT)
        });
    }

    fn internal_clock(&mut self, enable: bool) {
        self.platform.modify32(regs::SYSCTL, |sc| {
            if enable {
                sc | bits::SC_ICE
            } else {
                sc & !bits::SC_ICE
            }
        });
    }

    fn clock_stable(&mut self) -> bool {
        self.platform.read32(regs::SYSCTL) & bits::SC_ICS != 0
    }

    fn card_clock(&mut self, enable: bool) {
        self.platform.modify32(regs::SYSCTL, |sc| {
            if enable {
                sc | bits::SC_CEN
            } else {
                sc & !bits::SC_CEN
            }
        });
    }

    fn set_power(&mut self, vdd: Option<VddLevel>) {
        self.platform.modify32(regs::HCTL, |hctl| {
            let hctl = hctl & !(bits::HCTL_SDVS_MASK | bits::HCTL_SDBP);
            match vdd {
                None => hctl,
                Some(VddLevel::V18) => hctl | bits::HCTL_SDVS_18 | bits::HCTL_SDBP,
                Some(VddLevel::V30) => hctl | bits::HCTL_SDVS_30 | bits::HCTL_SDBP,
                Some(VddLevel::V33) => hctl | bits::HCTL_SDVS_33 | bits::HCTL_SDBP,
            }
        });
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        self.platform.modify32(regs::CON, |con| {
            if width == BusWidth::Eight {
                con | bits::CON_DW8
            } else {
                con & !bits::CON_DW8
            }
        });
        self.platform.modify32(regs::HCTL, |hctl| {
            if width == BusWidth::Four {
                hctl | bits::HCTL_DTW_4
            } else {
                hctl & !bits::HCTL_DTW_4
            }
        });
    }

    fn set_timing(&mut self, timing: TimingMode) {
        self.platform.modify32(regs::HCTL, |hctl| {
            if matches!(timing, TimingMode::Legacy | TimingMode::Sdr12) {
                hctl & !bits::HCTL_HSPE
            } else {
                hctl | bits::HCTL_HSPE
            }
        });
        self.platform.modify32(regs::CON, |con| {
            if timing.is_ddr() {
                con | bits::CON_DDR
            } else {
                con & !bits::CON_DDR
            }
        });
    }

    fn set_bus_mode(&mut self, mode: BusMode) {
        self.platform.modify32(regs::CON, |con| {
            if mode == BusMode::OpenDrain {
                con | bits::CON_OD
            } else {
                con & !bits::CON_OD
            }
        });
    }

    fn set_signal_voltage(&mut self, voltage: SignalVoltage) {
        self.platform.modify32(regs::HCTL, |hctl| {
            let hctl = hctl & !bits::HCTL_SDVS_MASK;
            if voltage == SignalVoltage::V18 {
                hctl | bits::HCTL_SDVS_18
            } else {
                hctl | bits::HCTL_SDVS_33
            }
        });
    }

    fn data_line_level(&mut self) -> u8 {
        ((self.platform.read32(regs::PSTATE) >> bits::PS_DLEV_SHIFT) & 0xf) as u8
    }

    fn set_driver_type(&mut self, _drive: DriverType) {
        // Pad drive strength is control-module domain on this SoC.
    }

    fn set_preset_enable(&mut self, _enable: bool) {
        // No preset-value registers.
    }

    fn set_sample_phase(&mut self, phase: u8) {
        self.platform.modify32(regs::DLL, |dll| {
            (dll & !(0x7f << 8)) | (u32::from(phase & 0x7f) << 8)
        });
    }

    fn card_state(&mut self) -> CardState {
        // Slot detect is board wiring mirrored into the debounced
        // present-state bits.
        let state = self.platform.read32(regs::PSTATE);
        if state & bits::PS_CARD_INSERTED == 0 {
            CardState::Removed
        } else if state & bits::PS_WRITE_ENABLED == 0 {
            CardState::WriteProtected
        } else {
            CardState::Inserted
        }
    }

    fn arm_init_stream(&mut self) {
        self.platform
            .modify32(regs::CON, |con| con | bits::CON_INIT);
        self.init_armed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;

    fn backend() -> Mmchs<MockPlatform> {
        let mut platform = MockPlatform::new();
        platform.w1c = &[regs::STAT];
        platform.fifo_offset = Some(regs::DATA);
        Mmchs::new(platform)
    }

    #[test]
    fn open_drain_rides_in_con() {
        let mut mmchs = backend();
        mmchs.set_bus_mode(BusMode::OpenDrain);
        assert_ne!(mmchs.platform.get32(regs::CON) & bits::CON_OD, 0);
        mmchs.set_bus_mode(BusMode::PushPull);
        assert_eq!(mmchs.platform.get32(regs::CON) & bits::CON_OD, 0);
    }

    #[test]
    fn init_stream_clears_with_the_first_command() {
        let mut mmchs = backend();
        mmchs.arm_init_stream();
        assert_ne!(mmchs.platform.get32(regs::CON) & bits::CON_INIT, 0);

        let frame = CommandFrame::build(
            &crate::command::Command::new(0, 0, ResponseKind::None),
            false,
        );
        mmchs.write_command(&frame);
        assert_eq!(mmchs.platform.get32(regs::CON) & bits::CON_INIT, 0);
    }

    #[test]
    fn clock_divider_lands_in_sysctl() {
        let mut mmchs = backend();
        mmchs.set_clock_divider(250);
        let sysctl = mmchs.platform.get32(regs::SYSCTL);
        assert_eq!((sysctl & bits::SC_CLKD_MASK) >> bits::SC_CLKD_SHIFT, 250);
    }

    #[test]
    fn eight_bit_uses_con_dw8() {
        let mut mmchs = backend();
        mmchs.set_bus_width(BusWidth::Eight);
        assert_ne!(mmchs.platform.get32(regs::CON) & bits::CON_DW8, 0);
        mmchs.set_bus_width(BusWidth::Four);
        assert_eq!(mmchs.platform.get32(regs::CON) & bits::CON_DW8, 0);
        assert_ne!(mmchs.platform.get32(regs::HCTL) & bits::HCTL_DTW_4, 0);
    }
}
