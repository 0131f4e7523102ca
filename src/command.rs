//! # Command Model
//!
//! ## Overview
//!
//! A [`Command`] is the generic descriptor the card-management layer hands
//! to [`Host::command`](crate::host::Host::command). Before issue, the
//! dispatcher folds it (together with the transfer plan) into a
//! backend-neutral [`CommandFrame`] carrying every decision a controller
//! needs to build its hardware command word: response length, CRC/index
//! checking, data presence and direction, multi-block and auto-stop
//! handling, and abort-class tagging for STOP_TRANSMISSION.

use heapless::Vec;

use crate::scatter::SgEntry;

/// Command opcodes used by the engine itself.
///
/// The card-management layer issues the full command set; only the opcodes
/// the engine has to recognize are named here.
pub mod opcode {
    /// GO_IDLE_STATE — resets the card; first command after power-up.
    pub const GO_IDLE_STATE: u8 = 0;
    /// VOLTAGE_SWITCH — starts the 1.8 V signalling handshake.
    pub const VOLTAGE_SWITCH: u8 = 11;
    /// STOP_TRANSMISSION — abort-class command ending an open-ended
    /// multi-block transfer.
    pub const STOP_TRANSMISSION: u8 = 12;
    /// SEND_TUNING_BLOCK — SD tuning-block read (UHS-I).
    pub const SEND_TUNING_BLOCK: u8 = 19;
    /// SEND_TUNING_BLOCK_HS200 — eMMC tuning-block read.
    pub const SEND_TUNING_BLOCK_HS200: u8 = 21;
    /// SET_BLOCK_COUNT — pre-defines the length of the following
    /// multi-block transfer.
    pub const SET_BLOCK_COUNT: u8 = 23;
}

/// Maximum number of scatter/gather fragments per command.
pub const MAX_SEGMENTS: usize = 32;

/// Response layout expected for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseKind {
    /// No response.
    None,
    /// 48-bit response (R1, R3, R6, R7, ...).
    Short,
    /// 48-bit response with a busy phase on DAT0 (R1b).
    ShortBusy,
    /// 136-bit response (R2: CID/CSD).
    Long,
}

impl ResponseKind {
    /// Whether the controller should verify the response CRC.
    ///
    /// R3/R4 responses carry no CRC; their commands clear the flag on the
    /// [`Command`] after construction.
    pub fn checks_crc(self) -> bool {
        !matches!(self, ResponseKind::None)
    }

    /// Whether the controller should verify the echoed command index.
    ///
    /// 136-bit responses carry no index field.
    pub fn checks_index(self) -> bool {
        matches!(self, ResponseKind::Short | ResponseKind::ShortBusy)
    }
}

/// Direction of a data transfer, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataDirection {
    /// Card to host.
    Read,
    /// Host to card.
    Write,
}

/// Hardware-automatic companion command for multi-block transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AutoStop {
    /// No automatic command.
    None,
    /// Auto CMD12: controller issues STOP_TRANSMISSION after the last
    /// block.
    Cmd12,
    /// Auto CMD23: controller issues SET_BLOCK_COUNT before the data
    /// command.
    Cmd23,
}

/// Data phase attached to a command.
#[derive(Debug, Clone)]
pub struct DataRequest {
    /// Transfer direction.
    pub direction: DataDirection,
    /// Block size in bytes.
    pub block_size: u16,
    /// Number of blocks.
    pub block_count: u16,
    /// Scatter/gather list; entry lengths must sum to
    /// `block_size * block_count`.
    pub sg: Vec<SgEntry, MAX_SEGMENTS>,
    /// Automatic companion command.
    pub auto_stop: AutoStop,
}

impl DataRequest {
    /// Total payload length in bytes.
    pub fn total_len(&self) -> u32 {
        u32::from(self.block_size) * u32::from(self.block_count)
    }

    /// Whether the scatter list covers exactly the advertised payload.
    pub(crate) fn is_consistent(&self) -> bool {
        if self.block_size == 0 || self.block_count == 0 {
            return false;
        }
        let listed: u64 = self.sg.iter().map(|entry| u64::from(entry.len)).sum();
        listed == u64::from(self.total_len())
    }
}

/// A generic host-controller command descriptor.
///
/// Owned exclusively by the engine from issue until the completion is
/// handed back; the captured response and byte count are filled in by the
/// interrupt handler.
#[derive(Debug, Clone)]
pub struct Command {
    /// Command opcode (0..=63).
    pub opcode: u8,
    /// 32-bit command argument.
    pub argument: u32,
    /// Expected response layout.
    pub response: ResponseKind,
    /// Verify the response CRC.
    pub check_crc: bool,
    /// Verify the echoed command index.
    pub check_index: bool,
    /// Data phase, if any.
    pub data: Option<DataRequest>,
    /// Captured response words. Short responses use `response_words[0]`;
    /// 136-bit responses fill all four words, most-significant first.
    pub response_words: [u32; 4],
    /// Captured auto-stop response word, when an automatic companion
    /// command ran.
    pub auto_response: u32,
    /// Bytes actually moved by the data phase.
    pub bytes_transferred: u32,
}

impl Command {
    /// Creates a control command without data phase.
    ///
    /// CRC and index checking default to what the response kind allows;
    /// commands with CRC-less responses (R3/R4) should clear
    /// [`check_crc`](Command::check_crc) afterwards.
    pub fn new(opcode: u8, argument: u32, response: ResponseKind) -> Self {
        Command {
            opcode,
            argument,
            response,
            check_crc: response.checks_crc(),
            check_index: response.checks_index(),
            data: None,
            response_words: [0; 4],
            auto_response: 0,
            bytes_transferred: 0,
        }
    }

    /// Attaches a data phase.
    pub fn with_data(mut self, data: DataRequest) -> Self {
        self.data = Some(data);
        self
    }

    /// Whether this is the abort-class STOP_TRANSMISSION command.
    pub fn is_abort(&self) -> bool {
        self.opcode == opcode::STOP_TRANSMISSION
    }
}

/// Backend-neutral command word, fully decided by the dispatcher.
///
/// Backends translate this one-to-one into their hardware command and
/// transfer-mode registers; no protocol decisions are left to them.
#[derive(Debug, Clone, Copy)]
pub struct CommandFrame {
    /// Command opcode.
    pub opcode: u8,
    /// 32-bit command argument.
    pub argument: u32,
    /// Response layout.
    pub response: ResponseKind,
    /// Verify the response CRC.
    pub check_crc: bool,
    /// Verify the echoed command index.
    pub check_index: bool,
    /// A data phase follows the command.
    pub data_present: bool,
    /// Data direction, when a data phase is present.
    pub direction: Option<DataDirection>,
    /// More than one block moves.
    pub multi_block: bool,
    /// Hardware-automatic companion command.
    pub auto_stop: AutoStop,
    /// Abort-class command: issued while the data lines are busy.
    pub abort: bool,
    /// Move the payload with the DMA engine selected at setup.
    pub use_dma: bool,
}

impl CommandFrame {
    /// Folds a command descriptor and the transfer decision into the frame.
    pub(crate) fn build(command: &Command, use_dma: bool) -> Self {
        let data = command.data.as_ref();
        let multi_block = data.map(|d| d.block_count > 1).unwrap_or(false);
        CommandFrame {
            opcode: command.opcode,
            argument: command.argument,
            response: command.response,
            check_crc: command.check_crc,
            check_index: command.check_index,
            data_present: data.is_some(),
            direction: data.map(|d| d.direction),
            // Auto-stop only applies to multi-block transfers.
            multi_block,
            auto_stop: if multi_block {
                data.map(|d| d.auto_stop).unwrap_or(AutoStop::None)
            } else {
                AutoStop::None
            },
            abort: command.is_abort(),
            use_dma,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scatter::SgEntry;

    fn read_request(block_size: u16, block_count: u16, buf: &mut [u8]) -> DataRequest {
        let mut sg = Vec::new();
        sg.push(SgEntry::from_slice(buf)).unwrap();
        DataRequest {
            direction: DataDirection::Read,
            block_size,
            block_count,
            sg,
            auto_stop: AutoStop::Cmd12,
        }
    }

    #[test]
    fn control_frame_has_no_data_bits() {
        let cmd = Command::new(0, 0, ResponseKind::None);
        let frame = CommandFrame::build(&cmd, false);
        assert!(!frame.data_present);
        assert!(frame.direction.is_none());
        assert!(!frame.multi_block);
        assert_eq!(frame.auto_stop, AutoStop::None);
        assert!(!frame.check_crc);
        assert!(!frame.check_index);
    }

    #[test]
    fn multi_block_read_sets_auto_stop() {
        let mut buf = [0u8; 1024];
        let cmd = Command::new(18, 0, ResponseKind::Short).with_data(read_request(512, 2, &mut buf));
        let frame = CommandFrame::build(&cmd, true);
        assert!(frame.data_present);
        assert!(frame.multi_block);
        assert_eq!(frame.auto_stop, AutoStop::Cmd12);
        assert_eq!(frame.direction, Some(DataDirection::Read));
        assert!(frame.use_dma);
    }

    #[test]
    fn single_block_suppresses_auto_stop() {
        let mut buf = [0u8; 512];
        let cmd = Command::new(17, 0, ResponseKind::Short).with_data(read_request(512, 1, &mut buf));
        let frame = CommandFrame::build(&cmd, false);
        assert!(!frame.multi_block);
        assert_eq!(frame.auto_stop, AutoStop::None);
    }

    #[test]
    fn stop_transmission_is_abort_class() {
        let cmd = Command::new(opcode::STOP_TRANSMISSION, 0, ResponseKind::ShortBusy);
        let frame = CommandFrame::build(&cmd, false);
        assert!(frame.abort);
    }

    #[test]
    fn sg_length_mismatch_is_inconsistent() {
        let mut buf = [0u8; 500];
        let data = read_request(512, 1, &mut buf);
        assert!(!data.is_consistent());
    }
}
