//! # Normalized Interrupt Events
//!
//! ## Overview
//!
//! Backends read-and-clear their raw status registers and hand the engine
//! an [`EnumSet`] of [`HostEvent`]s. Classification of the error bits into
//! a single [`CompletionStatus`] follows a fixed priority so that a status
//! word carrying several error conditions still produces exactly one
//! outcome, one recovery reset, and one completion report.

use enumset::{enum_set, EnumSet, EnumSetType};

/// One normalized host-controller interrupt condition.
#[derive(Debug, EnumSetType)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostEvent {
    /// The command phase finished; the response is ready.
    CommandComplete,
    /// The data phase finished.
    TransferComplete,
    /// The read FIFO reached the watermark.
    BufferReadReady,
    /// The write FIFO drained below the watermark.
    BufferWriteReady,
    /// A single-buffer DMA engine stopped at its address boundary and
    /// waits for the next system address.
    DmaBoundary,
    /// The automatic companion command (CMD12/CMD23) completed.
    AutoCommandDone,
    /// A card was inserted.
    CardInserted,
    /// The card was removed.
    CardRemoved,
    /// The controller requests a re-tune before the next data command.
    RetuneRequest,
    /// Command response timeout.
    ErrCommandTimeout,
    /// Command response CRC error.
    ErrCommandCrc,
    /// Command response end-bit error.
    ErrCommandEndBit,
    /// Command response index mismatch.
    ErrCommandIndex,
    /// Data timeout.
    ErrDataTimeout,
    /// Data CRC error.
    ErrDataCrc,
    /// Data end-bit error.
    ErrDataEndBit,
    /// The automatic companion command failed.
    ErrAutoCommand,
    /// Any other error condition the backend reports.
    ErrGeneric,
}

/// All error events, in no particular order.
pub const ERROR_EVENTS: EnumSet<HostEvent> = enum_set!(
    HostEvent::ErrCommandTimeout
        | HostEvent::ErrCommandCrc
        | HostEvent::ErrCommandEndBit
        | HostEvent::ErrCommandIndex
        | HostEvent::ErrDataTimeout
        | HostEvent::ErrDataCrc
        | HostEvent::ErrDataEndBit
        | HostEvent::ErrAutoCommand
        | HostEvent::ErrGeneric
);

/// Events every transaction enables beyond the transfer-specific ones.
pub(crate) const BASE_COMMAND_EVENTS: EnumSet<HostEvent> = enum_set!(
    HostEvent::CommandComplete
        | HostEvent::ErrCommandTimeout
        | HostEvent::ErrCommandCrc
        | HostEvent::ErrCommandEndBit
        | HostEvent::ErrCommandIndex
        | HostEvent::ErrDataTimeout
        | HostEvent::ErrDataCrc
        | HostEvent::ErrDataEndBit
        | HostEvent::ErrAutoCommand
        | HostEvent::ErrGeneric
);

/// Events kept enabled while the controller is idle.
pub(crate) const IDLE_EVENTS: EnumSet<HostEvent> = enum_set!(
    HostEvent::CardInserted | HostEvent::CardRemoved | HostEvent::RetuneRequest
);

/// Terminal outcome of one command, reported exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CompletionStatus {
    /// Command (and data phase, if any) completed.
    Success,
    /// No response within the response timeout.
    CommandTimeout,
    /// Response CRC mismatch.
    CommandCrc,
    /// Response end bit missing.
    CommandEndBit,
    /// Response echoed the wrong command index.
    CommandIndex,
    /// Data did not arrive within the data timeout.
    DataTimeout,
    /// Data CRC mismatch.
    DataCrc,
    /// Data end bit missing.
    DataEndBit,
    /// The card left the slot while the command was in flight.
    CardRemoved,
    /// The command was cancelled through
    /// [`Host::abort`](crate::host::Host::abort).
    Aborted,
    /// Unclassified controller error.
    Failure,
}

impl CompletionStatus {
    /// Whether the outcome is an error.
    pub fn is_error(self) -> bool {
        !matches!(self, CompletionStatus::Success)
    }

    /// Whether the outcome is a timeout that may be reclassified as
    /// [`CompletionStatus::CardRemoved`] when the slot is empty.
    pub(crate) fn is_timeout(self) -> bool {
        matches!(
            self,
            CompletionStatus::CommandTimeout | CompletionStatus::DataTimeout
        )
    }
}

/// Classifies a status set into the highest-priority error, if any.
///
/// Priority (first match wins): data timeout, data CRC, data end-bit,
/// command timeout, command CRC, command end-bit, command index, then the
/// unclassified errors.
pub(crate) fn classify(events: EnumSet<HostEvent>) -> Option<CompletionStatus> {
    const PRIORITY: [(HostEvent, CompletionStatus); 7] = [
        (HostEvent::ErrDataTimeout, CompletionStatus::DataTimeout),
        (HostEvent::ErrDataCrc, CompletionStatus::DataCrc),
        (HostEvent::ErrDataEndBit, CompletionStatus::DataEndBit),
        (HostEvent::ErrCommandTimeout, CompletionStatus::CommandTimeout),
        (HostEvent::ErrCommandCrc, CompletionStatus::CommandCrc),
        (HostEvent::ErrCommandEndBit, CompletionStatus::CommandEndBit),
        (HostEvent::ErrCommandIndex, CompletionStatus::CommandIndex),
    ];

    for (event, status) in PRIORITY {
        if events.contains(event) {
            return Some(status);
        }
    }
    if events.contains(HostEvent::ErrAutoCommand) || events.contains(HostEvent::ErrGeneric) {
        return Some(CompletionStatus::Failure);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_timeout_outranks_data_crc() {
        let events = HostEvent::ErrDataTimeout | HostEvent::ErrDataCrc;
        assert_eq!(classify(events), Some(CompletionStatus::DataTimeout));
    }

    #[test]
    fn data_errors_outrank_command_errors() {
        let events = HostEvent::ErrCommandTimeout | HostEvent::ErrDataEndBit;
        assert_eq!(classify(events), Some(CompletionStatus::DataEndBit));
    }

    #[test]
    fn command_priority_order() {
        let events =
            HostEvent::ErrCommandIndex | HostEvent::ErrCommandCrc | HostEvent::ErrCommandEndBit;
        assert_eq!(classify(events), Some(CompletionStatus::CommandCrc));
    }

    #[test]
    fn generic_error_is_last_resort() {
        assert_eq!(
            classify(HostEvent::ErrGeneric.into()),
            Some(CompletionStatus::Failure)
        );
    }

    #[test]
    fn completion_bits_are_not_errors() {
        let events = HostEvent::CommandComplete | HostEvent::TransferComplete;
        assert_eq!(classify(events), None);
    }
}
