//! # Host Controller Engine
//!
//! ## Overview
//!
//! [`Host`] is one controller instance: it owns a backend adapter, the
//! descriptor pool, and at most one in-flight [`Command`]. The caller
//! serializes issuance; completion is delivered asynchronously by calling
//! [`Host::handle_interrupt`] from the platform's interrupt dispatch
//! context, which returns at most one [`Completion`] per command —
//! exactly once, also for aborted and failed transactions.
//!
//! All busy-waits are bounded register polls (command-line free,
//! clock-stable, reset-complete, voltage-switch line level, DMA idle) and
//! surface [`Error::Timeout`] instead of hanging. Command and data errors
//! trigger one scoped reset before the error is reported; retry policy
//! stays with the card-management layer above.

use embedded_hal::delay::DelayNs;
use enumset::EnumSet;
use fugit::HertzU32;
use heapless::Vec;

use crate::backend::{Backend, Capability, DmaKind, ResetScope};
use crate::command::{
    AutoStop, Command, CommandFrame, DataDirection, DataRequest, ResponseKind,
};
use crate::config::{
    BusMode, BusWidth, CardState, Config, DmaSelect, DriverType, SignalVoltage, TimingMode,
    VddLevel,
};
use crate::dma::DescriptorPool;
use crate::event::{self, CompletionStatus, HostEvent};
use crate::response;
use crate::scatter::SgEntry;
use crate::transfer::{self, DmaPolicy, TransferState};
use crate::tuning::{self, TuningFallback, MAX_RANGE};

/// Errors returned by the host's control operations.
///
/// Command and data protocol errors (CRC, end-bit, index) never surface
/// here — they resolve asynchronously as a [`CompletionStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A bounded poll expired: the command line never freed, the clock
    /// never stabilized, the voltage switch never confirmed, or the DMA
    /// engine never idled.
    Timeout,
    /// The request exceeds what the controller can do (descriptor limits
    /// with no PIO fallback, a missing DMA path).
    NotSupported,
    /// A command is already in flight, or no transaction slot is free.
    ResourceExhausted,
    /// The card left the slot.
    CardRemoved,
    /// Unsupported or inconsistent parameter.
    Invalid,
    /// Tuning failed and the backend propagates rather than degrades.
    Io,
}

/// Current I/O settings of a host instance.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ios {
    /// Card clock actually programmed, if any.
    pub clock: Option<HertzU32>,
    /// Data bus width.
    pub bus_width: BusWidth,
    /// Timing mode.
    pub timing: TimingMode,
    /// Signalling voltage.
    pub signal_voltage: SignalVoltage,
    /// Command-line drive mode.
    pub bus_mode: BusMode,
    /// UHS-I driver strength.
    pub driver_type: DriverType,
    /// Supply rail, `None` while powered down.
    pub vdd: Option<VddLevel>,
    /// Calibrated sampling phase, once tuned.
    pub sample_phase: Option<u8>,
    /// Preset-value operation enabled.
    pub presets_enabled: bool,
}

/// A finished command, handed back exactly once.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The command descriptor, with response and byte count filled in.
    pub command: Command,
    /// Terminal outcome.
    pub status: CompletionStatus,
}

/// Card slot transition reported alongside command progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardChange {
    /// A card was inserted.
    Inserted,
    /// The card was removed.
    Removed,
}

/// What one interrupt produced.
#[derive(Debug)]
pub struct Event {
    /// The in-flight command finished.
    pub completion: Option<Completion>,
    /// The card slot changed.
    pub card: Option<CardChange>,
    /// The controller asked for a re-tune before the next data command.
    pub retune_request: bool,
}

/// In-flight transaction state.
struct Active {
    command: Command,
    state: Option<TransferState>,
    cmd_done: bool,
    data_done: bool,
    wants_transfer_complete: bool,
    await_auto: bool,
    auto_done: bool,
}

/// One SD/MMC host-controller instance.
pub struct Host<B: Backend> {
    backend: B,
    config: Config,
    caps: EnumSet<Capability>,
    pool: DescriptorPool,
    active: Option<Active>,
    ios: Ios,
    dma_active: bool,
    init_stream_pending: bool,
    initialized: bool,
}

impl<B: Backend> Host<B> {
    /// Creates a host around one backend instance.
    ///
    /// Nothing touches the hardware until [`Host::init`].
    pub fn new(backend: B, config: Config) -> Self {
        Host {
            backend,
            config,
            caps: EnumSet::empty(),
            pool: DescriptorPool::new(),
            active: None,
            ios: Ios {
                clock: None,
                bus_width: BusWidth::One,
                timing: TimingMode::Legacy,
                signal_voltage: SignalVoltage::V33,
                bus_mode: BusMode::PushPull,
                driver_type: DriverType::B,
                vdd: None,
                sample_phase: None,
                presets_enabled: false,
            },
            dma_active: false,
            init_stream_pending: false,
            initialized: false,
        }
    }

    /// Brings the controller to a known state and probes capabilities.
    pub fn init(&mut self) -> Result<(), Error> {
        self.caps = self.backend.init()?;
        self.backend.set_event_mask(event::IDLE_EVENTS);
        self.initialized = true;
        info!("{} ready", self.backend.profile().name);
        Ok(())
    }

    /// Quiesces and powers down the controller.
    pub fn deinit(&mut self) {
        if self.active.is_some() {
            let _ = self.abort();
        }
        let _ = self.set_power(None);
        self.backend.deinit();
        self.initialized = false;
    }

    /// Capabilities probed at [`Host::init`].
    pub fn capabilities(&self) -> EnumSet<Capability> {
        self.caps
    }

    /// Current I/O settings.
    pub fn ios(&self) -> &Ios {
        &self.ios
    }

    /// Card slot state.
    pub fn card_detect(&mut self) -> CardState {
        self.backend.card_state()
    }

    /// OCR voltage window assembled from the probed capabilities.
    pub fn ocr_mask(&self) -> u32 {
        let mut ocr = 0;
        if self.caps.contains(Capability::Voltage33) {
            // 3.2-3.3 and 3.3-3.4 V.
            ocr |= 0x0030_0000;
        }
        if self.caps.contains(Capability::Voltage30) {
            // 2.9-3.0 and 3.0-3.1 V.
            ocr |= 0x0006_0000;
        }
        if self.caps.contains(Capability::Voltage18) {
            // Low-voltage range.
            ocr |= 0x0000_0080;
        }
        ocr
    }

    /// Slowest and fastest card clocks the divider chain can produce.
    pub fn clock_limits(&self) -> (HertzU32, HertzU32) {
        let source = self.config.clock_source;
        let max_div = match self.backend.profile().divider {
            crate::clock::DividerStrategy::RoundUp { max } => max,
            crate::clock::DividerStrategy::PowerOfTwo { max } => max,
        };
        (HertzU32::from_raw(source.to_Hz() / max_div), source)
    }

    /// Issues a command.
    ///
    /// Control-only commands and data commands alike complete through
    /// [`Host::handle_interrupt`]; `Ok` here only means the transaction
    /// started. Buffers referenced by the scatter list must stay valid
    /// until the completion (or abort) hands the command back.
    pub fn command(&mut self, command: Command) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::Invalid);
        }
        if self.active.is_some() {
            return Err(Error::ResourceExhausted);
        }

        // Abort-class commands go out while the data lines are busy.
        let busy_response = matches!(command.response, ResponseKind::ShortBusy);
        let check_data = (command.data.is_some() || busy_response) && !command.is_abort();
        self.wait_lines_idle(check_data)?;

        let mut events = event::BASE_COMMAND_EVENTS | event::IDLE_EVENTS;
        let mut state = None;
        let mut use_dma = false;
        if let Some(data) = command.data.clone() {
            let policy = self.dma_policy();
            let (plan, transfer_state) =
                transfer::setup(&mut self.backend, &mut self.pool, &data, policy)?;
            events |= plan.events;
            use_dma = plan.use_dma;
            state = Some(transfer_state);
        } else if busy_response {
            // R1b: the busy phase ends with transfer-complete.
            events |= HostEvent::TransferComplete;
        }

        let frame = CommandFrame::build(&command, use_dma);
        let await_auto =
            frame.auto_stop != AutoStop::None && self.backend.profile().signals_auto_cmd_done;
        let wants_transfer_complete = command.data.is_some() || busy_response;

        self.backend.set_event_mask(events);
        self.backend.clear_transaction_status();

        if self.init_stream_pending {
            // The one synchronous wait hardware requires: the 74-clock
            // initialization window ahead of the first command.
            let us = self.backend.profile().init_stream_us;
            self.backend.platform().delay_us(us);
            self.init_stream_pending = false;
        }

        trace!("issue CMD{} arg={:08x}", command.opcode, command.argument);
        self.dma_active = matches!(state, Some(TransferState::Dma { .. }));
        self.backend.write_command(&frame);
        self.active = Some(Active {
            command,
            state,
            cmd_done: false,
            data_done: false,
            wants_transfer_complete,
            await_auto,
            auto_done: false,
        });
        Ok(())
    }

    /// Cancels the in-flight command, if any.
    ///
    /// Halts DMA, resets command, data, and DMA scopes, and applies the
    /// backend's settle delay; afterwards the controller accepts a fresh
    /// [`Host::command`]. The cancelled command comes back with
    /// [`CompletionStatus::Aborted`].
    pub fn abort(&mut self) -> Result<Option<Completion>, Error> {
        self.backend.stop_dma();
        self.backend
            .reset(ResetScope::Command | ResetScope::Data | ResetScope::Dma)?;
        let settle = self.backend.profile().abort_settle_us;
        self.backend.platform().delay_us(settle);
        self.dma_active = false;
        self.backend.set_event_mask(event::IDLE_EVENTS);
        Ok(self.active.take().map(|active| Completion {
            command: active.command,
            status: CompletionStatus::Aborted,
        }))
    }

    /// Single per-interrupt entry point.
    ///
    /// Reads and clears the pending status, dispatches card-detect and
    /// re-tune events independently of the in-flight command, classifies
    /// errors, steps PIO/DMA data phases, and finalizes the transaction
    /// at most once.
    pub fn handle_interrupt(&mut self) -> Event {
        let events = self.backend.pending_events();
        let mut out = Event {
            completion: None,
            card: None,
            retune_request: false,
        };
        if events.contains(HostEvent::CardInserted) {
            out.card = Some(CardChange::Inserted);
        }
        if events.contains(HostEvent::CardRemoved) {
            out.card = Some(CardChange::Removed);
        }
        if events.contains(HostEvent::RetuneRequest) {
            out.retune_request = true;
        }
        if self.active.is_none() {
            return out;
        }

        if let Some(mut status) = event::classify(events) {
            // A timeout with an empty slot is the card going away, not a
            // protocol failure.
            if status.is_timeout() && !self.backend.card_state().is_present() {
                status = CompletionStatus::CardRemoved;
            }
            self.recover(status);
            out.completion = self.finalize(status);
            return out;
        }

        if events.contains(HostEvent::CommandComplete) {
            self.on_command_complete();
        }
        if events.contains(HostEvent::BufferReadReady)
            || events.contains(HostEvent::BufferWriteReady)
        {
            self.on_buffer_ready();
        }
        if events.contains(HostEvent::DmaBoundary) {
            self.on_dma_boundary();
        }
        if events.contains(HostEvent::AutoCommandDone) {
            self.on_auto_command_done();
        }
        if events.contains(HostEvent::TransferComplete) {
            if let Some(status) = self.on_transfer_complete() {
                self.recover(status);
                out.completion = self.finalize(status);
                return out;
            }
        }

        if self.ready_to_finalize() {
            out.completion = self.finalize(CompletionStatus::Success);
        }
        out
    }

    /// Sequences bus power.
    ///
    /// `None` resets FIFO and DMA, zeroes the external regulators (the
    /// backend keeps a soldered eMMC rail up when so profiled), and idles
    /// the controller. A voltage selects the regulator range, enables bus
    /// power, and arms the initialization stream for the next command.
    pub fn set_power(&mut self, vdd: Option<VddLevel>) -> Result<(), Error> {
        match vdd {
            None => {
                self.backend.stop_dma();
                self.backend.reset(ResetScope::Fifo | ResetScope::Dma)?;
                self.backend.set_power(None);
                self.dma_active = false;
                self.ios.vdd = None;
            }
            Some(level) => {
                let supported = match level {
                    VddLevel::V18 => self.caps.contains(Capability::Voltage18),
                    VddLevel::V30 => self.caps.contains(Capability::Voltage30),
                    VddLevel::V33 => self.caps.contains(Capability::Voltage33),
                };
                if !supported {
                    return Err(Error::Invalid);
                }
                self.backend.set_power(Some(level));
                self.backend.arm_init_stream();
                self.init_stream_pending = true;
                self.ios.vdd = Some(level);
            }
        }
        Ok(())
    }

    /// Programs the card clock.
    ///
    /// Always stop-then-restart: the card clock is gated, the divider
    /// written, the internal clock re-enabled and polled stable, then the
    /// card clock released. Returns the clock actually produced.
    pub fn set_clock(&mut self, target: HertzU32) -> Result<HertzU32, Error> {
        let profile = self.backend.profile();
        let mut effective = target;
        if self.ios.timing.is_ddr() && profile.ddr_prediv {
            // Both clock edges carry data; halve ahead of the divider.
            effective = HertzU32::from_raw(effective.to_Hz() / 2);
        }
        let divided = crate::clock::divide(profile.divider, self.config.clock_source, effective)?;

        self.backend.card_clock(false);
        self.backend.set_clock_divider(divided.divider);
        self.backend.internal_clock(true);
        self.poll_backend(|backend| backend.clock_stable())?;
        self.backend.card_clock(true);

        debug!("clock {} -> divider {}", target.to_Hz(), divided.divider);
        self.ios.clock = Some(divided.actual);
        Ok(divided.actual)
    }

    /// Sets the data bus width.
    pub fn set_bus_width(&mut self, width: BusWidth) -> Result<(), Error> {
        if width == BusWidth::Eight && !self.caps.contains(Capability::BusWidth8) {
            return Err(Error::Invalid);
        }
        self.backend.set_bus_width(width);
        self.ios.bus_width = width;
        Ok(())
    }

    /// Sets the command-line drive mode.
    pub fn set_bus_mode(&mut self, mode: BusMode) -> Result<(), Error> {
        self.backend.set_bus_mode(mode);
        self.ios.bus_mode = mode;
        Ok(())
    }

    /// Selects the timing mode.
    pub fn set_timing(&mut self, timing: TimingMode) -> Result<(), Error> {
        let supported = match timing {
            TimingMode::Legacy | TimingMode::Sdr12 | TimingMode::Sdr25 => true,
            TimingMode::HighSpeed => self.caps.contains(Capability::HighSpeed),
            TimingMode::Sdr50 => self.caps.contains(Capability::Sdr50),
            TimingMode::Sdr104 => self.caps.contains(Capability::Sdr104),
            TimingMode::Ddr50 => self.caps.contains(Capability::Ddr50),
            TimingMode::Hs200 => self.caps.contains(Capability::Hs200),
        };
        if !supported {
            return Err(Error::Invalid);
        }
        if timing.is_ddr() && self.backend.profile().ddr_forces_8bit {
            // Dual-data-rate on this controller pairs with the full bus.
            self.set_bus_width(BusWidth::Eight)?;
        }
        self.backend.set_timing(timing);
        self.ios.timing = timing;
        Ok(())
    }

    /// Switches the signalling voltage with line-state confirmation.
    ///
    /// The card clock is quiesced, the regulator instructed, and DAT[3:0]
    /// polled high within the bounded window. Failure power-cycles the
    /// bus rather than leaving the rail indeterminate.
    pub fn set_signal_voltage(&mut self, voltage: SignalVoltage) -> Result<(), Error> {
        if voltage == SignalVoltage::V18 && !self.caps.contains(Capability::Voltage18) {
            return Err(Error::Invalid);
        }
        self.backend.card_clock(false);
        self.backend.set_signal_voltage(voltage);

        match self.poll_backend(|backend| backend.data_line_level() == 0xf) {
            Ok(()) => {
                self.backend.card_clock(true);
                self.ios.signal_voltage = voltage;
                Ok(())
            }
            Err(_) => {
                warn!("voltage switch did not confirm, cycling power");
                let vdd = self.ios.vdd;
                self.set_power(None)?;
                self.backend.platform().delay_us(10_000);
                self.set_power(vdd)?;
                Err(Error::Timeout)
            }
        }
    }

    /// Sets the UHS-I driver strength.
    pub fn set_driver_type(&mut self, drive: DriverType) -> Result<(), Error> {
        if drive != DriverType::B && !self.caps.contains(Capability::DriverStrength) {
            return Err(Error::Invalid);
        }
        self.backend.set_driver_type(drive);
        self.ios.driver_type = drive;
        Ok(())
    }

    /// Enables or disables preset-value operation.
    pub fn set_preset_enable(&mut self, enable: bool) -> Result<(), Error> {
        if enable && !self.caps.contains(Capability::PresetValues) {
            return Err(Error::Invalid);
        }
        self.backend.set_preset_enable(enable);
        self.ios.presets_enabled = enable;
        Ok(())
    }

    /// Calibrates the data-sampling phase for the current timing mode.
    ///
    /// A no-op outside modes that tune. Sweeps the backend's phase range
    /// with fixed-size tuning-block reads, then selects the final phase
    /// by the backend's policy; total failure follows the backend's
    /// fallback (degrade to the default phase, or [`Error::Io`]).
    pub fn tune(&mut self, opcode: u8) -> Result<(), Error> {
        let profile = self.backend.profile();
        let needs = self.ios.timing.requires_tuning()
            || (self.ios.timing == TimingMode::Sdr50
                && self.caps.contains(Capability::TuningForSdr50));
        if !needs {
            return Ok(());
        }
        if self.active.is_some() {
            return Err(Error::ResourceExhausted);
        }

        let block_len: usize = if self.ios.bus_width == BusWidth::Eight {
            128
        } else {
            64
        };
        let range = profile.tuning_range.min(MAX_RANGE);
        let policy = profile.tuning_policy;
        let fallback = profile.tuning_fallback;
        let default_phase = profile.default_sample_phase;

        let mut map = 0u64;
        for phase in 0..range {
            self.backend.set_sample_phase(phase);
            let mut block = [0u8; 128];
            if self.tuning_read(opcode, &mut block[..block_len])? {
                let reference: &[u8] = if block_len == 128 {
                    &tuning::PATTERN_8BIT
                } else {
                    &tuning::PATTERN_4BIT
                };
                if block[..block_len] == *reference {
                    map |= 1 << phase;
                }
            }
        }

        match tuning::select(map, range, policy) {
            Some(phase) => {
                debug!("tuned sample phase {} (map {:016x})", phase, map);
                self.backend.set_sample_phase(phase);
                self.ios.sample_phase = Some(phase);
                Ok(())
            }
            None => match fallback {
                TuningFallback::DegradeDefaultPhase => {
                    warn!("tuning found no window, degrading to phase {}", default_phase);
                    self.backend.set_sample_phase(default_phase);
                    self.ios.sample_phase = None;
                    Ok(())
                }
                TuningFallback::PropagateError => {
                    self.backend.reset(ResetScope::Command | ResetScope::Data)?;
                    Err(Error::Io)
                }
            },
        }
    }

    /// Issues one tuning-block read and waits for it synchronously.
    ///
    /// Returns whether the read completed successfully; a candidate that
    /// never completes is aborted and counted as a failure.
    fn tuning_read(&mut self, opcode: u8, block: &mut [u8]) -> Result<bool, Error> {
        let block_len = block.len() as u16;
        let mut sg = Vec::new();
        sg.push(SgEntry::from_slice(block)).ok();
        let command = Command::new(opcode, 0, ResponseKind::Short).with_data(DataRequest {
            direction: DataDirection::Read,
            block_size: block_len,
            block_count: 1,
            sg,
            auto_stop: AutoStop::None,
        });

        // Tuning reads always go through the FIFO.
        let selected = self.config.dma;
        self.config.dma = DmaSelect::Pio;
        let issued = self.command(command);
        self.config.dma = selected;
        issued?;

        let profile = self.backend.profile();
        let (iterations, step) = (profile.poll_iterations, profile.poll_step_us);
        for _ in 0..iterations {
            let event = self.handle_interrupt();
            if let Some(completion) = event.completion {
                return Ok(completion.status == CompletionStatus::Success);
            }
            self.backend.platform().delay_us(step);
        }
        let _ = self.abort()?;
        Ok(false)
    }

    /// Bounded busy-wait until the command (and data) lines are free.
    fn wait_lines_idle(&mut self, check_data: bool) -> Result<(), Error> {
        self.poll_backend(|backend| backend.lines_idle(check_data))
    }

    /// Bounded poll of a backend condition, profiled per controller.
    fn poll_backend(&mut self, mut done: impl FnMut(&mut B) -> bool) -> Result<(), Error> {
        let profile = self.backend.profile();
        let (iterations, step) = (profile.poll_iterations, profile.poll_step_us);
        for _ in 0..iterations {
            if done(&mut self.backend) {
                return Ok(());
            }
            self.backend.platform().delay_us(step);
        }
        Err(Error::Timeout)
    }

    fn dma_policy(&self) -> DmaPolicy {
        let profile = self.backend.profile();
        match self.config.dma {
            DmaSelect::Pio => DmaPolicy {
                chained: false,
                single: false,
            },
            DmaSelect::SingleBuffer => DmaPolicy {
                chained: false,
                single: self.caps.contains(Capability::SingleBufferDma)
                    && profile.dma_boundary.is_some(),
            },
            DmaSelect::Auto => DmaPolicy {
                chained: self.caps.contains(Capability::ChainedDma)
                    && profile.max_descriptors > 0,
                single: self.caps.contains(Capability::SingleBufferDma)
                    && profile.dma_boundary.is_some(),
            },
        }
    }

    fn on_command_complete(&mut self) {
        let preshifted = self.backend.profile().long_response_preshifted;
        let backend = &mut self.backend;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        response::capture(
            active.command.response,
            preshifted,
            |index| backend.response_word(index),
            &mut active.command.response_words,
        );
        active.cmd_done = true;
    }

    fn on_buffer_ready(&mut self) {
        let watermark = self.backend.profile().fifo_watermark_words;
        let backend = &mut self.backend;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(TransferState::Pio(cursor)) = active.state.as_mut() else {
            return;
        };
        let Some(data) = active.command.data.as_ref() else {
            return;
        };
        match data.direction {
            DataDirection::Read => transfer::pio_read(backend, &data.sg, cursor, watermark),
            DataDirection::Write => transfer::pio_write(backend, &data.sg, cursor, watermark),
        }
    }

    fn on_dma_boundary(&mut self) {
        let boundary = self.backend.profile().dma_boundary.unwrap_or(0);
        let backend = &mut self.backend;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(TransferState::Dma {
            kind: DmaKind::SingleBuffer,
            last_addr,
            ..
        }) = active.state.as_mut()
        else {
            return;
        };
        if boundary == 0 {
            return;
        }
        // The engine halts at every boundary crossing until the next
        // system address is supplied.
        let next = (*last_addr / boundary + 1) * boundary;
        backend.resume_dma(next);
        *last_addr = next;
    }

    fn on_auto_command_done(&mut self) {
        let backend = &mut self.backend;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.command.auto_response = backend.auto_response_word();
        active.auto_done = true;
    }

    /// Data-phase wrap-up; returns a status when the phase failed late.
    fn on_transfer_complete(&mut self) -> Option<CompletionStatus> {
        let dma_active = self.dma_active;
        if dma_active {
            // Bounded wait for the engine to drain, then disable it.
            if self.poll_backend(|backend| backend.dma_idle()).is_err() {
                return Some(CompletionStatus::Failure);
            }
            self.backend.stop_dma();
            self.dma_active = false;
        }

        let backend = &mut self.backend;
        let Some(active) = self.active.as_mut() else {
            return None;
        };

        // The busy phase can update the final response word.
        if matches!(
            active.command.response,
            ResponseKind::Short | ResponseKind::ShortBusy
        ) {
            active.command.response_words[0] = backend.response_word(0);
        }

        let transferred = match active.state.as_mut() {
            Some(TransferState::Pio(cursor)) => {
                if let Some(data) = active.command.data.as_ref() {
                    if data.direction == DataDirection::Read && !cursor.is_done() {
                        // Completion can beat the last sub-watermark FIFO
                        // chunk; drain it before closing the books.
                        transfer::pio_drain_residue(backend, &data.sg, cursor);
                    }
                }
                cursor.transferred()
            }
            Some(state) => state.planned_total(0),
            None => 0,
        };
        active.command.bytes_transferred = transferred;
        active.data_done = true;
        None
    }

    fn ready_to_finalize(&self) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        active.cmd_done
            && (!active.wants_transfer_complete || active.data_done)
            && (!active.await_auto || active.auto_done)
    }

    /// Stops DMA and applies the one scoped reset an error gets.
    fn recover(&mut self, status: CompletionStatus) {
        if self.dma_active {
            self.backend.stop_dma();
        }
        let mut scope = EnumSet::empty();
        match status {
            CompletionStatus::CommandTimeout
            | CompletionStatus::CommandCrc
            | CompletionStatus::CommandEndBit
            | CompletionStatus::CommandIndex => scope |= ResetScope::Command,
            CompletionStatus::DataTimeout
            | CompletionStatus::DataCrc
            | CompletionStatus::DataEndBit => scope |= ResetScope::Data,
            CompletionStatus::CardRemoved | CompletionStatus::Failure => {
                scope |= ResetScope::Command;
                scope |= ResetScope::Data;
            }
            CompletionStatus::Success | CompletionStatus::Aborted => {}
        }
        if self.dma_active {
            scope |= ResetScope::Dma;
        }
        if !scope.is_empty() {
            if self.backend.reset(scope).is_err() {
                error!("scoped reset did not complete");
            }
        }
    }

    /// Closes the in-flight slot; at most one completion per command.
    fn finalize(&mut self, status: CompletionStatus) -> Option<Completion> {
        self.dma_active = false;
        let active = self.active.take()?;
        self.backend.set_event_mask(event::IDLE_EVENTS);
        if status.is_error() {
            warn!("CMD{} finished with an error", active.command.opcode);
        }
        Some(Completion {
            command: active.command,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dwmshc::{self, DwMshc};
    use crate::backend::sdhci::{bits, regs, Sdhci};
    use crate::platform::mock::{MockPlatform, WINDOW_SIZE};

    const TEST_CAPS: u32 = bits::CAP_ADMA2
        | bits::CAP_SDMA
        | bits::CAP_HIGH_SPEED
        | bits::CAP_8BIT
        | bits::CAP_VDD_33
        | bits::CAP_VDD_18;
    const TEST_CAPS_1: u32 = bits::CAP1_SDR50 | bits::CAP1_SDR104;
    const CARD_PRESENT: u32 = bits::PS_CARD_INSERTED | bits::PS_WRITE_ENABLED;

    /// Registers that clear themselves in hardware: software reset and
    /// the clock-stable handshake.
    fn sdhci_hw(mem: &mut [u8; WINDOW_SIZE], offset: usize, value: u32, _width: usize) {
        if offset == regs::SOFTWARE_RESET {
            mem[offset] = 0;
        }
        if offset == regs::CLOCK_CONTROL && value & u32::from(bits::CC_INT_CLK_ENABLE) != 0 {
            mem[offset] |= bits::CC_INT_CLK_STABLE as u8;
        }
    }

    fn host_with(dma: DmaSelect) -> Host<Sdhci<MockPlatform>> {
        let mut platform = MockPlatform::new();
        platform.w1c = &[regs::INT_STATUS];
        platform.fifo_offset = Some(regs::BUFFER_PORT);
        platform.on_write = Some(sdhci_hw);
        platform.set32(regs::CAPABILITIES, TEST_CAPS);
        platform.set32(regs::CAPABILITIES_1, TEST_CAPS_1);
        platform.set32(regs::PRESENT_STATE, CARD_PRESENT);
        let mut host = Host::new(Sdhci::new(platform), Config::default().with_dma(dma));
        host.init().unwrap();
        host
    }

    fn read_request(
        block_size: u16,
        block_count: u16,
        buf: &mut [u8],
        auto_stop: AutoStop,
    ) -> DataRequest {
        let mut sg = Vec::new();
        sg.push(SgEntry::from_slice(buf)).unwrap();
        DataRequest {
            direction: DataDirection::Read,
            block_size,
            block_count,
            sg,
            auto_stop,
        }
    }

    #[test]
    fn no_response_command_never_reads_response_registers() {
        let mut host = host_with(DmaSelect::Pio);
        host.backend.platform().response_window = Some((regs::RESPONSE, regs::RESPONSE + 0x10));

        host.command(Command::new(0, 0, ResponseKind::None)).unwrap();
        host.backend
            .platform()
            .raise(regs::INT_STATUS, bits::INT_CMD_COMPLETE);
        let event = host.handle_interrupt();

        let completion = event.completion.unwrap();
        assert_eq!(completion.status, CompletionStatus::Success);
        assert_eq!(host.backend.platform().response_reads, 0);
    }

    #[test]
    fn second_command_while_in_flight_is_resource_exhausted() {
        let mut host = host_with(DmaSelect::Pio);
        host.command(Command::new(0, 0, ResponseKind::None)).unwrap();
        let err = host.command(Command::new(0, 0, ResponseKind::None)).unwrap_err();
        assert_eq!(err, Error::ResourceExhausted);
    }

    #[test]
    fn pio_read_moves_every_byte_through_the_fifo() {
        let mut host = host_with(DmaSelect::Pio);
        let mut buf = [0u8; 512];
        let command = Command::new(17, 0, ResponseKind::Short)
            .with_data(read_request(512, 1, &mut buf, AutoStop::None));
        host.command(command).unwrap();

        for word in 0..128u32 {
            host.backend.platform().fifo_rx.push_back(word).unwrap();
        }
        host.backend.platform().set32(regs::RESPONSE, 0x900);
        host.backend.platform().raise(
            regs::INT_STATUS,
            bits::INT_CMD_COMPLETE | bits::INT_BUFFER_READ_READY,
        );
        assert!(host.handle_interrupt().completion.is_none());

        host.backend
            .platform()
            .raise(regs::INT_STATUS, bits::INT_TRANSFER_COMPLETE);
        let completion = host.handle_interrupt().completion.unwrap();

        assert_eq!(completion.status, CompletionStatus::Success);
        assert_eq!(completion.command.bytes_transferred, 512);
        assert_eq!(buf[0..4], [0, 0, 0, 0]);
        assert_eq!(buf[4..8], [1, 0, 0, 0]);
        assert_eq!(buf[508..512], [127, 0, 0, 0]);
    }

    #[test]
    fn pio_write_counts_bytes_into_the_fifo() {
        let mut host = host_with(DmaSelect::Pio);
        let mut buf = [0u8; 512];
        for (index, byte) in buf.iter_mut().enumerate() {
            *byte = index as u8;
        }
        let mut sg = Vec::new();
        sg.push(SgEntry::from_slice(&mut buf)).unwrap();
        let command = Command::new(24, 0, ResponseKind::Short).with_data(DataRequest {
            direction: DataDirection::Write,
            block_size: 512,
            block_count: 1,
            sg,
            auto_stop: AutoStop::None,
        });
        host.command(command).unwrap();

        host.backend.platform().raise(
            regs::INT_STATUS,
            bits::INT_CMD_COMPLETE | bits::INT_BUFFER_WRITE_READY,
        );
        assert!(host.handle_interrupt().completion.is_none());
        assert_eq!(host.backend.platform().fifo_tx.len(), 128);
        assert_eq!(host.backend.platform().fifo_tx[0], 0x0302_0100);

        host.backend
            .platform()
            .raise(regs::INT_STATUS, bits::INT_TRANSFER_COMPLETE);
        let completion = host.handle_interrupt().completion.unwrap();
        assert_eq!(completion.status, CompletionStatus::Success);
        assert_eq!(completion.command.bytes_transferred, 512);
    }

    #[test]
    fn read_completion_drains_sub_watermark_residue() {
        let mut host = host_with(DmaSelect::Pio);
        let mut buf = [0u8; 64];
        let command = Command::new(17, 0, ResponseKind::Short)
            .with_data(read_request(64, 1, &mut buf, AutoStop::None));
        host.command(command).unwrap();

        // Transfer-complete arrives while the whole payload still sits in
        // the FIFO below the watermark.
        for word in 0..16u32 {
            host.backend.platform().fifo_rx.push_back(0x0101_0101 * word).unwrap();
        }
        host.backend
            .platform()
            .raise(regs::INT_STATUS, bits::INT_TRANSFER_COMPLETE | bits::INT_CMD_COMPLETE);
        let completion = host.handle_interrupt().completion.unwrap();

        assert_eq!(completion.status, CompletionStatus::Success);
        assert_eq!(completion.command.bytes_transferred, 64);
        assert_eq!(buf[4..8], [1, 1, 1, 1]);
    }

    #[test]
    fn chained_dma_accounts_descriptor_totals() {
        let mut host = host_with(DmaSelect::Auto);
        let mut buf = [0u8; 2048];
        let command = Command::new(18, 0, ResponseKind::Short)
            .with_data(read_request(512, 4, &mut buf, AutoStop::Cmd12));
        host.command(command).unwrap();

        // The chain base landed in the ADMA address register.
        assert_ne!(host.backend.platform().get32(regs::ADMA_ADDRESS), 0);

        host.backend.platform().raise(
            regs::INT_STATUS,
            bits::INT_CMD_COMPLETE | bits::INT_TRANSFER_COMPLETE,
        );
        let completion = host.handle_interrupt().completion.unwrap();
        assert_eq!(completion.status, CompletionStatus::Success);
        assert_eq!(completion.command.bytes_transferred, 2048);
    }

    #[test]
    fn single_buffer_dma_restarts_at_the_boundary() {
        let mut host = host_with(DmaSelect::SingleBuffer);
        let mut buf = [0u8; 512];
        let base = buf.as_ptr() as usize as u32;
        let command = Command::new(17, 0, ResponseKind::Short)
            .with_data(read_request(512, 1, &mut buf, AutoStop::None));
        host.command(command).unwrap();
        assert_eq!(host.backend.platform().get32(regs::SDMA_ADDRESS), base);

        host.backend
            .platform()
            .raise(regs::INT_STATUS, bits::INT_DMA);
        assert!(host.handle_interrupt().completion.is_none());
        let next = (base / 4096 + 1) * 4096;
        assert_eq!(host.backend.platform().get32(regs::SDMA_ADDRESS), next);

        host.backend.platform().raise(
            regs::INT_STATUS,
            bits::INT_CMD_COMPLETE | bits::INT_TRANSFER_COMPLETE,
        );
        let completion = host.handle_interrupt().completion.unwrap();
        assert_eq!(completion.command.bytes_transferred, 512);
    }

    #[test]
    fn physical_fragment_without_dma_is_a_hard_error() {
        let mut host = host_with(DmaSelect::Pio);
        let mut sg = Vec::new();
        sg.push(SgEntry::physical(0x8000_0000, 512)).unwrap();
        let command = Command::new(17, 0, ResponseKind::Short).with_data(DataRequest {
            direction: DataDirection::Read,
            block_size: 512,
            block_count: 1,
            sg,
            auto_stop: AutoStop::None,
        });
        assert_eq!(host.command(command).unwrap_err(), Error::NotSupported);
    }

    #[test]
    fn scatter_total_mismatch_is_invalid() {
        let mut host = host_with(DmaSelect::Pio);
        let mut buf = [0u8; 500];
        let command = Command::new(17, 0, ResponseKind::Short)
            .with_data(read_request(512, 1, &mut buf, AutoStop::None));
        assert_eq!(host.command(command).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn same_frequency_writes_the_same_clock_pattern() {
        let mut host = host_with(DmaSelect::Pio);
        host.set_clock(HertzU32::MHz(25)).unwrap();

        host.backend.platform().write_log.clear();
        host.set_clock(HertzU32::MHz(25)).unwrap();
        let first: Vec<(usize, u32), 64> = host
            .backend
            .platform()
            .write_log
            .iter()
            .filter(|&&(offset, _)| offset == regs::CLOCK_CONTROL)
            .copied()
            .collect();

        host.backend.platform().write_log.clear();
        host.set_clock(HertzU32::MHz(25)).unwrap();
        let second: Vec<(usize, u32), 64> = host
            .backend
            .platform()
            .write_log
            .iter()
            .filter(|&&(offset, _)| offset == regs::CLOCK_CONTROL)
            .copied()
            .collect();

        assert_eq!(first, second);
        assert_eq!(host.ios().clock, Some(HertzU32::MHz(25)));
    }

    #[test]
    fn bus_width_reflects_in_host_control() {
        let mut host = host_with(DmaSelect::Pio);
        host.set_bus_width(BusWidth::Four).unwrap();
        assert_ne!(
            host.backend.platform().mem[regs::HOST_CONTROL] & bits::HC_BUS_WIDTH_4,
            0
        );
        host.set_bus_width(BusWidth::Eight).unwrap();
        assert_ne!(
            host.backend.platform().mem[regs::HOST_CONTROL] & bits::HC_BUS_WIDTH_8,
            0
        );
        host.set_bus_width(BusWidth::One).unwrap();
        assert_eq!(
            host.backend.platform().mem[regs::HOST_CONTROL]
                & (bits::HC_BUS_WIDTH_4 | bits::HC_BUS_WIDTH_8),
            0
        );
    }

    #[test]
    fn error_bits_classify_once_with_data_timeout_priority() {
        let mut host = host_with(DmaSelect::Pio);
        let mut buf = [0u8; 512];
        let command = Command::new(17, 0, ResponseKind::Short)
            .with_data(read_request(512, 1, &mut buf, AutoStop::None));
        host.command(command).unwrap();
        host.backend.platform().write_log.clear();

        host.backend.platform().raise(
            regs::INT_STATUS,
            bits::INT_ERROR | bits::INT_DATA_TIMEOUT | bits::INT_DATA_CRC,
        );
        let completion = host.handle_interrupt().completion.unwrap();
        assert_eq!(completion.status, CompletionStatus::DataTimeout);

        let resets = host
            .backend
            .platform()
            .write_log
            .iter()
            .filter(|&&(offset, _)| offset == regs::SOFTWARE_RESET)
            .count();
        assert_eq!(resets, 1);

        // The slot is free again.
        assert!(host.handle_interrupt().completion.is_none());
    }

    #[test]
    fn abort_mid_dma_leaves_a_usable_controller() {
        let mut host = host_with(DmaSelect::Auto);
        let mut buf = [0u8; 2048];
        let command = Command::new(18, 0, ResponseKind::Short)
            .with_data(read_request(512, 4, &mut buf, AutoStop::Cmd12));
        host.command(command).unwrap();

        let aborted = host.abort().unwrap().unwrap();
        assert_eq!(aborted.status, CompletionStatus::Aborted);
        assert!(host.backend.platform().delayed_us >= 500);

        // A fresh command issues and completes normally.
        host.command(Command::new(0, 0, ResponseKind::None)).unwrap();
        host.backend
            .platform()
            .raise(regs::INT_STATUS, bits::INT_CMD_COMPLETE);
        let completion = host.handle_interrupt().completion.unwrap();
        assert_eq!(completion.status, CompletionStatus::Success);
    }

    #[test]
    fn timeout_with_empty_slot_reclassifies_as_card_removed() {
        let mut host = host_with(DmaSelect::Pio);
        host.command(Command::new(17, 0, ResponseKind::Short)).unwrap();

        host.backend.platform().set32(regs::PRESENT_STATE, 0);
        host.backend
            .platform()
            .raise(regs::INT_STATUS, bits::INT_ERROR | bits::INT_CMD_TIMEOUT);
        let completion = host.handle_interrupt().completion.unwrap();
        assert_eq!(completion.status, CompletionStatus::CardRemoved);
    }

    #[test]
    fn card_events_flow_independently_of_commands() {
        let mut host = host_with(DmaSelect::Pio);
        host.backend
            .platform()
            .raise(regs::INT_STATUS, bits::INT_CARD_REMOVED);
        let event = host.handle_interrupt();
        assert_eq!(event.card, Some(CardChange::Removed));
        assert!(event.completion.is_none());
    }

    #[test]
    fn long_response_is_reassembled_into_the_command() {
        let mut host = host_with(DmaSelect::Pio);
        host.command(Command::new(2, 0, ResponseKind::Long)).unwrap();

        host.backend.platform().set32(regs::RESPONSE, 0xddee_ff00);
        host.backend.platform().set32(regs::RESPONSE + 4, 0xaabb_ccdd);
        host.backend.platform().set32(regs::RESPONSE + 8, 0x7788_99aa);
        host.backend.platform().set32(regs::RESPONSE + 12, 0x4455_6677);
        host.backend
            .platform()
            .raise(regs::INT_STATUS, bits::INT_CMD_COMPLETE);
        let completion = host.handle_interrupt().completion.unwrap();

        assert_eq!(
            completion.command.response_words[0],
            0x4455_6677 << 8 | 0x7788_99aa >> 24
        );
    }

    #[test]
    fn ocr_mask_follows_the_voltage_capabilities() {
        let host = host_with(DmaSelect::Pio);
        let ocr = host.ocr_mask();
        assert_ne!(ocr & 0x0030_0000, 0);
        assert_ne!(ocr & 0x0000_0080, 0);
        assert_eq!(ocr & 0x0006_0000, 0);

        let (min, max) = host.clock_limits();
        assert_eq!(max, HertzU32::MHz(200));
        assert!(min < HertzU32::kHz(400));
    }

    #[test]
    fn voltage_switch_confirms_on_the_data_lines() {
        let mut host = host_with(DmaSelect::Pio);
        host.backend
            .platform()
            .set32(regs::PRESENT_STATE, CARD_PRESENT | 0xf << 20);
        host.set_signal_voltage(SignalVoltage::V18).unwrap();
        assert_ne!(
            host.backend.platform().get32(regs::HOST_CONTROL2) & u32::from(bits::HC2_SIGNALING_18),
            0
        );
        assert_eq!(host.ios().signal_voltage, SignalVoltage::V18);
    }

    #[test]
    fn unconfirmed_voltage_switch_cycles_power() {
        let mut host = host_with(DmaSelect::Pio);
        host.set_power(Some(VddLevel::V33)).unwrap();
        // DAT[3:0] never settle high.
        let err = host.set_signal_voltage(SignalVoltage::V18).unwrap_err();
        assert_eq!(err, Error::Timeout);

        // Power was cycled back on rather than left indeterminate.
        let power = host.backend.platform().mem[regs::POWER_CONTROL];
        assert_ne!(power & 0x1, 0);
    }

    #[test]
    fn power_up_arms_the_init_stream_wait() {
        let mut host = host_with(DmaSelect::Pio);
        host.set_power(Some(VddLevel::V33)).unwrap();
        let before = host.backend.platform().delayed_us;
        host.command(Command::new(0, 0, ResponseKind::None)).unwrap();
        assert!(host.backend.platform().delayed_us >= before + 1000);

        // The wait applies to the first command only.
        host.abort().unwrap();
        let before = host.backend.platform().delayed_us;
        host.command(Command::new(0, 0, ResponseKind::None)).unwrap();
        assert!(host.backend.platform().delayed_us < before + 1000);
    }

    #[test]
    fn tune_is_a_no_op_outside_tuning_modes() {
        let mut host = host_with(DmaSelect::Pio);
        host.backend.platform().write_log.clear();
        host.tune(19).unwrap();
        assert!(host.backend.platform().write_log.is_empty());
    }

    #[test]
    fn failed_tuning_sweep_propagates_io_error() {
        let mut host = host_with(DmaSelect::Pio);
        host.set_timing(TimingMode::Sdr104).unwrap();
        // No tuning block ever arrives; every candidate fails and the
        // sdhci profile propagates.
        assert_eq!(host.tune(19).unwrap_err(), Error::Io);
        assert!(host.handle_interrupt().completion.is_none());
    }

    fn dw_hw(mem: &mut [u8; WINDOW_SIZE], offset: usize, _value: u32, _width: usize) {
        // Command-start and reset bits self-clear.
        if offset == dwmshc::regs::CMD {
            mem[offset + 3] &= 0x7f;
        }
        if offset == dwmshc::regs::CTRL {
            mem[offset] &= !0x07;
        }
    }

    #[test]
    fn failed_tuning_sweep_degrades_on_dw_mshc() {
        let mut platform = MockPlatform::new();
        platform.w1c = &[dwmshc::regs::RINTSTS];
        platform.fifo_offset = Some(dwmshc::regs::FIFO);
        platform.on_write = Some(dw_hw);
        // Active-low detect: card present.
        platform.set32(dwmshc::regs::CDETECT, 0);
        let mut host = Host::new(DwMshc::new(platform), Config::default());
        host.init().unwrap();
        host.set_timing(TimingMode::Sdr104).unwrap();

        host.tune(19).unwrap();
        assert_eq!(host.ios().sample_phase, None);
    }
}
