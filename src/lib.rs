//! # Multi-backend SD/MMC host-controller engine
//!
//! ## Overview
//!
//! One command/data engine driving four SD/MMC host-controller families
//! through a common register-level adapter trait:
//!
//! - generic SDHC-standard controllers ([`backend::sdhci`])
//! - Synopsys DesignWare mobile-storage hosts ([`backend::dwmshc`])
//! - NXP uSDHC ([`backend::usdhc`])
//! - TI OMAP MMCHS ([`backend::mmchs`])
//!
//! The engine owns command issuance, response capture, PIO and DMA data
//! transfer with descriptor-chain construction, interrupt-driven completion
//! with error classification and recovery, UHS sample-point tuning, and
//! power/clock/bus-width/timing/voltage sequencing. Card-level protocol
//! (CID/CSD parsing, partitioning, filesystems) stays with the caller.
//!
//! ## Usage
//!
//! A platform provides register access, delays, and address translation by
//! implementing [`platform::Platform`]; a [`host::Host`] is then built
//! around one backend instance:
//!
//! ```rust, no_run, ignore
//! use sdmmc_hal::{backend::sdhci::Sdhci, config::Config, host::Host};
//!
//! let backend = Sdhci::new(window);
//! let mut host = Host::new(backend, Config::default());
//! host.init()?;
//! ```
//!
//! Commands complete asynchronously: the platform calls
//! [`host::Host::handle_interrupt`] from its interrupt dispatch context and
//! receives at most one [`host::Completion`] per issued command.
//!
//! ## Feature Flags
#![doc = document_features::document_features!()]
#![deny(missing_docs, rust_2018_idioms)]
#![no_std]

// MUST be the first module
mod fmt;

pub mod backend;
pub mod clock;
pub mod command;
pub mod config;
pub mod dma;
pub mod event;
pub mod host;
pub mod platform;
pub mod scatter;
pub mod tuning;

mod response;
mod transfer;
