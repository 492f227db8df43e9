//! reeprom-core - Adapter contract and EEPROM transaction engine
//!
//! This crate provides the hardware-independent half of reeprom: the
//! [`I2cAdapter`](adapter::I2cAdapter) capability contract that every
//! USB-to-I2C bridge implementation satisfies, chip descriptors for I2C
//! EEPROM devices, and the transaction engine that turns logical byte-range
//! operations into correctly chunked and correctly timed bus transactions.
//!
//! # Example
//!
//! ```ignore
//! use reeprom_core::chip::ChipRegistry;
//! use reeprom_core::engine::{Engine, EngineOptions};
//!
//! let registry = ChipRegistry::builtin();
//! let chip = registry.get("24c256")?.clone();
//! let mut engine = Engine::new(adapter, chip, device_addr, EngineOptions::default())?;
//! let data = engine.read(0, 128)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod adapter;
pub mod addr;
pub mod chip;
pub mod engine;
pub mod error;
pub mod wait;

pub use addr::BusAddress;
pub use error::{Error, Result};
