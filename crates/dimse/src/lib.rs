//! DIMSE (DICOM Message Service Element) implementation.
//!
//! This crate provides both Service Class Provider (SCP) and Service Class
//! User (SCU) implementations for DICOM networking.
//!
//! # Features
//! - Inbound DIMSE services (SCP): C-ECHO, C-STORE, C-FIND, C-GET, C-MOVE
//! - Outbound DIMSE services (SCU): C-ECHO, C-STORE, used by the proxy's
//!   dispatch path to forward anonymized instances to downstream nodes.

pub mod config;
pub mod error;
pub mod scp;
pub mod scu;
pub mod types;

pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use scp::{AssociationContext, DimseHandlers, DimseScp};
pub use scu::DimseScu;
pub use types::{status, DimseCommand, Priority, QueryLevel};

/// Default DICOM port.
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
