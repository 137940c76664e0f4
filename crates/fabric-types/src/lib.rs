//! # Fabric Types Crate
//!
//! Identifiers, discovery records and management-request types shared by the
//! routing engine (`sm-01-routing`), the sweep engine (`sm-02-sweep`) and any
//! transport adapter.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: every type that crosses a crate boundary lives here.
//! - **Wire-agnostic**: requests describe *what* to program, never how it is
//!   encoded on the management transport.
//! - **Handles, not references**: topology links are expressed as GUID/port
//!   pairs so records stay valid across rediscovery.

pub mod entities;
pub mod errors;
pub mod mad;

pub use entities::*;
pub use errors::*;
pub use mad::*;
