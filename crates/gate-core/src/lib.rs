//! Core abstractions for querygate
//!
//! Types, the policy snapshot, the error taxonomy and the driver trait shared
//! by the SQL gatekeeping crate, the drivers and the gateway itself.

pub mod error;
pub mod policy;
pub mod traits;
pub mod types;

pub use error::{DatabaseErrorKind, GateError, GateResult, ViolationKind};
pub use policy::PolicySnapshot;
pub use traits::DatabaseDriver;
pub use types::*;
