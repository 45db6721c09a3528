//! # truenas-core
//!
//! Foundation types shared by every crate of the TrueNAS client:
//!
//! - **Errors**: [`ClientError`] covering handshake, authentication, remote
//!   method, connection closure, protocol and precondition failures
//! - **Branded IDs**: [`CorrelationId`] and [`SessionId`] newtypes
//! - **Credentials**: [`Credentials`], exactly one credential kind per login
//! - **Field values**: [`FieldValue`] / [`FieldMap`], the tagged union every
//!   server payload is decoded into at the protocol boundary
//! - **Logging**: [`logging::init_subscriber`]

#![deny(unsafe_code)]

pub mod credentials;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod value;

pub use credentials::Credentials;
pub use errors::{ClientError, Result};
pub use ids::{CorrelationId, JobId, SessionId};
pub use value::{FieldMap, FieldValue};
