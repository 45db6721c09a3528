//! # truenas-ddp
//!
//! Protocol engine for the TrueNAS websocket API: a DDP-style JSON protocol
//! with method calls, subscriptions and pushed collection updates.
//!
//! - **Connection**: [`Connection`] performs the handshake and login, then
//!   exposes [`invoke`](Connection::invoke),
//!   [`subscribe`](Connection::subscribe) and
//!   [`unsubscribe`](Connection::unsubscribe)
//! - **Dispatch**: a single background task owns the socket and every
//!   pending-call and subscription table
//! - **Wire format**: [`message`] encodes outbound and decodes inbound frames
//! - **Seam**: [`MethodInvoker`] lets higher layers run against fakes

#![deny(unsafe_code)]

pub mod connection;
mod dispatch;
pub mod invoker;
pub mod message;
mod registry;
pub mod state;
pub mod transport;

pub use connection::{ConnectOptions, Connection};
pub use invoker::MethodInvoker;
pub use message::{PushEvent, PushKind};
pub use registry::SubscriptionQueue;
pub use state::ConnectionState;
