//! Core message model and collaborator contracts.
//!
//! Provides the message envelope, the injectable clock, delivery outcome
//! events and the traits broker adapters implement. The delivery crate and
//! every transport depend on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;
pub mod transport;

pub use error::{TransportError, TransportResult};
pub use events::{
    AttemptContext, DeliveryEvent, EventHandler, MulticastEventHandler, NoOpEventHandler,
};
pub use models::{Dispatch, Message, RequestId, Topic};
pub use time::{Clock, RealClock, TestClock};
pub use transport::{ConnectivityProbe, ListenerContainer, Transport};
