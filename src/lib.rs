//! Client library for the Respoke cloud signaling service.
//!
//! Endpoints authenticated to the service discover one another, exchange
//! session descriptions and ICE candidates over a single duplex session,
//! and open audio, video, screen-share, or data-channel calls. This crate
//! is the client half; the service delivers signals by identity.

pub mod calls;
pub mod client;
pub mod http;
pub mod signaling;
pub mod transport;
pub mod types;

pub use calls::state::{CallEvent, CallFsm, CallStateName};
pub use calls::{Call, CallParams};
pub use client::{Client, ClientError};
pub use signaling::{AuthParams, ChannelConfig, SignalingChannel};
pub use types::presence::Presence;
pub use types::signal::{SignalTarget, SignalingMessage};
