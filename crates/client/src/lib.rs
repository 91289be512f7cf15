//! Client for remote-controlling cloud Android instances: a WebRTC session
//! with a binary control channel, screenshot requests over signaling, and a
//! local TCP tunnel to the instance's ADB endpoint.

pub mod adb;
pub mod api;
pub mod config;
pub mod correlator;
pub mod error;
pub mod input;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod tunnel;

pub use error::{Error, Result};
pub use session::{
    Screenshot, Session, SessionOptions, SessionState, create_instance_client,
    create_instance_client_with,
};
pub use tunnel::{ProxyHandle, TunnelOptions, start_tcp_proxy};
