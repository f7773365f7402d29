//! duet-daemon library: native relay, WebSocket link and session driver.
//!
//! A thin library layer under the `duet` binary so integration tests can
//! reach the same components.

pub mod config;
pub mod connection;
pub mod driver;
pub mod media;
pub mod relay;
pub mod signal;
pub mod stories;
pub mod ws_link;

pub use config::{ClientConfig, ConfigError};
pub use driver::{Command, CommandError, Driver};
pub use media::VirtualCamera;
pub use relay::RelayServer;
pub use signal::{MAX_FRAME_SIZE, RejectReason, SignalFrame};
pub use stories::DirStoryLoader;
pub use ws_link::{WsLink, WsSignaling};
