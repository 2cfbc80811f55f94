//! Raybar drives an xray-core engine on macOS: it turns a node link and
//! user settings into an engine config, runs the engine, and points the
//! system proxy at it for as long as the session lasts.

pub mod builder;
pub mod config;
pub mod document;
pub mod error;
pub mod link;
pub mod logging;
pub mod session;
pub mod settings;
pub mod supervisor;
pub mod system_proxy;

mod cli;

pub use builder::{build, build_json};
pub use config::{ProxySessionConfig, RoutingRule};
pub use error::{BuildError, LinkError, SessionError, SettingsError, SpawnError, Stage};
pub use link::{decode_subscription, parse, OutboundNode};
pub use session::{Session, SessionEvent, SessionStatus, StartRequest, StopMode};
pub use settings::{AppPaths, AppSettings};
pub use supervisor::{Engine, ProcessSupervisor, SupervisorState};
pub use system_proxy::{SystemProxyController, SystemProxySnapshot};

/// Entry point of the `raybar` binary.
pub fn run() -> anyhow::Result<()> {
    cli::run()
}
