#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("storlets only works on linux or android");

#[macro_use] extern crate serde;

pub mod client;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod factory;
pub mod fdio;
pub mod files;
pub mod invocation;
pub mod launcher;
pub mod logging;
pub mod runtime;
pub mod sbus;
pub mod server;

pub use crate::{
    client::SBusClient,
    config::GatewayConfig,
    daemon::{Storlet, StorletDaemon},
    factory::DaemonFactory,
    invocation::{StorletInvocationProtocol, StorletRequest, StorletResponse},
    runtime::{RunTimeSandbox, SandboxRestarter},
    sbus::SBus,
};
pub use storlets_protocol as protocol;
