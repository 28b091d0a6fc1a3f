//! vnet node library.
//!
//! An embeddable node on a private virtual network. A [`Server`] starts its
//! subsystems on first use, lets the application listen on and dial over the
//! overlay, dispatches inbound flows to registered [`Listener`]s, and exposes
//! an administrative local API in-process and, on request, on loopback
//! alongside a SOCKS5 proxy.
//!
//! The packet engine, user-space stack and control-plane backend are supplied
//! through [`Subsystems`]; [`sim`] provides an in-process set.

pub mod backend;
pub mod config;
pub mod conn;
pub mod dialer;
pub mod error;
pub mod funnel;
pub mod listener;
pub mod localapi;
pub mod logpipe;
pub mod loopback;
pub mod registry;
mod rollback;
pub mod server;
pub mod sim;
pub mod socks5;
pub mod store;
pub mod subsystems;
pub mod tls;

pub use backend::{Backend, BackendState, ServeConfig, Status};
pub use config::ServerConfig;
pub use conn::{flow_handler, Conn, FlowHandler};
pub use error::Error;
pub use funnel::FunnelMode;
pub use listener::{Listener, ListenerAddr};
pub use localapi::LocalClient;
pub use loopback::LoopbackInfo;
pub use registry::{FallbackDecision, FallbackRegistration, ListenKey};
pub use server::Server;
pub use store::{FileStore, MemStore, StateStore};
pub use subsystems::Subsystems;
pub use tls::{TlsConn, TlsListener};
