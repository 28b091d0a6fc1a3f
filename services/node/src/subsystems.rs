//! Contracts of the subsystems the server owns, and the factory that builds
//! them.
//!
//! The server never names a concrete engine, stack or backend. An embedder
//! hands it a [`Subsystems`] implementation; tests and the demo binary use
//! [`crate::sim::SimSubsystems`].

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use vnet_tlsdial::TrustMonitor;

use crate::backend::Backend;
use crate::conn::{Conn, FlowHandler};
use crate::store::StateStore;

// ============================================================================
// Flow resolution
// ============================================================================

/// What the stack should do with a new inbound flow.
pub enum FlowDecision {
    /// Accept the flow and hand it to this handler.
    Deliver(FlowHandler),
    /// Accept the flow and drop it.
    Drop,
    /// Not handled here; let the stack forward it.
    Forward,
}

impl FlowDecision {
    /// Whether the stack should terminate the flow locally.
    pub fn intercepts(&self) -> bool {
        !matches!(self, FlowDecision::Forward)
    }
}

impl fmt::Debug for FlowDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowDecision::Deliver(_) => f.write_str("Deliver"),
            FlowDecision::Drop => f.write_str("Drop"),
            FlowDecision::Forward => f.write_str("Forward"),
        }
    }
}

/// Decides the fate of flows arriving on the overlay interface.
///
/// Installed into the stack at construction; called once per new flow.
pub trait FlowResolver: Send + Sync {
    fn resolve_tcp(&self, src: SocketAddr, dst: SocketAddr) -> FlowDecision;
    fn resolve_udp(&self, src: SocketAddr, dst: SocketAddr) -> FlowDecision;
}

/// Decides the fate of flows arriving over the public ingress path.
pub trait FunnelResolver: Send + Sync {
    /// Handler for a funnel flow from `src` to `dst_port`, if one is open.
    fn resolve_funnel_tcp(&self, src: SocketAddr, dst_port: u16) -> Option<FlowHandler>;
}

// ============================================================================
// Subsystems
// ============================================================================

/// Watches the host's network interfaces.
#[async_trait]
pub trait NetMonitor: Send + Sync {
    async fn close(&self);
}

/// Packet-forwarding engine and virtual interface.
#[async_trait]
pub trait PacketEngine: Send + Sync {
    /// Whether `ip` belongs to a peer in the current network map.
    fn is_peer(&self, ip: IpAddr) -> bool;

    /// UDP port the engine listens on.
    fn listen_port(&self) -> u16;

    async fn close(&self);
}

/// User-space TCP/IP stack.
#[async_trait]
pub trait NetStack: Send + Sync {
    async fn start(&self, backend: Arc<dyn Backend>) -> anyhow::Result<()>;

    /// Open a TCP connection to a peer over the overlay.
    async fn dial_tcp(&self, dst: SocketAddr) -> io::Result<Conn>;

    async fn close(&self);
}

pub struct EngineConfig {
    /// 0 lets the engine pick.
    pub listen_port: u16,
    pub net_monitor: Arc<dyn NetMonitor>,
}

pub struct BackendParams {
    pub state_dir: PathBuf,
    pub store: Arc<dyn StateStore>,
    pub engine: Arc<dyn PacketEngine>,
    pub ephemeral: bool,
    pub log_id: Option<String>,
    pub funnel: Arc<dyn FunnelResolver>,
    /// Verification record for the backend's control connections.
    pub trust: Arc<TrustMonitor>,
}

/// Builds the subsystems a server owns. Each method is called at most once
/// per server, in declaration order.
#[async_trait]
pub trait Subsystems: Send + Sync + 'static {
    async fn net_monitor(&self) -> anyhow::Result<Arc<dyn NetMonitor>>;

    async fn packet_engine(&self, config: EngineConfig) -> anyhow::Result<Arc<dyn PacketEngine>>;

    async fn net_stack(
        &self,
        engine: Arc<dyn PacketEngine>,
        resolver: Arc<dyn FlowResolver>,
    ) -> anyhow::Result<Arc<dyn NetStack>>;

    async fn backend(&self, params: BackendParams) -> anyhow::Result<Arc<dyn Backend>>;
}
