//! Connection and flow-handler types shared by the stack, the registry and
//! listeners.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream.
pub trait AsyncConn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncConn for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// An accepted or dialed connection. Dropping it closes it.
pub type Conn = Box<dyn AsyncConn>;

/// Serves one accepted flow.
pub type FlowHandler = Arc<dyn Fn(Conn) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`FlowHandler`].
pub fn flow_handler<F, Fut>(f: F) -> FlowHandler
where
    F: Fn(Conn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |conn| Box::pin(f(conn)))
}
