use axum::http::{header, Method, Request, StatusCode};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::memnet::MemDialer;
use super::{LOCAL_API_HOST, LOGIN_INTERACTIVE_PATH, SERVE_CONFIG_PATH, STATUS_PATH};
use crate::backend::{ServeConfig, Status};
use crate::error::Error;

/// Client for the administrative API over the in-process transport.
#[derive(Clone)]
pub struct LocalClient {
    dialer: MemDialer,
}

impl LocalClient {
    pub(crate) fn new(dialer: MemDialer) -> Self {
        Self { dialer }
    }

    pub async fn status(&self) -> Result<Status, Error> {
        self.get_json(STATUS_PATH).await
    }

    pub async fn serve_config(&self) -> Result<ServeConfig, Error> {
        self.get_json(SERVE_CONFIG_PATH).await
    }

    pub async fn set_serve_config(&self, config: &ServeConfig) -> Result<(), Error> {
        self.send(Method::POST, SERVE_CONFIG_PATH, Some(config)).await?;
        Ok(())
    }

    pub async fn start_login_interactive(&self) -> Result<(), Error> {
        self.send::<()>(Method::POST, LOGIN_INTERACTIVE_PATH, None).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let body = self.send::<()>(Method::GET, path, None).await?;
        serde_json::from_slice(&body).map_err(|e| Error::LocalApi(format!("{path}: {e}")))
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Bytes, Error> {
        let io = self.dialer.dial().await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| Error::LocalApi(format!("handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "local api connection ended");
            }
        });

        let payload = match body {
            Some(b) => Bytes::from(
                serde_json::to_vec(b).map_err(|e| Error::LocalApi(format!("encode: {e}")))?,
            ),
            None => Bytes::new(),
        };
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, LOCAL_API_HOST)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|e| Error::LocalApi(format!("request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| Error::LocalApi(format!("{path}: {e}")))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::LocalApi(format!("{path}: {e}")))?
            .to_bytes();

        if !status.is_success() {
            return Err(Error::LocalApi(format!(
                "{path}: {status}: {}",
                String::from_utf8_lossy(&body).trim()
            )));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Bytes::new());
        }
        Ok(body)
    }
}
