use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

/// Maps any anyhow error to a 500 response so that handlers can
/// simply use `?`
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!("http request failed: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{:#}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Bind and serve `router` on `addr` until the process shuts down.
/// The returned value is the locally bound address, which is useful
/// when binding to port 0 in tests.
pub async fn spawn_http_listener(
    addr: SocketAddr,
    router: axum::Router,
) -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("http listener on {local_addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            tracing::error!("http listener on {local_addr} failed: {err:#}");
        }
    });
    Ok(local_addr)
}
