//! HTTP server for webhook pushes and OAuth redirects.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::Filter;

use super::router::{EventRouter, OAuthRedirect, WebhookPayload};

/// Largest webhook body accepted.
const MAX_BODY_BYTES: u64 = 256 * 1024;

const AUTHORIZED_PAGE: &str = "<html><body><h1>Toon connected</h1>\
<p>You can close this window.</p></body></html>";
const DENIED_PAGE: &str = "<html><body><h1>Authorization failed</h1>\
<p>Close this window and try again.</p></body></html>";

/// Errors from starting or stopping the server.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("No available port found in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    #[error("Server failed to start")]
    StartFailed,
}

/// HTTP callback server.
///
/// Binds the first free port in a range and serves the webhook and OAuth
/// redirect endpoints until [`shutdown`](CallbackServer::shutdown).
pub struct CallbackServer {
    port: u16,
    /// `http://<local_ip>:<port>`
    base_url: String,
    event_router: Arc<EventRouter>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CallbackServer {
    /// Find a free port in `port_range`, start serving and wait until the
    /// listener is up.
    pub async fn new(
        port_range: (u16, u16),
        webhook_sender: mpsc::UnboundedSender<WebhookPayload>,
        oauth_sender: mpsc::UnboundedSender<OAuthRedirect>,
    ) -> Result<Self, CallbackError> {
        let port = Self::find_available_port(port_range.0, port_range.1).ok_or(
            CallbackError::NoAvailablePort {
                start: port_range.0,
                end: port_range.1,
            },
        )?;

        let local_ip = Self::detect_local_ip().unwrap_or_else(|| {
            warn!("Could not detect local IP address, advertising loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });
        let base_url = format!("http://{local_ip}:{port}");

        let event_router = Arc::new(EventRouter::new(webhook_sender, oauth_sender));

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(1);

        let server_handle = Self::start_server(port, event_router.clone(), shutdown_rx, ready_tx);

        ready_rx.recv().await.ok_or(CallbackError::StartFailed)?;

        Ok(Self {
            port,
            base_url,
            event_router,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Local webhook URL for `device_key`.
    pub fn webhook_url(&self, device_key: &str) -> String {
        format!("{}/webhook/{}", self.base_url, device_key)
    }

    /// Local OAuth redirect URL.
    pub fn redirect_url(&self) -> String {
        format!("{}/oauth/callback", self.base_url)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.event_router
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) -> Result<(), CallbackError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }

        debug!("Callback server on port {} stopped", self.port);
        Ok(())
    }

    fn find_available_port(start: u16, end: u16) -> Option<u16> {
        (start..=end).find(|&port| Self::is_port_available(port))
    }

    fn is_port_available(port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).is_ok()
    }

    /// Local address of the default route. Uses a UDP socket's routing
    /// decision; no data is sent.
    fn detect_local_ip() -> Option<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }

    fn start_server(
        port: u16,
        event_router: Arc<EventRouter>,
        mut shutdown_rx: mpsc::Receiver<()>,
        ready_tx: mpsc::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let webhook_route = warp::post()
                .and(warp::path!("webhook" / String))
                .and(warp::body::content_length_limit(MAX_BODY_BYTES))
                .and(warp::body::bytes())
                .and_then({
                    let router = event_router.clone();
                    move |device_key: String, body: bytes::Bytes| {
                        let router = router.clone();
                        async move { handle_webhook(&router, device_key, body).await }
                    }
                });

            let oauth_route = warp::get()
                .and(warp::path!("oauth" / "callback"))
                .and(warp::query::<OAuthRedirect>())
                .and_then({
                    let router = event_router.clone();
                    move |redirect: OAuthRedirect| {
                        let router = router.clone();
                        async move { handle_redirect(&router, redirect) }
                    }
                });

            let routes = webhook_route.or(oauth_route).recover(handle_rejection);

            let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                async move {
                    shutdown_rx.recv().await;
                },
            );

            info!("Callback server listening on {addr}");
            let _ = ready_tx.send(()).await;
            server.await;
        })
    }
}

async fn handle_webhook(
    router: &EventRouter,
    device_key: String,
    body: bytes::Bytes,
) -> Result<impl warp::Reply, warp::Rejection> {
    let body: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
        warn!("Rejecting webhook for {}: body is not JSON ({})", device_key, e);
        warp::reject::custom(InvalidPayload)
    })?;

    debug!("Webhook push for {}", device_key);
    if router.route_webhook(device_key.clone(), body).await {
        Ok(warp::reply::with_status("", StatusCode::OK))
    } else {
        debug!("Webhook push for unknown device {}", device_key);
        Err(warp::reject::custom(UnknownDevice))
    }
}

fn handle_redirect(
    router: &EventRouter,
    redirect: OAuthRedirect,
) -> Result<impl warp::Reply, warp::Rejection> {
    if redirect.code.is_none() && redirect.error.is_none() {
        return Err(warp::reject::custom(InvalidRedirect));
    }

    let denied = redirect.error.is_some();
    if !router.route_redirect(redirect) {
        warn!("Authorization redirect received but no login is listening");
    }

    let (page, status) = if denied {
        (DENIED_PAGE, StatusCode::BAD_REQUEST)
    } else {
        (AUTHORIZED_PAGE, StatusCode::OK)
    };
    Ok(warp::reply::with_status(warp::reply::html(page), status))
}

#[derive(Debug)]
struct InvalidPayload;

impl warp::reject::Reject for InvalidPayload {}

#[derive(Debug)]
struct UnknownDevice;

impl warp::reject::Reject for UnknownDevice {}

#[derive(Debug)]
struct InvalidRedirect;

impl warp::reject::Reject for InvalidRedirect {}

/// Map rejections to plain-text responses.
async fn handle_rejection(
    err: warp::Rejection,
) -> Result<impl warp::Reply, std::convert::Infallible> {
    let (code, message) = if err.find::<UnknownDevice>().is_some() {
        (StatusCode::NOT_FOUND, "Unknown device")
    } else if err.find::<InvalidPayload>().is_some() {
        (StatusCode::BAD_REQUEST, "Invalid JSON payload")
    } else if err.find::<InvalidRedirect>().is_some() {
        (StatusCode::BAD_REQUEST, "Missing code or error")
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "Invalid query string")
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    };

    Ok(warp::reply::with_status(message, code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_port_available() {
        assert!(CallbackServer::is_port_available(0));

        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!CallbackServer::is_port_available(port));
        drop(listener);
    }

    #[test]
    fn test_find_available_port() {
        let port = CallbackServer::find_available_port(51000, 51100).unwrap();
        assert!((51000..=51100).contains(&port));
    }

    #[test]
    fn test_no_port_in_occupied_range() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(CallbackServer::find_available_port(port, port), None);
    }

    #[tokio::test]
    async fn test_server_creation_and_urls() {
        let (webhook_tx, _webhook_rx) = mpsc::unbounded_channel();
        let (oauth_tx, _oauth_rx) = mpsc::unbounded_channel();

        let server = CallbackServer::new((51100, 51200), webhook_tx, oauth_tx)
            .await
            .unwrap();
        assert!((51100..=51200).contains(&server.port()));
        assert!(server.base_url().ends_with(&format!(":{}", server.port())));
        assert_eq!(
            server.webhook_url("eneco-001"),
            format!("{}/webhook/eneco-001", server.base_url())
        );
        assert!(server.redirect_url().ends_with("/oauth/callback"));

        server.shutdown().await.unwrap();
    }
}
