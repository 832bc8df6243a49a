//! ToonHub - main entry point of the SDK
//!
//! Wires the session manager, the callback server and the paired devices
//! together and runs the background tasks that feed them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callback_server::{CallbackServer, EventRouter, OAuthRedirect, WebhookPayload};
use dashmap::DashMap;
use parking_lot::Mutex;
use task_queue::{Clock, TokioClock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use toon_api::{Agreement, AuthProvider, ClientFactory, ToonClientFactory, ToonOAuth};
use toon_device::{Device, DeviceConfig, PayloadKind, SubscriptionConfig};
use toon_session::{
    AuthorizationCallback, JsonFileStore, LoginOutcome, ManagedDevice, SessionError,
    SessionEvent, SessionManager, SessionStore,
};
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::{HubError, Result};

/// Collaborators a hub is built from.
///
/// [`ToonHub::start`] builds the production set; tests inject doubles
/// through [`ToonHub::start_with`].
pub struct HubComponents {
    pub store: Arc<dyn SessionStore>,
    pub provider: Arc<dyn AuthProvider>,
    pub factory: Arc<dyn ClientFactory>,
    pub clock: Arc<dyn Clock>,
}

/// A running Toon integration.
///
/// # Example
///
/// ```rust,ignore
/// use toon_sdk::{HubConfig, SessionEvent, ToonHub};
///
/// let hub = ToonHub::start(HubConfig::from_env()?).await?;
///
/// if !hub.is_authenticated().await? {
///     let mut events = hub.session_events();
///     let login = hub.login();
///     // show SessionEvent::AuthorizationUrl to the user, then:
///     login.await?;
/// }
///
/// for agreement in hub.pairing_candidates().await? {
///     let device = hub.add_device(&agreement).await?;
///     device.set_target_temperature(20.5).await?;
/// }
///
/// hub.shutdown().await?;
/// ```
pub struct ToonHub {
    config: HubConfig,
    session: Arc<SessionManager>,
    clock: Arc<dyn Clock>,

    /// Paired devices by common name
    devices: Arc<DashMap<String, Arc<Device>>>,

    router: Arc<EventRouter>,
    base_url: String,
    port: u16,
    server: tokio::sync::Mutex<Option<CallbackServer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ToonHub {
    /// Start against the production provider.
    ///
    /// This will:
    /// 1. Start the callback server on the first free configured port
    /// 2. Build the OAuth provider, falling back to the server's redirect
    ///    URL when none is configured
    /// 3. Spawn the webhook, redirect and poll tasks
    /// 4. Restore a persisted session, if any
    pub async fn start(config: HubConfig) -> Result<Self> {
        config.validate()?;
        let (server, channels) = Self::start_server(&config).await?;

        let api_url = config.api_url()?;
        let oauth = config.oauth_config(&server.redirect_url())?;
        let components = HubComponents {
            store: Arc::new(JsonFileStore::new(config.session_store_path.clone())),
            provider: Arc::new(ToonOAuth::with_api_base(oauth, api_url.clone())),
            factory: Arc::new(ToonClientFactory::new(api_url)),
            clock: Arc::new(TokioClock),
        };

        Self::launch(config, server, channels, components).await
    }

    /// Start with injected collaborators.
    pub async fn start_with(config: HubConfig, components: HubComponents) -> Result<Self> {
        config.validate()?;
        let (server, channels) = Self::start_server(&config).await?;
        Self::launch(config, server, channels, components).await
    }

    async fn start_server(config: &HubConfig) -> Result<(CallbackServer, Channels)> {
        let (webhook_tx, webhook_rx) = mpsc::unbounded_channel();
        let (oauth_tx, oauth_rx) = mpsc::unbounded_channel();
        let server = CallbackServer::new(config.callback_port_range, webhook_tx, oauth_tx).await?;
        Ok((
            server,
            Channels {
                webhooks: webhook_rx,
                redirects: oauth_rx,
            },
        ))
    }

    async fn launch(
        config: HubConfig,
        server: CallbackServer,
        channels: Channels,
        components: HubComponents,
    ) -> Result<Self> {
        let session = Arc::new(SessionManager::new(
            config.config_id.clone(),
            components.store,
            components.provider,
            components.factory,
        ));
        let devices: Arc<DashMap<String, Arc<Device>>> = Arc::new(DashMap::new());

        let tasks = vec![
            spawn_webhook_dispatch(devices.clone(), channels.webhooks),
            spawn_redirect_dispatch(session.clone(), channels.redirects),
            spawn_poller(devices.clone(), config.poll_interval),
        ];

        let hub = Self {
            router: server.router().clone(),
            base_url: server.base_url().to_string(),
            port: server.port(),
            server: tokio::sync::Mutex::new(Some(server)),
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
            clock: components.clock,
            config,
            session,
            devices,
        };

        match hub.session.restore().await {
            Ok(Some(outcome)) => info!("Resumed session {}", outcome.session.title),
            Ok(None) => debug!("No stored session, login required"),
            Err(e) => {
                hub.shutdown().await?;
                return Err(e.into());
            }
        }

        info!("Toon hub listening on {}", hub.base_url);
        Ok(hub)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe_events()
    }

    /// Advertised address of the callback server.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the authorization handshake.
    ///
    /// Completes when the provider redirects back to the callback server,
    /// so subscribe to [`session_events`](Self::session_events) first to
    /// learn the authorization URL.
    pub async fn login(&self) -> Result<LoginOutcome> {
        self.ensure_open()?;
        Ok(self.session.login().await?)
    }

    pub async fn logout(&self) -> Result<()> {
        Ok(self.session.logout().await?)
    }

    pub async fn is_authenticated(&self) -> Result<bool> {
        Ok(self.session.is_authenticated().await?)
    }

    /// Thermostats of the logged-in account that are not paired yet.
    pub async fn pairing_candidates(&self) -> Result<Vec<Agreement>> {
        let client = self.session.client().ok_or(SessionError::NotAuthenticated)?;
        let agreements = client.agreements().await?;
        Ok(agreements
            .into_iter()
            .filter(|a| !self.devices.contains_key(&a.display_common_name))
            .collect())
    }

    /// Pair a thermostat and start receiving its pushes.
    ///
    /// Adding an already paired thermostat returns the existing device.
    pub async fn add_device(&self, agreement: &Agreement) -> Result<Arc<Device>> {
        self.ensure_open()?;
        let client = self.session.client().ok_or(SessionError::NotAuthenticated)?;
        let binding = self.session.binding().ok_or(SessionError::NotAuthenticated)?;

        let device_id = agreement.display_common_name.clone();
        if let Some(existing) = self.devices.get(&device_id) {
            debug!("Device {} is already paired", device_id);
            return Ok(existing.clone());
        }

        let callback_url = self
            .config
            .public_webhook_for(&device_id)
            .unwrap_or_else(|| format!("{}/webhook/{}", self.base_url, device_id));
        let subscription = SubscriptionConfig::new(&self.config.application_id, callback_url)
            .with_retries(
                self.config.subscription_retries,
                self.config.subscription_base_delay,
            );
        let device_config = DeviceConfig::new(&device_id, &agreement.agreement_id, subscription)
            .with_name(agreement.address())
            .with_write_debounce(self.config.write_debounce);
        let device = Device::new(device_config, self.clock.clone());

        // Routable before the subscription exists; the first push may
        // arrive right after registration.
        self.router.register(device_id.clone()).await;
        self.devices.insert(device_id.clone(), device.clone());
        self.session.register_device(device.clone());

        if let Err(e) = device.rebind(client, &binding).await {
            self.forget(&device_id).await;
            return Err(HubError::Pairing {
                device_id,
                message: e.to_string(),
            });
        }

        if let Err(e) = device.poll().await {
            warn!("Initial status fetch for {} failed: {}", device_id, e);
        }

        info!("Paired device {} ({})", device_id, device.name());
        Ok(device)
    }

    /// Unpair a thermostat. Its webhook is removed best effort.
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let device = self
            .forget(device_id)
            .await
            .ok_or_else(|| HubError::DeviceNotFound(device_id.to_string()))?;
        device.teardown().await;
        Ok(())
    }

    pub fn device(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    /// Stop the background tasks and the callback server.
    ///
    /// Every device is torn down, so its webhook is removed and no renewal
    /// fires afterwards. A login still waiting for its redirect fails with
    /// [`SessionError::CallbackClosed`].
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.session.close_authorization();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some(device) = self.forget(&id).await {
                device.teardown().await;
            }
        }

        if let Some(server) = self.server.lock().await.take() {
            server.shutdown().await?;
        }
        info!("Toon hub stopped");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(HubError::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn forget(&self, device_id: &str) -> Option<Arc<Device>> {
        let (_, device) = self.devices.remove(device_id)?;
        self.session.unregister_device(device_id);
        self.router.unregister(device_id).await;
        Some(device)
    }
}

struct Channels {
    webhooks: mpsc::UnboundedReceiver<WebhookPayload>,
    redirects: mpsc::UnboundedReceiver<OAuthRedirect>,
}

/// Pushes are handled one at a time, so each device sees them in arrival
/// order.
fn spawn_webhook_dispatch(
    devices: Arc<DashMap<String, Arc<Device>>>,
    mut rx: mpsc::UnboundedReceiver<WebhookPayload>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(WebhookPayload { device_key, body }) = rx.recv().await {
            let Some(device) = devices.get(&device_key).map(|d| d.clone()) else {
                debug!("Dropping push for removed device {}", device_key);
                continue;
            };

            match device.handle_payload(&body).await {
                PayloadKind::Applied | PayloadKind::Heartbeat => {}
                PayloadKind::Foreign(name) => {
                    debug!("Push on {} is for {}, ignored", device_key, name)
                }
                PayloadKind::Malformed(reason) => {
                    warn!("Malformed push for {}: {}", device_key, reason)
                }
            }
        }
        debug!("Webhook dispatch stopped");
    })
}

fn spawn_redirect_dispatch(
    session: Arc<SessionManager>,
    mut rx: mpsc::UnboundedReceiver<OAuthRedirect>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(redirect) = rx.recv().await {
            let Some(callback) = authorization_callback(redirect) else {
                continue;
            };
            let Some(sender) = session.authorization_sender() else {
                debug!("Authorization redirect after shutdown, ignored");
                continue;
            };
            if let Err(e) = sender.try_send(callback) {
                warn!("Authorization redirect dropped: {}", e);
            }
        }
        debug!("Redirect dispatch stopped");
    })
}

fn spawn_poller(devices: Arc<DashMap<String, Arc<Device>>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let snapshot: Vec<Arc<Device>> = devices.iter().map(|e| e.value().clone()).collect();
            for device in snapshot.into_iter().filter(|d| d.is_available()) {
                if let Err(e) = device.poll().await {
                    warn!("Polling {} failed: {}", device.id(), e);
                }
            }
        }
    })
}

/// Translate a provider redirect. A redirect with neither code nor error
/// carries nothing to act on.
fn authorization_callback(redirect: OAuthRedirect) -> Option<AuthorizationCallback> {
    let state = redirect.state.unwrap_or_default();
    match (redirect.code, redirect.error) {
        (_, Some(error)) => Some(AuthorizationCallback::Denied { error, state }),
        (Some(code), None) => Some(AuthorizationCallback::Code { code, state }),
        (None, None) => None,
    }
}
