//! The host controller: connection lifecycle, catalogue, and dispatch.
//!
//! A [`Host`] dials the dashboard with its API key and a per-process
//! instance id, authenticates the framed socket, registers the route
//! catalogue through `INITIALIZE_HOST`, and then serves the dashboard's
//! calls: starting transactions, routing IO responses, and opening and
//! closing pages. When the connection drops, the controller re-dials under
//! the same instance id, rebinds the RPC transport without losing pending
//! calls, replays in-flight renders and loading states, and re-initialises.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use chrono::{SecondsFormat, Utc};
use futures_util::future::join_all;
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue},
};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    api::{ApiClient, ApiError, QueuedAction},
    config::{ConfigError, HostConfig},
    context::{ActionContext, NotifyOptions, PageContext, RedirectTarget},
    page::{self, PageSession},
    payload::{self, Payload},
    routes::{Catalogue, Route, RouteMap, UnknownSlug},
    rpc::{DuplexRpcClient, RpcError},
    socket::{FramedSocket, SocketError, SocketOptions},
    transaction::{
        IoClient,
        IoError,
        IoErrorKind,
        LoadingState,
        TransactionLoadingState,
    },
    wire::{
        self,
        ActionResult,
        ActionStatus,
        AlertSeverity,
        Environment,
        InitializeHostInputs,
        InitializeHostReturns,
        MarkTransactionCompleteInputs,
        NotifyInputs,
        OpenPageReturns,
        OrganizationDef,
        SdkAlert,
        SendIoCallInputs,
        SendLoadingCallInputs,
        SendLogInputs,
        SendRedirectInputs,
        ServerMethod,
    },
};

/// Name reported to the dashboard during initialisation.
pub const SDK_NAME: &str = "interval-rs";

/// Longest log line forwarded before truncation.
const MAX_LOG_LENGTH: usize = 10_000;

/// Errors surfaced by the host controller.
#[derive(Debug, Error)]
pub enum HostError {
    /// Configuration could not be loaded or derived.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The websocket dial failed.
    #[error("failed dialling the dashboard: {0}")]
    Dial(#[from] Box<tungstenite::Error>),
    /// The framed socket failed during connect.
    #[error(transparent)]
    Socket(#[from] SocketError),
    /// An RPC call failed in a way retries cannot fix.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// The HTTP API rejected a request.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The server refused `INITIALIZE_HOST`.
    #[error("host initialisation failed: {0}")]
    Initialize(String),
    /// An operation needs `listen` to have succeeded first.
    #[error("host is not listening")]
    NotListening,
}

struct HostInner {
    config: HostConfig,
    instance_id: Uuid,
    api: ApiClient,
    routes: StdMutex<RouteMap>,
    catalogue: StdMutex<Catalogue>,
    pending_io_calls: StdMutex<HashMap<String, String>>,
    loading_states: StdMutex<HashMap<String, LoadingState>>,
    response_handlers: StdMutex<HashMap<String, IoClient>>,
    page_sessions: StdMutex<HashMap<String, PageSession>>,
    socket: StdMutex<Option<Arc<FramedSocket>>>,
    rpc: StdMutex<Option<Arc<DuplexRpcClient>>>,
    organization: StdMutex<Option<OrganizationDef>>,
    environment: StdMutex<Option<Environment>>,
    is_connected: AtomicBool,
    is_initialized: AtomicBool,
    intentionally_closed: AtomicBool,
    reinit_scheduled: AtomicBool,
    ping_monitor_started: AtomicBool,
    tasks: TaskTracker,
}

/// A connected (or connecting) dashboard host.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

/// Handle for mutating the route registry of a live host.
///
/// Mutations after a successful `listen` coalesce into a single delayed
/// re-initialisation.
pub struct RoutesHandle {
    inner: Arc<HostInner>,
}

impl RoutesHandle {
    /// Insert or replace a route at a `/`-separated slug path.
    ///
    /// # Errors
    /// Fails when an intermediate segment does not name an existing page.
    pub fn add(&self, slug: &str, route: impl Into<Route>) -> Result<(), UnknownSlug> {
        lock_or_poisoned(&self.inner.routes).add(slug, route)?;
        HostInner::schedule_reinitialize(&self.inner);
        Ok(())
    }

    /// Remove the route at a `/`-separated slug path, when present.
    pub fn remove(&self, slug: &str) {
        lock_or_poisoned(&self.inner.routes).remove(slug);
        HostInner::schedule_reinitialize(&self.inner);
    }
}

impl Host {
    /// Create a host for the given configuration.
    ///
    /// # Errors
    /// Fails when the HTTP API client cannot be constructed.
    pub fn new(config: HostConfig) -> Result<Self, HostError> {
        let api = ApiClient::new(config.clone())?;
        Ok(Self {
            inner: Arc::new(HostInner {
                config,
                instance_id: Uuid::new_v4(),
                api,
                routes: StdMutex::new(RouteMap::default()),
                catalogue: StdMutex::new(Catalogue::default()),
                pending_io_calls: StdMutex::new(HashMap::new()),
                loading_states: StdMutex::new(HashMap::new()),
                response_handlers: StdMutex::new(HashMap::new()),
                page_sessions: StdMutex::new(HashMap::new()),
                socket: StdMutex::new(None),
                rpc: StdMutex::new(None),
                organization: StdMutex::new(None),
                environment: StdMutex::new(None),
                is_connected: AtomicBool::new(false),
                is_initialized: AtomicBool::new(false),
                intentionally_closed: AtomicBool::new(false),
                reinit_scheduled: AtomicBool::new(false),
                ping_monitor_started: AtomicBool::new(false),
                tasks: TaskTracker::new(),
            }),
        })
    }

    /// The registry of routes this host exposes.
    #[must_use]
    pub fn routes(&self) -> RoutesHandle {
        RoutesHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Identity presented in the `x-instance-id` header; stable across
    /// reconnects.
    #[must_use]
    pub fn instance_id(&self) -> Uuid { self.inner.instance_id }

    /// True while the framed socket is connected and authenticated.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.inner.is_connected.load(Ordering::SeqCst) }

    /// The organisation reported by the last initialisation.
    #[must_use]
    pub fn organization(&self) -> Option<OrganizationDef> {
        lock_or_poisoned(&self.inner.organization).clone()
    }

    /// Dial, authenticate, register handlers, and initialise the host.
    ///
    /// # Errors
    /// Fails when the dial, the authentication handshake, or the
    /// initialisation exchange fails. Connection losses after a successful
    /// `listen` are handled by the reconnect loop instead.
    pub async fn listen(&self) -> Result<(), HostError> {
        let inner = &self.inner;
        let socket = HostInner::dial(inner).await?;

        let rpc = lock_or_poisoned(&inner.rpc).clone();
        match rpc {
            Some(rpc) => rpc.bind_transport(socket),
            None => {
                let rpc = HostInner::build_rpc(inner, socket);
                *lock_or_poisoned(&inner.rpc) = Some(rpc);
            }
        }

        HostInner::initialize_host(inner).await?;

        if !inner.ping_monitor_started.swap(true, Ordering::SeqCst) {
            let weak = Arc::downgrade(inner);
            tokio::spawn(async move {
                ping_monitor(weak).await;
            });
        }

        Ok(())
    }

    /// Close the connection on purpose, without triggering reconnects.
    pub async fn close(&self) {
        self.inner.intentionally_closed.store(true, Ordering::SeqCst);
        self.inner.is_connected.store(false, Ordering::SeqCst);
        let socket = lock_or_poisoned(&self.inner.socket).take();
        if let Some(socket) = socket {
            socket.close().await;
        }
        *lock_or_poisoned(&self.inner.rpc) = None;
    }

    /// Send a notification outside any transaction.
    ///
    /// # Errors
    /// Fails when the HTTP API rejects the notification.
    pub async fn notify(
        &self,
        message: impl Into<String> + Send,
        options: NotifyOptions,
    ) -> Result<(), HostError> {
        HostInner::notify(&self.inner, None, message.into(), options).await?;
        Ok(())
    }

    /// Queue an action invocation for later execution.
    ///
    /// # Errors
    /// Fails when the HTTP API refuses the request.
    pub async fn enqueue(
        &self,
        slug: impl Into<String> + Send,
        assignee: Option<String>,
        params: Option<serde_json::Value>,
    ) -> Result<QueuedAction, HostError> {
        Ok(self.inner.api.enqueue(slug, assignee, params).await?)
    }

    /// Remove a queued invocation.
    ///
    /// # Errors
    /// Fails when the HTTP API refuses the request.
    pub async fn dequeue(&self, id: impl Into<String> + Send) -> Result<QueuedAction, HostError> {
        Ok(self.inner.api.dequeue(id).await?)
    }
}

impl HostInner {
    /// Dial the websocket, wrap it in a framed socket, and authenticate.
    async fn dial(inner: &Arc<Self>) -> Result<Arc<FramedSocket>, HostError> {
        let mut request = inner
            .config
            .endpoint
            .clone()
            .into_client_request()
            .map_err(Box::new)?;
        let headers = request.headers_mut();
        let _ = headers.insert(
            "x-api-key",
            header_value(&inner.config.api_key)
                .ok_or_else(|| HostError::Initialize("API key is not header-safe".to_owned()))?,
        );
        let _ = headers.insert(
            "x-instance-id",
            header_value(&inner.instance_id.to_string())
                .ok_or_else(|| HostError::Initialize("instance id is not header-safe".to_owned()))?,
        );

        let (stream, _) = connect_async(request).await.map_err(Box::new)?;
        let socket = Arc::new(FramedSocket::new(
            inner.instance_id,
            stream,
            SocketOptions {
                send_timeout: inner.config.send_timeout(),
                connect_timeout: inner.config.connect_timeout(),
                ping_timeout: inner.config.ping_timeout(),
                num_producers: inner.config.num_message_producers,
            },
        ));
        Self::install_on_close(inner, &socket);

        socket.connect().await?;
        *lock_or_poisoned(&inner.socket) = Some(Arc::clone(&socket));
        inner.is_connected.store(true, Ordering::SeqCst);
        Ok(socket)
    }

    fn install_on_close(inner: &Arc<Self>, socket: &Arc<FramedSocket>) {
        let weak = Arc::downgrade(inner);
        socket.set_on_close(Some(Arc::new(move |code, reason| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else { return };
                if inner.intentionally_closed.swap(false, Ordering::SeqCst) {
                    return;
                }
                if !inner.is_connected.swap(false, Ordering::SeqCst) {
                    return;
                }
                info!(code, reason = %reason, "lost connection to the dashboard, reconnecting");
                loop {
                    match Self::reconnect(&inner).await {
                        Ok(()) => {
                            info!("reconnection successful");
                            break;
                        }
                        Err(err) => {
                            debug!(error = %err, "unable to reconnect, retrying");
                            sleep(inner.config.retry_interval()).await;
                        }
                    }
                }
            })
        })));
    }

    /// One reconnect attempt: dial, rebind the RPC transport, replay
    /// in-flight work, then re-initialise.
    async fn reconnect(inner: &Arc<Self>) -> Result<(), HostError> {
        let socket = Self::dial(inner).await?;
        let rpc = lock_or_poisoned(&inner.rpc).clone();
        if let Some(rpc) = rpc {
            rpc.bind_transport(socket);
        }
        let ((), ()) = tokio::join!(
            Self::resend_pending_io_calls(inner),
            Self::resend_loading_states(inner),
        );
        Self::initialize_host(inner).await?;
        Ok(())
    }

    /// Issue one RPC call, waiting out disconnected intervals and
    /// retrying transport timeouts.
    async fn call<M>(inner: &Arc<Self>, inputs: M::Inputs) -> Result<M::Returns, HostError>
    where
        M: ServerMethod,
        M::Inputs: Clone,
    {
        loop {
            if inner.is_connected.load(Ordering::SeqCst) {
                let rpc = lock_or_poisoned(&inner.rpc)
                    .clone()
                    .ok_or(HostError::NotListening)?;
                match rpc.call::<M>(inputs.clone()).await {
                    Ok(returns) => return Ok(returns),
                    Err(RpcError::Socket(err)) => {
                        debug!(method = M::NAME, error = %err, "call failed, retrying");
                    }
                    Err(err) => return Err(err.into()),
                }
            } else {
                debug!(method = M::NAME, "not connected, retrying shortly");
            }
            sleep(inner.config.retry_interval()).await;
        }
    }

    /// Walk the route tree and register the catalogue with the server.
    async fn initialize_host(inner: &Arc<Self>) -> Result<(), HostError> {
        let catalogue = lock_or_poisoned(&inner.routes).walk();
        let inputs = InitializeHostInputs {
            api_key: inner.config.api_key.clone(),
            sdk_name: SDK_NAME.to_owned(),
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
            actions: catalogue.actions.clone(),
            groups: catalogue.groups.clone(),
        };
        *lock_or_poisoned(&inner.catalogue) = catalogue;

        let response = Self::call::<wire::InitializeHost>(inner, inputs).await?;
        match response {
            InitializeHostReturns::Error { message, sdk_alert } => {
                if let Some(alert) = sdk_alert {
                    log_sdk_alert(&alert);
                }
                Err(HostError::Initialize(message))
            }
            InitializeHostReturns::Success {
                environment,
                invalid_slugs,
                organization,
                dashboard_url,
                sdk_alert,
                warnings,
            } => {
                if let Some(alert) = sdk_alert {
                    log_sdk_alert(&alert);
                }
                if !invalid_slugs.is_empty() {
                    warn!("invalid slugs detected:");
                    for slug in &invalid_slugs {
                        warn!(" - {slug}");
                    }
                    warn!(
                        "action slugs must contain only letters, numbers, underscores, \
                         periods, and hyphens"
                    );
                }
                for warning in &warnings {
                    warn!("{warning}");
                }
                if !inner.is_initialized.swap(true, Ordering::SeqCst) {
                    info!("connected! access your actions at: {dashboard_url}");
                    debug!(instance_id = %inner.instance_id, "host instance registered");
                }
                *lock_or_poisoned(&inner.organization) = Some(organization);
                *lock_or_poisoned(&inner.environment) = Some(environment);
                Ok(())
            }
        }
    }

    /// Coalesce route mutations into one delayed re-initialisation.
    fn schedule_reinitialize(inner: &Arc<Self>) {
        if !inner.is_initialized.load(Ordering::SeqCst) {
            return;
        }
        if inner.reinit_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else { return };
            sleep(inner.config.reinitialize_batch_timeout()).await;
            inner.reinit_scheduled.store(false, Ordering::SeqCst);
            if let Err(err) = Self::initialize_host(&inner).await {
                error!(error = %err, "failed reinitialising routes");
            }
        });
    }

    fn build_rpc(inner: &Arc<Self>, socket: Arc<FramedSocket>) -> Arc<DuplexRpcClient> {
        let rpc = DuplexRpcClient::new(socket);

        let weak = Arc::downgrade(inner);
        rpc.respond_to::<wire::StartTransaction, _, _>(move |inputs| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    Self::start_transaction(&inner, inputs);
                }
                Ok(())
            }
        });

        let weak = Arc::downgrade(inner);
        rpc.respond_to::<wire::IoResponse, _, _>(move |inputs| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    Self::io_response(&inner, inputs).await;
                }
                Ok(())
            }
        });

        let weak = Arc::downgrade(inner);
        rpc.respond_to::<wire::OpenPage, _, _>(move |inputs| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => Ok(Self::open_page(&inner, inputs)),
                    None => Ok(OpenPageReturns::Error {
                        message: Some("host is shutting down".to_owned()),
                    }),
                }
            }
        });

        let weak = Arc::downgrade(inner);
        rpc.respond_to::<wire::ClosePage, _, _>(move |inputs| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    Self::close_page(&inner, &inputs.page_key);
                }
                Ok(())
            }
        });

        rpc
    }

    /// Handle `START_TRANSACTION`: spawn the action handler as its own
    /// task and report its result when it finishes.
    fn start_transaction(inner: &Arc<Self>, inputs: wire::StartTransactionInputs) {
        let Some(organization) = lock_or_poisoned(&inner.organization).clone() else {
            error!("no organization defined");
            return;
        };

        let transaction_id = inputs.transaction_id.clone();
        if lock_or_poisoned(&inner.response_handlers).contains_key(&transaction_id) {
            debug!(%transaction_id, "transaction already started, not starting again");
            return;
        }

        let slug = inputs.action.slug.clone();
        let handler = lock_or_poisoned(&inner.catalogue)
            .action_handlers
            .get(&slug)
            .cloned();
        let Some(handler) = handler else {
            debug!(%slug, "no handler registered for action");
            return;
        };

        let client = IoClient::new(Self::render_sender(inner, &transaction_id));
        let _ = lock_or_poisoned(&inner.response_handlers)
            .insert(transaction_id.clone(), client.clone());

        let params = decode_params(&inputs.params, inputs.params_meta.as_ref());
        let ctx = ActionContext {
            user: inputs.user,
            params,
            environment: inputs.environment,
            organization,
            action: inputs.action,
            loading: TransactionLoadingState::new(Self::loading_sender(inner, &transaction_id)),
            log_sender: Self::log_sender(inner, &transaction_id),
            redirector: Self::redirector(inner, &transaction_id),
            notifier: Self::notifier(inner, &transaction_id),
        };

        let weak = Arc::downgrade(inner);
        let _ = inner.tasks.spawn(async move {
            let outcome = handler(client, ctx).await;
            let Some(inner) = weak.upgrade() else { return };

            let result = match outcome {
                Ok(value) => Some(ActionResult {
                    schema_version: 1,
                    status: ActionStatus::Success,
                    data: payload::encode(&value).0,
                }),
                Err(err) => match err.downcast_ref::<IoError>() {
                    Some(io_err) if io_err.kind == IoErrorKind::Canceled => {
                        info!(%slug, "transaction canceled for action");
                        None
                    }
                    Some(io_err) if io_err.kind == IoErrorKind::TransactionClosed => {
                        info!(
                            %slug,
                            "attempted to make IO call after transaction already closed"
                        );
                        None
                    }
                    _ => {
                        error!(%slug, error = %err, "error in action handler");
                        Some(ActionResult {
                            schema_version: 1,
                            status: ActionStatus::Failure,
                            data: json!({
                                "error": error_class(&err),
                                "message": err.to_string(),
                            }),
                        })
                    }
                },
            };

            if let Some(result) = result {
                match serde_json::to_string(&result) {
                    Ok(serialised) => {
                        let call = Self::call::<wire::MarkTransactionComplete>(
                            &inner,
                            MarkTransactionCompleteInputs {
                                transaction_id: transaction_id.clone(),
                                result: Some(serialised),
                            },
                        );
                        if let Err(err) = call.await {
                            error!(error = %err, "failed marking transaction complete");
                        }
                    }
                    Err(err) => error!(error = %err, "failed serialising action result"),
                }
            }

            let _ = lock_or_poisoned(&inner.pending_io_calls).remove(&transaction_id);
            let _ = lock_or_poisoned(&inner.response_handlers).remove(&transaction_id);
        });
    }

    /// Handle `IO_RESPONSE`: dispatch into the owning client, which may be
    /// a transaction or a page session.
    async fn io_response(inner: &Arc<Self>, inputs: wire::IoResponseInputs) {
        let response: crate::transaction::IoResponse = match serde_json::from_str(&inputs.value) {
            Ok(response) => response,
            Err(err) => {
                debug!(error = %err, "skipping malformed IO response");
                return;
            }
        };
        let handler = lock_or_poisoned(&inner.response_handlers)
            .get(&response.transaction_id)
            .cloned();
        match handler {
            Some(client) => client.on_response(response).await,
            None => debug!(
                transaction_id = %response.transaction_id,
                "missing reply handler"
            ),
        }
    }

    /// Handle `OPEN_PAGE`: spawn the page session and return immediately.
    fn open_page(inner: &Arc<Self>, inputs: wire::OpenPageInputs) -> OpenPageReturns {
        let Some(organization) = lock_or_poisoned(&inner.organization).clone() else {
            error!("no organization defined");
            return OpenPageReturns::Error {
                message: Some("No organization defined.".to_owned()),
            };
        };

        let handler = lock_or_poisoned(&inner.catalogue)
            .page_handlers
            .get(&inputs.page.slug)
            .cloned();
        let Some(handler) = handler else {
            error!(slug = %inputs.page.slug, "no page handler found");
            return OpenPageReturns::Error {
                message: Some("No page handler found.".to_owned()),
            };
        };

        let page_key = inputs.page_key.clone();
        let ctx = PageContext {
            user: inputs.user,
            params: decode_params(&inputs.params, inputs.params_meta.as_ref()),
            environment: inputs.environment,
            organization,
            page: inputs.page,
        };

        let weak = Arc::downgrade(inner);
        let sender_key = page_key.clone();
        let sender: page::PageSender = Arc::new(move |serialised: String| {
            let weak = weak.clone();
            let page_key = sender_key.clone();
            Box::pin(async move {
                let inner = weak.upgrade().ok_or_else(|| anyhow::anyhow!("host gone"))?;
                let accepted = Self::call::<wire::SendPage>(
                    &inner,
                    wire::SendPageInputs {
                        page_key,
                        page: serialised,
                    },
                )
                .await?;
                Ok(accepted)
            })
        });

        let session =
            page::open_page_session(handler, ctx, sender, inner.config.retry_interval());
        let _ = lock_or_poisoned(&inner.response_handlers)
            .insert(page_key.clone(), session.client.clone());
        let _ = lock_or_poisoned(&inner.page_sessions).insert(page_key.clone(), session);

        OpenPageReturns::Success { page_key }
    }

    /// Handle `CLOSE_PAGE`: cancel the session and drop its entries.
    fn close_page(inner: &Arc<Self>, page_key: &str) {
        let session = lock_or_poisoned(&inner.page_sessions).remove(page_key);
        if let Some(session) = session {
            session.close();
        }
        let _ = lock_or_poisoned(&inner.response_handlers).remove(page_key);
    }

    /// Re-send every stored render batch until the server accepts,
    /// refuses, or the transaction is gone.
    async fn resend_pending_io_calls(inner: &Arc<Self>) {
        let mut to_resend: HashMap<String, String> =
            lock_or_poisoned(&inner.pending_io_calls).clone();

        while !to_resend.is_empty() {
            let items: Vec<(String, String)> = to_resend
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let sends = items.iter().map(|(transaction_id, io_call)| {
                Self::call::<wire::SendIoCall>(
                    inner,
                    SendIoCallInputs {
                        transaction_id: transaction_id.clone(),
                        io_call: io_call.clone(),
                    },
                )
            });
            let results = join_all(sends).await;

            for ((transaction_id, _), result) in items.iter().zip(results) {
                let client_terminated = lock_or_poisoned(&inner.response_handlers)
                    .get(transaction_id)
                    .is_none_or(|client| client.is_canceled());
                match result {
                    Ok(true) if !client_terminated => {
                        let _ = to_resend.remove(transaction_id);
                    }
                    Ok(_) => {
                        // refused by the server or terminated locally
                        let _ = to_resend.remove(transaction_id);
                        let _ = lock_or_poisoned(&inner.pending_io_calls).remove(transaction_id);
                    }
                    Err(err) => {
                        warn!(error = %err, %transaction_id, "failed resending pending IO call");
                        let _ = to_resend.remove(transaction_id);
                        let _ = lock_or_poisoned(&inner.pending_io_calls).remove(transaction_id);
                    }
                }
            }

            if !to_resend.is_empty() {
                debug!("retrying pending IO calls shortly");
                sleep(inner.config.retry_interval()).await;
            }
        }
    }

    /// Re-send every stored loading state with the same policy as pending
    /// IO calls.
    async fn resend_loading_states(inner: &Arc<Self>) {
        let mut to_resend: HashMap<String, LoadingState> =
            lock_or_poisoned(&inner.loading_states).clone();

        while !to_resend.is_empty() {
            let items: Vec<(String, LoadingState)> = to_resend
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let sends = items.iter().map(|(transaction_id, state)| {
                Self::call::<wire::SendLoadingCall>(
                    inner,
                    loading_inputs(transaction_id.clone(), state.clone()),
                )
            });
            let results = join_all(sends).await;

            for ((transaction_id, _), result) in items.iter().zip(results) {
                match result {
                    Ok(true) => {
                        let _ = to_resend.remove(transaction_id);
                    }
                    Ok(false) => {
                        let _ = to_resend.remove(transaction_id);
                        let _ = lock_or_poisoned(&inner.loading_states).remove(transaction_id);
                    }
                    Err(err) => {
                        warn!(error = %err, %transaction_id, "failed resending loading state");
                        let _ = to_resend.remove(transaction_id);
                        let _ = lock_or_poisoned(&inner.loading_states).remove(transaction_id);
                    }
                }
            }

            if !to_resend.is_empty() {
                debug!("retrying loading states shortly");
                sleep(inner.config.retry_interval()).await;
            }
        }
    }

    fn render_sender(inner: &Arc<Self>, transaction_id: &str) -> crate::transaction::RenderSender {
        let weak = Arc::downgrade(inner);
        let transaction_id = transaction_id.to_owned();
        Arc::new(move |render| {
            let weak = weak.clone();
            let transaction_id = transaction_id.clone();
            Box::pin(async move {
                let inner = weak.upgrade().ok_or_else(|| anyhow::anyhow!("host gone"))?;
                let io_call = serde_json::to_string(&render)?;
                let _ = lock_or_poisoned(&inner.pending_io_calls)
                    .insert(transaction_id.clone(), io_call.clone());
                let _ = Self::call::<wire::SendIoCall>(
                    &inner,
                    SendIoCallInputs {
                        transaction_id,
                        io_call,
                    },
                )
                .await?;
                Ok(())
            })
        })
    }

    fn loading_sender(
        inner: &Arc<Self>,
        transaction_id: &str,
    ) -> crate::transaction::loading::LoadingSender {
        let weak = Arc::downgrade(inner);
        let transaction_id = transaction_id.to_owned();
        Arc::new(move |state: LoadingState| {
            let weak = weak.clone();
            let transaction_id = transaction_id.clone();
            Box::pin(async move {
                let inner = weak.upgrade().ok_or_else(|| anyhow::anyhow!("host gone"))?;
                let _ = lock_or_poisoned(&inner.loading_states)
                    .insert(transaction_id.clone(), state.clone());
                let _ = Self::call::<wire::SendLoadingCall>(
                    &inner,
                    loading_inputs(transaction_id, state),
                )
                .await?;
                Ok(())
            })
        })
    }

    fn log_sender(inner: &Arc<Self>, transaction_id: &str) -> crate::context::LogSender {
        let weak = Arc::downgrade(inner);
        let transaction_id = transaction_id.to_owned();
        let index = Arc::new(AtomicU64::new(0));
        Arc::new(move |message: String| {
            let weak = weak.clone();
            let transaction_id = transaction_id.clone();
            let index = Arc::clone(&index);
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else { return };
                let data = truncate_log(message);
                let result = Self::call::<wire::SendLog>(
                    &inner,
                    SendLogInputs {
                        transaction_id,
                        data,
                        index: Some(index.fetch_add(1, Ordering::SeqCst)),
                        timestamp: Some(Utc::now().timestamp_millis()),
                    },
                )
                .await;
                if let Err(err) = result {
                    error!(error = %err, "failed sending log line");
                }
            })
        })
    }

    fn redirector(inner: &Arc<Self>, transaction_id: &str) -> crate::context::Redirector {
        let weak = Arc::downgrade(inner);
        let transaction_id = transaction_id.to_owned();
        Arc::new(move |target: RedirectTarget| {
            let weak = weak.clone();
            let transaction_id = transaction_id.clone();
            Box::pin(async move {
                let inner = weak.upgrade().ok_or_else(|| anyhow::anyhow!("host gone"))?;
                let mut inputs = SendRedirectInputs {
                    transaction_id,
                    url: None,
                    route: None,
                    params: None,
                };
                match target {
                    RedirectTarget::Url(url) => inputs.url = Some(url),
                    RedirectTarget::Route { slug, params } => {
                        inputs.route = Some(slug);
                        inputs.params = params;
                    }
                }
                let accepted = Self::call::<wire::SendRedirect>(&inner, inputs).await?;
                if !accepted {
                    anyhow::bail!("failed sending redirect");
                }
                Ok(())
            })
        })
    }

    fn notifier(inner: &Arc<Self>, transaction_id: &str) -> crate::context::Notifier {
        let weak = Arc::downgrade(inner);
        let transaction_id = transaction_id.to_owned();
        Arc::new(move |message: String, options: NotifyOptions| {
            let weak = weak.clone();
            let transaction_id = transaction_id.clone();
            Box::pin(async move {
                let inner = weak.upgrade().ok_or_else(|| anyhow::anyhow!("host gone"))?;
                Self::notify(&inner, Some(transaction_id), message, options).await?;
                Ok(())
            })
        })
    }

    /// Deliver a notification, warning when a development key cannot
    /// notify outside a transaction.
    async fn notify(
        inner: &Arc<Self>,
        transaction_id: Option<String>,
        message: String,
        options: NotifyOptions,
    ) -> Result<(), ApiError> {
        if transaction_id.is_none() {
            let environment = lock_or_poisoned(&inner.environment).clone();
            let development = match environment {
                Some(Environment::Development) => true,
                Some(Environment::Live) => false,
                None => !inner.config.is_live_key(),
            };
            if development {
                warn!(
                    "calls to notify() outside of a transaction have no effect with a \
                     development key; please use a live key to send notifications"
                );
            }
        }

        inner
            .api
            .notify(NotifyInputs {
                message,
                title: options.title,
                transaction_id,
                idempotency_key: options.idempotency_key,
                delivery_instructions: options.delivery,
                created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .await
    }
}

/// Issue pings on an interval and close a silently dead connection so the
/// reconnect loop takes over.
async fn ping_monitor(weak: std::sync::Weak<HostInner>) {
    let mut last_response = Instant::now();
    loop {
        let Some(inner) = weak.upgrade() else { return };
        let interval = inner.config.ping_interval();
        let deadline = inner.config.close_unresponsive_connection_timeout();
        drop(inner);
        sleep(interval).await;

        let Some(inner) = weak.upgrade() else { return };
        if inner.intentionally_closed.load(Ordering::SeqCst) {
            return;
        }
        let socket = lock_or_poisoned(&inner.socket).clone();
        let Some(socket) = socket else { continue };
        match socket.ping().await {
            Ok(()) => last_response = Instant::now(),
            Err(err) => {
                debug!(error = %err, "ping failed");
                if last_response.elapsed() >= deadline {
                    warn!("connection unresponsive, closing to force a reconnect");
                    socket.close().await;
                    last_response = Instant::now();
                }
            }
        }
    }
}

fn decode_params(params: &serde_json::Value, meta: Option<&serde_json::Value>) -> Payload {
    match payload::decode(params, meta) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(error = %err, "failed decoding params");
            Payload::Null
        }
    }
}

fn loading_inputs(transaction_id: String, state: LoadingState) -> SendLoadingCallInputs {
    SendLoadingCallInputs {
        transaction_id,
        title: state.title,
        description: state.description,
        items_in_queue: state.items_in_queue,
        items_completed: state.items_completed,
    }
}

fn truncate_log(message: String) -> String {
    if message.chars().count() <= MAX_LOG_LENGTH {
        return message;
    }
    let head: String = message.chars().take(MAX_LOG_LENGTH).collect();
    format!(
        "{head}...\n^ Warning: 10k logline character limit reached.\nTo avoid this error, \
         try separating your data into multiple log calls."
    )
}

fn error_class(err: &anyhow::Error) -> &'static str {
    if err.downcast_ref::<IoError>().is_some() {
        "IOError"
    } else {
        "Error"
    }
}

fn log_sdk_alert(alert: &SdkAlert) {
    let message = alert.message.clone().unwrap_or_else(|| {
        format!(
            "a newer SDK version is expected (minimum {})",
            alert.min_sdk_version
        )
    });
    match alert.severity {
        AlertSeverity::Info => info!("{message}"),
        AlertSeverity::Warning => warn!("{message}"),
        AlertSeverity::Error => error!("{message}"),
    }
}

fn header_value(value: &str) -> Option<HeaderValue> { HeaderValue::from_str(value).ok() }

fn lock_or_poisoned<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
