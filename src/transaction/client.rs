//! The render/response engine shared by transactions and page sessions.
//!
//! `render_components` submits one batch under a fresh input group key and
//! suspends until every component in the batch has a value. Responses
//! carrying any other key are stale leftovers from an earlier batch and are
//! ignored. A `CANCELED` response poisons the client permanently; later IO
//! attempts fail with `TRANSACTION_CLOSED`.

use std::sync::{
    Arc,
    Mutex as StdMutex,
    atomic::{AtomicBool, Ordering},
};

use futures_util::future::{BoxFuture, join_all};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{
    IoError,
    render::{ButtonConfig, IoRender, IoResponse, IoResponseKind, RenderKind},
};
use crate::{
    component::Component,
    payload::{self, Payload},
};

/// Delivers a serialised render batch to the dashboard.
pub type RenderSender =
    Arc<dyn Fn(IoRender) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Validator over the whole group's parsed values.
pub type GroupValidator =
    Arc<dyn Fn(Vec<Payload>) -> BoxFuture<'static, Option<String>> + Send + Sync>;

struct RenderGroup {
    key: Uuid,
    components: Vec<Arc<Component>>,
    continue_button: Option<ButtonConfig>,
    validator: Option<GroupValidator>,
    validation_error_message: StdMutex<Option<String>>,
    returned: AtomicBool,
    slots: StdMutex<Vec<Option<oneshot::Sender<Result<Payload, IoError>>>>>,
    send: RenderSender,
}

impl RenderGroup {
    /// Send the current batch on its own task; delivery may outlive the
    /// caller when the transport is awaiting a reconnect.
    fn spawn_render(self: &Arc<Self>) {
        let group = Arc::clone(self);
        tokio::spawn(async move {
            let batch = IoRender {
                id: Uuid::new_v4(),
                input_group_key: group.key,
                to_render: group.components.iter().map(|c| c.render_info()).collect(),
                kind: RenderKind::Render,
                validation_error_message: lock_or_poisoned(&group.validation_error_message)
                    .clone(),
                continue_button: group.continue_button.clone(),
            };
            if let Err(err) = (group.send)(batch).await {
                warn!(error = %err, "failed sending render batch");
            }
        });
    }

    fn resolve(&self, index: usize, result: Result<Payload, IoError>) {
        let sender = lock_or_poisoned(&self.slots)
            .get_mut(index)
            .and_then(Option::take);
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }

    fn fail_all(&self, err: &IoError) {
        let senders: Vec<_> = lock_or_poisoned(&self.slots)
            .iter_mut()
            .map(Option::take)
            .collect();
        for sender in senders.into_iter().flatten() {
            let _ = sender.send(Err(err.clone()));
        }
    }
}

struct ClientInner {
    send: RenderSender,
    canceled: AtomicBool,
    group: StdMutex<Option<Arc<RenderGroup>>>,
}

/// The engine driving renders and responses for one transaction or page.
#[derive(Clone)]
pub struct IoClient {
    inner: Arc<ClientInner>,
}

impl IoClient {
    /// Build a client that delivers batches through `send`.
    #[must_use]
    pub fn new(send: RenderSender) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                send,
                canceled: AtomicBool::new(false),
                group: StdMutex::new(None),
            }),
        }
    }

    /// True once the server has cancelled the interaction.
    #[must_use]
    pub fn is_canceled(&self) -> bool { self.inner.canceled.load(Ordering::SeqCst) }

    /// Render a batch of components and wait for all of their values.
    ///
    /// A fresh input group key scopes this batch; responses for earlier
    /// batches are ignored. Validation failures re-render with messages and
    /// keep waiting; the call completes only when the dashboard submits a
    /// fully valid `RETURN` or cancels.
    ///
    /// # Errors
    /// Fails with `TRANSACTION_CLOSED` when the client is already
    /// terminated, `CANCELED` when the server cancels mid-flight, and an
    /// invalid-response error when a final value cannot be parsed.
    pub async fn render_components(
        &self,
        components: Vec<Component>,
        group_validator: Option<GroupValidator>,
        continue_button: Option<ButtonConfig>,
    ) -> Result<Vec<Payload>, IoError> {
        if self.is_canceled() {
            return Err(IoError::transaction_closed());
        }

        if components.len() > 1 {
            for component in &components {
                if component.method().def().exclusive {
                    warn!(
                        method = ?component.method(),
                        "exclusive component rendered in a multi-component group"
                    );
                }
            }
        }

        let components: Vec<Arc<Component>> = components.into_iter().map(Arc::new).collect();
        let mut slots = Vec::with_capacity(components.len());
        let mut receivers = Vec::with_capacity(components.len());
        for _ in &components {
            let (tx, rx) = oneshot::channel();
            slots.push(Some(tx));
            receivers.push(rx);
        }

        let group = Arc::new(RenderGroup {
            key: Uuid::new_v4(),
            components: components.clone(),
            continue_button,
            validator: group_validator,
            validation_error_message: StdMutex::new(None),
            returned: AtomicBool::new(false),
            slots: StdMutex::new(slots),
            send: Arc::clone(&self.inner.send),
        });
        *lock_or_poisoned(&self.inner.group) = Some(Arc::clone(&group));

        group.spawn_render();

        for (index, component) in components.iter().enumerate() {
            if component.resolves_immediately() {
                group.resolve(index, Ok(Payload::Null));
            }
        }

        let mut values = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            match receiver.await {
                Ok(Ok(value)) => values.push(value),
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(IoError::transaction_closed()),
            }
        }
        Ok(values)
    }

    /// Dispatch one `IO_RESPONSE` body into the batch in flight.
    pub async fn on_response(&self, response: IoResponse) {
        let group = lock_or_poisoned(&self.inner.group).clone();
        let Some(group) = group else {
            debug!("received response with no render in flight");
            return;
        };
        if response.input_group_key != Some(group.key) {
            debug!("received response for another input group");
            return;
        }
        if self.is_canceled() || group.returned.load(Ordering::SeqCst) {
            debug!("received response after IO call complete");
            return;
        }

        match response.kind {
            IoResponseKind::Canceled => {
                self.inner.canceled.store(true, Ordering::SeqCst);
                group.fail_all(&IoError::canceled());
            }
            IoResponseKind::SetState => {
                if response.values.len() != group.components.len() {
                    error!(
                        expected = group.components.len(),
                        received = response.values.len(),
                        "mismatched state array length"
                    );
                    return;
                }
                for (component, value) in group.components.iter().zip(&response.values) {
                    let state = match payload::decode(value, None) {
                        Ok(state) => state,
                        Err(err) => {
                            warn!(error = %err, "received unreadable state");
                            continue;
                        }
                    };
                    if let Err(err) = component.apply_state(state).await {
                        warn!(error = %err, "state-change handler failed");
                    }
                }
                group.spawn_render();
            }
            IoResponseKind::Return => {
                if response.values.len() != group.components.len() {
                    error!(
                        expected = group.components.len(),
                        received = response.values.len(),
                        "mismatched return array length"
                    );
                    return;
                }
                self.handle_return(&group, &response.values).await;
            }
        }
    }

    async fn handle_return(&self, group: &Arc<RenderGroup>, values: &[serde_json::Value]) {
        let checks = group
            .components
            .iter()
            .zip(values)
            .map(|(component, value)| component.handle_validation(value));
        let messages = join_all(checks).await;

        *lock_or_poisoned(&group.validation_error_message) = None;

        if messages.iter().any(Option::is_some) {
            group.spawn_render();
            return;
        }

        if let Some(validator) = &group.validator {
            let mut parsed = Vec::with_capacity(values.len());
            for (component, value) in group.components.iter().zip(values) {
                match component.parse_return_value(value) {
                    Ok(payload) => parsed.push(payload),
                    Err(err) => {
                        error!(error = %err, "return value failed parsing after validation");
                        return;
                    }
                }
            }
            if let Some(message) = validator(parsed).await {
                *lock_or_poisoned(&group.validation_error_message) = Some(message);
                group.spawn_render();
                return;
            }
        }

        group.returned.store(true, Ordering::SeqCst);
        for (index, (component, value)) in group.components.iter().zip(values).enumerate() {
            match component.parse_return_value(value) {
                Ok(payload) => group.resolve(index, Ok(payload)),
                Err(err) => {
                    error!(error = %err, "received unparseable return value");
                    group.resolve(index, Err(IoError::invalid_response(err.to_string())));
                }
            }
        }
    }
}

fn lock_or_poisoned<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
