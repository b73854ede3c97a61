//! The page engine: concurrent layout evaluation and snapshot delivery.
//!
//! A layout's title, description, menu items, and children resolve
//! independently. Each completion updates a mutex-protected snapshot and
//! marks it dirty; a single in-flight sender drains dirtiness into
//! `SEND_PAGE` calls, so the dashboard always converges on the latest
//! snapshot without overlapping sends. Failures of individual layout parts
//! are captured per layout key and shipped inside the snapshot rather than
//! aborting the page.

use std::{
    sync::{
        Arc,
        Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    component::Component,
    context::PageContext,
    routes::PageHandler,
    transaction::{ButtonTheme, IoClient, IoRender, RenderSender},
};

/// How many times one snapshot delivery is attempted before the page fails.
const MAX_SEND_PAGE_RETRIES: u32 = 5;

/// A string that may be available now or only eventually.
pub enum EventualString {
    /// Already resolved.
    Value(String),
    /// Resolves (or fails) later.
    Pending(BoxFuture<'static, anyhow::Result<String>>),
}

impl EventualString {
    /// Wrap a future resolving to the string.
    #[must_use]
    pub fn pending<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        Self::Pending(Box::pin(future))
    }
}

impl From<&str> for EventualString {
    fn from(value: &str) -> Self { Self::Value(value.to_owned()) }
}

impl From<String> for EventualString {
    fn from(value: String) -> Self { Self::Value(value) }
}

impl std::fmt::Debug for EventualString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Pending(_) => f.debug_tuple("Pending").field(&"..").finish(),
        }
    }
}

/// A menu entry shown alongside the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonItem {
    /// Button label.
    pub label: String,
    /// Route slug target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Absolute URL target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Params handed to the target route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Visual emphasis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<ButtonTheme>,
}

/// The layout a page handler returns.
#[derive(Debug, Default)]
pub struct Layout {
    /// Page title; literal or eventual.
    pub title: Option<EventualString>,
    /// Page description; literal or eventual.
    pub description: Option<EventualString>,
    /// Components rendered as the page body.
    pub children: Option<Vec<Component>>,
    /// Menu entries.
    pub menu_items: Option<Vec<ButtonItem>>,
}

/// One captured failure of a layout part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageError {
    /// Which part failed: `title`, `description`, `children`, `menuItems`.
    pub layout_key: String,
    /// Error class, as far as one exists.
    pub error: String,
    /// Human-readable failure detail.
    pub message: String,
}

impl PageError {
    fn new(layout_key: &str, err: &anyhow::Error) -> Self {
        Self {
            layout_key: layout_key.to_owned(),
            error: "Error".to_owned(),
            message: err.to_string(),
        }
    }
}

/// The snapshot wire form: a basic layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicLayout {
    /// Layout discriminator, always `BASIC`.
    pub kind: String,
    /// Resolved title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Resolved description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Last children render batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<IoRender>,
    /// Menu entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu_items: Option<Vec<ButtonItem>>,
    /// Captured per-layout-key failures.
    #[serde(default)]
    pub errors: Vec<PageError>,
}

/// Delivers one serialised snapshot; resolves to the server's accept flag.
pub(crate) type PageSender =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

#[derive(Default)]
struct Snapshot {
    title: Option<String>,
    description: Option<String>,
    menu_items: Option<Vec<ButtonItem>>,
    children: Option<IoRender>,
    errors: Vec<PageError>,
}

impl Snapshot {
    fn compose(&self) -> BasicLayout {
        BasicLayout {
            kind: "BASIC".to_owned(),
            title: self.title.clone(),
            description: self.description.clone(),
            children: self.children.clone(),
            menu_items: self.menu_items.clone(),
            errors: self.errors.clone(),
        }
    }
}

struct SessionShared {
    snapshot: StdMutex<Snapshot>,
    dirty: AtomicBool,
    in_flight: AtomicBool,
    sender: PageSender,
    retry_interval: Duration,
    cancel: CancellationToken,
}

impl SessionShared {
    /// Mark the snapshot dirty and make sure exactly one sender drains it.
    fn schedule_send(self: &Arc<Self>) {
        self.dirty.store(true, Ordering::SeqCst);
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                shared.dirty.store(false, Ordering::SeqCst);
                shared.send_once().await;
                if !shared.dirty.load(Ordering::SeqCst) {
                    break;
                }
            }
            shared.in_flight.store(false, Ordering::SeqCst);
            // a dirtying that slipped in as the loop exited restarts it
            if shared.dirty.load(Ordering::SeqCst) {
                shared.schedule_send();
            }
        });
    }

    async fn send_once(&self) {
        let layout = lock_or_poisoned(&self.snapshot).compose();
        let serialised = match serde_json::to_string(&layout) {
            Ok(serialised) => serialised,
            Err(err) => {
                error!(error = %err, "failed serialising page layout");
                return;
            }
        };
        for attempt in 1..=MAX_SEND_PAGE_RETRIES {
            if self.cancel.is_cancelled() {
                return;
            }
            match (self.sender)(serialised.clone()).await {
                Ok(_) => return,
                Err(err) => {
                    debug!(error = %err, attempt, "failed sending page");
                    sleep(self.retry_interval).await;
                }
            }
        }
        error!("unsuccessful sending page, max retries exceeded");
    }

    fn record_error(self: &Arc<Self>, layout_key: &str, err: &anyhow::Error) {
        lock_or_poisoned(&self.snapshot)
            .errors
            .push(PageError::new(layout_key, err));
        self.schedule_send();
    }
}

/// One open page view, keyed by the server-minted page key.
pub(crate) struct PageSession {
    pub(crate) client: IoClient,
    cancel: CancellationToken,
}

impl PageSession {
    /// Cancel the root task and all children.
    pub(crate) fn close(&self) { self.cancel.cancel(); }
}

/// Spawn the page session: run the handler and drive its layout parts.
pub(crate) fn open_page_session(
    handler: PageHandler,
    ctx: PageContext,
    sender: PageSender,
    retry_interval: Duration,
) -> PageSession {
    let cancel = CancellationToken::new();
    let shared = Arc::new(SessionShared {
        snapshot: StdMutex::new(Snapshot::default()),
        dirty: AtomicBool::new(false),
        in_flight: AtomicBool::new(false),
        sender,
        retry_interval,
        cancel: cancel.clone(),
    });

    let render_sender: RenderSender = {
        let shared = Arc::clone(&shared);
        Arc::new(move |render| {
            let shared = Arc::clone(&shared);
            Box::pin(async move {
                lock_or_poisoned(&shared.snapshot).children = Some(render);
                shared.schedule_send();
                Ok(())
            })
        })
    };
    let client = IoClient::new(render_sender);

    {
        let shared = Arc::clone(&shared);
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = run_page(shared, client, handler, ctx) => {}
            }
        });
    }

    PageSession { client, cancel }
}

async fn run_page(
    shared: Arc<SessionShared>,
    client: IoClient,
    handler: PageHandler,
    ctx: PageContext,
) {
    let layout = match handler(client.clone(), ctx).await {
        Ok(layout) => layout,
        Err(err) => {
            warn!(error = %err, "page handler failed");
            shared.record_error("children", &err);
            return;
        }
    };

    match layout.title {
        Some(EventualString::Value(title)) => {
            lock_or_poisoned(&shared.snapshot).title = Some(title);
        }
        Some(EventualString::Pending(future)) => {
            spawn_eventual(&shared, "title", future, |snapshot, value| {
                snapshot.title = Some(value);
            });
        }
        None => {}
    }

    match layout.description {
        Some(EventualString::Value(description)) => {
            lock_or_poisoned(&shared.snapshot).description = Some(description);
        }
        Some(EventualString::Pending(future)) => {
            spawn_eventual(&shared, "description", future, |snapshot, value| {
                snapshot.description = Some(value);
            });
        }
        None => {}
    }

    if let Some(menu_items) = layout.menu_items {
        lock_or_poisoned(&shared.snapshot).menu_items = Some(menu_items);
    }

    shared.schedule_send();

    if let Some(children) = layout.children {
        let shared = Arc::clone(&shared);
        let cancel = shared.cancel.clone();
        tokio::spawn(async move {
            let render = client.render_components(children, None, None);
            tokio::select! {
                () = cancel.cancelled() => {}
                result = render => match result {
                    Ok(_) => debug!("page children returned"),
                    Err(err) => {
                        shared.record_error("children", &anyhow::Error::new(err));
                    }
                }
            }
        });
    }
}

fn spawn_eventual(
    shared: &Arc<SessionShared>,
    layout_key: &'static str,
    future: BoxFuture<'static, anyhow::Result<String>>,
    apply: impl FnOnce(&mut Snapshot, String) + Send + 'static,
) {
    let shared = Arc::clone(shared);
    let cancel = shared.cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {}
            result = future => {
                match result {
                    Ok(value) => {
                        apply(&mut lock_or_poisoned(&shared.snapshot), value);
                        shared.schedule_send();
                    }
                    Err(err) => shared.record_error(layout_key, &err),
                }
            }
        }
    });
}

fn lock_or_poisoned<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        component::MethodName,
        payload::Payload,
        wire::{ContextUser, Environment, OrganizationDef, PageInfo},
    };

    fn page_ctx() -> PageContext {
        PageContext {
            user: ContextUser {
                email: "op@example.com".to_owned(),
                first_name: None,
                last_name: None,
            },
            params: Payload::Null,
            environment: Environment::Development,
            organization: OrganizationDef {
                name: "Acme".to_owned(),
                slug: "acme".to_owned(),
            },
            page: PageInfo {
                slug: "dash".to_owned(),
            },
        }
    }

    fn capture_sender() -> (PageSender, mpsc::UnboundedReceiver<BasicLayout>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender: PageSender = Arc::new(move |serialised: String| {
            let tx = tx.clone();
            Box::pin(async move {
                let layout: BasicLayout = serde_json::from_str(&serialised)?;
                tx.send(layout).map_err(|_| anyhow::anyhow!("page channel closed"))?;
                Ok(true)
            })
        });
        (sender, rx)
    }

    async fn recv_until<F>(rx: &mut mpsc::UnboundedReceiver<BasicLayout>, predicate: F) -> BasicLayout
    where
        F: Fn(&BasicLayout) -> bool,
    {
        loop {
            let layout = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out awaiting page snapshot")
                .expect("page channel closed");
            if predicate(&layout) {
                return layout;
            }
        }
    }

    #[tokio::test]
    async fn literal_title_and_children_reach_one_snapshot() {
        let (sender, mut snapshots) = capture_sender();
        let handler: PageHandler = Arc::new(|_io, _ctx| {
            Box::pin(async move {
                Ok(Layout {
                    title: Some("Users".into()),
                    children: Some(vec![Component::new(
                        MethodName::DisplayTable,
                        "All users",
                        Payload::Object(std::collections::BTreeMap::new()),
                    )]),
                    ..Layout::default()
                })
            })
        });

        let session = open_page_session(
            handler,
            page_ctx(),
            sender,
            Duration::from_millis(10),
        );

        let snapshot = recv_until(&mut snapshots, |layout| {
            layout.title.is_some() && layout.children.is_some()
        })
        .await;
        assert_eq!(snapshot.kind, "BASIC");
        assert_eq!(snapshot.title.as_deref(), Some("Users"));
        let children = snapshot.children.unwrap();
        assert_eq!(children.to_render.len(), 1);
        assert!(snapshot.errors.is_empty());

        session.close();
    }

    #[tokio::test]
    async fn failing_description_is_captured_per_layout_key() {
        let (sender, mut snapshots) = capture_sender();
        let handler: PageHandler = Arc::new(|_io, _ctx| {
            Box::pin(async move {
                Ok(Layout {
                    title: Some("Users".into()),
                    description: Some(EventualString::pending(async {
                        anyhow::bail!("description exploded")
                    })),
                    ..Layout::default()
                })
            })
        });

        let session = open_page_session(
            handler,
            page_ctx(),
            sender,
            Duration::from_millis(10),
        );

        let snapshot = recv_until(&mut snapshots, |layout| !layout.errors.is_empty()).await;
        assert_eq!(snapshot.errors.len(), 1);
        assert_eq!(snapshot.errors[0].layout_key, "description");
        assert!(snapshot.errors[0].message.contains("description exploded"));
        assert_eq!(snapshot.title.as_deref(), Some("Users"));

        session.close();
    }

    #[tokio::test]
    async fn menu_items_serialise_camel_case() {
        let item = ButtonItem {
            label: "New user".to_owned(),
            route: Some("users/create".to_owned()),
            url: None,
            params: Some(json!({ "role": "admin" })),
            theme: Some(ButtonTheme::Primary),
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(
            value,
            json!({
                "label": "New user",
                "route": "users/create",
                "params": { "role": "admin" },
                "theme": "primary",
            })
        );
    }
}
