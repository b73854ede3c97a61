//! Contexts handed to user handlers.
//!
//! An [`ActionContext`] carries everything a handler may want besides its
//! IO operations: the invoking operator, deserialised params, environment
//! and organisation, plus the `log`, `redirect`, `notify`, and `loading`
//! helpers wired back into the host. A [`PageContext`] is the read-only
//! counterpart for layout handlers.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::{
    payload::Payload,
    transaction::TransactionLoadingState,
    wire::{
        ActionInfo,
        ContextUser,
        DeliveryInstruction,
        Environment,
        OrganizationDef,
        PageInfo,
    },
};

/// Where a redirect should take the operator.
#[derive(Debug, Clone)]
pub enum RedirectTarget {
    /// An absolute URL.
    Url(String),
    /// Another route, with optional params.
    Route {
        /// Fully qualified slug.
        slug: String,
        /// Params handed to the target.
        params: Option<Value>,
    },
}

/// Options accepted by [`ActionContext::notify`].
#[derive(Debug, Clone, Default)]
pub struct NotifyOptions {
    /// Optional title line.
    pub title: Option<String>,
    /// Explicit delivery targets.
    pub delivery: Option<Vec<DeliveryInstruction>>,
    /// Deduplication key.
    pub idempotency_key: Option<String>,
}

pub(crate) type LogSender = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type Redirector =
    Arc<dyn Fn(RedirectTarget) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub(crate) type Notifier =
    Arc<dyn Fn(String, NotifyOptions) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Everything a running action handler knows about its invocation.
#[derive(Clone)]
pub struct ActionContext {
    /// The operator driving the invocation.
    pub user: ContextUser,
    /// Invocation params with dates revived.
    pub params: Payload,
    /// Environment of the invocation.
    pub environment: Environment,
    /// Organisation that owns the catalogue.
    pub organization: OrganizationDef,
    /// The action being invoked.
    pub action: ActionInfo,
    /// Progress side channel for this transaction.
    pub loading: TransactionLoadingState,
    pub(crate) log_sender: LogSender,
    pub(crate) redirector: Redirector,
    pub(crate) notifier: Notifier,
}

impl ActionContext {
    /// Append a log line to the transaction, visible on the dashboard.
    pub async fn log(&self, message: impl Into<String> + Send) {
        (self.log_sender)(message.into()).await;
    }

    /// Redirect the operator viewing this transaction.
    ///
    /// # Errors
    /// Fails when the server refuses the redirect.
    pub async fn redirect(&self, target: RedirectTarget) -> anyhow::Result<()> {
        (self.redirector)(target).await
    }

    /// Send a notification tied to this transaction.
    ///
    /// # Errors
    /// Fails when the notification cannot be delivered to the server.
    pub async fn notify(
        &self,
        message: impl Into<String> + Send,
        options: NotifyOptions,
    ) -> anyhow::Result<()> {
        (self.notifier)(message.into(), options).await
    }
}

impl std::fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContext")
            .field("user", &self.user)
            .field("environment", &self.environment)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// Everything a layout handler knows about its page view.
#[derive(Debug, Clone)]
pub struct PageContext {
    /// The operator viewing the page.
    pub user: ContextUser,
    /// View params with dates revived.
    pub params: Payload,
    /// Environment of the view.
    pub environment: Environment,
    /// Organisation that owns the catalogue.
    pub organization: OrganizationDef,
    /// The page being viewed.
    pub page: PageInfo,
}
