//! Per-transaction progress side channel.
//!
//! Handlers describe long-running work with a title, a description, and an
//! optional item counter. Every mutation transmits the full state through
//! `SEND_LOADING_CALL`; delivery failures are logged, never raised, so
//! progress reporting can never break a handler.

use std::sync::{Arc, Mutex as StdMutex};

use futures_util::future::BoxFuture;
use tracing::warn;

/// The progress state displayed alongside a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadingState {
    /// Headline describing the work.
    pub title: Option<String>,
    /// Supporting detail.
    pub description: Option<String>,
    /// Total queued items, when enumerable.
    pub items_in_queue: Option<u64>,
    /// Items completed so far.
    pub items_completed: Option<u64>,
}

/// Fields accepted by [`TransactionLoadingState::start`] and
/// [`TransactionLoadingState::update`].
#[derive(Debug, Clone, Default)]
pub struct LoadingOptions {
    /// Headline describing the work.
    pub title: Option<String>,
    /// Supporting detail.
    pub description: Option<String>,
    /// Total queued items, when enumerable.
    pub items_in_queue: Option<u64>,
}

impl LoadingOptions {
    /// Options carrying only a title.
    #[must_use]
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }
}

/// Delivers one loading state to the dashboard.
pub type LoadingSender =
    Arc<dyn Fn(LoadingState) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handle through which a handler reports progress.
#[derive(Clone)]
pub struct TransactionLoadingState {
    sender: LoadingSender,
    state: Arc<StdMutex<Option<LoadingState>>>,
}

impl TransactionLoadingState {
    /// Build a handle that transmits through `sender`.
    #[must_use]
    pub fn new(sender: LoadingSender) -> Self {
        Self {
            sender,
            state: Arc::new(StdMutex::new(None)),
        }
    }

    /// Snapshot of the current state, when any has been sent.
    #[must_use]
    pub fn state(&self) -> Option<LoadingState> { lock_or_poisoned(&self.state).clone() }

    /// Reset the state and transmit it.
    ///
    /// Setting `items_in_queue` also resets `items_completed` to zero.
    pub async fn start(&self, options: LoadingOptions) {
        {
            let mut state = lock_or_poisoned(&self.state);
            let mut fresh = LoadingState {
                title: options.title,
                description: options.description,
                items_in_queue: options.items_in_queue,
                items_completed: None,
            };
            if fresh.items_in_queue.is_some() {
                fresh.items_completed = Some(0);
            }
            *state = Some(fresh);
        }
        self.send_state().await;
    }

    /// Merge the given fields into the state and transmit it.
    ///
    /// Calling before [`TransactionLoadingState::start`] promotes to a
    /// start.
    pub async fn update(&self, options: LoadingOptions) {
        let started = lock_or_poisoned(&self.state).is_some();
        if !started {
            warn!("loading.update called before loading.start");
            self.start(options).await;
            return;
        }

        {
            let mut state = lock_or_poisoned(&self.state);
            if let Some(state) = state.as_mut() {
                if let Some(title) = options.title {
                    state.title = Some(title);
                }
                if let Some(description) = options.description {
                    state.description = Some(description);
                }
                if let Some(items_in_queue) = options.items_in_queue {
                    state.items_in_queue = Some(items_in_queue);
                    if state.items_completed.is_none() {
                        state.items_completed = Some(0);
                    }
                }
            }
        }
        self.send_state().await;
    }

    /// Increment the completed-item counter and transmit the state.
    ///
    /// Without a queue size this is a no-op beyond a warning.
    pub async fn complete_one(&self) {
        {
            let mut state = lock_or_poisoned(&self.state);
            let Some(state) = state.as_mut().filter(|s| s.items_in_queue.is_some()) else {
                warn!(
                    "loading.complete_one called without items_in_queue, nothing to complete"
                );
                return;
            };
            state.items_completed = Some(state.items_completed.unwrap_or(0) + 1);
        }
        self.send_state().await;
    }

    async fn send_state(&self) {
        let state = lock_or_poisoned(&self.state).clone().unwrap_or_default();
        if let Err(err) = (self.sender)(state).await {
            warn!(error = %err, "failed sending loading state");
        }
    }
}

fn lock_or_poisoned<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn capture_sender() -> (LoadingSender, mpsc::UnboundedReceiver<LoadingState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender: LoadingSender = Arc::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send(state).map_err(|_| anyhow::anyhow!("loading channel closed"))?;
                Ok(())
            })
        });
        (sender, rx)
    }

    #[tokio::test]
    async fn start_with_queue_resets_completed() {
        let (sender, mut sent) = capture_sender();
        let loading = TransactionLoadingState::new(sender);

        loading
            .start(LoadingOptions {
                title: Some("Importing".to_owned()),
                items_in_queue: Some(3),
                ..LoadingOptions::default()
            })
            .await;

        let state = sent.recv().await.unwrap();
        assert_eq!(state.title.as_deref(), Some("Importing"));
        assert_eq!(state.items_in_queue, Some(3));
        assert_eq!(state.items_completed, Some(0));
    }

    #[tokio::test]
    async fn bare_update_transmits_the_same_state_as_start() {
        let (sender, mut sent) = capture_sender();
        let loading = TransactionLoadingState::new(sender);

        loading.start(LoadingOptions::title("Working")).await;
        let after_start = sent.recv().await.unwrap();

        loading.update(LoadingOptions::default()).await;
        let after_update = sent.recv().await.unwrap();
        assert_eq!(after_start, after_update);
    }

    #[tokio::test]
    async fn update_before_start_promotes_to_start() {
        let (sender, mut sent) = capture_sender();
        let loading = TransactionLoadingState::new(sender);

        loading
            .update(LoadingOptions {
                items_in_queue: Some(2),
                ..LoadingOptions::default()
            })
            .await;
        let state = sent.recv().await.unwrap();
        assert_eq!(state.items_in_queue, Some(2));
        assert_eq!(state.items_completed, Some(0));
    }

    #[tokio::test]
    async fn complete_one_counts_up() {
        let (sender, mut sent) = capture_sender();
        let loading = TransactionLoadingState::new(sender);

        loading
            .start(LoadingOptions {
                items_in_queue: Some(2),
                ..LoadingOptions::default()
            })
            .await;
        let _ = sent.recv().await;

        loading.complete_one().await;
        loading.complete_one().await;
        assert_eq!(sent.recv().await.unwrap().items_completed, Some(1));
        assert_eq!(sent.recv().await.unwrap().items_completed, Some(2));
    }

    #[tokio::test]
    async fn complete_one_without_queue_is_a_no_op() {
        let (sender, mut sent) = capture_sender();
        let loading = TransactionLoadingState::new(sender);

        loading.start(LoadingOptions::title("Working")).await;
        let _ = sent.recv().await;

        loading.complete_one().await;
        assert!(sent.try_recv().is_err());
    }
}
