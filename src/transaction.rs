//! The per-invocation interaction engine.
//!
//! A transaction is one invocation of an action, identified by a
//! server-minted id. Its engine is the [`IoClient`]: handlers submit render
//! batches of components, the dashboard answers with returns, state updates,
//! or a cancellation, and the client correlates those answers to the batch
//! in flight, runs validation, and resolves each component's value.

pub mod client;
pub mod loading;
pub mod render;

pub use client::{GroupValidator, IoClient, RenderSender};
pub use loading::{LoadingOptions, LoadingState, TransactionLoadingState};
pub use render::{
    ButtonConfig,
    ButtonTheme,
    IoRender,
    IoResponse,
    IoResponseKind,
    RenderKind,
};

/// Distinguished failure kinds a handler may observe from IO operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorKind {
    /// The server cancelled the interaction.
    Canceled,
    /// IO was attempted after the transaction reached a terminal state.
    TransactionClosed,
    /// A response could not be parsed into the expected value.
    InvalidResponse,
}

/// Failure of an IO operation within a transaction.
#[derive(Debug, Clone)]
pub struct IoError {
    /// Failure category.
    pub kind: IoErrorKind,
    /// Optional detail.
    pub message: Option<String>,
}

impl std::error::Error for IoError {}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            IoErrorKind::Canceled => "CANCELED",
            IoErrorKind::TransactionClosed => "TRANSACTION_CLOSED",
            IoErrorKind::InvalidResponse => "INVALID_RESPONSE",
        };
        match &self.message {
            Some(message) => write!(f, "{kind}: {message}"),
            None => write!(f, "{kind}"),
        }
    }
}

impl IoError {
    /// The server cancelled the interaction.
    #[must_use]
    pub const fn canceled() -> Self {
        Self {
            kind: IoErrorKind::Canceled,
            message: None,
        }
    }

    /// IO attempted after the transaction ended.
    #[must_use]
    pub const fn transaction_closed() -> Self {
        Self {
            kind: IoErrorKind::TransactionClosed,
            message: None,
        }
    }

    /// A response failed to parse.
    #[must_use]
    pub fn invalid_response(detail: impl Into<String>) -> Self {
        Self {
            kind: IoErrorKind::InvalidResponse,
            message: Some(detail.into()),
        }
    }
}
