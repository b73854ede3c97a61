//! Method catalogues and payload models for the duplex RPC wire.
//!
//! Field names are camelCase on the wire; discriminated unions use a `type`
//! tag. Each RPC method is a zero-sized marker implementing [`ServerMethod`]
//! (host calls server) or [`HostMethod`] (server calls host, handled here),
//! pairing the method name with its input and return schemas. The RPC layer
//! validates both directions by (de)serialising against these types.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Whether a duplex message initiates a call or answers one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    /// A request the receiving peer should dispatch to a handler.
    Call,
    /// The answer correlated to an earlier call by id.
    Response,
}

/// Envelope carried in the framed socket's `data` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplexMessage {
    /// Caller-assigned id; monotonically increasing per peer.
    pub id: String,
    /// Catalogue name, e.g. `SEND_IO_CALL`.
    pub method_name: String,
    /// Method inputs (for calls) or return value (for responses).
    pub data: Value,
    /// Call or response marker.
    pub kind: MessageKind,
}

/// A method this host may invoke on the server.
pub trait ServerMethod {
    /// Catalogue name on the wire.
    const NAME: &'static str;
    /// Input schema.
    type Inputs: Serialize + Send;
    /// Return schema.
    type Returns: DeserializeOwned + Send;
}

/// A method the server may invoke on this host.
pub trait HostMethod {
    /// Catalogue name on the wire.
    const NAME: &'static str;
    /// Input schema.
    type Inputs: DeserializeOwned + Send + 'static;
    /// Return schema.
    type Returns: Serialize + Send + 'static;
}

/// Environment a transaction or page runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Production environment backed by a live key.
    Live,
    /// Development environment.
    Development,
}

/// The organisation this host authenticated into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationDef {
    /// Display name.
    pub name: String,
    /// URL slug.
    pub slug: String,
}

/// The operator driving a transaction or viewing a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUser {
    /// Email address.
    pub email: String,
    /// Given name, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Family name, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

/// Identity of the action being invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInfo {
    /// Fully qualified slug, e.g. `billing/refund`.
    pub slug: String,
    /// Dashboard URL of the running invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Identity of the page being opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    /// Fully qualified slug.
    pub slug: String,
}

/// Who may see and run a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccessControl {
    /// A fixed policy keyword, currently `entire-organization`.
    Keyword(String),
    /// Restricted to the named teams.
    Teams {
        /// Team slugs granted access.
        teams: Vec<String>,
    },
}

impl AccessControl {
    /// Access for everyone in the organisation.
    #[must_use]
    pub fn entire_organization() -> Self { Self::Keyword("entire-organization".to_owned()) }
}

/// Severity of a server-issued SDK advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    /// Informational notice.
    Info,
    /// Upgrade recommended.
    Warning,
    /// Upgrade required.
    Error,
}

/// Server-originated advisory about the client library version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkAlert {
    /// Minimum version the server wants to see.
    pub min_sdk_version: String,
    /// How urgently the host should react.
    pub severity: AlertSeverity,
    /// Free-form advisory text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Flat action entry reported during initialisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    /// Slug of the enclosing page group, when nested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_slug: Option<String>,
    /// Leaf slug.
    pub slug: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Display description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the dashboard may run it without an attached client.
    pub backgroundable: bool,
    /// Hidden from the catalogue listing.
    pub unlisted: bool,
    /// Access policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessControl>,
}

/// Flat page (group) entry reported during initialisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDefinition {
    /// Fully qualified slug.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Display description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the page renders a layout of its own.
    pub has_handler: bool,
    /// Hidden from the catalogue listing.
    pub unlisted: bool,
    /// Access policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<AccessControl>,
}

/// `INITIALIZE_HOST` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeHostInputs {
    /// The configured API key.
    pub api_key: String,
    /// Library name, e.g. `interval-rs`.
    pub sdk_name: String,
    /// Library version.
    pub sdk_version: String,
    /// Every action the host currently exposes.
    pub actions: Vec<ActionDefinition>,
    /// Every page group the host currently exposes.
    pub groups: Vec<PageDefinition>,
}

/// `INITIALIZE_HOST` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InitializeHostReturns {
    /// The catalogue was accepted.
    #[serde(rename_all = "camelCase")]
    Success {
        /// Environment the key authenticated into.
        environment: Environment,
        /// Slugs rejected for invalid characters.
        invalid_slugs: Vec<String>,
        /// Owning organisation.
        organization: OrganizationDef,
        /// Dashboard address for the connected catalogue.
        dashboard_url: String,
        /// Optional version advisory.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdk_alert: Option<SdkAlert>,
        /// Human-readable warnings to surface to the operator.
        #[serde(default)]
        warnings: Vec<String>,
    },
    /// The host could not be initialised.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Why initialisation failed.
        message: String,
        /// Optional version advisory.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdk_alert: Option<SdkAlert>,
    },
}

/// `SEND_IO_CALL` inputs: one serialised render batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendIoCallInputs {
    /// Transaction being rendered.
    pub transaction_id: String,
    /// JSON-serialised render batch.
    pub io_call: String,
}

/// `SEND_LOADING_CALL` inputs: the transaction progress side channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendLoadingCallInputs {
    /// Transaction the progress belongs to.
    pub transaction_id: String,
    /// Progress title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Progress description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Total queued items, when enumerable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_in_queue: Option<u64>,
    /// Items completed so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_completed: Option<u64>,
}

/// `SEND_LOG` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendLogInputs {
    /// Transaction the log line belongs to.
    pub transaction_id: String,
    /// Log text.
    pub data: String,
    /// Position within the transaction's log stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// `SEND_REDIRECT` inputs: either `url` or `route` (+ params) is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRedirectInputs {
    /// Transaction requesting the redirect.
    pub transaction_id: String,
    /// Absolute URL target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Route slug target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// Params passed to the target route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// `SEND_PAGE` inputs: a serialised layout snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPageInputs {
    /// Page session being refreshed.
    pub page_key: String,
    /// JSON-serialised layout.
    pub page: String,
}

/// `MARK_TRANSACTION_COMPLETE` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkTransactionCompleteInputs {
    /// Transaction being finalised.
    pub transaction_id: String,
    /// JSON-serialised action result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Terminal status of an action invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionStatus {
    /// The handler returned a value.
    Success,
    /// The handler failed.
    Failure,
}

/// The result reported through `MARK_TRANSACTION_COMPLETE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    /// Result schema version.
    pub schema_version: u8,
    /// Terminal status.
    pub status: ActionStatus,
    /// The handler's return value, or `{error, message}` on failure.
    pub data: Value,
}

/// How a notification should reach its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryInstruction {
    /// Email address or channel handle.
    pub to: String,
    /// Delivery method; the server picks a default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<DeliveryMethod>,
}

/// Supported notification transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryMethod {
    /// Deliver by email.
    Email,
    /// Deliver to Slack.
    Slack,
}

/// `NOTIFY` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyInputs {
    /// Notification body.
    pub message: String,
    /// Optional title line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Transaction to attach the notification to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Deduplication key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Explicit delivery targets; organisation defaults apply when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_instructions: Option<Vec<DeliveryInstruction>>,
    /// Creation timestamp, ISO-8601.
    pub created_at: String,
}

/// `NOTIFY` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotifyReturns {
    /// Delivered to the server.
    Success {},
    /// Rejected by the server.
    Error {
        /// Why delivery failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// `ENQUEUE_ACTION` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueActionInputs {
    /// Slug of the action to queue.
    pub slug: String,
    /// Operator the invocation is assigned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Params handed to the handler when the invocation starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// `ENQUEUE_ACTION` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EnqueueActionReturns {
    /// The invocation was queued.
    Success {
        /// Queued invocation id.
        id: String,
    },
    /// The server refused to queue it.
    Error {
        /// Why queueing failed.
        message: String,
    },
}

/// `DEQUEUE_ACTION` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeueActionInputs {
    /// Queued invocation id.
    pub id: String,
}

/// `DEQUEUE_ACTION` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DequeueActionReturns {
    /// The invocation was removed from the queue.
    Success {
        /// Queued invocation id.
        id: String,
        /// Operator it was assigned to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
        /// Params it was queued with.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    /// The server refused to dequeue it.
    Error {
        /// Why dequeueing failed.
        message: String,
    },
}

/// `CONNECT_TO_TRANSACTION_AS_CLIENT` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectToTransactionAsClientInputs {
    /// Transaction to observe.
    pub transaction_id: String,
    /// Observer instance id.
    pub instance_id: String,
}

/// `RESPOND_TO_IO_CALL` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondToIoCallInputs {
    /// Transaction being answered.
    pub transaction_id: String,
    /// JSON-serialised IO response body.
    pub io_response: String,
}

/// `START_TRANSACTION` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionInputs {
    /// Server-minted transaction id.
    pub transaction_id: String,
    /// Action to invoke.
    pub action: ActionInfo,
    /// Environment of the invocation.
    pub environment: Environment,
    /// Operator driving the invocation.
    pub user: ContextUser,
    /// Invocation params as plain JSON.
    #[serde(default)]
    pub params: Value,
    /// Codec annotations for `params`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_meta: Option<Value>,
}

/// `IO_RESPONSE` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoResponseInputs {
    /// JSON-serialised IO response body.
    pub value: String,
    /// Transaction the response belongs to.
    pub transaction_id: String,
}

/// `OPEN_PAGE` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPageInputs {
    /// Server-minted page session key.
    pub page_key: String,
    /// Viewer's client id, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Page to open.
    pub page: PageInfo,
    /// Environment of the view.
    pub environment: Environment,
    /// Operator viewing the page.
    pub user: ContextUser,
    /// View params as plain JSON.
    #[serde(default)]
    pub params: Value,
    /// Codec annotations for `params`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_meta: Option<Value>,
}

/// `OPEN_PAGE` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OpenPageReturns {
    /// The page session is live.
    #[serde(rename = "SUCCESS", rename_all = "camelCase")]
    Success {
        /// Echoed page session key.
        page_key: String,
    },
    /// The page could not be opened.
    #[serde(rename = "ERROR")]
    Error {
        /// Why opening failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// `CLOSE_PAGE` inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePageInputs {
    /// Page session to tear down.
    pub page_key: String,
}

macro_rules! server_method {
    ($(#[$doc:meta])* $marker:ident, $name:literal, $inputs:ty, $returns:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $marker;

        impl ServerMethod for $marker {
            const NAME: &'static str = $name;
            type Inputs = $inputs;
            type Returns = $returns;
        }
    };
}

macro_rules! host_method {
    ($(#[$doc:meta])* $marker:ident, $name:literal, $inputs:ty, $returns:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $marker;

        impl HostMethod for $marker {
            const NAME: &'static str = $name;
            type Inputs = $inputs;
            type Returns = $returns;
        }
    };
}

server_method!(
    /// Register the route catalogue and authenticate the host.
    InitializeHost,
    "INITIALIZE_HOST",
    InitializeHostInputs,
    InitializeHostReturns
);
server_method!(
    /// Deliver a render batch for a transaction.
    SendIoCall,
    "SEND_IO_CALL",
    SendIoCallInputs,
    bool
);
server_method!(
    /// Deliver a loading-state update for a transaction.
    SendLoadingCall,
    "SEND_LOADING_CALL",
    SendLoadingCallInputs,
    bool
);
server_method!(
    /// Append a log line to a transaction.
    SendLog,
    "SEND_LOG",
    SendLogInputs,
    bool
);
server_method!(
    /// Redirect the operator viewing a transaction.
    SendRedirect,
    "SEND_REDIRECT",
    SendRedirectInputs,
    bool
);
server_method!(
    /// Deliver a layout snapshot for a page session.
    SendPage,
    "SEND_PAGE",
    SendPageInputs,
    bool
);
server_method!(
    /// Report the terminal result of a transaction.
    MarkTransactionComplete,
    "MARK_TRANSACTION_COMPLETE",
    MarkTransactionCompleteInputs,
    bool
);
server_method!(
    /// Send a notification through the organisation's channels.
    Notify,
    "NOTIFY",
    NotifyInputs,
    NotifyReturns
);
server_method!(
    /// Queue an action invocation for later execution.
    EnqueueAction,
    "ENQUEUE_ACTION",
    EnqueueActionInputs,
    EnqueueActionReturns
);
server_method!(
    /// Remove a queued invocation.
    DequeueAction,
    "DEQUEUE_ACTION",
    DequeueActionInputs,
    DequeueActionReturns
);
server_method!(
    /// Observe a transaction as a client peer.
    ConnectToTransactionAsClient,
    "CONNECT_TO_TRANSACTION_AS_CLIENT",
    ConnectToTransactionAsClientInputs,
    bool
);
server_method!(
    /// Answer an IO call on behalf of a client peer.
    RespondToIoCall,
    "RESPOND_TO_IO_CALL",
    RespondToIoCallInputs,
    bool
);

host_method!(
    /// Begin an action invocation.
    StartTransaction,
    "START_TRANSACTION",
    StartTransactionInputs,
    ()
);
host_method!(
    /// Deliver the operator's answer to a render batch.
    IoResponse,
    "IO_RESPONSE",
    IoResponseInputs,
    ()
);
host_method!(
    /// Open a page session.
    OpenPage,
    "OPEN_PAGE",
    OpenPageInputs,
    OpenPageReturns
);
host_method!(
    /// Tear down a page session.
    ClosePage,
    "CLOSE_PAGE",
    ClosePageInputs,
    ()
);

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn duplex_messages_use_camel_case() {
        let msg = DuplexMessage {
            id: "7".to_owned(),
            method_name: SendIoCall::NAME.to_owned(),
            data: json!({ "transactionId": "t1", "ioCall": "{}" }),
            kind: MessageKind::Call,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "7",
                "methodName": "SEND_IO_CALL",
                "data": { "transactionId": "t1", "ioCall": "{}" },
                "kind": "CALL",
            })
        );
    }

    #[rstest]
    fn initialize_host_returns_discriminate_on_type() {
        let success: InitializeHostReturns = serde_json::from_value(json!({
            "type": "success",
            "environment": "development",
            "invalidSlugs": ["bad slug"],
            "organization": { "name": "Acme", "slug": "acme" },
            "dashboardUrl": "https://interval.com/dashboard/acme",
            "warnings": [],
        }))
        .unwrap();
        assert!(matches!(
            success,
            InitializeHostReturns::Success { ref invalid_slugs, .. }
                if invalid_slugs == &["bad slug".to_owned()]
        ));

        let error: InitializeHostReturns =
            serde_json::from_value(json!({ "type": "error", "message": "bad key" })).unwrap();
        assert!(matches!(error, InitializeHostReturns::Error { .. }));
    }

    #[rstest]
    fn open_page_returns_use_upper_case_tags() {
        let ok = OpenPageReturns::Success {
            page_key: "pk1".to_owned(),
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "type": "SUCCESS", "pageKey": "pk1" })
        );
    }

    #[rstest]
    fn access_control_accepts_keyword_and_teams() {
        let keyword: AccessControl = serde_json::from_value(json!("entire-organization")).unwrap();
        assert_eq!(keyword, AccessControl::entire_organization());

        let teams: AccessControl =
            serde_json::from_value(json!({ "teams": ["support"] })).unwrap();
        assert_eq!(
            teams,
            AccessControl::Teams {
                teams: vec!["support".to_owned()],
            }
        );
    }

    #[rstest]
    fn start_transaction_inputs_parse_wire_shape() {
        let inputs: StartTransactionInputs = serde_json::from_value(json!({
            "transactionId": "t1",
            "action": { "slug": "hello", "url": "https://interval.com/t/1" },
            "environment": "live",
            "user": { "email": "op@example.com", "firstName": "Ada" },
            "params": { "count": 3 },
        }))
        .unwrap();
        assert_eq!(inputs.transaction_id, "t1");
        assert_eq!(inputs.action.slug, "hello");
        assert_eq!(inputs.environment, Environment::Live);
        assert_eq!(inputs.user.first_name.as_deref(), Some("Ada"));
    }
}
