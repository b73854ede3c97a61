//! Render batches and their responses on the wire.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::component::ComponentRenderInfo;

/// Discriminator for outbound render instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RenderKind {
    /// Render the listed components.
    Render,
}

/// Theme of the group's submit affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonTheme {
    /// Default emphasis.
    Primary,
    /// Reduced emphasis.
    Secondary,
    /// Destructive emphasis.
    Danger,
}

/// Configuration of the group's continue button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonConfig {
    /// Button label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Button theme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<ButtonTheme>,
}

/// One render batch: the unit of a single `SEND_IO_CALL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoRender {
    /// Batch id, fresh per render.
    pub id: Uuid,
    /// Scope key minted per `render_components` call.
    pub input_group_key: Uuid,
    /// Components in display order.
    pub to_render: Vec<ComponentRenderInfo>,
    /// Instruction discriminator.
    pub kind: RenderKind,
    /// Group-level validation message from the last submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error_message: Option<String>,
    /// Submit affordance configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_button: Option<ButtonConfig>,
}

/// Discriminator for inbound responses to a render batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IoResponseKind {
    /// Final values for every component in the batch.
    Return,
    /// Updated client state for stateful components.
    SetState,
    /// The server cancelled the interaction.
    Canceled,
}

/// The dashboard's answer to a render batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoResponse {
    /// Response id.
    pub id: Uuid,
    /// Scope key of the batch being answered; stale keys are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_group_key: Option<Uuid>,
    /// Transaction the response belongs to.
    pub transaction_id: String,
    /// Response discriminator.
    pub kind: IoResponseKind,
    /// Per-component values, ordered like the batch.
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{component::MethodName, payload::Payload};

    #[rstest]
    fn render_batches_serialise_camel_case() {
        let component =
            crate::component::Component::new(MethodName::InputText, "Name", Payload::Null);
        let render = IoRender {
            id: Uuid::new_v4(),
            input_group_key: Uuid::new_v4(),
            to_render: vec![component.render_info()],
            kind: RenderKind::Render,
            validation_error_message: None,
            continue_button: Some(ButtonConfig {
                label: Some("Submit".to_owned()),
                theme: Some(ButtonTheme::Danger),
            }),
        };
        let value = serde_json::to_value(&render).unwrap();
        assert_eq!(value.get("kind"), Some(&json!("RENDER")));
        assert!(value.get("inputGroupKey").is_some());
        assert!(value.get("validationErrorMessage").is_none());
        assert_eq!(
            value.get("continueButton"),
            Some(&json!({ "label": "Submit", "theme": "danger" }))
        );
        let info = value.get("toRender").and_then(|v| v.get(0)).unwrap();
        assert_eq!(info.get("methodName"), Some(&json!("INPUT_TEXT")));
        assert_eq!(info.get("label"), Some(&json!("Name")));
    }

    #[rstest]
    fn responses_parse_each_kind() {
        let group = Uuid::new_v4();
        let response: IoResponse = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "inputGroupKey": group,
            "transactionId": "t1",
            "kind": "SET_STATE",
            "values": [{ "queryTerm": "ill" }],
        }))
        .unwrap();
        assert_eq!(response.kind, IoResponseKind::SetState);
        assert_eq!(response.input_group_key, Some(group));

        let canceled: IoResponse = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "transactionId": "t1",
            "kind": "CANCELED",
        }))
        .unwrap();
        assert_eq!(canceled.kind, IoResponseKind::Canceled);
        assert!(canceled.values.is_empty());
    }
}
