//! UI components: the closed method vocabulary and per-component runtime.
//!
//! Each component names a method from the closed set, which fixes its
//! schema triple (props, state, return) at construction. The runtime side
//! carries what the engine needs while a render batch is in flight: current
//! props and state, a state-change handler for client-driven re-renders, an
//! optional validator, and the parsing rules that turn a wire return value
//! into a typed [`Payload`].

use std::sync::{Arc, Mutex as StdMutex};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::payload::{self, Payload};

/// The closed set of component methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MethodName {
    /// Single- or multi-line text input.
    InputText,
    /// Email address input.
    InputEmail,
    /// Numeric input.
    InputNumber,
    /// Checkbox input.
    InputBoolean,
    /// Rich text editor.
    InputRichText,
    /// Spreadsheet-style tabular input.
    InputSpreadsheet,
    /// URL input.
    InputUrl,
    /// Calendar date input.
    InputDate,
    /// Time-of-day input.
    InputTime,
    /// Combined date and time input.
    InputDatetime,
    /// Blocking confirmation dialog.
    Confirm,
    /// Re-authentication dialog.
    ConfirmIdentity,
    /// Row selection from a table.
    SelectTable,
    /// Single choice from a list.
    SelectSingle,
    /// Multiple choices from a list.
    SelectMultiple,
    /// Typeahead search backed by host-supplied results.
    Search,
    /// File upload.
    UploadFile,
    /// Code block display.
    DisplayCode,
    /// Heading display.
    DisplayHeading,
    /// Image display.
    DisplayImage,
    /// Link display.
    DisplayLink,
    /// Markdown display.
    DisplayMarkdown,
    /// Labelled metadata display.
    DisplayMetadata,
    /// Object tree display.
    DisplayObject,
    /// Table display.
    DisplayTable,
    /// Video display.
    DisplayVideo,
    /// Step progress display.
    DisplayProgressSteps,
    /// Indeterminate progress display.
    DisplayProgressIndeterminate,
    /// Item-by-item progress display.
    DisplayProgressThroughList,
}

/// Shape of a method's return value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    /// Display methods return nothing.
    None,
    /// UTF-8 text.
    Text,
    /// Floating-point number.
    Number,
    /// Boolean.
    Boolean,
    /// `{year, month, day}`.
    Date,
    /// `{hour, minute}`.
    Time,
    /// `{year, month, day, hour, minute}`.
    DateTime,
    /// A list of string-keyed records.
    Records,
    /// A list of `{key}` table-row references.
    TableSelection,
    /// A `{label, value, ...}` option object.
    RichOption,
    /// A list of `{label, value}` pairs.
    LabelValueList,
    /// A primitive or flat record of primitives, passed through.
    SearchResult,
    /// An uploaded file descriptor.
    File,
}

/// Static definition of one method: its schema triple characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDef {
    /// Return value shape.
    pub returns: ReturnShape,
    /// Whether the dashboard may stream state for re-rendering.
    pub has_state: bool,
    /// Whether the component resolves without waiting for a reply.
    pub immediate: bool,
    /// Whether the component must be rendered alone in its group.
    pub exclusive: bool,
    /// Whether the component may collect multiple values.
    pub supports_multiple: bool,
}

const fn def(returns: ReturnShape) -> MethodDef {
    MethodDef {
        returns,
        has_state: false,
        immediate: false,
        exclusive: false,
        supports_multiple: false,
    }
}

impl MethodName {
    /// The fixed definition for this method.
    #[must_use]
    pub const fn def(self) -> MethodDef {
        match self {
            Self::InputText | Self::InputEmail | Self::InputRichText | Self::InputUrl => {
                def(ReturnShape::Text)
            }
            Self::InputNumber => def(ReturnShape::Number),
            Self::InputBoolean => def(ReturnShape::Boolean),
            Self::InputDate => def(ReturnShape::Date),
            Self::InputTime => def(ReturnShape::Time),
            Self::InputDatetime => def(ReturnShape::DateTime),
            Self::InputSpreadsheet => def(ReturnShape::Records),
            Self::Confirm | Self::ConfirmIdentity => MethodDef {
                exclusive: true,
                ..def(ReturnShape::Boolean)
            },
            Self::SelectTable => MethodDef {
                has_state: true,
                ..def(ReturnShape::TableSelection)
            },
            Self::SelectSingle => MethodDef {
                has_state: true,
                ..def(ReturnShape::RichOption)
            },
            Self::SelectMultiple => def(ReturnShape::LabelValueList),
            Self::Search => MethodDef {
                has_state: true,
                supports_multiple: true,
                ..def(ReturnShape::SearchResult)
            },
            Self::UploadFile => MethodDef {
                has_state: true,
                supports_multiple: true,
                ..def(ReturnShape::File)
            },
            Self::DisplayTable => MethodDef {
                has_state: true,
                ..def(ReturnShape::None)
            },
            Self::DisplayProgressSteps | Self::DisplayProgressIndeterminate => MethodDef {
                immediate: true,
                ..def(ReturnShape::None)
            },
            Self::DisplayCode
            | Self::DisplayHeading
            | Self::DisplayImage
            | Self::DisplayLink
            | Self::DisplayMarkdown
            | Self::DisplayMetadata
            | Self::DisplayObject
            | Self::DisplayVideo
            | Self::DisplayProgressThroughList => def(ReturnShape::None),
        }
    }

    /// Whether this is a display-only method.
    #[must_use]
    pub const fn is_display(self) -> bool {
        matches!(self.def().returns, ReturnShape::None)
    }
}

/// Errors produced while constructing or parsing a component.
#[derive(Debug, Error)]
pub enum ComponentError {
    /// `multiple` requested on a method that does not support it.
    #[error("{0:?} components cannot be multiple")]
    NotMultipleable(MethodName),
    /// A return value did not match the method's schema.
    #[error("received invalid {method:?} return value: {detail}")]
    InvalidReturn {
        /// The component's method.
        method: MethodName,
        /// What was wrong with the value.
        detail: String,
    },
}

/// Validator over a parsed return value; yields a message when invalid.
pub type Validator = Arc<dyn Fn(Payload) -> BoxFuture<'static, Option<String>> + Send + Sync>;

/// Handler producing new props from `(new_state, old_props)`.
pub type StateChangeHandler =
    Arc<dyn Fn(Payload, Payload) -> BoxFuture<'static, anyhow::Result<Payload>> + Send + Sync>;

/// Render-time view of one component, serialised into a render batch.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRenderInfo {
    /// Method tag.
    pub method_name: MethodName,
    /// Operator-facing label.
    pub label: String,
    /// Encoded props.
    pub props: Value,
    /// Codec annotations for `props`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props_meta: Option<Value>,
    /// Whether the dashboard may stream state updates.
    pub is_stateful: bool,
    /// Whether a null return is accepted.
    pub is_optional: bool,
    /// Whether the component collects a list of values.
    pub is_multiple: bool,
    /// Extra props applied when `is_multiple`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiple_props: Option<MultipleProps>,
    /// Message shown when the last submission failed validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_error_message: Option<String>,
}

/// Extra props for components collecting multiple values.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipleProps {
    /// Values preselected when the component first renders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

/// One UI component inside a render batch.
pub struct Component {
    method: MethodName,
    label: String,
    props: StdMutex<Payload>,
    state: StdMutex<Option<Payload>>,
    validation_error_message: StdMutex<Option<String>>,
    state_handler: Option<StateChangeHandler>,
    validator: Option<Validator>,
    is_optional: bool,
    is_multiple: bool,
    multiple_default_value: Option<Value>,
}

impl Component {
    /// Create a component for `method` with its initial props.
    #[must_use]
    pub fn new(method: MethodName, label: impl Into<String>, props: Payload) -> Self {
        Self {
            method,
            label: label.into(),
            props: StdMutex::new(props),
            state: StdMutex::new(None),
            validation_error_message: StdMutex::new(None),
            state_handler: None,
            validator: None,
            is_optional: false,
            is_multiple: false,
            multiple_default_value: None,
        }
    }

    /// Accept a null return and surface it as [`Payload::Null`].
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    /// Collect a list of values instead of a single one.
    ///
    /// # Errors
    /// Fails when the method does not support multiple values.
    pub fn multiple(mut self, default_value: Option<Value>) -> Result<Self, ComponentError> {
        if !self.method.def().supports_multiple {
            return Err(ComponentError::NotMultipleable(self.method));
        }
        self.is_multiple = true;
        self.multiple_default_value = default_value;
        Ok(self)
    }

    /// Install a synchronous validator over the parsed return value.
    #[must_use]
    pub fn with_validator<F>(mut self, validate: F) -> Self
    where
        F: Fn(Payload) -> Option<String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(move |value| {
            let message = validate(value);
            Box::pin(async move { message })
        }));
        self
    }

    /// Install an asynchronous validator over the parsed return value.
    #[must_use]
    pub fn with_async_validator<F, Fut>(mut self, validate: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        self.validator = Some(Arc::new(move |value| Box::pin(validate(value))));
        self
    }

    /// Install the state-change handler, marking the component stateful.
    #[must_use]
    pub fn with_state_handler<F, Fut>(mut self, handle: F) -> Self
    where
        F: Fn(Payload, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
    {
        self.state_handler = Some(Arc::new(move |state, props| Box::pin(handle(state, props))));
        self
    }

    /// Method tag.
    #[must_use]
    pub const fn method(&self) -> MethodName { self.method }

    /// Whether the component resolves without waiting for a reply.
    #[must_use]
    pub const fn resolves_immediately(&self) -> bool { self.method.def().immediate }

    /// Snapshot the component for inclusion in a render batch.
    #[must_use]
    pub fn render_info(&self) -> ComponentRenderInfo {
        let props = lock_or_poisoned(&self.props).clone();
        let (encoded, meta) = payload::encode(&props);
        ComponentRenderInfo {
            method_name: self.method,
            label: self.label.clone(),
            props: encoded,
            props_meta: meta,
            is_stateful: self.state_handler.is_some(),
            is_optional: self.is_optional,
            is_multiple: self.is_multiple,
            multiple_props: self.is_multiple.then(|| MultipleProps {
                default_value: self.multiple_default_value.clone(),
            }),
            validation_error_message: lock_or_poisoned(&self.validation_error_message).clone(),
        }
    }

    /// Record the validation message shown on the next render.
    pub fn set_validation_error(&self, message: Option<String>) {
        *lock_or_poisoned(&self.validation_error_message) = message;
    }

    /// Apply a state update from the dashboard.
    ///
    /// When the state differs from the last seen value, the state-change
    /// handler produces new props. Returns whether the props changed.
    ///
    /// # Errors
    /// Propagates a failure from the state-change handler.
    pub async fn apply_state(&self, new_state: Payload) -> anyhow::Result<bool> {
        {
            let mut state = lock_or_poisoned(&self.state);
            if state.as_ref() == Some(&new_state) {
                return Ok(false);
            }
            *state = Some(new_state.clone());
        }

        let Some(handler) = &self.state_handler else {
            if !new_state.is_nullish() {
                warn!(method = ?self.method, "received state but no handler is defined");
            }
            return Ok(false);
        };

        let old_props = lock_or_poisoned(&self.props).clone();
        let new_props = handler(new_state, old_props).await?;
        *lock_or_poisoned(&self.props) = new_props;
        Ok(true)
    }

    /// Run the component's validator over a raw return value.
    ///
    /// Returns the validation message when invalid. A value that fails
    /// parsing is reported as a generic invalid response.
    pub async fn handle_validation(&self, value: &Value) -> Option<String> {
        let parsed = match self.parse_return_value(value) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "received invalid return value");
                let message = "Received invalid response.".to_owned();
                self.set_validation_error(Some(message.clone()));
                return Some(message);
            }
        };
        let Some(validator) = &self.validator else {
            self.set_validation_error(None);
            return None;
        };
        let message = validator(parsed).await;
        self.set_validation_error(message.clone());
        message
    }

    /// Parse a raw wire value into this component's typed return value.
    ///
    /// # Errors
    /// Fails when the value does not match the method's return schema, or
    /// when a required component receives null.
    pub fn parse_return_value(&self, value: &Value) -> Result<Payload, ComponentError> {
        let shape = self.method.def().returns;
        let invalid = |detail: String| ComponentError::InvalidReturn {
            method: self.method,
            detail,
        };

        if value.is_null() {
            if self.is_optional || matches!(shape, ReturnShape::None) {
                return Ok(Payload::Null);
            }
            return Err(invalid("null return for a required component".to_owned()));
        }

        if self.is_multiple {
            let items = value
                .as_array()
                .ok_or_else(|| invalid("expected a list of values".to_owned()))?;
            let parsed = items
                .iter()
                .map(|item| parse_shape(shape, item).map_err(&invalid))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Payload::Array(parsed));
        }

        parse_shape(shape, value).map_err(invalid)
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("method", &self.method)
            .field("label", &self.label)
            .field("is_optional", &self.is_optional)
            .field("is_multiple", &self.is_multiple)
            .finish_non_exhaustive()
    }
}

fn lock_or_poisoned<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn int_field(value: &Value, field: &str) -> Result<i64, String> {
    value
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| format!("missing integer field `{field}`"))
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "calendar fields are range-checked by chrono immediately after the cast"
)]
fn date_from(value: &Value) -> Result<NaiveDate, String> {
    let year = int_field(value, "year")?;
    let month = int_field(value, "month")?;
    let day = int_field(value, "day")?;
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .ok_or_else(|| "calendar fields out of range".to_owned())
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "clock fields are range-checked by chrono immediately after the cast"
)]
fn time_from(value: &Value) -> Result<NaiveTime, String> {
    let hour = int_field(value, "hour")?;
    let minute = int_field(value, "minute")?;
    NaiveTime::from_hms_opt(hour as u32, minute as u32, 0)
        .ok_or_else(|| "clock fields out of range".to_owned())
}

fn datetime_from(value: &Value) -> Result<NaiveDateTime, String> {
    let date = date_from(value)?;
    let time = time_from(value)?;
    Ok(NaiveDateTime::new(date, time))
}

fn lift_record_list(value: &Value, what: &str) -> Result<Payload, String> {
    let items = value
        .as_array()
        .ok_or_else(|| format!("expected a list of {what}"))?;
    for item in items {
        if !item.is_object() {
            return Err(format!("expected every {what} entry to be an object"));
        }
    }
    Ok(lift(value))
}

fn lift(value: &Value) -> Payload {
    match payload::decode(value, None) {
        Ok(parsed) => parsed,
        Err(_) => Payload::Null,
    }
}

fn parse_shape(shape: ReturnShape, value: &Value) -> Result<Payload, String> {
    match shape {
        ReturnShape::None => Ok(Payload::Null),
        ReturnShape::Text => value
            .as_str()
            .map(Payload::from)
            .ok_or_else(|| "expected a string".to_owned()),
        ReturnShape::Number => value
            .as_f64()
            .map(Payload::Float)
            .ok_or_else(|| "expected a number".to_owned()),
        ReturnShape::Boolean => value
            .as_bool()
            .map(Payload::Bool)
            .ok_or_else(|| "expected a boolean".to_owned()),
        ReturnShape::Date => date_from(value).map(Payload::Date),
        ReturnShape::Time => time_from(value).map(Payload::Time),
        ReturnShape::DateTime => datetime_from(value).map(Payload::DateTime),
        ReturnShape::Records => lift_record_list(value, "records"),
        ReturnShape::TableSelection => {
            let items = value
                .as_array()
                .ok_or_else(|| "expected a list of row references".to_owned())?;
            for item in items {
                if item.get("key").and_then(Value::as_str).is_none() {
                    return Err("expected row references with a string `key`".to_owned());
                }
            }
            Ok(lift(value))
        }
        ReturnShape::RichOption => {
            if !value.is_object() {
                return Err("expected an option object".to_owned());
            }
            Ok(lift(value))
        }
        ReturnShape::LabelValueList => lift_record_list(value, "options"),
        ReturnShape::SearchResult => match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Object(_) => {
                Ok(lift(value))
            }
            _ => Err("expected a primitive or record result".to_owned()),
        },
        ReturnShape::File => {
            if value.get("name").and_then(Value::as_str).is_none() {
                return Err("expected a file descriptor with a `name`".to_owned());
            }
            Ok(lift(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn method_names_serialise_screaming_snake() {
        assert_eq!(
            serde_json::to_value(MethodName::InputDatetime).unwrap(),
            json!("INPUT_DATETIME")
        );
        assert_eq!(
            serde_json::to_value(MethodName::DisplayProgressThroughList).unwrap(),
            json!("DISPLAY_PROGRESS_THROUGH_LIST")
        );
    }

    #[rstest]
    fn text_components_parse_strings() {
        let component = Component::new(MethodName::InputText, "Name", Payload::Null);
        assert_eq!(
            component.parse_return_value(&json!("Ada")).unwrap(),
            Payload::from("Ada")
        );
        assert!(component.parse_return_value(&json!(12)).is_err());
    }

    #[rstest]
    fn required_components_reject_null() {
        let component = Component::new(MethodName::InputText, "Name", Payload::Null);
        assert!(component.parse_return_value(&json!(null)).is_err());

        let optional = Component::new(MethodName::InputText, "Name", Payload::Null).optional();
        assert_eq!(
            optional.parse_return_value(&json!(null)).unwrap(),
            Payload::Null
        );
    }

    #[rstest]
    fn display_components_accept_null() {
        let component = Component::new(MethodName::DisplayMarkdown, "Notes", Payload::Null);
        assert_eq!(
            component.parse_return_value(&json!(null)).unwrap(),
            Payload::Null
        );
    }

    #[rstest]
    fn date_wire_objects_become_dates() {
        let component = Component::new(MethodName::InputDate, "When", Payload::Null);
        let parsed = component
            .parse_return_value(&json!({ "year": 2022, "month": 6, "day": 20 }))
            .unwrap();
        assert_eq!(
            parsed,
            Payload::Date(chrono::NaiveDate::from_ymd_opt(2022, 6, 20).unwrap())
        );
        assert!(component.parse_return_value(&json!({ "year": 2022 })).is_err());
    }

    #[rstest]
    fn multiple_is_limited_to_capable_methods() {
        assert!(
            Component::new(MethodName::InputText, "Name", Payload::Null)
                .multiple(None)
                .is_err()
        );
        let search = Component::new(MethodName::Search, "Find", Payload::Null)
            .multiple(None)
            .unwrap();
        let parsed = search.parse_return_value(&json!(["a", "b"])).unwrap();
        assert_eq!(
            parsed,
            Payload::Array(vec![Payload::from("a"), Payload::from("b")])
        );
    }

    #[tokio::test]
    async fn validators_report_messages() {
        let component = Component::new(MethodName::InputNumber, "Age", Payload::Null)
            .with_validator(|value| match value {
                Payload::Float(n) if n < 13.0 => {
                    Some("Please enter a number greater than or equal to 13.".to_owned())
                }
                _ => None,
            });
        let message = component.handle_validation(&json!(7)).await;
        assert_eq!(
            message.as_deref(),
            Some("Please enter a number greater than or equal to 13.")
        );
        assert!(component.handle_validation(&json!(21)).await.is_none());
    }

    #[tokio::test]
    async fn unparseable_values_are_generically_invalid() {
        let component = Component::new(MethodName::InputNumber, "Age", Payload::Null);
        let message = component.handle_validation(&json!("nope")).await;
        assert_eq!(message.as_deref(), Some("Received invalid response."));
    }

    #[tokio::test]
    async fn state_changes_produce_new_props() {
        let component = Component::new(
            MethodName::Search,
            "Find a state",
            Payload::Object(std::collections::BTreeMap::new()),
        )
        .with_state_handler(|state, _old_props| async move {
            let term = state
                .as_str()
                .map(str::to_owned)
                .unwrap_or_default();
            Ok(Payload::from(format!("results for {term}")))
        });

        let changed = component.apply_state(Payload::from("ill")).await.unwrap();
        assert!(changed);
        let repeat = component.apply_state(Payload::from("ill")).await.unwrap();
        assert!(!repeat);
    }
}
