#![allow(missing_docs, reason = "integration tests")]
#![allow(clippy::unwrap_used, reason = "test code can panic")]
#![allow(clippy::expect_used, reason = "test code can panic")]
#![allow(clippy::float_arithmetic, reason = "test arithmetic on handler values")]

mod common;

use std::{collections::BTreeMap, time::Duration};

use interval_host::{
    Action,
    Component,
    MethodName,
    Payload,
    component::ComponentError,
};
use serde_json::{Value, json};
use test_util::MockDashboard;

fn start_transaction_inputs(transaction_id: &str, slug: &str) -> Value {
    json!({
        "transactionId": transaction_id,
        "action": { "slug": slug, "url": format!("http://localhost/t/{transaction_id}") },
        "environment": "development",
        "user": { "email": "op@example.com", "firstName": "Ada" },
        "params": {},
    })
}

fn io_call_body(call_data: &Value) -> Value {
    let raw = call_data
        .get("ioCall")
        .and_then(Value::as_str)
        .expect("ioCall payload");
    serde_json::from_str(raw).expect("ioCall parses")
}

fn result_body(call_data: &Value) -> Value {
    let raw = call_data
        .get("result")
        .and_then(Value::as_str)
        .expect("result payload");
    serde_json::from_str(raw).expect("result parses")
}

#[tokio::test]
async fn happy_text_input_completes_with_success() {
    let dashboard = MockDashboard::start().await;
    let host = common::test_host(&dashboard);

    host.routes()
        .add(
            "hello",
            Action::new(|io, _ctx| async move {
                let values = io
                    .render_components(
                        vec![Component::new(MethodName::InputText, "Name", Payload::Null)],
                        None,
                        None,
                    )
                    .await?;
                let name = values
                    .first()
                    .and_then(Payload::as_str)
                    .unwrap_or_default()
                    .to_owned();
                Ok(Payload::Object(BTreeMap::from([(
                    "name".to_owned(),
                    Payload::from(name),
                )])))
            }),
        )
        .unwrap();

    host.listen().await.unwrap();

    let init = dashboard.next_call_named("INITIALIZE_HOST").await;
    let actions = init.data.get("actions").and_then(Value::as_array).unwrap();
    assert_eq!(actions[0].get("slug"), Some(&json!("hello")));
    assert_eq!(init.data.get("sdkName"), Some(&json!("interval-rs")));

    dashboard
        .call_host("START_TRANSACTION", start_transaction_inputs("t1", "hello"))
        .await;

    let io_call = dashboard.next_call_named("SEND_IO_CALL").await;
    assert_eq!(io_call.data.get("transactionId"), Some(&json!("t1")));
    let body = io_call_body(&io_call.data);
    assert_eq!(body.get("kind"), Some(&json!("RENDER")));
    let to_render = body.get("toRender").and_then(Value::as_array).unwrap();
    assert_eq!(to_render.len(), 1);
    assert_eq!(to_render[0].get("methodName"), Some(&json!("INPUT_TEXT")));
    assert_eq!(to_render[0].get("label"), Some(&json!("Name")));

    dashboard
        .send_io_response("t1", body["inputGroupKey"].clone(), "RETURN", json!(["Ada"]))
        .await;

    let mark = dashboard.next_call_named("MARK_TRANSACTION_COMPLETE").await;
    assert_eq!(mark.data.get("transactionId"), Some(&json!("t1")));
    let result = result_body(&mark.data);
    assert_eq!(result.get("status"), Some(&json!("SUCCESS")));
    assert_eq!(result.get("schemaVersion"), Some(&json!(1)));
    assert_eq!(result.get("data"), Some(&json!({ "name": "Ada" })));
}

#[tokio::test]
async fn min_number_validation_rerenders_until_valid() {
    let dashboard = MockDashboard::start().await;
    let host = common::test_host(&dashboard);

    host.routes()
        .add(
            "sum",
            Action::new(|io, _ctx| async move {
                let first = io
                    .render_components(
                        vec![Component::new(
                            MethodName::InputNumber,
                            "First",
                            Payload::Object(BTreeMap::from([(
                                "min".to_owned(),
                                Payload::Int(0),
                            )])),
                        )],
                        None,
                        None,
                    )
                    .await?;
                let Some(Payload::Float(first)) = first.first().cloned() else {
                    anyhow::bail!("expected a number");
                };

                let min = first + 1.0;
                let second = io
                    .render_components(
                        vec![
                            Component::new(
                                MethodName::InputNumber,
                                "Second",
                                Payload::Object(BTreeMap::from([(
                                    "min".to_owned(),
                                    Payload::Float(min),
                                )])),
                            )
                            .with_validator(move |value| match value {
                                Payload::Float(n) if n < min => Some(format!(
                                    "Please enter a number greater than or equal to {min}."
                                )),
                                _ => None,
                            }),
                        ],
                        None,
                        None,
                    )
                    .await?;
                let Some(Payload::Float(second)) = second.first().cloned() else {
                    anyhow::bail!("expected a number");
                };

                Ok(Payload::Object(BTreeMap::from([(
                    "sum".to_owned(),
                    Payload::Float(first + second),
                )])))
            }),
        )
        .unwrap();

    host.listen().await.unwrap();
    let _ = dashboard.next_call_named("INITIALIZE_HOST").await;

    dashboard
        .call_host("START_TRANSACTION", start_transaction_inputs("t2", "sum"))
        .await;

    let first_call = dashboard.next_call_named("SEND_IO_CALL").await;
    let first_body = io_call_body(&first_call.data);
    dashboard
        .send_io_response("t2", first_body["inputGroupKey"].clone(), "RETURN", json!([12]))
        .await;

    let second_call = dashboard.next_call_named("SEND_IO_CALL").await;
    let second_body = io_call_body(&second_call.data);
    assert_ne!(second_body["inputGroupKey"], first_body["inputGroupKey"]);

    dashboard
        .send_io_response("t2", second_body["inputGroupKey"].clone(), "RETURN", json!([7]))
        .await;

    let rerender = dashboard.next_call_named("SEND_IO_CALL").await;
    let rerender_body = io_call_body(&rerender.data);
    assert_eq!(rerender_body["inputGroupKey"], second_body["inputGroupKey"]);
    let to_render = rerender_body.get("toRender").and_then(Value::as_array).unwrap();
    assert_eq!(
        to_render[0].get("validationErrorMessage"),
        Some(&json!("Please enter a number greater than or equal to 13."))
    );

    dashboard
        .send_io_response("t2", second_body["inputGroupKey"].clone(), "RETURN", json!([13]))
        .await;

    let mark = dashboard.next_call_named("MARK_TRANSACTION_COMPLETE").await;
    let result = result_body(&mark.data);
    assert_eq!(result.get("status"), Some(&json!("SUCCESS")));
    assert_eq!(result.get("data"), Some(&json!({ "sum": 25.0 })));
}

#[tokio::test]
async fn server_cancel_suppresses_completion() {
    let dashboard = MockDashboard::start().await;
    let host = common::test_host(&dashboard);

    host.routes()
        .add(
            "cancelable",
            Action::new(|io, _ctx| async move {
                let values = io
                    .render_components(
                        vec![Component::new(MethodName::InputText, "Name", Payload::Null)],
                        None,
                        None,
                    )
                    .await?;
                Ok(values.into_iter().next().unwrap_or(Payload::Null))
            }),
        )
        .unwrap();

    host.listen().await.unwrap();
    let _ = dashboard.next_call_named("INITIALIZE_HOST").await;

    dashboard
        .call_host(
            "START_TRANSACTION",
            start_transaction_inputs("t3", "cancelable"),
        )
        .await;

    let io_call = dashboard.next_call_named("SEND_IO_CALL").await;
    let body = io_call_body(&io_call.data);
    dashboard
        .send_io_response("t3", body["inputGroupKey"].clone(), "CANCELED", json!([]))
        .await;

    // the dashboard owns finalisation of a cancelled transaction
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Some(call) = dashboard.try_next_call().await {
        assert_ne!(call.method, "MARK_TRANSACTION_COMPLETE");
    }
}

#[tokio::test]
async fn duplicate_start_transaction_is_ignored() {
    let dashboard = MockDashboard::start().await;
    let host = common::test_host(&dashboard);

    host.routes()
        .add(
            "once",
            Action::new(|io, _ctx| async move {
                let _ = io
                    .render_components(
                        vec![Component::new(MethodName::InputText, "Name", Payload::Null)],
                        None,
                        None,
                    )
                    .await?;
                Ok(Payload::Null)
            }),
        )
        .unwrap();

    host.listen().await.unwrap();
    let _ = dashboard.next_call_named("INITIALIZE_HOST").await;

    dashboard
        .call_host("START_TRANSACTION", start_transaction_inputs("t4", "once"))
        .await;
    let _ = dashboard.next_call_named("SEND_IO_CALL").await;

    dashboard
        .call_host("START_TRANSACTION", start_transaction_inputs("t4", "once"))
        .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Some(call) = dashboard.try_next_call().await {
        assert_ne!(call.method, "SEND_IO_CALL");
    }
}

#[test]
fn multiple_flag_is_rejected_for_single_value_methods() {
    let err = Component::new(MethodName::InputText, "Name", Payload::Null)
        .multiple(None)
        .unwrap_err();
    assert!(matches!(err, ComponentError::NotMultipleable(_)));
}
