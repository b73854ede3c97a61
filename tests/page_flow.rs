#![allow(missing_docs, reason = "integration tests")]
#![allow(clippy::unwrap_used, reason = "test code can panic")]
#![allow(clippy::expect_used, reason = "test code can panic")]

mod common;

use std::{collections::BTreeMap, time::Duration};

use interval_host::{
    Component,
    MethodName,
    Payload,
    page::{EventualString, Layout},
    routes::Page,
};
use serde_json::{Value, json};
use test_util::MockDashboard;

fn open_page_inputs(page_key: &str, slug: &str) -> Value {
    json!({
        "pageKey": page_key,
        "page": { "slug": slug },
        "environment": "development",
        "user": { "email": "op@example.com" },
        "params": {},
    })
}

fn page_body(call_data: &Value) -> Value {
    let raw = call_data
        .get("page")
        .and_then(Value::as_str)
        .expect("page payload");
    serde_json::from_str(raw).expect("page parses")
}

#[tokio::test]
async fn failing_description_ships_an_error_and_children_render() {
    let dashboard = MockDashboard::start().await;
    let host = common::test_host(&dashboard);

    host.routes()
        .add(
            "users",
            Page::new("Users").with_handler(|_io, _ctx| async move {
                Ok(Layout {
                    title: Some("All users".into()),
                    description: Some(EventualString::pending(async {
                        anyhow::bail!("could not load description")
                    })),
                    children: Some(vec![Component::new(
                        MethodName::DisplayTable,
                        "Users",
                        Payload::Object(BTreeMap::from([(
                            "data".to_owned(),
                            Payload::Array(vec![]),
                        )])),
                    )]),
                    ..Layout::default()
                })
            }),
        )
        .unwrap();

    host.listen().await.unwrap();
    let init = dashboard.next_call_named("INITIALIZE_HOST").await;
    let groups = init.data.get("groups").and_then(Value::as_array).unwrap();
    assert_eq!(groups[0].get("slug"), Some(&json!("users")));
    assert_eq!(groups[0].get("hasHandler"), Some(&json!(true)));

    let open = dashboard
        .call_host("OPEN_PAGE", open_page_inputs("pk1", "users"))
        .await;
    assert_eq!(open.get("type"), Some(&json!("SUCCESS")));
    assert_eq!(open.get("pageKey"), Some(&json!("pk1")));

    // snapshots converge on title + children + the description error
    let mut saw_error = false;
    let mut saw_children = false;
    for _ in 0..6 {
        let send_page = dashboard.next_call_named("SEND_PAGE").await;
        assert_eq!(send_page.data.get("pageKey"), Some(&json!("pk1")));
        let body = page_body(&send_page.data);
        assert_eq!(body.get("kind"), Some(&json!("BASIC")));
        if let Some(children) = body.get("children") {
            let to_render = children.get("toRender").and_then(Value::as_array).unwrap();
            assert_eq!(
                to_render[0].get("methodName"),
                Some(&json!("DISPLAY_TABLE"))
            );
            saw_children = true;
        }
        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                assert_eq!(errors[0].get("layoutKey"), Some(&json!("description")));
                assert!(
                    errors[0]
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap()
                        .contains("could not load description")
                );
                saw_error = true;
            }
        }
        if saw_error && saw_children {
            break;
        }
    }
    assert!(saw_error && saw_children);

    let closed = dashboard
        .call_host("CLOSE_PAGE", json!({ "pageKey": "pk1" }))
        .await;
    assert_eq!(closed, Value::Null);

    // closing again is a no-op
    let closed_again = dashboard
        .call_host("CLOSE_PAGE", json!({ "pageKey": "pk1" }))
        .await;
    assert_eq!(closed_again, Value::Null);

    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Some(call) = dashboard.try_next_call().await {
        assert_ne!(call.method, "SEND_PAGE");
    }
}

#[tokio::test]
async fn unknown_pages_return_an_error() {
    let dashboard = MockDashboard::start().await;
    let host = common::test_host(&dashboard);
    host.listen().await.unwrap();
    let _ = dashboard.next_call_named("INITIALIZE_HOST").await;

    let open = dashboard
        .call_host("OPEN_PAGE", open_page_inputs("pk2", "missing"))
        .await;
    assert_eq!(open.get("type"), Some(&json!("ERROR")));
}
