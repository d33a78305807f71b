//! Request/response exchange over the in-process bus using only the public API.

use std::time::Duration;

use mcptunnel_shared::bus::{MemoryBus, MessageBus};
use mcptunnel_shared::protocol::{
    decode_body, encode_body, now_millis, BusMessage, Headers, Topics, TunnelRequest,
    TunnelResponse, DEFAULT_NAMESPACE,
};

fn request(tenant: &str, id: &str, body: &[u8]) -> TunnelRequest {
    TunnelRequest {
        request_id: id.to_string(),
        tenant_id: tenant.to_string(),
        method: "POST".into(),
        url: "https://httpbin.org/post".into(),
        headers: Headers::new(),
        body: encode_body(body),
        timestamp: now_millis(),
    }
}

#[tokio::test]
async fn echo_exchange_preserves_binary_body() {
    let bus = MemoryBus::new();
    bus.connect().await.unwrap();
    let topics = Topics::new(DEFAULT_NAMESPACE, "t1");

    let mut inbox = bus.subscribe(&topics.requests).await.unwrap();
    let mut replies = bus.subscribe(&topics.responses).await.unwrap();

    let payload: Vec<u8> = (0..=255u8).rev().collect();
    let sent = request("t1", "r-1", &payload);
    bus.publish(&topics.requests, BusMessage::request(&sent).unwrap())
        .await
        .unwrap();

    // Remote side: decode, echo.
    let received = inbox.recv().await.unwrap().into_request().unwrap();
    assert_eq!(received, sent);
    let echoed = TunnelResponse {
        request_id: received.request_id.clone(),
        tenant_id: received.tenant_id.clone(),
        status: 200,
        status_text: Some("OK".into()),
        headers: Headers::new(),
        body: encode_body(&received.body_bytes().unwrap()),
        error: None,
        timestamp: now_millis(),
    };
    bus.publish(&topics.responses, BusMessage::response(&echoed).unwrap())
        .await
        .unwrap();

    let reply = replies.recv().await.unwrap().into_response().unwrap();
    assert_eq!(reply.request_id, "r-1");
    assert_eq!(decode_body(reply.body.as_deref()).unwrap(), payload);
}

#[tokio::test]
async fn tenants_do_not_see_each_other() {
    let bus = MemoryBus::new();
    bus.connect().await.unwrap();
    let a = Topics::new(DEFAULT_NAMESPACE, "a");
    let b = Topics::new(DEFAULT_NAMESPACE, "b");

    let mut b_inbox = bus.subscribe(&b.requests).await.unwrap();
    bus.publish(&a.requests, BusMessage::request(&request("a", "r-a", b"x")).unwrap())
        .await
        .unwrap();

    let got = tokio::time::timeout(Duration::from_millis(50), b_inbox.recv()).await;
    assert!(got.is_err(), "tenant b must not receive tenant a's request");
}

#[tokio::test]
async fn close_ends_subscriptions() {
    let bus = MemoryBus::new();
    bus.connect().await.unwrap();
    let topics = Topics::new(DEFAULT_NAMESPACE, "t1");
    let mut sub = bus.subscribe(&topics.responses).await.unwrap();

    bus.close().await.unwrap();
    assert_eq!(sub.recv().await, None);
    assert!(bus
        .publish(&topics.responses, BusMessage::request(&request("t1", "r", b"")).unwrap())
        .await
        .is_err());
}
