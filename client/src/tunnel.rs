//! Tunnel client: turns a call intent into a request message, waits for the
//! matching response and hands it back to the caller.
//!
//! One subscription on the tenant's response topic is held from `connect()`
//! on. A dispatcher task routes each response to the waiter registered under
//! its request id; the waiter is registered before the request is published,
//! so a fast response can never be missed.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mcptunnel_shared::bus::{MessageBus, Subscription};
use mcptunnel_shared::protocol::{
    encode_body, now_millis, BusMessage, Headers, Topics, TunnelRequest, TunnelResponse,
};
use mcptunnel_shared::{Error, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type PendingMap = DashMap<String, oneshot::Sender<TunnelResponse>>;

/// An HTTP call the caller wants performed on the remote side.
#[derive(Debug, Clone)]
pub struct CallIntent {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Overrides the client's default timeout for this call
    pub timeout: Option<Duration>,
}

impl CallIntent {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Headers::new(),
            body: Vec::new(),
            timeout: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response returned to the caller. The body is decoded and
/// `content-encoding` has been removed.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl FetchResponse {
    fn from_tunnel(response: TunnelResponse) -> Result<Self> {
        if let Some(message) = response.error {
            return Err(Error::Remote {
                status: response.status,
                message,
            });
        }
        let body = mcptunnel_shared::protocol::decode_body(response.body.as_deref())?;
        let headers = response
            .headers
            .into_iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("content-encoding"))
            .collect();
        Ok(Self {
            status: response.status,
            status_text: response.status_text,
            headers,
            body,
        })
    }
}

/// Removes a waiter when the call finishes, however it finishes.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

pub struct TunnelClient {
    bus: Arc<dyn MessageBus>,
    tenant_id: String,
    topics: Topics,
    timeout: Duration,
    pending: Arc<PendingMap>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelClient {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        namespace: &str,
        tenant_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            bus,
            topics: Topics::new(namespace, &tenant_id),
            tenant_id,
            timeout,
            pending: Arc::new(DashMap::new()),
            dispatcher: Mutex::new(None),
        }
    }

    /// Open the bus session and start listening for responses.
    pub async fn connect(&self) -> Result<()> {
        if !self.bus.is_connected() {
            self.bus.connect().await?;
        }
        let responses = self.bus.subscribe(&self.topics.responses).await?;
        let task = tokio::spawn(dispatch(responses, self.pending.clone()));

        let previous = self
            .dispatcher
            .lock()
            .map_err(|_| Error::Bus("dispatcher lock poisoned".into()))?
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(tenant_id = %self.tenant_id, topic = %self.topics.responses, "Tunnel client connected");
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.dispatcher
            .lock()
            .map(|d| d.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Perform `intent` on the remote side.
    ///
    /// Resolves with the remote response (any status) unless the response
    /// carries an error, in which case `Error::Remote` holds both the status
    /// and the message. Fails with `Error::Timeout` once the deadline passes.
    pub async fn fetch(&self, intent: CallIntent) -> Result<FetchResponse> {
        if !self.is_listening() {
            return Err(Error::Connection("tunnel client is not connected".into()));
        }

        let (request_id, rx) = self.register();
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: request_id.clone(),
        };

        let request = TunnelRequest {
            request_id: request_id.clone(),
            tenant_id: self.tenant_id.clone(),
            method: intent.method.to_ascii_uppercase(),
            url: intent.url,
            headers: intent.headers,
            body: encode_body(&intent.body),
            timestamp: now_millis(),
        };
        let message = BusMessage::request(&request)?;

        let start = Instant::now();
        self.bus.publish(&self.topics.requests, message).await?;
        debug!(request_id = %request_id, method = %request.method, url = %request.url, "Published request");

        let deadline = intent.timeout.unwrap_or(self.timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => {
                debug!(
                    request_id = %request_id,
                    status = response.status,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Received response"
                );
                FetchResponse::from_tunnel(response)
            }
            Ok(Err(_)) => Err(Error::Bus("tunnel closed while waiting for response".into())),
            Err(_) => {
                warn!(request_id = %request_id, timeout_ms = deadline.as_millis() as u64, "Request timed out");
                Err(Error::Timeout)
            }
        }
    }

    /// Allocate a request id that no pending call is using and park a waiter
    /// under it.
    fn register(&self) -> (String, oneshot::Receiver<TunnelResponse>) {
        loop {
            let request_id = Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = self.pending.entry(request_id.clone()) {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                return (request_id, rx);
            }
        }
    }

    /// Calls currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop listening, fail every pending call and close the bus session.
    pub async fn close(&self) -> Result<()> {
        let task = self
            .dispatcher
            .lock()
            .map_err(|_| Error::Bus("dispatcher lock poisoned".into()))?
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.pending.clear();
        self.bus.close().await?;
        info!(tenant_id = %self.tenant_id, "Tunnel client closed");
        Ok(())
    }
}

/// Route each response to its waiter. Responses nobody waits for are late
/// (the caller timed out or went away) and are dropped.
async fn dispatch(mut responses: Subscription, pending: Arc<PendingMap>) {
    while let Some(message) = responses.recv().await {
        let response = match message.into_response() {
            Ok(r) => r,
            Err(e) => {
                warn!("Ignoring unreadable message on response topic: {}", e);
                continue;
            }
        };
        match pending.remove(&response.request_id) {
            Some((request_id, waiter)) => {
                if waiter.send(response).is_err() {
                    debug!(request_id = %request_id, "Waiter went away before delivery");
                }
            }
            None => {
                debug!(request_id = %response.request_id, "Dropping response with no pending call");
            }
        }
    }
    debug!(topic = responses.topic(), "Response subscription ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcptunnel_shared::bus::MemoryBus;
    use mcptunnel_shared::protocol::DEFAULT_NAMESPACE;
    use std::collections::HashSet;

    struct Harness {
        bus: Arc<MemoryBus>,
        client: Arc<TunnelClient>,
        requests: Subscription,
        topics: Topics,
    }

    async fn harness(timeout: Duration) -> Harness {
        let bus = Arc::new(MemoryBus::new());
        bus.connect().await.unwrap();
        let topics = Topics::new(DEFAULT_NAMESPACE, "t1");
        let requests = bus.subscribe(&topics.requests).await.unwrap();
        let client = Arc::new(TunnelClient::new(bus.clone(), DEFAULT_NAMESPACE, "t1", timeout));
        client.connect().await.unwrap();
        Harness {
            bus,
            client,
            requests,
            topics,
        }
    }

    impl Harness {
        async fn next_request(&mut self) -> TunnelRequest {
            tokio::time::timeout(Duration::from_secs(2), self.requests.recv())
                .await
                .unwrap()
                .unwrap()
                .into_request()
                .unwrap()
        }

        async fn reply(&self, response: TunnelResponse) {
            self.bus
                .publish(&self.topics.responses, BusMessage::response(&response).unwrap())
                .await
                .unwrap();
        }
    }

    fn ok_response(request: &TunnelRequest, status: u16) -> TunnelResponse {
        TunnelResponse {
            request_id: request.request_id.clone(),
            tenant_id: request.tenant_id.clone(),
            status,
            status_text: Some("OK".into()),
            headers: Headers::new(),
            body: request.body.clone(),
            error: None,
            timestamp: now_millis(),
        }
    }

    async fn wait_pending(client: &TunnelClient, n: usize) {
        for _ in 0..100 {
            if client.pending_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} pending calls, have {}", n, client.pending_count());
    }

    #[tokio::test]
    async fn test_fetch_round_trip() {
        let mut h = harness(Duration::from_secs(5)).await;
        let payload: Vec<u8> = (0..=255u8).collect();

        let client = h.client.clone();
        let body = payload.clone();
        let call = tokio::spawn(async move {
            client
                .fetch(CallIntent::new("post", "https://httpbin.org/post").header("X-Test", "1").body(body))
                .await
        });

        let request = h.next_request().await;
        assert_eq!(request.method, "POST");
        assert_eq!(request.tenant_id, "t1");
        assert_eq!(request.headers.get("X-Test").map(String::as_str), Some("1"));

        let mut response = ok_response(&request, 200);
        response.headers.insert("Content-Encoding".into(), "gzip".into());
        response.headers.insert("content-type".into(), "application/octet-stream".into());
        h.reply(response).await;

        let got = call.await.unwrap().unwrap();
        assert_eq!(got.status, 200);
        assert_eq!(got.body, payload);
        assert!(!got.headers.keys().any(|k| k.eq_ignore_ascii_case("content-encoding")));
        assert!(got.headers.contains_key("content-type"));
        assert_eq!(h.client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_responses_route_to_their_own_waiter() {
        let mut h = harness(Duration::from_secs(5)).await;

        let mut calls = Vec::new();
        for i in 0..3 {
            let client = h.client.clone();
            calls.push(tokio::spawn(async move {
                client.fetch(CallIntent::new("GET", format!("https://httpbin.org/anything/{}", i))).await
            }));
        }

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(h.next_request().await);
        }
        let ids: HashSet<_> = requests.iter().map(|r| r.request_id.clone()).collect();
        assert_eq!(ids.len(), 3, "request ids must be unique");
        wait_pending(&h.client, 3).await;

        // Answer only the call for /anything/1.
        let target = requests.iter().find(|r| r.url.ends_with("/1")).unwrap();
        h.reply(ok_response(target, 201)).await;

        let resolved = calls.remove(1).await.unwrap().unwrap();
        assert_eq!(resolved.status, 201);
        wait_pending(&h.client, 2).await;
        assert!(calls.iter().all(|c| !c.is_finished()));

        for request in requests.iter().filter(|r| !r.url.ends_with("/1")) {
            h.reply(ok_response(request, 200)).await;
        }
        for call in calls {
            assert_eq!(call.await.unwrap().unwrap().status, 200);
        }
        assert_eq!(h.client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response() {
        let mut h = harness(Duration::from_millis(50)).await;

        let start = Instant::now();
        let client = h.client.clone();
        let call = tokio::spawn(async move { client.fetch(CallIntent::new("GET", "https://httpbin.org/delay/5")).await });
        let request = h.next_request().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(h.client.pending_count(), 0);

        // The late answer is dropped and the client keeps working.
        h.reply(ok_response(&request, 200)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = h.client.clone();
        let call = tokio::spawn(async move {
            client
                .fetch(CallIntent::new("GET", "https://httpbin.org/get").timeout(Duration::from_secs(2)))
                .await
        });
        let request = h.next_request().await;
        h.reply(ok_response(&request, 200)).await;
        assert_eq!(call.await.unwrap().unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_remote_error_keeps_status() {
        let mut h = harness(Duration::from_secs(5)).await;
        let client = h.client.clone();
        let call = tokio::spawn(async move { client.fetch(CallIntent::new("GET", "https://evil.example")).await });

        let request = h.next_request().await;
        h.reply(TunnelResponse::failure(&request, 403, "Request to https://evil.example is not allowed"))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.status(), Some(403));
        match err {
            Error::Remote { status, message } => {
                assert_eq!(status, 403);
                assert!(message.contains("not allowed"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_success_status_is_not_an_error() {
        let mut h = harness(Duration::from_secs(5)).await;
        let client = h.client.clone();
        let call = tokio::spawn(async move { client.fetch(CallIntent::new("GET", "https://httpbin.org/status/404")).await });

        let request = h.next_request().await;
        let mut response = ok_response(&request, 404);
        response.status_text = Some("Not Found".into());
        h.reply(response).await;

        let got = call.await.unwrap().unwrap();
        assert_eq!(got.status, 404);
        assert_eq!(got.status_text.as_deref(), Some("Not Found"));
    }

    #[tokio::test]
    async fn test_cancelled_call_removes_waiter() {
        let mut h = harness(Duration::from_secs(30)).await;
        let client = h.client.clone();
        let call = tokio::spawn(async move { client.fetch(CallIntent::new("GET", "https://httpbin.org/get")).await });

        let request = h.next_request().await;
        wait_pending(&h.client, 1).await;
        call.abort();
        let _ = call.await;
        assert_eq!(h.client.pending_count(), 0);

        // Answering the abandoned id is harmless.
        h.reply(ok_response(&request, 200)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.client.pending_count(), 0);
    }

    /// Memory bus whose publishes always fail.
    #[derive(Default)]
    struct BrokenPublishBus {
        inner: MemoryBus,
    }

    #[async_trait::async_trait]
    impl MessageBus for BrokenPublishBus {
        async fn connect(&self) -> Result<()> {
            self.inner.connect().await
        }

        async fn publish(&self, _topic: &str, _message: BusMessage) -> Result<()> {
            Err(Error::Bus("publish refused".into()))
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription> {
            self.inner.subscribe(topic).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
    }

    #[tokio::test]
    async fn test_publish_failure_removes_waiter() {
        let client = TunnelClient::new(
            Arc::new(BrokenPublishBus::default()),
            DEFAULT_NAMESPACE,
            "t1",
            Duration::from_secs(5),
        );
        client.connect().await.unwrap();

        let err = client.fetch(CallIntent::new("GET", "https://httpbin.org/get")).await.unwrap_err();
        assert!(matches!(err, Error::Bus(_)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_after_subscription_ends() {
        let h = harness(Duration::from_secs(5)).await;
        h.bus.close().await.unwrap();
        // The dispatcher notices its subscription ending.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = h.client.fetch(CallIntent::new("GET", "https://httpbin.org/get")).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(h.client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_requires_connect() {
        let bus = Arc::new(MemoryBus::new());
        let client = TunnelClient::new(bus, DEFAULT_NAMESPACE, "t1", Duration::from_secs(1));
        let err = client.fetch(CallIntent::new("GET", "https://httpbin.org/get")).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let mut h = harness(Duration::from_secs(30)).await;
        let client = h.client.clone();
        let call = tokio::spawn(async move { client.fetch(CallIntent::new("GET", "https://httpbin.org/get")).await });
        h.next_request().await;
        wait_pending(&h.client, 1).await;

        h.client.close().await.unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Bus(_)));
        assert!(!h.bus.is_connected());
    }
}
