//! Method-routed LSP session layer.
//!
//! [`Client`] sits on top of [`tether_rpc::RpcClient`] and adds the part
//! the messaging core deliberately leaves out: routing inbound requests
//! and notifications by method name. It installs exactly one handler of
//! each kind on the RPC client and looks the method up in per-method
//! ordered handler lists, plus the thin LSP glue (`initialize`, `open`,
//! `shutdown`) a caller needs to talk to a real language server.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tether_rpc::RpcClient;

mod protocol;

/// How long `shutdown()` waits for the server to answer the `shutdown`
/// request before tearing the transport down anyway.
const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

/// Per-method handler for server requests. Gets the request's params;
/// the first handler in a method's list to return `Ok(Some(_))` wins.
pub type RequestHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync>;

/// Per-method handler for server notifications.
pub type NotifyHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type HandlerMap<H> = Arc<Mutex<HashMap<String, Vec<H>>>>;

fn handlers_for<H: Clone>(map: &HandlerMap<H>, method: &str) -> Vec<H> {
    map.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(method)
        .cloned()
        .unwrap_or_default()
}

/// A language-server session: one spawned server, method-routed
/// subscriptions, and the LSP lifecycle glue.
pub struct Client {
    rpc: RpcClient,
    request_handlers: HandlerMap<RequestHandler>,
    notify_handlers: HandlerMap<NotifyHandler>,
}

impl Client {
    /// Spawn the server command and wire a session onto it.
    pub fn spawn(cmd: &[String]) -> Result<Self, tether_rpc::Error> {
        Ok(Self::from_rpc(RpcClient::spawn(cmd)?))
    }

    /// Wire a session onto an existing RPC client.
    ///
    /// Installs one request handler and one notification handler on the
    /// core; both route by the method name of the inbound message.
    #[must_use]
    pub fn from_rpc(rpc: RpcClient) -> Self {
        let request_handlers: HandlerMap<RequestHandler> = Arc::default();
        let notify_handlers: HandlerMap<NotifyHandler> = Arc::default();

        let table = request_handlers.clone();
        rpc.add_request_handler(move |msg| {
            let handlers = handlers_for(&table, &msg.method);
            async move {
                // A failing subscriber produced no result; the next one
                // in the method's list still gets its turn.
                for handler in handlers {
                    match handler(msg.params.clone()).await {
                        Ok(Some(result)) => return Ok(Some(result)),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(
                                "request subscriber failed for '{}': {e:#}",
                                msg.method
                            );
                        }
                    }
                }
                Ok(None)
            }
        });

        let table = notify_handlers.clone();
        rpc.add_notify_handler(move |msg| {
            let handlers = handlers_for(&table, &msg.method);
            async move {
                for handler in handlers {
                    if let Err(e) = handler(msg.params.clone()).await {
                        tracing::warn!(
                            "notification subscriber failed for '{}': {e:#}",
                            msg.method
                        );
                    }
                }
                Ok(())
            }
        });

        Self {
            rpc,
            request_handlers,
            notify_handlers,
        }
    }

    /// Subscribe a handler to server requests for `method`. Handlers for
    /// a method run in subscription order until one claims the request.
    pub fn subscribe_request<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.request_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method.to_string())
            .or_default()
            .push(handler);
    }

    /// Subscribe a handler to server notifications for `method`. Every
    /// handler for the method runs, in subscription order.
    pub fn subscribe_notify<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: NotifyHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.notify_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method.to_string())
            .or_default()
            .push(handler);
    }

    /// Send a request to the server and wait for its result.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.rpc
            .request(method, params)
            .await
            .with_context(|| format!("request '{method}' failed"))
    }

    /// Send a notification to the server.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.rpc
            .notify(method, params)
            .await
            .with_context(|| format!("notification '{method}' failed"))
    }

    /// Run the LSP handshake: `initialize`, then the `initialized`
    /// notification. Returns the server's initialize result.
    pub async fn initialize(&self) -> Result<Value> {
        let result = self
            .rpc
            .request("initialize", Some(protocol::initialize_params()))
            .await
            .context("initialize request failed")?;
        self.rpc
            .notify("initialized", Some(serde_json::json!({})))
            .await
            .context("initialized notification failed")?;
        Ok(result)
    }

    /// Read `path` and announce it to the server with
    /// `textDocument/didOpen`. When `language_id` is `None` it is derived
    /// from the file extension.
    pub async fn open(&self, path: impl AsRef<Path>, language_id: Option<&str>) -> Result<()> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let absolute = tokio::fs::canonicalize(path)
            .await
            .with_context(|| format!("resolving {}", path.display()))?;
        let uri = protocol::path_to_file_uri(&absolute)?;

        let language_id = match language_id {
            Some(id) => id.to_string(),
            None => protocol::language_id_for(&absolute),
        };

        let params = protocol::did_open_params(uri.as_str(), &language_id, 1, &text);
        self.rpc
            .notify("textDocument/didOpen", Some(params))
            .await
            .context("didOpen notification failed")?;
        Ok(())
    }

    /// End the session: `shutdown` request, `exit` notification, then
    /// transport teardown. A server that never answers `shutdown` is
    /// torn down after a short wait.
    pub async fn shutdown(self) {
        let shutdown = self.rpc.request("shutdown", None);
        let grace = std::time::Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        match tokio::time::timeout(grace, shutdown).await {
            Ok(Ok(_)) => {
                let _ = self.rpc.notify("exit", None).await;
            }
            Ok(Err(e)) => tracing::debug!("shutdown request failed: {e}"),
            Err(_) => tracing::debug!("server did not answer shutdown in time"),
        }
        self.rpc.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_rpc::codec::{FrameReader, FrameWriter};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type ServerReader = FrameReader<ReadHalf<DuplexStream>>;
    type ServerWriter = FrameWriter<WriteHalf<DuplexStream>>;

    fn test_session() -> (Client, ServerReader, ServerWriter) {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let rpc = RpcClient::from_streams(client_read, client_write);
        (
            Client::from_rpc(rpc),
            FrameReader::new(server_read),
            FrameWriter::new(server_write),
        )
    }

    fn result_frame(id: &Value, result: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "result": result })
    }

    #[tokio::test]
    async fn test_notifications_route_by_method() {
        let (client, mut server_rx, mut server_tx) = test_session();

        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        for method in ["textDocument/publishDiagnostics", "window/logMessage"] {
            let log = log.clone();
            client.subscribe_notify(method, move |params| {
                let log = log.clone();
                let tag = format!("{method}:{}", params.unwrap()["n"]);
                async move {
                    log.lock().unwrap().push(tag);
                    Ok(())
                }
            });
        }

        let (outcome, ()) = tokio::join!(client.request("barrier", None), async {
            let frame = server_rx.read_message().await.unwrap().unwrap();
            for (method, n) in [
                ("window/logMessage", 1),
                ("textDocument/publishDiagnostics", 2),
                ("telemetry/event", 3), // nothing subscribed, must be skipped
            ] {
                server_tx
                    .write_message(&json!({
                        "jsonrpc": "2.0",
                        "method": method,
                        "params": { "n": n }
                    }))
                    .await
                    .unwrap();
            }
            server_tx
                .write_message(&result_frame(&frame["id"], json!(null)))
                .await
                .unwrap();
        });
        outcome.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "window/logMessage:1",
                "textDocument/publishDiagnostics:2"
            ]
        );
    }

    #[tokio::test]
    async fn test_requests_route_by_method_first_match_wins() {
        let (client, mut server_rx, mut server_tx) = test_session();

        let wrong_method = Arc::new(Mutex::new(false));
        let flag = wrong_method.clone();
        client.subscribe_request("workspace/applyEdit", move |_| {
            *flag.lock().unwrap() = true;
            async { Ok(Some(json!("wrong"))) }
        });
        client.subscribe_request("workspace/configuration", |_| async { Ok(None) });
        client.subscribe_request("workspace/configuration", |params| async move {
            Ok(Some(json!({ "echo": params })))
        });

        server_tx
            .write_message(&json!({
                "jsonrpc": "2.0",
                "id": 11,
                "method": "workspace/configuration",
                "params": { "items": [] }
            }))
            .await
            .unwrap();

        let reply = server_rx.read_message().await.unwrap().unwrap();
        assert_eq!(reply["id"], 11);
        assert_eq!(reply["result"], json!({ "echo": { "items": [] } }));
        assert!(
            !*wrong_method.lock().unwrap(),
            "handlers for other methods stay untouched"
        );
        drop(client);
    }

    #[tokio::test]
    async fn test_failing_request_subscriber_falls_through_to_next() {
        let (client, mut server_rx, mut server_tx) = test_session();

        client.subscribe_request("workspace/configuration", |_| async {
            Err(anyhow::anyhow!("boom"))
        });
        client.subscribe_request("workspace/configuration", |_| async {
            Ok(Some(json!({ "settings": [] })))
        });

        server_tx
            .write_message(&json!({
                "jsonrpc": "2.0",
                "id": 12,
                "method": "workspace/configuration"
            }))
            .await
            .unwrap();

        let reply = server_rx.read_message().await.unwrap().unwrap();
        assert_eq!(reply["id"], 12);
        assert_eq!(
            reply["result"],
            json!({ "settings": [] }),
            "a failing subscriber produced no result; the next one answers"
        );
        drop(client);
    }

    #[tokio::test]
    async fn test_failing_notify_subscriber_does_not_skip_later_ones() {
        let (client, mut server_rx, mut server_tx) = test_session();

        let reached = Arc::new(Mutex::new(false));
        client.subscribe_notify("window/showMessage", |_| async {
            Err(anyhow::anyhow!("boom"))
        });
        let flag = reached.clone();
        client.subscribe_notify("window/showMessage", move |_| {
            let flag = flag.clone();
            async move {
                *flag.lock().unwrap() = true;
                Ok(())
            }
        });

        let (outcome, ()) = tokio::join!(client.request("barrier", None), async {
            let frame = server_rx.read_message().await.unwrap().unwrap();
            server_tx
                .write_message(&json!({
                    "jsonrpc": "2.0",
                    "method": "window/showMessage",
                    "params": { "message": "hi" }
                }))
                .await
                .unwrap();
            server_tx
                .write_message(&result_frame(&frame["id"], json!(null)))
                .await
                .unwrap();
        });
        outcome.unwrap();

        assert!(
            *reached.lock().unwrap(),
            "later subscribers for the method still run after one errors"
        );
    }

    #[tokio::test]
    async fn test_unsubscribed_server_request_goes_unanswered() {
        let (client, mut server_rx, mut server_tx) = test_session();

        let (outcome, ()) = tokio::join!(client.request("barrier", None), async {
            let frame = server_rx.read_message().await.unwrap().unwrap();
            server_tx
                .write_message(&json!({
                    "jsonrpc": "2.0",
                    "id": 40,
                    "method": "client/registerCapability"
                }))
                .await
                .unwrap();
            server_tx
                .write_message(&result_frame(&frame["id"], json!(null)))
                .await
                .unwrap();
        });
        outcome.unwrap();

        client.notify("after", None).await.unwrap();
        let next = server_rx.read_message().await.unwrap().unwrap();
        assert_eq!(next["method"], "after", "no response was sent for id 40");
    }

    #[tokio::test]
    async fn test_initialize_handshake() {
        let (client, mut server_rx, mut server_tx) = test_session();

        let (outcome, ()) = tokio::join!(client.initialize(), async {
            let init = server_rx.read_message().await.unwrap().unwrap();
            assert_eq!(init["method"], "initialize");
            assert!(init["params"]["processId"].is_number());
            assert!(init["params"]["capabilities"].is_object());
            server_tx
                .write_message(&result_frame(&init["id"], json!({ "capabilities": {} })))
                .await
                .unwrap();

            let initialized = server_rx.read_message().await.unwrap().unwrap();
            assert_eq!(initialized["method"], "initialized");
            assert!(initialized.get("id").is_none());
        });

        assert_eq!(outcome.unwrap(), json!({ "capabilities": {} }));
    }

    #[tokio::test]
    async fn test_open_sends_did_open_with_derived_language_id() {
        let (client, mut server_rx, _server_tx) = test_session();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.rs");
        std::fs::write(&path, "fn main() {}").unwrap();

        client.open(&path, None).await.unwrap();

        let frame = server_rx.read_message().await.unwrap().unwrap();
        assert_eq!(frame["method"], "textDocument/didOpen");
        let doc = &frame["params"]["textDocument"];
        let uri = doc["uri"].as_str().unwrap();
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("/main.rs"));
        assert_eq!(doc["languageId"], "rs");
        assert_eq!(doc["version"], 1);
        assert_eq!(doc["text"], "fn main() {}");
    }

    #[tokio::test]
    async fn test_open_honors_explicit_language_id() {
        let (client, mut server_rx, _server_tx) = test_session();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.txt");
        std::fs::write(&path, "select 1").unwrap();

        client.open(&path, Some("sql")).await.unwrap();

        let frame = server_rx.read_message().await.unwrap().unwrap();
        assert_eq!(frame["params"]["textDocument"]["languageId"], "sql");
    }

    #[tokio::test]
    async fn test_open_missing_file_fails_without_writing() {
        let (client, mut server_rx, _server_tx) = test_session();

        let err = client.open("/no/such/file.rs", None).await.unwrap_err();
        assert!(err.to_string().contains("/no/such/file.rs"));

        client.notify("probe", None).await.unwrap();
        let frame = server_rx.read_message().await.unwrap().unwrap();
        assert_eq!(frame["method"], "probe");
    }

    #[tokio::test]
    async fn test_shutdown_sends_exit_after_shutdown_response() {
        let (client, mut server_rx, mut server_tx) = test_session();

        let ((), ()) = tokio::join!(client.shutdown(), async {
            let frame = server_rx.read_message().await.unwrap().unwrap();
            assert_eq!(frame["method"], "shutdown");
            server_tx
                .write_message(&result_frame(&frame["id"], json!(null)))
                .await
                .unwrap();

            let exit = server_rx.read_message().await.unwrap().unwrap();
            assert_eq!(exit["method"], "exit");
            assert!(exit.get("id").is_none());
        });
    }
}
