//! The RPC client: request/response correlation and bidirectional
//! dispatch over a child process's stdio.
//!
//! One client owns one subprocess for its whole life. Callers issue
//! [`RpcClient::request`] and [`RpcClient::notify`] concurrently; a
//! single inbound task reads framed messages in arrival order and either
//! resolves a pending request, fans a notification out to the registered
//! handlers, or runs the request handler chain and writes a response
//! back. Method-based routing is layered above this type — handlers here
//! see every inbound message of their kind.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::Error;
use crate::message::{
    self, Incoming, Notification, NotificationMessage, Request, RequestMessage, ResponseMessage,
};

/// How long `close()` waits for the child to exit before killing it.
const CHILD_EXIT_GRACE_SECS: u64 = 2;

/// Handler for inbound requests. `Ok(Some(_))` claims the request and
/// stops the chain — `Some(Value::Null)` included; `Ok(None)` passes to
/// the next handler; `Err` is logged and counts as a pass.
pub type RequestHandler =
    Arc<dyn Fn(RequestMessage) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync>;

/// Handler for inbound notifications. Every registered handler runs for
/// every notification, in registration order; `Err` is logged and the
/// chain continues.
pub type NotifyHandler =
    Arc<dyn Fn(NotificationMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type BoxWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Outstanding requests plus the id counter. Both live under one lock so
/// allocation and insertion are atomic with respect to each other and to
/// the inbound task's removals; ids start at 1 and are never reused.
struct Pending {
    next_id: u64,
    inflight: HashMap<u64, oneshot::Sender<ResponseMessage>>,
}

struct Shared {
    writer: Mutex<BoxWriter>,
    pending: Mutex<Pending>,
    request_handlers: StdMutex<Vec<RequestHandler>>,
    notify_handlers: StdMutex<Vec<NotifyHandler>>,
    closed: AtomicBool,
}

impl Shared {
    fn request_handlers(&self) -> Vec<RequestHandler> {
        self.request_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn notify_handlers(&self) -> Vec<NotifyHandler> {
        self.notify_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Write one frame, holding the writer lock so frames never
    /// interleave. A failed write marks the client closed.
    async fn write(&self, frame: &Value) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_message(frame).await {
            tracing::warn!("outbound stream failed: {e:#}");
            self.closed.store(true, Ordering::SeqCst);
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Flip to closed and fail everything still in flight. Dropping the
    /// senders wakes the waiting `request` calls with [`Error::Closed`].
    async fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut pending = self.pending.lock().await;
        let abandoned = pending.inflight.len();
        pending.inflight.clear();
        if abandoned > 0 {
            tracing::warn!("connection closed with {abandoned} request(s) still pending");
        }
    }
}

/// JSON-RPC 2.0 client bound to a spawned server process.
pub struct RpcClient {
    shared: Arc<Shared>,
    child: Option<Child>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl RpcClient {
    /// Spawn `cmd` with piped stdio and start the inbound task.
    ///
    /// Construction is atomic: if the executable cannot be resolved or
    /// spawned, this returns `Err` and nothing is left running.
    pub fn spawn(cmd: &[String]) -> Result<Self, Error> {
        let Some((command, args)) = cmd.split_first() else {
            return Err(Error::Spawn {
                command: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let resolved = which::which(command).map_err(|source| Error::CommandNotFound {
            command: command.clone(),
            source,
        })?;

        let mut child = Command::new(&resolved)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                command: command.clone(),
                source,
            })?;

        // Piped stdio is always present after a successful spawn.
        let missing_pipe = |what: &str| Error::Spawn {
            command: command.clone(),
            source: std::io::Error::other(format!("child {what} not captured")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;

        let mut client = Self::from_streams(stdout, stdin);
        client.child = Some(child);
        Ok(client)
    }

    /// Build a client over arbitrary stream halves instead of a child
    /// process. The inbound task starts immediately and runs until
    /// `reader` ends.
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let shared = Arc::new(Shared {
            writer: Mutex::new(FrameWriter::new(boxed)),
            pending: Mutex::new(Pending {
                next_id: 1,
                inflight: HashMap::new(),
            }),
            request_handlers: StdMutex::new(Vec::new()),
            notify_handlers: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let loop_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            let mut frames = FrameReader::new(reader);
            loop {
                match frames.read_message().await {
                    Ok(Some(frame)) => dispatch(&loop_shared, &frame).await,
                    Ok(None) => {
                        tracing::info!("server closed its output stream");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("inbound stream failed: {e:#}");
                        break;
                    }
                }
            }
            loop_shared.shut_down().await;
        });

        Self {
            shared,
            child: None,
            reader_task,
        }
    }

    /// Register a request handler. Handlers are tried in registration
    /// order; the first defined result wins and is written back as the
    /// response.
    pub fn add_request_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(RequestMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |msg| Box::pin(handler(msg)));
        self.shared
            .request_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Register a notification handler.
    pub fn add_notify_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(NotificationMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: NotifyHandler = Arc::new(move |msg| Box::pin(handler(msg)));
        self.shared
            .notify_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Send a request and wait for its response.
    ///
    /// The returned future resolves when the matching response arrives:
    /// `Ok` with the result (even a `null` one), [`Error::Rpc`] when the
    /// server answered with an error object, [`Error::Closed`] when the
    /// connection went away first. There is no timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        check_params(params.as_ref())?;
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let (id, rx) = {
            let mut pending = self.shared.pending.lock().await;
            let id = pending.next_id;
            pending.next_id += 1;
            let (tx, rx) = oneshot::channel();
            pending.inflight.insert(id, tx);
            (id, rx)
        };

        let frame = serde_json::to_value(Request::new(id, method, params))?;
        if let Err(e) = self.shared.write(&frame).await {
            // The request never reached the wire; take its entry back out.
            self.shared.pending.lock().await.inflight.remove(&id);
            return Err(e);
        }

        let Ok(response) = rx.await else {
            return Err(Error::Closed);
        };
        if let Some(result) = response.result {
            return Ok(result);
        }
        if let Some(error) = response.error {
            return Err(Error::Rpc(error));
        }
        Err(Error::InvalidResponse)
    }

    /// Send a notification. Completes once the frame is flushed; no
    /// response is ever awaited.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        check_params(params.as_ref())?;
        let frame = serde_json::to_value(Notification::new(method, params))?;
        self.shared.write(&frame).await
    }

    /// Whether the connection has ended. Once true, `request` and
    /// `notify` fail with [`Error::Closed`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Tear the client down, giving the child a short grace period to
    /// exit before killing it.
    pub async fn close(mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.child.take() {
            let grace = std::time::Duration::from_secs(CHILD_EXIT_GRACE_SECS);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                tracing::debug!("server did not exit in time, killing it");
                let _ = child.kill().await;
            }
        }
        self.reader_task.abort();
        self.shared.shut_down().await;
    }
}

fn check_params(params: Option<&Value>) -> Result<(), Error> {
    match params {
        None => Ok(()),
        Some(value) if message::is_valid_params(value) => Ok(()),
        Some(_) => Err(Error::InvalidParams),
    }
}

/// Route one inbound frame. Runs on the inbound task; message N is fully
/// dispatched (all handlers awaited) before message N+1 is classified.
async fn dispatch(shared: &Shared, frame: &Value) {
    match message::classify(frame) {
        Incoming::Request(request) => dispatch_request(shared, request).await,
        Incoming::Notification(note) => {
            for handler in shared.notify_handlers() {
                if let Err(e) = handler(note.clone()).await {
                    tracing::warn!("notification handler failed for '{}': {e:#}", note.method);
                }
            }
        }
        Incoming::Response(response) => resolve_response(shared, response).await,
        Incoming::Unrecognized => tracing::trace!("dropping unrecognized frame"),
    }
}

async fn dispatch_request(shared: &Shared, request: RequestMessage) {
    let id = request.id.clone();
    let method = request.method.clone();

    let mut result = None;
    for handler in shared.request_handlers() {
        match handler(request.clone()).await {
            Ok(Some(value)) => {
                result = Some(value);
                break;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("request handler failed for '{method}': {e:#}"),
        }
    }

    // No handler claiming a request is not an error: server-initiated
    // requests cover optional capabilities, and an unclaimed one simply
    // goes unanswered.
    let Some(result) = result else {
        tracing::debug!("no handler claimed server request '{method}'");
        return;
    };

    let response = json!({ "jsonrpc": "2.0", "id": id, "result": result });
    let _ = shared.write(&response).await;
}

async fn resolve_response(shared: &Shared, response: ResponseMessage) {
    // This client only ever issues integer ids, so anything else cannot
    // match the pending table.
    let Some(id) = response.id.as_u64() else {
        tracing::trace!("dropping response with non-numeric id");
        return;
    };
    let waiter = shared.pending.lock().await.inflight.remove(&id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => tracing::trace!("dropping response for unmatched request id {id}"),
    }
}
