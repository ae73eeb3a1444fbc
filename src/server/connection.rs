//! Host-controller connection handling.
//!
//! Each connection carries requests in both directions. Inbound frames are
//! decoded and either dispatched to the [`Handler`] on a bounded worker pool
//! (requests) or matched against the correlation table (responses to
//! master-initiated calls such as pings and forwarded operations).
//!
//! The correlation table holds a `oneshot` completion per in-flight
//! outbound request. Closing the connection drops every entry, which wakes
//! every waiter with a connection-closed error; nothing in this crate parks
//! on a dead connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::sync::oneshot;

use crate::constants::{CONNECTION_WORKERS, MAX_FRAME_SIZE, WRITER_QUEUE_DEPTH};
use crate::domain::metrics;
use crate::encode::ToByte;
use crate::error::{Error, MgmtErrorCode, Result};
use crate::protocol::{
    Frame, Op, Request, RequestHeader, ResponseFrame, WireResponse, encode_request_frame,
};
use crate::types::{ConnectionId, CorrelationId};

use super::handler::{Handler, Reply, RequestContext};

/// Shared handle to a live host-controller connection.
///
/// Handed to request handlers and the heartbeat monitor. Cheap to clone via
/// `Arc`; outlives the connection task, after which every operation fails
/// with a connection-closed error.
pub struct ConnectionHandle {
    id: uuid::Uuid,
    addr: SocketAddr,
    local_connection_id: ConnectionId,
    writer_tx: mpsc::Sender<Vec<u8>>,
    /// In-flight master-initiated requests awaiting a response frame.
    pending: DashMap<i32, oneshot::Sender<(i16, Bytes)>>,
    next_correlation: AtomicI32,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last inbound frame. Benign
    /// concurrent writes; liveness only needs a recent-enough value.
    last_activity_ms: AtomicU64,
    closed: AtomicBool,
    close_notify: Notify,
    /// Host name bound after a committed registration; used for teardown.
    peer_identity: std::sync::Mutex<Option<String>>,
}

impl ConnectionHandle {
    fn new(
        addr: SocketAddr,
        local_connection_id: ConnectionId,
        writer_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        ConnectionHandle {
            id: uuid::Uuid::new_v4(),
            addr,
            local_connection_id,
            writer_tx,
            pending: DashMap::new(),
            next_correlation: AtomicI32::new(1),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            peer_identity: std::sync::Mutex::new(None),
        }
    }

    /// Stable identity of this connection within the process.
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    /// The host controller's address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// This process's connection id, reported in ping replies.
    pub fn local_connection_id(&self) -> ConnectionId {
        self.local_connection_id
    }

    /// Bind the registered host's name to this connection.
    pub fn bind_identity(&self, name: &str) {
        let mut slot = self.peer_identity.lock().expect("identity lock poisoned");
        *slot = Some(name.to_string());
    }

    /// Name of the host registered over this connection, if any.
    pub fn identity(&self) -> Option<String> {
        self.peer_identity
            .lock()
            .expect("identity lock poisoned")
            .clone()
    }

    /// Record inbound traffic; any frame counts as liveness.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection.
    ///
    /// Idempotent: the first caller wins. Fails every in-flight outbound
    /// call and wakes the read and write loops.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(client = %self.addr, "Closing connection");
            self.pending.clear();
            self.close_notify.notify_waiters();
        }
    }

    /// Wait until the connection is closed.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Send a request to the host and await its response.
    ///
    /// There is deliberately no timeout here: liveness is the heartbeat
    /// monitor's responsibility, and a stalled call resolves when the
    /// connection closes.
    pub async fn call(&self, op: Op, body: Vec<u8>) -> Result<(MgmtErrorCode, Bytes)> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(format!(
                "connection to {} is closed",
                self.addr
            )));
        }

        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation, tx);

        let frame = encode_request_frame(op, CorrelationId::new(correlation), &body)?;
        if self.writer_tx.send(frame).await.is_err() {
            self.pending.remove(&correlation);
            return Err(Error::ConnectionClosed(format!(
                "writer for {} is gone",
                self.addr
            )));
        }

        match rx.await {
            Ok((status, body)) => {
                let code = num_traits::FromPrimitive::from_i16(status)
                    .unwrap_or(MgmtErrorCode::Unknown);
                Ok((code, body))
            }
            Err(_) => Err(Error::ConnectionClosed(format!(
                "connection to {} closed while awaiting {}",
                self.addr,
                op.as_str()
            ))),
        }
    }

    /// Probe the host and return the connection id it reports.
    pub async fn ping(&self) -> Result<ConnectionId> {
        let (code, body) = self.call(Op::Ping, Vec::new()).await?;
        if !code.is_ok() {
            return Err(Error::Protocol(format!(
                "ping rejected with {}",
                code.as_str()
            )));
        }
        if body.len() < 8 {
            return Err(Error::Parse(body));
        }
        let mut cursor = body;
        Ok(ConnectionId::new(cursor.get_i64()))
    }

    /// Send a response frame for a request handled on this connection.
    pub async fn send_response(&self, response: WireResponse) -> Result<()> {
        let frame = response.encode_with_size()?;
        self.writer_tx.send(frame).await.map_err(|_| {
            Error::ConnectionClosed(format!("writer for {} is gone", self.addr))
        })
    }

    /// Complete the in-flight call matching a response frame.
    fn complete_pending(&self, response: ResponseFrame) -> bool {
        match self.pending.remove(&response.correlation_id.value()) {
            Some((_, tx)) => {
                let _ = tx.send((response.status, response.body));
                true
            }
            None => false,
        }
    }
}

/// A host-controller connection being served by the domain controller.
pub struct HostConnection<S> {
    stream: S,
    handle: Arc<ConnectionHandle>,
    writer_rx: mpsc::Receiver<Vec<u8>>,
}

impl<S> HostConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Create a new connection over an accepted stream.
    pub fn new(stream: S, addr: SocketAddr, local_connection_id: ConnectionId) -> Self {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let handle = Arc::new(ConnectionHandle::new(addr, local_connection_id, writer_tx));
        HostConnection {
            stream,
            handle,
            writer_rx,
        }
    }

    /// Shared handle for callers that outlive this connection task.
    pub fn handle(&self) -> Arc<ConnectionHandle> {
        self.handle.clone()
    }

    /// Serve requests from this connection until it closes.
    pub async fn run<H: Handler + 'static>(self, handler: Arc<H>) -> Result<()> {
        metrics::ACTIVE_CONNECTIONS.inc();

        let handle = self.handle.clone();
        let result = self.run_inner(handler.clone()).await;

        // The close flag may already be set (heartbeat, protocol violation);
        // setting it here covers plain EOF and read errors.
        handle.close();
        handler.connection_closed(&handle).await;

        metrics::ACTIVE_CONNECTIONS.dec();
        result
    }

    async fn run_inner<H: Handler + 'static>(self, handler: Arc<H>) -> Result<()> {
        let HostConnection {
            stream,
            handle,
            writer_rx,
        } = self;

        let (mut read_half, write_half) = tokio::io::split(stream);
        let mut writer = tokio::spawn(write_loop(write_half, writer_rx, handle.clone()));
        let workers = Arc::new(Semaphore::new(CONNECTION_WORKERS));

        let result = loop {
            tokio::select! {
                _ = handle.wait_closed() => break Ok(()),
                frame = read_frame(&mut read_half) => match frame {
                    Ok(data) => {
                        handle.touch();
                        if let Err(e) = route_frame(&handler, &handle, &workers, data).await {
                            break Err(e);
                        }
                    }
                    Err(Error::ConnectionClosed(_)) => {
                        tracing::debug!(client = %handle.addr(), "Host controller disconnected");
                        break Ok(());
                    }
                    Err(e) => {
                        tracing::error!(client = %handle.addr(), error = ?e, "Error reading frame");
                        break Err(e);
                    }
                }
            }
        };

        handle.close();
        // Give the writer a chance to drain (it exits on the close flag once
        // the queue is empty); a peer that stopped reading gets cut off.
        if tokio::time::timeout(Duration::from_secs(5), &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
        result
    }
}

/// Route one decoded frame: responses complete the correlation table,
/// requests are dispatched to the handler on a pooled worker.
async fn route_frame<H: Handler + 'static>(
    handler: &Arc<H>,
    handle: &Arc<ConnectionHandle>,
    workers: &Arc<Semaphore>,
    data: Bytes,
) -> Result<()> {
    match Frame::parse(data) {
        Err(e) => {
            tracing::error!(client = %handle.addr(), error = ?e, "Malformed frame");
            handle.close();
            Err(e)
        }
        Ok(Frame::Response(response)) => {
            if handle.complete_pending(response) {
                Ok(())
            } else {
                // Unmatched responses only happen when the peer invents
                // correlation ids; fatal like any other violation.
                handle.close();
                Err(Error::Protocol("response with unknown correlation id".into()))
            }
        }
        Ok(Frame::Request(header, request)) => {
            let permit = match workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            let handler = handler.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                dispatch_request(handler, handle, header, request).await;
                drop(permit);
            });
            Ok(())
        }
    }
}

/// Dispatch a decoded request to the handler and write the response.
async fn dispatch_request<H: Handler>(
    handler: Arc<H>,
    handle: Arc<ConnectionHandle>,
    header: RequestHeader,
    request: Request,
) {
    let start = Instant::now();
    let ctx = RequestContext {
        client_addr: handle.addr(),
        correlation_id: header.correlation_id,
        request_id: uuid::Uuid::new_v4(),
        connection: handle.clone(),
    };

    tracing::debug!(
        request_id = %ctx.request_id,
        op = header.op.as_str(),
        client = %ctx.client_addr,
        correlation_id = %header.correlation_id,
        "Handling request"
    );

    let reply = match request {
        Request::RegisterHost(info) => handler.handle_register(&ctx, info).await,
        Request::CompleteRegistration(data) => handler.handle_complete(&ctx, data).await,
        Request::UnregisterHost(data) => handler.handle_unregister(&ctx, data).await,
        Request::Ping => {
            // Answered at the transport layer; host-side probes of the
            // master need no domain logic.
            let mut body = Vec::new();
            match handle.local_connection_id().encode(&mut body) {
                Ok(()) => Reply::Ok(body),
                Err(_) => Reply::error(MgmtErrorCode::Unknown, "failed to encode connection id"),
            }
        }
        Request::ExecuteOperation(_) => Reply::error(
            MgmtErrorCode::ProtocolViolation,
            "the domain controller does not accept forwarded operations",
        ),
        Request::Unknown(opcode, _) => Reply::error(
            MgmtErrorCode::ProtocolViolation,
            format!("unsupported opcode {:#06x}", opcode),
        ),
    };

    let fatal = reply.is_fatal();
    let status = match &reply {
        Reply::Ok(_) | Reply::Sent => "success",
        Reply::Err { .. } => "error",
    };
    metrics::record_request(header.op.as_str(), status, start.elapsed().as_secs_f64());

    match reply {
        Reply::Sent => {}
        Reply::Ok(body) => {
            if let Err(e) = handle
                .send_response(WireResponse::ok(header.correlation_id, body))
                .await
            {
                tracing::debug!(client = %handle.addr(), error = ?e, "Failed to write response");
            }
        }
        Reply::Err { code, message } => {
            tracing::warn!(
                request_id = %ctx.request_id,
                op = header.op.as_str(),
                client = %ctx.client_addr,
                code = code.as_str(),
                message = %message,
                "Request failed"
            );
            if let Err(e) = handle
                .send_response(WireResponse::error(header.correlation_id, code, &message))
                .await
            {
                tracing::debug!(client = %handle.addr(), error = ?e, "Failed to write error response");
            }
        }
    }

    if fatal {
        handle.close();
    }
}

/// Drain the outbound queue onto the socket until the connection closes.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    handle: Arc<ConnectionHandle>,
) {
    loop {
        // Biased so queued frames (e.g. the error response that caused a
        // close) drain before the close flag ends the loop.
        tokio::select! {
            biased;
            maybe = rx.recv() => match maybe {
                Some(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        tracing::debug!(client = %handle.addr(), error = ?e, "Write failed");
                        handle.close();
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        tracing::debug!(client = %handle.addr(), error = ?e, "Flush failed");
                        handle.close();
                        break;
                    }
                }
                None => break,
            },
            _ = handle.wait_closed() => break,
        }
    }
}

/// Read a single size-prefixed frame payload.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut size_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut size_buf).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(Error::ConnectionClosed("connection closed".to_owned()));
        }
        return Err(Error::Io(e.kind()));
    }

    let size = i32::from_be_bytes(size_buf);
    if size <= 0 {
        return Err(Error::Protocol(format!("invalid frame size {}", size)));
    }
    let size = size as usize;
    if size > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame size {} exceeds maximum {}",
            size, MAX_FRAME_SIZE
        )));
    }

    let mut data = vec![0u8; size];
    if let Err(e) = reader.read_exact(&mut data).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(Error::ConnectionClosed(
                "connection closed mid-frame".to_owned(),
            ));
        }
        return Err(Error::Io(e.kind()));
    }

    Ok(Bytes::from(data))
}
