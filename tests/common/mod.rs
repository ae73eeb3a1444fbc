//! Shared harness for integration tests: a real server plus a hand-rolled
//! host-controller client speaking the management wire protocol.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BufMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use domainlink::domain::{
    DomainConfig, DomainController, DomainModel, OperationResult, OutboundOperation,
    ResourceAddress,
};
use domainlink::protocol::{Frame, Op, Request, ResponseFrame, WireResponse};
use domainlink::server::DomainServer;
use domainlink::types::CorrelationId;

/// Start a domain controller on an ephemeral port.
pub async fn start_server(
    config: DomainConfig,
    model: DomainModel,
) -> (DomainController, Arc<DomainServer<DomainController>>, SocketAddr) {
    let controller = DomainController::new(config, model);
    let server = Arc::new(
        DomainServer::new("127.0.0.1:0", controller.clone())
            .await
            .expect("bind test server"),
    );
    let addr = server.local_addr().expect("server addr");
    let background = server.clone();
    tokio::spawn(async move {
        let _ = background.run().await;
    });
    (controller, server, addr)
}

/// A model with the usual fixture resources:
/// profiles `default` and `prod`, socket binding group `standard`, and
/// server group `sg1` bound to `default`.
pub fn seeded_model() -> DomainModel {
    let mut model = DomainModel::new();
    let mut described = serde_json::Map::new();
    described.insert("description".into(), serde_json::json!("base profile"));
    model
        .add_resource(ResourceAddress::of("profile", "default"), described)
        .unwrap();
    model
        .add_resource(ResourceAddress::of("profile", "prod"), serde_json::Map::new())
        .unwrap();
    model
        .add_resource(
            ResourceAddress::of("socket-binding-group", "standard"),
            serde_json::Map::new(),
        )
        .unwrap();

    let mut group = serde_json::Map::new();
    group.insert("profile".into(), serde_json::json!("default"));
    model
        .add_resource(ResourceAddress::of("server-group", "sg1"), group)
        .unwrap();
    model
}

/// Ignore declaration used when registering a test slave.
pub struct IgnoreDecl {
    pub resource_type: &'static str,
    pub wildcard: bool,
    pub names: Vec<&'static str>,
}

impl IgnoreDecl {
    pub fn named(resource_type: &'static str, name: &'static str) -> Self {
        IgnoreDecl {
            resource_type,
            wildcard: false,
            names: vec![name],
        }
    }

    pub fn wildcard(resource_type: &'static str) -> Self {
        IgnoreDecl {
            resource_type,
            wildcard: true,
            names: vec![],
        }
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

fn put_null_string(buf: &mut Vec<u8>) {
    buf.put_i16(-1);
}

fn put_nullable_string(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => put_string(buf, s),
        None => put_null_string(buf),
    }
}

/// Encode a RegisterHost body the way a host controller does.
pub fn encode_host_info(
    name: &str,
    version: (i8, i8, i8),
    ignored: &[IgnoreDecl],
) -> Vec<u8> {
    let mut buf = Vec::new();
    put_string(&mut buf, name);
    put_string(&mut buf, "30.0.1.Final");
    put_null_string(&mut buf);
    put_null_string(&mut buf);
    buf.put_i8(version.0);
    buf.put_i8(version.1);
    buf.put_i8(version.2);
    buf.put_i32(ignored.len() as i32);
    for decl in ignored {
        put_string(&mut buf, decl.resource_type);
        buf.put_i8(decl.wildcard as i8);
        buf.put_i32(decl.names.len() as i32);
        for name in &decl.names {
            put_string(&mut buf, name);
        }
    }
    buf
}

/// Hand-rolled host controller for driving the master over a real socket.
pub struct Slave {
    stream: TcpStream,
    pub connection_id: i64,
    next_correlation: i32,
}

impl Slave {
    pub async fn connect(addr: SocketAddr, connection_id: i64) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to master");
        Slave {
            stream,
            connection_id,
            next_correlation: 1,
        }
    }

    fn next_correlation(&mut self) -> i32 {
        let id = self.next_correlation;
        self.next_correlation += 1;
        id
    }

    async fn send_request(&mut self, op: Op, body: &[u8]) -> i32 {
        let correlation = self.next_correlation();
        let frame =
            domainlink::protocol::encode_request_frame(op, CorrelationId::new(correlation), body)
                .expect("encode request");
        self.stream.write_all(&frame).await.expect("write request");
        correlation
    }

    /// Read one frame; `None` when the master closed the connection.
    pub async fn read_frame(&mut self) -> Option<Frame> {
        let mut size_buf = [0u8; 4];
        if self.stream.read_exact(&mut size_buf).await.is_err() {
            return None;
        }
        let size = i32::from_be_bytes(size_buf) as usize;
        let mut data = vec![0u8; size];
        if self.stream.read_exact(&mut data).await.is_err() {
            return None;
        }
        Some(Frame::parse(data.into()).expect("parse frame"))
    }

    /// Read frames until a response arrives, answering pings along the way.
    pub async fn read_response(&mut self) -> ResponseFrame {
        loop {
            match self.read_frame().await.expect("connection closed") {
                Frame::Response(response) => return response,
                Frame::Request(header, Request::Ping) => {
                    self.reply_ping(header.correlation_id).await;
                }
                Frame::Request(header, request) => {
                    panic!("unexpected request {:?} ({:?})", request, header.op)
                }
            }
        }
    }

    /// Send REGISTER and return the master's response (snapshot or error).
    pub async fn register(&mut self, name: &str) -> ResponseFrame {
        self.register_with(name, (3, 0, 0), &[]).await
    }

    pub async fn register_with(
        &mut self,
        name: &str,
        version: (i8, i8, i8),
        ignored: &[IgnoreDecl],
    ) -> ResponseFrame {
        let body = encode_host_info(name, version, ignored);
        self.send_request(Op::RegisterHost, &body).await;
        self.read_response().await
    }

    /// Send REGISTER without waiting for the response.
    pub async fn send_register(&mut self, name: &str) {
        let body = encode_host_info(name, (3, 0, 0), &[]);
        self.send_request(Op::RegisterHost, &body).await;
    }

    /// Report the local outcome of applying the snapshot.
    pub async fn complete(&mut self, commit: bool, message: Option<&str>) -> ResponseFrame {
        let mut body = Vec::new();
        body.put_i8(if commit { 0 } else { 1 });
        put_nullable_string(&mut body, message);
        self.send_request(Op::CompleteRegistration, &body).await;
        self.read_response().await
    }

    /// Full happy-path handshake.
    pub async fn register_and_commit(&mut self, name: &str) -> ResponseFrame {
        let snapshot = self.register(name).await;
        assert_eq!(snapshot.status, 0, "registration rejected");
        let done = self.complete(true, None).await;
        assert_eq!(done.status, 0, "completion rejected");
        snapshot
    }

    pub async fn unregister(&mut self, reason: Option<&str>) -> ResponseFrame {
        let mut body = Vec::new();
        put_nullable_string(&mut body, reason);
        self.send_request(Op::UnregisterHost, &body).await;
        self.read_response().await
    }

    /// Probe the master; returns the correlation id to match the pong.
    pub async fn send_ping(&mut self) -> CorrelationId {
        let correlation = self.send_request(Op::Ping, &[]).await;
        CorrelationId::new(correlation)
    }

    /// Answer a ping with this slave's connection id.
    pub async fn reply_ping(&mut self, correlation: CorrelationId) {
        let body = self.connection_id.to_be_bytes().to_vec();
        self.respond_ok(correlation, body).await;
    }

    /// Answer a ping with an arbitrary connection id.
    pub async fn reply_ping_with(&mut self, correlation: CorrelationId, connection_id: i64) {
        self.respond_ok(correlation, connection_id.to_be_bytes().to_vec())
            .await;
    }

    pub async fn respond_ok(&mut self, correlation: CorrelationId, body: Vec<u8>) {
        let frame = WireResponse::ok(correlation, body)
            .encode_with_size()
            .expect("encode response");
        self.stream.write_all(&frame).await.expect("write response");
    }

    /// Wait for a forwarded operation, answering pings along the way.
    pub async fn expect_execute(&mut self) -> (CorrelationId, OutboundOperation) {
        loop {
            match self.read_frame().await.expect("connection closed") {
                Frame::Request(header, Request::ExecuteOperation(body)) => {
                    let outbound: OutboundOperation =
                        serde_json::from_slice(&body).expect("decode outbound operation");
                    return (header.correlation_id, outbound);
                }
                Frame::Request(header, Request::Ping) => {
                    self.reply_ping(header.correlation_id).await;
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    /// Answer a forwarded operation.
    pub async fn reply_execute(&mut self, correlation: CorrelationId, result: &OperationResult) {
        let body = serde_json::to_vec(result).expect("encode result");
        self.respond_ok(correlation, body).await;
    }

    /// Serve forwarded operations with a fixed behavior in the background.
    ///
    /// Returns a handle yielding the operations received once the
    /// connection closes or `expected` operations were served.
    pub fn serve_executes(
        mut self,
        expected: usize,
        succeed: bool,
    ) -> tokio::task::JoinHandle<(Slave, Vec<OutboundOperation>)> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < expected {
                let (correlation, outbound) = self.expect_execute().await;
                let result = if succeed {
                    OperationResult::success(serde_json::Value::Null)
                } else {
                    OperationResult::failed("host refused the change")
                };
                self.reply_execute(correlation, &result).await;
                seen.push(outbound);
            }
            (self, seen)
        })
    }
}

/// Poll until `check` passes or the deadline hits.
pub async fn wait_until<F, Fut>(description: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", description);
}
