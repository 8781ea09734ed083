//! The server request loop (spec.md §4.3): per-connection handshake,
//! concurrent dispatch to registered methods, per-request handle
//! timeout, and serialized response writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::codec::{self, CodecReader, CodecWriter, OwnedBody};
use crate::handshake;
use crate::message::{EmptyBody, Header, Seq};
use crate::service::{Service, ServiceRegistry};
use crate::transport::{Listener, Stream};
use crate::Error;

/// Accumulates registered services before producing an immutable
/// [`Server`] (spec.md §3 ADDED "Configuration surface").
#[derive(Default)]
pub struct ServerBuilder {
    registry: ServiceRegistry,
}

impl ServerBuilder {
    pub fn new() -> Self {
        ServerBuilder::default()
    }

    pub fn register(self, name: impl Into<String>, service: Service) -> Result<Self, Error> {
        self.registry.register(name, service)?;
        Ok(self)
    }

    pub fn build(self) -> Server {
        Server {
            registry: Arc::new(self.registry),
        }
    }
}

/// An explicit server value (spec.md §9 "treat a process-wide default as
/// an opt-in convenience atop an explicit server; the core is the
/// explicit server" — this crate stops at the explicit server and does
/// not add a global-default wrapper).
pub struct Server {
    registry: Arc<ServiceRegistry>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Binds `addr` (`network@address`, spec.md §6) and serves accepted
    /// connections until the listener itself errors. Each connection runs
    /// on its own spawned task and does not block other connections.
    pub async fn accept(&self, addr: &str) -> Result<(), Error> {
        let listener = Listener::bind(addr).await?;
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("accepted connection from {}", peer);
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_conn(registry, stream).await {
                    warn!("connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

/// One accepted connection's handshake plus dispatch loop (spec.md
/// §4.3's "Per-connection lifecycle").
async fn serve_conn(registry: Arc<ServiceRegistry>, mut stream: Box<dyn Stream>) -> Result<(), Error> {
    let options = handshake::read_options(&mut stream).await?;
    let factory = codec::lookup(&options.codec)?;
    let (reader, writer) = factory(stream);
    serve_codec(registry, reader, writer, options.handle_timeout).await
}

async fn serve_codec(
    registry: Arc<ServiceRegistry>,
    mut reader: Box<dyn CodecReader>,
    writer: Box<dyn CodecWriter>,
    handle_timeout: Duration,
) -> Result<(), Error> {
    let writer = Arc::new(AsyncMutex::new(writer));
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let header = match reader.read_header().await {
            Ok(Some(h)) => h,
            Ok(None) => break,
            Err(e) => {
                debug!("connection closing: {}", e);
                break;
            }
        };

        match registry.find(&header.service_method) {
            Ok((service, method_name)) => {
                let argv = reader.read_body().await?;
                let writer = writer.clone();
                workers.push(tokio::spawn(handle_request(
                    service,
                    method_name,
                    header.seq,
                    argv,
                    writer,
                    handle_timeout,
                )));
            }
            Err(e) => {
                // Resolution failed before we know the argument shape —
                // the body must still be pulled off the wire or framing
                // is lost (spec.md §9, the easiest bug to miss here).
                let body = reader.read_body().await?;
                body.discard();
                let seq = header.seq;
                let message = e.to_string();
                let writer = writer.clone();
                workers.push(tokio::spawn(async move {
                    send_response(&writer, Header::response_error(seq, message), empty_body()).await;
                }));
            }
        }
    }

    for worker in workers {
        let _ = worker.await;
    }

    let mut w = writer.lock().await;
    w.close().await?;
    drop(w);
    reader.close().await?;
    Ok(())
}

/// Runs one handler to completion and writes its response, racing a
/// timer when `handle_timeout` is non-zero.
///
/// The handler is never cancelled (spec.md §9's open question rules this
/// out as unsafe without a cancellation primitive): it is spawned as its
/// own task that always runs to completion, and an `responded` flag
/// arbitrates which of "handler finished" or "timer fired" gets to write
/// the single allowed response for this `seq`. If the timer wins, the
/// handler's eventual result is simply dropped when it later arrives.
async fn handle_request(
    service: Arc<Service>,
    method_name: String,
    seq: Seq,
    argv: OwnedBody,
    writer: Arc<AsyncMutex<Box<dyn CodecWriter>>>,
    handle_timeout: Duration,
) {
    let handler_task: JoinHandle<Result<OwnedBody, String>> = tokio::spawn({
        let service = service.clone();
        let method_name = method_name.clone();
        async move {
            let method = service
                .find_method(&method_name)
                .expect("method resolved at dispatch time still present");
            method.call(argv).await
        }
    });

    let responded = Arc::new(AtomicBool::new(false));
    let completion = {
        let writer = writer.clone();
        let responded = responded.clone();
        async move {
            let result = match handler_task.await {
                Ok(r) => r,
                Err(e) => Err(format!("handler task failed: {}", e)),
            };
            if !responded.swap(true, Ordering::SeqCst) {
                respond(&writer, seq, result).await;
            }
        }
    };

    if handle_timeout.is_zero() {
        completion.await;
        return;
    }

    tokio::spawn(completion);
    tokio::time::sleep(handle_timeout).await;
    if !responded.swap(true, Ordering::SeqCst) {
        let message = format!("request handle timeout: expect within {:?}", handle_timeout);
        send_response(&writer, Header::response_error(seq, message), empty_body()).await;
    }
}

async fn respond(writer: &Arc<AsyncMutex<Box<dyn CodecWriter>>>, seq: Seq, result: Result<OwnedBody, String>) {
    match result {
        Ok(body) => send_response(writer, Header::response_ok(seq), body).await,
        Err(message) => send_response(writer, Header::response_error(seq, message), empty_body()).await,
    }
}

async fn send_response(writer: &Arc<AsyncMutex<Box<dyn CodecWriter>>>, header: Header, body: OwnedBody) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write(&header, &body).await {
        error!("failed to write response for seq {}: {}", header.seq, e);
    }
}

fn empty_body() -> OwnedBody {
    OwnedBody::encode(&EmptyBody).expect("EmptyBody always encodes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceBuilder;

    struct Foo;

    async fn sum(_foo: Arc<Foo>, args: (i64, i64)) -> Result<i64, String> {
        Ok(args.0 + args.1)
    }

    async fn slow(_foo: Arc<Foo>, _args: ()) -> Result<(), String> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    }

    fn foo_registry() -> Arc<ServiceRegistry> {
        let registry = ServiceRegistry::new();
        registry
            .register(
                "Foo",
                ServiceBuilder::new("Foo", Foo)
                    .method("Sum", sum)
                    .method("Slow", slow)
                    .build(),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn dispatch_resolves_and_invokes_registered_method() {
        let (client_side, server_side) = tokio::io::duplex(8192);
        let (mut creader, mut cwriter) = codec::binary::new(Box::new(client_side));
        let (sreader, swriter) = codec::binary::new(Box::new(server_side));

        tokio::spawn(serve_codec(foo_registry(), sreader, swriter, Duration::ZERO));

        cwriter
            .write(&Header::request("Foo.Sum", 1), &OwnedBody::encode(&(3i64, 4i64)).unwrap())
            .await
            .unwrap();

        let header = creader.read_header().await.unwrap().unwrap();
        assert_eq!(header.seq, 1);
        assert_eq!(header.error, "");
        let body = creader.read_body().await.unwrap();
        let value: i64 = body.decode().unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn unknown_service_reports_error_and_connection_stays_usable() {
        let (client_side, server_side) = tokio::io::duplex(8192);
        let (mut creader, mut cwriter) = codec::binary::new(Box::new(client_side));
        let (sreader, swriter) = codec::binary::new(Box::new(server_side));

        tokio::spawn(serve_codec(foo_registry(), sreader, swriter, Duration::ZERO));

        cwriter
            .write(&Header::request("NoSuch.Method", 1), &OwnedBody::encode(&()).unwrap())
            .await
            .unwrap();
        let header = creader.read_header().await.unwrap().unwrap();
        assert_eq!(header.seq, 1);
        assert!(header.error.contains("can't find service"));

        cwriter
            .write(&Header::request("Foo.Sum", 2), &OwnedBody::encode(&(1i64, 1i64)).unwrap())
            .await
            .unwrap();
        let header = creader.read_header().await.unwrap().unwrap();
        assert_eq!(header.seq, 2);
        assert_eq!(header.error, "");
        let body = creader.read_body().await.unwrap();
        let value: i64 = body.decode().unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn slow_handler_yields_a_timeout_and_no_second_response() {
        let (client_side, server_side) = tokio::io::duplex(8192);
        let (mut creader, mut cwriter) = codec::binary::new(Box::new(client_side));
        let (sreader, swriter) = codec::binary::new(Box::new(server_side));

        tokio::spawn(serve_codec(
            foo_registry(),
            sreader,
            swriter,
            Duration::from_millis(50),
        ));

        cwriter
            .write(&Header::request("Foo.Slow", 1), &OwnedBody::encode(&()).unwrap())
            .await
            .unwrap();

        let header = tokio::time::timeout(Duration::from_millis(500), creader.read_header())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(header.seq, 1);
        assert!(header.error.contains("handle timeout"));

        // The handler keeps running in the background (spec.md §9) and
        // must not produce a second response for seq 1; wait past its
        // completion and confirm nothing else arrives.
        let nothing_more = tokio::time::timeout(Duration::from_millis(400), creader.read_header()).await;
        assert!(nothing_more.is_err(), "expected no second response for the timed-out call");
    }
}
