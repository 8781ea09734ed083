//! The client call multiplexer (spec.md §4.4): assign sequence numbers,
//! correlate inbound responses to pending calls, and propagate shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use flume::{Receiver, Sender};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::codec::{self, CodecReader, CodecWriter, OwnedBody};
use crate::handshake::{self, Options};
use crate::message::{Header, Seq};
use crate::transport;
use crate::Error;

/// Type-erased completion target for one pending call: knows how to
/// decode an `OwnedBody` into its caller's expected reply type, or fail
/// with an error, without the multiplexer itself knowing that type.
trait PendingSlot: Send {
    fn complete_ok(self: Box<Self>, body: OwnedBody);
    fn complete_err(self: Box<Self>, err: Error);
}

struct TypedSlot<Res> {
    sender: Sender<Result<Res, Error>>,
}

impl<Res: DeserializeOwned + Send + 'static> PendingSlot for TypedSlot<Res> {
    fn complete_ok(self: Box<Self>, body: OwnedBody) {
        let _ = self.sender.try_send(body.decode());
    }

    fn complete_err(self: Box<Self>, err: Error) {
        let _ = self.sender.try_send(Err(err));
    }
}

/// A call that has been sent (or failed before sending); await it to get
/// the reply. Backed by a capacity-1 `flume` channel, the buffered
/// completion queue spec.md §4.4's `go` requires — a send can never be
/// lost even if nothing is awaiting `wait` yet.
pub struct PendingCall<Res> {
    pub seq: Seq,
    receiver: Receiver<Result<Res, Error>>,
}

impl<Res> PendingCall<Res> {
    pub async fn wait(self) -> Result<Res, Error> {
        self.receiver.recv_async().await.unwrap_or(Err(Error::Shutdown))
    }
}

struct ClientState {
    next_seq: Seq,
    pending: HashMap<Seq, Box<dyn PendingSlot>>,
    closing: bool,
    shutdown: bool,
}

/// A live connection to an RPC server. Lives from [`Client::dial`] until
/// [`Client::close`] or a fatal receive error; after either, every
/// pending and subsequent call fails with [`Error::Shutdown`] (spec.md
/// §3's Client lifecycle).
pub struct Client {
    // Send lock: serializes sequence assignment + the codec write that
    // follows it. The state lock (inside `ClientState`) may be acquired
    // while this is held; never the reverse (spec.md §4.4 lock order).
    writer: Arc<AsyncMutex<Box<dyn CodecWriter>>>,
    state: Arc<StdMutex<ClientState>>,
    receiver_task: JoinHandle<()>,
}

impl Client {
    fn new(reader: Box<dyn CodecReader>, writer: Box<dyn CodecWriter>) -> Self {
        let state = Arc::new(StdMutex::new(ClientState {
            next_seq: 1,
            pending: HashMap::new(),
            closing: false,
            shutdown: false,
        }));
        let receiver_task = tokio::spawn(receive_loop(reader, state.clone()));
        Client {
            writer: Arc::new(AsyncMutex::new(writer)),
            state,
            receiver_task,
        }
    }

    /// Dials `addr` with default options (10s connect timeout, default
    /// codec, unlimited handle timeout).
    pub async fn dial(addr: &str) -> Result<Client, Error> {
        Client::dial_with_options(addr, Options::default()).await
    }

    pub async fn dial_with_options(addr: &str, options: Options) -> Result<Client, Error> {
        Client::dial_with_connector(addr, options, connect_and_handshake).await
    }

    /// Runs `connector` under `options.connect_timeout` (spec.md §4.5);
    /// a zero timeout means no deadline. Split out from [`Client::dial`]
    /// so the timeout-wrapping logic can be exercised against a
    /// deliberately slow stand-in connector, the same way the reference
    /// implementation's own dial-timeout test swaps in a slow
    /// constructor rather than relying on real network delay.
    async fn dial_with_connector<F, Fut>(addr: &str, options: Options, connector: F) -> Result<Client, Error>
    where
        F: FnOnce(String, Options) -> Fut,
        Fut: Future<Output = Result<Client, Error>>,
    {
        let connect_timeout = options.connect_timeout;
        let fut = connector(addr.to_string(), options);
        if connect_timeout.is_zero() {
            return fut.await;
        }
        match tokio::time::timeout(connect_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "connect timeout: expect within {:?}",
                connect_timeout
            ))),
        }
    }

    /// Issues a call and returns a handle to await its reply (spec.md
    /// §4.4's `go`).
    pub async fn go<Req, Res>(&self, service_method: &str, args: Req) -> PendingCall<Res>
    where
        Req: Serialize + Send + 'static,
        Res: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = flume::bounded(1);
        let mut writer = self.writer.lock().await;

        let seq = {
            let mut state = self.state.lock().expect("client state lock poisoned");
            if state.closing || state.shutdown {
                let _ = tx.try_send(Err(Error::Shutdown));
                return PendingCall { seq: 0, receiver: rx };
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.insert(seq, Box::new(TypedSlot { sender: tx }));
            seq
        };

        match OwnedBody::encode(&args) {
            Ok(body) => {
                let header = Header::request(service_method, seq);
                if let Err(e) = writer.write(&header, &body).await {
                    self.fail_pending(seq, e);
                }
            }
            Err(e) => self.fail_pending(seq, e),
        }

        PendingCall { seq, receiver: rx }
    }

    /// Synchronous convenience over [`Client::go`] (spec.md §4.4's `call`).
    pub async fn call<Req, Res>(&self, service_method: &str, args: Req) -> Result<Res, Error>
    where
        Req: Serialize + Send + 'static,
        Res: DeserializeOwned + Send + 'static,
    {
        self.go(service_method, args).await.wait().await
    }

    fn fail_pending(&self, seq: Seq, err: Error) {
        let mut state = self.state.lock().expect("client state lock poisoned");
        if let Some(slot) = state.pending.remove(&seq) {
            slot.complete_err(err);
        }
    }

    /// Closes the connection. A second call (or a call after the receive
    /// loop has already shut the client down) fails with
    /// [`Error::Shutdown`]. Every call pending at the time of this close
    /// is completed with [`Error::Shutdown`] immediately rather than
    /// waiting on the receive loop to notice a half-closed stream, which
    /// (over an in-process transport, or a TCP write-shutdown that the
    /// peer hasn't yet reacted to) might never happen within a bounded
    /// time (spec.md §4.4's `close`, invariant 4).
    pub async fn close(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().expect("client state lock poisoned");
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        self.receiver_task.abort();
        terminate_calls(&self.state);
        let mut writer = self.writer.lock().await;
        writer.close().await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.receiver_task.abort();
        terminate_calls(&self.state);
    }
}

async fn connect_and_handshake(addr: String, options: Options) -> Result<Client, Error> {
    let mut stream = transport::connect(&addr).await?;
    handshake::write_options(&mut stream, &options).await?;
    let factory = codec::lookup(&options.codec)?;
    let (reader, writer) = factory(stream);
    Ok(Client::new(reader, writer))
}

async fn receive_loop(mut reader: Box<dyn CodecReader>, state: Arc<StdMutex<ClientState>>) {
    loop {
        let header = match reader.read_header().await {
            Ok(Some(h)) => h,
            Ok(None) => break,
            Err(e) => {
                debug!("client receive loop exiting: {}", e);
                break;
            }
        };

        let slot = {
            let mut st = state.lock().expect("client state lock poisoned");
            st.pending.remove(&header.seq)
        };

        match slot {
            None => {
                // Already removed (e.g. on close), or a seq we never
                // issued; the body must still be consumed to hold frame
                // sync.
                if let Ok(body) = reader.read_body().await {
                    body.discard();
                }
            }
            Some(slot) => {
                if !header.error.is_empty() {
                    if let Ok(body) = reader.read_body().await {
                        body.discard();
                    }
                    slot.complete_err(crate::error::from_response_error(header.error));
                } else {
                    match reader.read_body().await {
                        Ok(body) => slot.complete_ok(body),
                        Err(e) => slot.complete_err(e),
                    }
                }
            }
        }
    }

    let _ = reader.close().await;
    terminate_calls(&state);
}

fn terminate_calls(state: &Arc<StdMutex<ClientState>>) {
    let pending = {
        let mut st = state.lock().expect("client state lock poisoned");
        st.shutdown = true;
        std::mem::take(&mut st.pending)
    };
    if !pending.is_empty() {
        warn!("client shutting down with {} pending call(s)", pending.len());
    }
    for (_seq, slot) in pending {
        slot.complete_err(Error::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    fn in_memory_client() -> (Client, Box<dyn CodecReader>, Box<dyn CodecWriter>) {
        let (client_side, server_side) = duplex(8192);
        let (creader, cwriter) = codec::binary::new(Box::new(client_side));
        let (sreader, swriter) = codec::binary::new(Box::new(server_side));
        (Client::new(creader, cwriter), sreader, swriter)
    }

    #[tokio::test]
    async fn sequence_numbers_start_at_one_and_increase() {
        let (client, _sreader, _swriter) = in_memory_client();
        let c1 = client.go::<_, ()>("Foo.Bar", ()).await;
        let c2 = client.go::<_, ()>("Foo.Bar", ()).await;
        assert_eq!(c1.seq, 1);
        assert_eq!(c2.seq, 2);
    }

    #[tokio::test]
    async fn a_successful_round_trip_delivers_the_reply() {
        let (client, mut sreader, mut swriter) = in_memory_client();
        let pending = client.go::<_, i64>("Foo.Sum", (3i64, 4i64)).await;

        let header = sreader.read_header().await.unwrap().unwrap();
        assert_eq!(header.seq, 1);
        let body = sreader.read_body().await.unwrap();
        let args: (i64, i64) = body.decode().unwrap();
        assert_eq!(args, (3, 4));

        swriter
            .write(&Header::response_ok(1), &OwnedBody::encode(&7i64).unwrap())
            .await
            .unwrap();

        assert_eq!(pending.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn an_error_reply_surfaces_as_an_error() {
        let (client, mut sreader, mut swriter) = in_memory_client();
        let pending = client.go::<_, ()>("NoSuch.Method", ()).await;

        let header = sreader.read_header().await.unwrap().unwrap();
        let body = sreader.read_body().await.unwrap();
        body.discard();

        swriter
            .write(
                &Header::response_error(header.seq, "can't find service NoSuch"),
                &OwnedBody::encode(&crate::message::EmptyBody).unwrap(),
            )
            .await
            .unwrap();

        let err = pending.wait().await.unwrap_err();
        assert!(err.to_string().contains("can't find service"));
    }

    #[tokio::test]
    async fn close_fails_a_pending_call_with_shutdown() {
        let (client, _sreader, _swriter) = in_memory_client();
        let pending = client.go::<_, ()>("Foo.Bar", ()).await;
        client.close().await.unwrap();
        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn closing_twice_fails_the_second_call() {
        let (client, _sreader, _swriter) = in_memory_client();
        client.close().await.unwrap();
        let err = client.close().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn a_call_after_close_fails_immediately() {
        let (client, _sreader, _swriter) = in_memory_client();
        client.close().await.unwrap();
        let result: Result<(), Error> = client.call("Foo.Bar", ()).await;
        assert!(matches!(result, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn connect_timeout_of_zero_means_no_limit() {
        let options = Options::default().with_connect_timeout(Duration::from_secs(0));
        let result = Client::dial_with_connector("unused", options, |_addr, _opts| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let (a, _b) = duplex(8192);
            let (reader, writer) = codec::binary::new(Box::new(a));
            Ok(Client::new(reader, writer))
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn a_slow_connector_trips_the_connect_timeout() {
        let options = Options::default().with_connect_timeout(Duration::from_millis(50));
        let result = Client::dial_with_connector("unused", options, |_addr, _opts| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let (a, _b) = duplex(8192);
            let (reader, writer) = codec::binary::new(Box::new(a));
            Ok(Client::new(reader, writer))
        })
        .await;
        let err = match result {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.to_string().contains("connect timeout"));
    }
}
