use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::LookupError;
use crate::model::LongForm;
use crate::transport::{
    EventKind, HttpTransport, TransferEvent, TransferHandle, Transport, TransportError,
};

/// Acromine dictionary endpoint. The query key is concatenated raw after
/// `?`; the service does not use `key=value` form.
pub const ACROMINE_ENDPOINT: &str = "http://www.nactem.ac.uk/software/acromine/dictionary.py";

type Callback = Box<dyn FnOnce(LookupOutcome) + Send>;
type Notify = Box<dyn FnOnce() + Send>;

/// Terminal outcome of a single `resolve` call.
#[derive(Debug)]
pub enum LookupOutcome {
    /// The transfer ran to its end, successfully or not.
    Completed(Completion),
    /// The lookup address could not be built from the key. Benign; no
    /// transfer was started and nothing failed.
    NoResult,
    /// A lookup for the same key was already in flight. The in-flight
    /// request keeps its own callback; this one is answered immediately
    /// with this neutral outcome and nothing else happens.
    DuplicateIgnored,
}

/// What a finished transfer produced.
#[derive(Debug)]
pub struct Completion {
    /// Whether the transfer succeeded at the transport level.
    pub succeeded: bool,
    /// Decoded record sequence, present only if the accumulated payload
    /// decoded cleanly.
    pub records: Option<Vec<Value>>,
    /// HTTP status, if response metadata arrived before completion.
    pub status: Option<u16>,
    /// Transport failure, or the decode failure when the transfer itself
    /// succeeded but the payload was unusable.
    pub error: Option<LookupError>,
}

impl Completion {
    /// Interprets the decoded records as long-form definitions.
    pub fn long_forms(&self) -> Vec<LongForm> {
        self.records
            .as_deref()
            .map(LongForm::from_lookup)
            .unwrap_or_default()
    }
}

enum Command {
    Resolve { key: String, callback: Callback },
    Cancel { done: Option<Notify> },
}

/// Handle to the lookup actor. Cloning is cheap; all clones talk to the
/// same single pending-request slot.
///
/// At most one lookup is in flight at a time. Resolving a new key while
/// another is pending silently abandons the old request; resolving the
/// same key is answered with [`LookupOutcome::DuplicateIgnored`]. Every
/// started request fires its callback at most once.
#[derive(Clone)]
pub struct LookupClient {
    commands: UnboundedSender<Command>,
}

impl LookupClient {
    /// Client against the real Acromine endpoint.
    ///
    /// Must be called from within a tokio runtime; the actor and its
    /// transfers run as spawned tasks.
    pub fn new() -> LookupClient {
        LookupClient::with_transport(HttpTransport::new(), ACROMINE_ENDPOINT)
    }

    /// Client with a custom transport and endpoint base.
    pub fn with_transport(
        transport: impl Transport,
        endpoint: impl Into<String>,
    ) -> LookupClient {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            transport,
            endpoint: endpoint.into(),
            commands: commands_rx,
            events_tx,
            events_rx,
            pending: None,
        };
        tokio::spawn(driver.run());
        LookupClient {
            commands: commands_tx,
        }
    }

    /// Starts a lookup for `key`, returning immediately.
    ///
    /// `key` must already be a normalized, percent-safe query string; the
    /// client performs no validation or encoding. The callback fires at
    /// most once: with the transfer's outcome, with
    /// [`LookupOutcome::DuplicateIgnored`] when the same key is already in
    /// flight, or never if this request is later cancelled or superseded.
    pub fn resolve(
        &self,
        key: impl Into<String>,
        on_complete: impl FnOnce(LookupOutcome) + Send + 'static,
    ) {
        // A failed send means the runtime is tearing down; the callback
        // is dropped uninvoked, same as a cancelled request.
        let _ = self.commands.send(Command::Resolve {
            key: key.into(),
            callback: Box::new(on_complete),
        });
    }

    /// Awaitable wrapper over [`resolve`](LookupClient::resolve).
    ///
    /// Returns `None` when the request was cancelled or superseded before
    /// completing.
    pub async fn lookup(&self, key: impl Into<String>) -> Option<LookupOutcome> {
        let (tx, rx) = oneshot::channel();
        self.resolve(key, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.ok()
    }

    /// Cancels the in-flight lookup, if any. Its callback never fires.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel { done: None });
    }

    /// [`cancel`](LookupClient::cancel) with a completion notification.
    /// Idempotent; `on_done` fires even when nothing was in flight.
    pub fn cancel_then(&self, on_done: impl FnOnce() + Send + 'static) {
        let _ = self.commands.send(Command::Cancel {
            done: Some(Box::new(on_done)),
        });
    }
}

impl Default for LookupClient {
    fn default() -> LookupClient {
        LookupClient::new()
    }
}

/// The single in-flight lookup's state. Lives in the driver's one slot;
/// nothing outside the actor can reach it.
struct PendingRequest {
    key: String,
    handle: TransferHandle,
    status: Option<u16>,
    buffer: Vec<u8>,
    records: Option<Vec<Value>>,
    decode_error: Option<serde_json::Error>,
    callback: Callback,
}

impl PendingRequest {
    fn new(key: String, handle: TransferHandle, callback: Callback) -> PendingRequest {
        PendingRequest {
            key,
            handle,
            status: None,
            buffer: Vec::new(),
            records: None,
            decode_error: None,
            callback,
        }
    }

    /// Aborts the transfer and drops the callback uninvoked.
    fn abandon(self) {
        self.handle.abort();
    }

    /// Fires the callback exactly once with the assembled outcome.
    fn complete(self, result: Result<(), TransportError>) {
        let completion = match result {
            // Transport failure still carries whatever decoded cleanly.
            Err(err) => Completion {
                succeeded: false,
                records: self.records,
                status: self.status,
                error: Some(LookupError::Transport(err)),
            },
            Ok(()) => Completion {
                succeeded: true,
                records: self.records,
                status: self.status,
                error: self.decode_error.map(LookupError::Decode),
            },
        };
        (self.callback)(LookupOutcome::Completed(completion));
    }
}

/// Actor loop owning the pending-request slot. Single writer by
/// construction: commands and transfer events are both funneled into this
/// task, so the slot needs no lock.
struct Driver<T> {
    transport: T,
    endpoint: String,
    commands: UnboundedReceiver<Command>,
    events_tx: UnboundedSender<TransferEvent>,
    events_rx: UnboundedReceiver<TransferEvent>,
    pending: Option<PendingRequest>,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every client handle dropped; shut down.
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
        if let Some(pending) = self.pending.take() {
            debug!(key = %pending.key, "client dropped, abandoning in-flight lookup");
            pending.abandon();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Resolve { key, callback } => self.start_lookup(key, callback),
            Command::Cancel { done } => {
                if let Some(pending) = self.pending.take() {
                    debug!(key = %pending.key, "cancelling in-flight lookup");
                    pending.abandon();
                }
                if let Some(done) = done {
                    done();
                }
            }
        }
    }

    fn start_lookup(&mut self, key: String, callback: Callback) {
        if let Some(pending) = self.pending.take() {
            if pending.key == key {
                debug!(%key, "lookup already in flight, ignoring duplicate");
                self.pending = Some(pending);
                callback(LookupOutcome::DuplicateIgnored);
                return;
            }
            debug!(old = %pending.key, new = %key, "superseding in-flight lookup");
            pending.abandon();
        }

        let url = match Url::parse(&format!("{}?{}", self.endpoint, key)) {
            Ok(url) => url,
            Err(err) => {
                warn!(%key, %err, "could not build lookup address");
                callback(LookupOutcome::NoResult);
                return;
            }
        };

        let handle = self.transport.start(url, &self.events_tx);
        self.pending = Some(PendingRequest::new(key, handle, callback));
    }

    fn handle_event(&mut self, event: TransferEvent) {
        let current = self.pending.as_ref().map(|p| p.handle.token());
        if current != Some(event.token) {
            // Late delivery from an aborted or superseded transfer.
            trace!(token = ?event.token, "discarding stale transfer event");
            return;
        }
        match event.kind {
            EventKind::Status(status) => {
                if let Some(pending) = self.pending.as_mut() {
                    debug!(key = %pending.key, status, "response metadata arrived");
                    pending.status = Some(status);
                }
            }
            EventKind::Chunk(bytes) => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.buffer.extend_from_slice(&bytes);
                    // Re-decode the whole accumulated payload; only a
                    // clean decode of everything received so far counts.
                    match serde_json::from_slice::<Vec<Value>>(&pending.buffer) {
                        Ok(records) => {
                            pending.records = Some(records);
                            pending.decode_error = None;
                        }
                        Err(err) => {
                            pending.records = None;
                            pending.decode_error = Some(err);
                        }
                    }
                }
            }
            EventKind::Done(result) => {
                if let Some(pending) = self.pending.take() {
                    debug!(key = %pending.key, ok = result.is_ok(), "lookup completed");
                    pending.complete(result);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransferToken;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const ENDPOINT: &str = "http://dictionary.test/lookup.py";
    const HMM_BODY: &str = r#"[{"sf":"HMM","lfs":[
        {"lf":"heavy meromyosin","freq":267,"since":1971},
        {"lf":"hidden Markov model","freq":341,"since":1986}
    ]}]"#;

    /// Records every started transfer instead of touching the network,
    /// handing the test its token and event sender so the test plays the
    /// transport's role.
    struct FakeTransport {
        started: UnboundedSender<StartedTransfer>,
    }

    struct StartedTransfer {
        token: TransferToken,
        url: Url,
        events: UnboundedSender<TransferEvent>,
        aborted: Arc<AtomicBool>,
    }

    impl StartedTransfer {
        fn was_aborted(&self) -> bool {
            self.aborted.load(Ordering::SeqCst)
        }

        fn send_status(&self, status: u16) {
            let _ = self.events.send(TransferEvent::status(self.token, status));
        }

        fn send_chunk(&self, bytes: &[u8]) {
            let _ = self
                .events
                .send(TransferEvent::chunk(self.token, bytes.to_vec().into()));
        }

        fn send_done(&self, result: Result<(), TransportError>) {
            let _ = self.events.send(TransferEvent::done(self.token, result));
        }
    }

    impl Transport for FakeTransport {
        fn start(
            &mut self,
            url: Url,
            events: &UnboundedSender<TransferEvent>,
        ) -> TransferHandle {
            let token = TransferToken::next();
            let aborted = Arc::new(AtomicBool::new(false));
            let _ = self.started.send(StartedTransfer {
                token,
                url,
                events: events.clone(),
                aborted: aborted.clone(),
            });
            TransferHandle::new(token, move || aborted.store(true, Ordering::SeqCst))
        }
    }

    fn test_client() -> (LookupClient, UnboundedReceiver<StartedTransfer>) {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        let client = LookupClient::with_transport(
            FakeTransport {
                started: started_tx,
            },
            ENDPOINT,
        );
        (client, started_rx)
    }

    /// Funnels a callback's outcome into an awaitable channel.
    fn capture() -> (
        impl FnOnce(LookupOutcome) + Send + 'static,
        UnboundedReceiver<LookupOutcome>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |outcome| {
                let _ = tx.send(outcome);
            },
            rx,
        )
    }

    fn expect_completion(outcome: LookupOutcome) -> Completion {
        match outcome {
            LookupOutcome::Completed(completion) => completion,
            other => panic!("expected a completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lookup_completes_with_decoded_records() {
        let (client, mut started) = test_client();
        let (cb, mut outcome) = capture();
        client.resolve("HMM", cb);

        let transfer = started.recv().await.unwrap();
        assert_eq!(transfer.url.as_str(), format!("{ENDPOINT}?HMM"));
        transfer.send_status(200);
        transfer.send_chunk(HMM_BODY.as_bytes());
        transfer.send_done(Ok(()));

        let completion = expect_completion(outcome.recv().await.unwrap());
        assert!(completion.succeeded);
        assert_eq!(completion.status, Some(200));
        assert!(completion.error.is_none());
        let forms = completion.long_forms();
        assert_eq!(forms.len(), 2);
        assert_eq!(forms[0].to_string(), "lf: heavy meromyosin, freq: 267, since: 1971");
    }

    #[tokio::test]
    async fn payload_split_across_chunks_decodes() {
        let (client, mut started) = test_client();
        let (cb, mut outcome) = capture();
        client.resolve("HMM", cb);

        let transfer = started.recv().await.unwrap();
        transfer.send_status(200);
        let body = HMM_BODY.as_bytes();
        let (head, tail) = body.split_at(body.len() / 2);
        transfer.send_chunk(head);
        transfer.send_chunk(tail);
        transfer.send_done(Ok(()));

        let completion = expect_completion(outcome.recv().await.unwrap());
        assert!(completion.succeeded);
        assert_eq!(completion.long_forms().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_key_is_ignored_and_original_completes() {
        let (client, mut started) = test_client();
        let (cb1, mut outcome1) = capture();
        client.resolve("HMM", cb1);
        let transfer = started.recv().await.unwrap();

        let (cb2, mut outcome2) = capture();
        client.resolve("HMM", cb2);
        assert!(matches!(
            outcome2.recv().await.unwrap(),
            LookupOutcome::DuplicateIgnored
        ));
        // The duplicate never became a second transfer.
        assert!(started.try_recv().is_err());
        assert!(!transfer.was_aborted());

        transfer.send_status(200);
        transfer.send_chunk(HMM_BODY.as_bytes());
        transfer.send_done(Ok(()));
        let completion = expect_completion(outcome1.recv().await.unwrap());
        assert!(completion.succeeded);
        // The duplicate's callback got its one neutral outcome and
        // nothing more.
        assert!(outcome2.try_recv().is_err());
    }

    #[tokio::test]
    async fn different_key_supersedes_silently() {
        let (client, mut started) = test_client();
        let (cb1, mut outcome1) = capture();
        client.resolve("HMM", cb1);
        let first = started.recv().await.unwrap();

        let (cb2, mut outcome2) = capture();
        client.resolve("DNA", cb2);
        let second = started.recv().await.unwrap();
        assert!(first.was_aborted());
        assert!(!second.was_aborted());

        second.send_status(200);
        second.send_chunk(b"[]");
        second.send_done(Ok(()));
        let completion = expect_completion(outcome2.recv().await.unwrap());
        assert!(completion.succeeded);

        // The superseded request was abandoned without notification.
        assert!(outcome1.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_events_do_not_mutate_new_request() {
        let (client, mut started) = test_client();
        let (cb1, mut outcome1) = capture();
        client.resolve("abc", cb1);
        let old = started.recv().await.unwrap();

        let (cb2, mut outcome2) = capture();
        client.resolve("xyz", cb2);
        let new = started.recv().await.unwrap();

        // Late deliveries from the aborted transfer, still tagged with
        // its token.
        old.send_status(500);
        old.send_chunk(b"garbage");
        old.send_done(Err(TransportError::new("connection reset")));

        new.send_status(200);
        new.send_chunk(HMM_BODY.as_bytes());
        new.send_done(Ok(()));

        let completion = expect_completion(outcome2.recv().await.unwrap());
        assert!(completion.succeeded);
        assert_eq!(completion.status, Some(200));
        assert!(completion.error.is_none());
        assert_eq!(completion.long_forms().len(), 2);
        assert!(outcome1.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_suppresses_callback() {
        let (client, mut started) = test_client();
        let (cb, mut outcome) = capture();
        client.resolve("HMM", cb);
        let transfer = started.recv().await.unwrap();

        let (done1_tx, done1_rx) = oneshot::channel();
        client.cancel_then(move || {
            let _ = done1_tx.send(());
        });
        done1_rx.await.unwrap();
        assert!(transfer.was_aborted());

        // Second cancel has nothing to do but still notifies.
        let (done2_tx, done2_rx) = oneshot::channel();
        client.cancel_then(move || {
            let _ = done2_tx.send(());
        });
        done2_rx.await.unwrap();

        // Completion arriving after cancellation is stale.
        transfer.send_done(Ok(()));
        let (done3_tx, done3_rx) = oneshot::channel();
        client.cancel_then(move || {
            let _ = done3_tx.send(());
        });
        done3_rx.await.unwrap();
        assert!(outcome.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancelled_then_reissued_key_fires_once() {
        let (client, mut started) = test_client();
        let (cb1, mut outcome1) = capture();
        client.resolve("HMM", cb1);
        let first = started.recv().await.unwrap();
        client.cancel();

        let (cb2, mut outcome2) = capture();
        client.resolve("HMM", cb2);
        let second = started.recv().await.unwrap();
        assert!(first.was_aborted());

        // The old transfer's completion must not satisfy the new request.
        first.send_done(Ok(()));
        second.send_status(200);
        second.send_chunk(b"[]");
        second.send_done(Ok(()));

        let completion = expect_completion(outcome2.recv().await.unwrap());
        assert!(completion.succeeded);
        assert!(outcome1.try_recv().is_err());
        assert!(outcome2.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_error_carries_previously_decoded_records() {
        let (client, mut started) = test_client();
        let (cb, mut outcome) = capture();
        client.resolve("HMM", cb);
        let transfer = started.recv().await.unwrap();

        transfer.send_status(200);
        transfer.send_chunk(HMM_BODY.as_bytes());
        transfer.send_done(Err(TransportError::new("connection reset by peer")));

        let completion = expect_completion(outcome.recv().await.unwrap());
        assert!(!completion.succeeded);
        assert!(completion.records.is_some());
        assert!(completion.error.as_ref().unwrap().is_transport());
    }

    #[tokio::test]
    async fn decode_failure_surfaces_alongside_transport_success() {
        let (client, mut started) = test_client();
        let (cb, mut outcome) = capture();
        client.resolve("HMM", cb);
        let transfer = started.recv().await.unwrap();

        transfer.send_status(200);
        transfer.send_chunk(b"<html>not the dictionary</html>");
        transfer.send_done(Ok(()));

        let completion = expect_completion(outcome.recv().await.unwrap());
        assert!(completion.succeeded);
        assert!(completion.records.is_none());
        assert!(completion.error.as_ref().unwrap().is_decode());
        assert!(completion.long_forms().is_empty());
    }

    #[tokio::test]
    async fn empty_body_completes_with_no_records_and_no_error() {
        let (client, mut started) = test_client();
        let (cb, mut outcome) = capture();
        client.resolve("HMM", cb);
        let transfer = started.recv().await.unwrap();

        transfer.send_status(204);
        transfer.send_done(Ok(()));

        let completion = expect_completion(outcome.recv().await.unwrap());
        assert!(completion.succeeded);
        assert!(completion.records.is_none());
        assert!(completion.error.is_none());
    }

    #[tokio::test]
    async fn unusable_endpoint_yields_benign_no_result() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let client = LookupClient::with_transport(
            FakeTransport {
                started: started_tx,
            },
            "not an address",
        );
        let (cb, mut outcome) = capture();
        client.resolve("HMM", cb);
        assert!(matches!(
            outcome.recv().await.unwrap(),
            LookupOutcome::NoResult
        ));
        assert!(started_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn async_lookup_returns_none_when_superseded() {
        let (client, mut started) = test_client();
        let lookup_client = client.clone();
        let lookup = tokio::spawn(async move { lookup_client.lookup("HMM").await });

        let _first = started.recv().await.unwrap();
        let (cb2, mut outcome2) = capture();
        client.resolve("DNA", cb2);
        let second = started.recv().await.unwrap();
        second.send_done(Ok(()));
        expect_completion(outcome2.recv().await.unwrap());

        assert!(lookup.await.unwrap().is_none());
    }
}
