//! Session presence protocol — the heart of presenced.
//!
//! One instance per connection. The session announces itself on the page's
//! broadcast group, consumes inbound announce/leave traffic, keeps a
//! private roster of known peers, and forwards roster deltas to the client.
//! On every exit path it publishes its own leave and releases the
//! subscription, so peers always observe exactly one departure.
//!
//! Split in two: [`PresenceProtocol`] is the pure roster state machine,
//! [`run_session`] is the async driver around it.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::{PresenceChannel, Subscription};
use crate::error::PresenceError;
use crate::types::{ClientEvent, PresenceMessage, SessionId, UserDescriptor};

/// Broadcast group shared by all presence sessions; page keys are
/// subchannels within it.
pub const PRESENCE_GROUP: &str = "presence";

// ═══════════════════════════════════════════════════════════════
// Roster state machine
// ═══════════════════════════════════════════════════════════════

/// Pure per-session state: own identity, own descriptor, and the roster
/// of currently-known peers. Exclusively owned by one session task.
pub struct PresenceProtocol {
    identity: SessionId,
    descriptor: UserDescriptor,
    roster: HashMap<SessionId, UserDescriptor>,
}

/// What a received message means for this session.
#[derive(Debug, PartialEq)]
pub enum Reaction {
    /// Own echo, duplicate announce, or leave from an unknown peer.
    Ignored,
    /// First announce from a peer. The caller forwards the event and then
    /// re-publishes its own announce so the newcomer discovers it in turn.
    Arrival(UserDescriptor),
    /// A known peer left; carries the descriptor stored at its arrival.
    Departure(UserDescriptor),
}

impl PresenceProtocol {
    pub fn new(descriptor: UserDescriptor) -> Self {
        Self {
            identity: SessionId::new(),
            descriptor,
            roster: HashMap::new(),
        }
    }

    pub fn identity(&self) -> SessionId {
        self.identity
    }

    /// Own announce message. Published at start and again after each
    /// newly-discovered peer.
    pub fn announce(&self) -> PresenceMessage {
        PresenceMessage::Announce {
            sender: self.identity,
            descriptor: self.descriptor.clone(),
        }
    }

    /// Own leave message, published exactly once at termination.
    pub fn leave(&self) -> PresenceMessage {
        PresenceMessage::Leave {
            sender: self.identity,
        }
    }

    /// Fold one received message into the roster.
    ///
    /// The broker echoes the sender's own publications back to it; those
    /// are filtered here, so the session's identity is never a roster key.
    /// Announce is idempotent per sender, leave is idempotent for unknown
    /// or already-removed senders.
    pub fn apply(&mut self, message: PresenceMessage) -> Reaction {
        if message.sender() == self.identity {
            return Reaction::Ignored;
        }
        match message {
            PresenceMessage::Leave { sender } => match self.roster.remove(&sender) {
                Some(descriptor) => Reaction::Departure(descriptor),
                None => Reaction::Ignored,
            },
            PresenceMessage::Announce { sender, descriptor } => {
                if self.roster.contains_key(&sender) {
                    return Reaction::Ignored;
                }
                self.roster.insert(sender, descriptor.clone());
                Reaction::Arrival(descriptor)
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Session driver
// ═══════════════════════════════════════════════════════════════

/// Run one session against `channel` until the client goes away or event
/// delivery fails.
///
/// The task is never aborted from outside: the transport signals
/// termination by dropping the `events` receiver, which trips the
/// `closed()` arm mid-receive. Every exit after a successful join passes
/// through the leave-publish and subscription release below.
pub async fn run_session<C: PresenceChannel>(
    channel: &C,
    page: &str,
    descriptor: UserDescriptor,
    events: mpsc::Sender<ClientEvent>,
) -> Result<(), PresenceError> {
    let mut subscription = channel.join(PRESENCE_GROUP, page).await?;
    let mut protocol = PresenceProtocol::new(descriptor);
    debug!(session = %protocol.identity(), page, "joined presence group");

    let outcome = active_loop(&mut protocol, &mut subscription, &events).await;

    // Peers learn of this session's departure only through this message.
    if let Ok(frame) = encode(&protocol.leave()) {
        let _ = subscription.publish(frame).await;
    }
    subscription.leave().await;
    debug!(session = %protocol.identity(), page, "left presence group");
    outcome
}

async fn active_loop<S: Subscription>(
    protocol: &mut PresenceProtocol,
    subscription: &mut S,
    events: &mpsc::Sender<ClientEvent>,
) -> Result<(), PresenceError> {
    subscription.publish(encode(&protocol.announce())?).await?;

    loop {
        let frame = tokio::select! {
            frame = subscription.receive() => match frame {
                Some(frame) => frame,
                None => {
                    return Err(PresenceError::ChannelUnavailable(
                        "broker closed the subscription".into(),
                    ))
                }
            },
            // Client torn down between events: clean exit.
            _ = events.closed() => return Ok(()),
        };

        // Malformed traffic is a violation local to that message.
        let message: PresenceMessage = match serde_json::from_value(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(session = %protocol.identity(), "dropping malformed frame: {e}");
                continue;
            }
        };

        match protocol.apply(message) {
            Reaction::Ignored => {}
            Reaction::Arrival(peer) => {
                events
                    .send(ClientEvent::Arrival(peer))
                    .await
                    .map_err(|_| PresenceError::SinkClosed)?;
                // Answer the newcomer so it discovers this session too.
                subscription.publish(encode(&protocol.announce())?).await?;
            }
            Reaction::Departure(peer) => {
                events
                    .send(ClientEvent::Departure(peer))
                    .await
                    .map_err(|_| PresenceError::SinkClosed)?;
            }
        }
    }
}

fn encode(message: &PresenceMessage) -> Result<Value, PresenceError> {
    serde_json::to_value(message).map_err(|e| PresenceError::Protocol(format!("encode: {e}")))
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::{sleep, timeout};

    use crate::broker::{MemoryBroker, MemorySubscription};

    fn descriptor(name: &str) -> UserDescriptor {
        json!({"id": name, "display_name": name})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn announce_from(sender: SessionId, name: &str) -> PresenceMessage {
        PresenceMessage::Announce {
            sender,
            descriptor: descriptor(name),
        }
    }

    // ── Pure state machine ──────────────────────────────────

    #[test]
    fn own_echo_is_filtered() {
        let mut protocol = PresenceProtocol::new(descriptor("me"));
        let echo = protocol.announce();
        assert_eq!(protocol.apply(echo), Reaction::Ignored);
        assert!(protocol.roster.is_empty());

        let leave_echo = protocol.leave();
        assert_eq!(protocol.apply(leave_echo), Reaction::Ignored);
    }

    #[test]
    fn announce_is_idempotent() {
        let mut protocol = PresenceProtocol::new(descriptor("me"));
        let peer = SessionId::new();

        assert_eq!(
            protocol.apply(announce_from(peer, "peer")),
            Reaction::Arrival(descriptor("peer"))
        );
        assert_eq!(protocol.apply(announce_from(peer, "peer")), Reaction::Ignored);
        assert_eq!(protocol.roster.len(), 1);
    }

    #[test]
    fn leave_of_unknown_peer_is_ignored() {
        let mut protocol = PresenceProtocol::new(descriptor("me"));
        assert_eq!(
            protocol.apply(PresenceMessage::Leave {
                sender: SessionId::new()
            }),
            Reaction::Ignored
        );
    }

    #[test]
    fn departure_carries_stored_descriptor() {
        let mut protocol = PresenceProtocol::new(descriptor("me"));
        let peer = SessionId::new();
        protocol.apply(announce_from(peer, "peer"));

        assert_eq!(
            protocol.apply(PresenceMessage::Leave { sender: peer }),
            Reaction::Departure(descriptor("peer"))
        );
        // Removal is not repeatable — the peer is gone.
        assert_eq!(
            protocol.apply(PresenceMessage::Leave { sender: peer }),
            Reaction::Ignored
        );
    }

    // ── Session driver over the in-process broker ───────────

    struct TestClient {
        events: mpsc::Receiver<ClientEvent>,
        task: tokio::task::JoinHandle<Result<(), PresenceError>>,
    }

    fn connect(broker: &MemoryBroker, page: &str, name: &str) -> TestClient {
        connect_with(broker, page, descriptor(name))
    }

    fn connect_with(broker: &MemoryBroker, page: &str, descriptor: UserDescriptor) -> TestClient {
        let (tx, rx) = mpsc::channel(16);
        let broker = broker.clone();
        let page = page.to_string();
        let task =
            tokio::spawn(async move { run_session(&broker, &page, descriptor, tx).await });
        TestClient { events: rx, task }
    }

    impl TestClient {
        async fn next(&mut self) -> ClientEvent {
            timeout(Duration::from_secs(1), self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("session ended before event")
        }

        async fn expect(&mut self, expected: ClientEvent) {
            assert_eq!(self.next().await, expected);
        }

        fn assert_idle(&mut self) {
            assert_eq!(self.events.try_recv(), Err(TryRecvError::Empty));
        }

        /// Simulate the client going away; returns the session outcome.
        async fn disconnect(self) -> Result<(), PresenceError> {
            drop(self.events);
            self.task.await.expect("session task panicked")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn staggered_join_converges_symmetrically() {
        let broker = MemoryBroker::new();
        let mut a = connect(&broker, "p", "a");
        sleep(Duration::from_millis(10)).await;
        let mut b = connect(&broker, "p", "b");

        // b is discovered directly, a via its re-announcement.
        a.expect(ClientEvent::Arrival(descriptor("b"))).await;
        b.expect(ClientEvent::Arrival(descriptor("a"))).await;

        sleep(Duration::from_millis(10)).await;
        a.assert_idle();
        b.assert_idle();
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_join_converges_symmetrically() {
        let broker = MemoryBroker::new();
        let mut a = connect(&broker, "p", "a");
        let mut b = connect(&broker, "p", "b");

        a.expect(ClientEvent::Arrival(descriptor("b"))).await;
        b.expect(ClientEvent::Arrival(descriptor("a"))).await;

        // The crossed re-announcements are duplicates and stay silent.
        sleep(Duration::from_millis(10)).await;
        a.assert_idle();
        b.assert_idle();
    }

    #[tokio::test(start_paused = true)]
    async fn departure_reaches_observing_peer() {
        let broker = MemoryBroker::new();
        let mut a = connect(&broker, "p", "a");
        sleep(Duration::from_millis(10)).await;
        let mut b = connect(&broker, "p", "b");

        a.expect(ClientEvent::Arrival(descriptor("b"))).await;
        b.expect(ClientEvent::Arrival(descriptor("a"))).await;

        b.disconnect().await.unwrap();
        a.expect(ClientEvent::Departure(descriptor("b"))).await;

        sleep(Duration::from_millis(10)).await;
        a.assert_idle();
    }

    #[tokio::test(start_paused = true)]
    async fn pages_are_isolated() {
        let broker = MemoryBroker::new();
        let mut a = connect(&broker, "p", "a");
        let mut b = connect(&broker, "q", "b");

        sleep(Duration::from_millis(10)).await;
        a.assert_idle();
        b.assert_idle();

        b.disconnect().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        a.assert_idle();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_dropped() {
        let broker = MemoryBroker::new();
        let mut a = connect(&broker, "p", "a");
        sleep(Duration::from_millis(10)).await;

        let raw = broker.join(PRESENCE_GROUP, "p").await.unwrap();
        raw.publish(json!("garbage")).await.unwrap();
        raw.publish(json!({"uuid": "not-a-uuid", "user": {}}))
            .await
            .unwrap();
        raw.leave().await;
        sleep(Duration::from_millis(10)).await;
        a.assert_idle();

        // The session survived and still reconciles arrivals.
        let mut b = connect(&broker, "p", "b");
        a.expect(ClientEvent::Arrival(descriptor("b"))).await;
        b.expect(ClientEvent::Arrival(descriptor("a"))).await;
    }

    #[tokio::test(start_paused = true)]
    async fn descriptor_is_forwarded_opaquely() {
        let broker = MemoryBroker::new();
        let custom = json!({"kokonimi": "Tohtori Kayttaja_2"})
            .as_object()
            .cloned()
            .unwrap();
        let mut a = connect(&broker, "p", "a");
        sleep(Duration::from_millis(10)).await;
        let mut b = connect_with(&broker, "p", custom.clone());

        a.expect(ClientEvent::Arrival(custom)).await;
        b.expect(ClientEvent::Arrival(descriptor("a"))).await;
    }

    struct FailingChannel;

    impl PresenceChannel for FailingChannel {
        type Subscription = MemorySubscription;

        async fn join(&self, _: &str, _: &str) -> Result<MemorySubscription, PresenceError> {
            Err(PresenceError::ChannelUnavailable("broker down".into()))
        }
    }

    #[tokio::test]
    async fn join_failure_aborts_before_any_event() {
        let (tx, mut rx) = mpsc::channel(1);
        let err = run_session(&FailingChannel, "p", descriptor("a"), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, PresenceError::ChannelUnavailable(_)));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_still_publishes_leave() {
        let broker = MemoryBroker::new();

        // A session whose client never drains its single-slot queue.
        let (tx, rx) = mpsc::channel(1);
        let stuck_broker = broker.clone();
        let stuck = tokio::spawn(async move {
            run_session(&stuck_broker, "p", descriptor("a"), tx).await
        });

        sleep(Duration::from_millis(10)).await;
        let mut b = connect(&broker, "p", "b");
        b.expect(ClientEvent::Arrival(descriptor("a"))).await;

        sleep(Duration::from_millis(10)).await;
        let mut c = connect(&broker, "p", "c");
        b.expect(ClientEvent::Arrival(descriptor("c"))).await;
        sleep(Duration::from_millis(10)).await;

        // The queue holds arrival(b); delivery of arrival(c) is blocked.
        // Dropping the receiver fails that send and terminates the session.
        drop(rx);
        assert!(matches!(
            stuck.await.unwrap(),
            Err(PresenceError::SinkClosed)
        ));

        b.expect(ClientEvent::Departure(descriptor("a"))).await;
        // c never completed discovery of the stuck session, so its leave
        // is an unknown-sender no-op there.
        c.expect(ClientEvent::Arrival(descriptor("b"))).await;
        sleep(Duration::from_millis(10)).await;
        c.assert_idle();
    }

    /// Session 1 joins at t=0, session 2 at t=10ms, session 3 at t=20ms;
    /// session 2 leaves at t=30ms, session 1 afterwards.
    #[tokio::test(start_paused = true)]
    async fn three_session_scenario() {
        let broker = MemoryBroker::new();
        let mut s1 = connect(&broker, "p", "user_1");
        sleep(Duration::from_millis(10)).await;
        let mut s2 = connect(&broker, "p", "user_2");
        sleep(Duration::from_millis(10)).await;
        let mut s3 = connect(&broker, "p", "user_3");
        sleep(Duration::from_millis(10)).await;

        // Session 2 observed both peers before leaving.
        s2.expect(ClientEvent::Arrival(descriptor("user_1"))).await;
        s2.expect(ClientEvent::Arrival(descriptor("user_3"))).await;
        s2.disconnect().await.unwrap();

        s1.expect(ClientEvent::Arrival(descriptor("user_2"))).await;
        s1.expect(ClientEvent::Arrival(descriptor("user_3"))).await;
        s1.expect(ClientEvent::Departure(descriptor("user_2"))).await;

        // Sessions 1 and 2 replied to session 3 concurrently; arrival
        // order between them is the broker's choice.
        let first = s3.next().await;
        let second = s3.next().await;
        let mut arrivals = vec![first, second];
        arrivals.sort_by_key(|e| format!("{e:?}"));
        let mut expected = vec![
            ClientEvent::Arrival(descriptor("user_1")),
            ClientEvent::Arrival(descriptor("user_2")),
        ];
        expected.sort_by_key(|e| format!("{e:?}"));
        assert_eq!(arrivals, expected);
        s3.expect(ClientEvent::Departure(descriptor("user_2"))).await;

        s1.disconnect().await.unwrap();
        s3.expect(ClientEvent::Departure(descriptor("user_1"))).await;

        sleep(Duration::from_millis(10)).await;
        s3.assert_idle();
    }
}
