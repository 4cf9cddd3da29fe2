//! Turns inbound lines into registry changes and outbound deliveries.
//!
//! Each session task calls [`Router::route`] for every line it reads, so a
//! session's own commands are handled strictly in arrival order. Deliveries
//! to other sessions happen after the registry lock has been released, and
//! a failed delivery only affects its recipient.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    error::{RegistryError, TransportError},
    protocol::{self, Inbound},
    registry::Registry,
    session::{Peer, SessionId},
};

/// What the session task should do after a line has been routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Router {
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handles one line from `from`.
    ///
    /// Returns an error only when a reply to the sender itself could not be
    /// written; the caller should then tear that session down.
    pub async fn route(&self, from: SessionId, line: &str) -> Result<Flow, TransportError> {
        // Already torn down by a concurrent path; nothing left to answer.
        let Some(sender) = self.registry.peer(from).await else {
            return Ok(Flow::Exit);
        };

        let inbound = match Inbound::parse(line) {
            Ok(inbound) => inbound,
            Err(error) => {
                debug!(session = %from, %error, "rejected malformed command");
                reply(&sender, &protocol::server_notice(&error.to_string())).await?;
                return Ok(Flow::Continue);
            }
        };

        match inbound {
            Inbound::Empty => Ok(Flow::Continue),
            Inbound::Nick(nickname) => self.set_nickname(&sender, nickname).await,
            Inbound::List => {
                let roster = self.registry.nicknames().await.join(", ");
                reply(&sender, &protocol::server_notice(&roster)).await?;
                Ok(Flow::Continue)
            }
            Inbound::ListIps => {
                let roster = self.registry.endpoints().await.join(", ");
                reply(&sender, &protocol::server_notice(&roster)).await?;
                Ok(Flow::Continue)
            }
            Inbound::Exit => {
                info!(session = %from, nickname = %sender.nickname, "session requested exit");
                Ok(Flow::Exit)
            }
            Inbound::PrivateMessage { target, text } => {
                self.private_message(&sender, target, text).await
            }
            Inbound::Chat(text) => {
                if sender.nickname.is_empty() {
                    reply(&sender, &protocol::server_notice(protocol::NICKNAME_REQUIRED)).await?;
                    return Ok(Flow::Continue);
                }
                let line = protocol::chat_line(self.clock.now(), &sender.nickname, text);
                self.broadcast(from, &line).await;
                Ok(Flow::Continue)
            }
        }
    }

    async fn set_nickname(&self, sender: &Peer, nickname: &str) -> Result<Flow, TransportError> {
        let previous = match self.registry.rename(sender.id, nickname).await {
            Ok(previous) => previous,
            Err(error @ RegistryError::NicknameTaken(_)) => {
                reply(sender, &protocol::server_notice(&error.to_string())).await?;
                return Ok(Flow::Continue);
            }
            Err(error) => {
                debug!(session = %sender.id, %error, "rename raced with teardown");
                return Ok(Flow::Exit);
            }
        };

        if previous.is_empty() {
            info!(session = %sender.id, %nickname, "nickname claimed");
            self.broadcast(sender.id, &protocol::joined_notice(nickname))
                .await;
        } else if previous != nickname {
            info!(session = %sender.id, old = %previous, new = %nickname, "nickname changed");
            self.broadcast(sender.id, &protocol::renamed_notice(&previous, nickname))
                .await;
        }

        reply(sender, &protocol::nickname_set_notice(nickname)).await?;
        Ok(Flow::Continue)
    }

    async fn private_message(
        &self,
        sender: &Peer,
        target: &str,
        text: &str,
    ) -> Result<Flow, TransportError> {
        let recipient = match self.registry.find_by_nickname(target).await {
            Ok(recipient) => recipient,
            Err(error) => {
                reply(sender, &protocol::server_notice(&error.to_string())).await?;
                return Ok(Flow::Continue);
            }
        };

        let now = self.clock.now();
        let delivered = protocol::private_from_line(now, &sender.nickname, text);
        if let Err(error) = recipient.sink.send(&delivered).await {
            warn!(recipient = %recipient.id, %error, "failed to deliver private message");
        }
        reply(sender, &protocol::private_to_line(now, &recipient.nickname, text)).await?;
        Ok(Flow::Continue)
    }

    /// Delivers `line` to every live session except `from`.
    ///
    /// Recipients are snapshotted under the read lock and written to
    /// concurrently afterwards. Returns how many deliveries succeeded.
    pub async fn broadcast(&self, from: SessionId, line: &str) -> usize {
        let recipients = self.registry.peers_except(from).await;
        deliver_all(&recipients, line).await
    }

    /// Delivers `line` to every live session.
    pub async fn announce(&self, line: &str) -> usize {
        let recipients = self.registry.peers().await;
        deliver_all(&recipients, line).await
    }

    /// Removes a session and releases its transport.
    ///
    /// Safe to call from several failure paths at once: only the caller that
    /// actually removed the session announces the departure and closes the
    /// sink. Returns whether this call did the teardown.
    pub async fn teardown(&self, id: SessionId) -> bool {
        let Some(session) = self.registry.remove(id).await else {
            return false;
        };

        if session.has_nickname() {
            self.announce(&protocol::left_notice(&session.nickname))
                .await;
        }
        info!(session = %id, endpoint = %session.endpoint, nickname = %session.nickname, "session closed");
        session.sink.close().await;
        true
    }
}

async fn reply(sender: &Peer, line: &str) -> Result<(), TransportError> {
    sender.sink.send(line).await
}

async fn deliver_all(recipients: &[Peer], line: &str) -> usize {
    let results = join_all(recipients.iter().map(|peer| async move {
        let result = peer.sink.send(line).await;
        (peer, result)
    }))
    .await;

    let mut delivered = 0;
    for (peer, result) in results {
        match result {
            Ok(()) => delivered += 1,
            Err(error) => {
                warn!(recipient = %peer.id, %error, "skipping unreachable recipient");
            }
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::*;
    use crate::{
        clock::FixedClock,
        session::{Session, SessionIds},
        transport::{
            SharedSink,
            memory::{self, MemoryPeer, MemorySink},
        },
    };

    struct Harness {
        router: Router,
        ids: SessionIds,
    }

    struct Client {
        id: SessionId,
        sink: Arc<MemorySink>,
        peer: MemoryPeer,
    }

    impl Harness {
        fn new() -> Self {
            let clock = FixedClock(NaiveTime::from_hms_opt(9, 30, 0).expect("valid time"));
            Self {
                router: Router::new(Arc::new(Registry::new()), Arc::new(clock)),
                ids: SessionIds::new(),
            }
        }

        async fn connect(&self, endpoint: &str) -> Client {
            let (_source, sink, peer) = memory::channel();
            let id = self.ids.next_id();
            self.router
                .registry()
                .add(Session::new(id, endpoint, Arc::clone(&sink) as SharedSink))
                .await
                .expect("register session");
            Client { id, sink, peer }
        }

        async fn named(&self, endpoint: &str, nickname: &str) -> Client {
            let mut client = self.connect(endpoint).await;
            self.send(&client, &format!("/nick {nickname}")).await;
            client.peer.drain();
            client
        }

        async fn send(&self, client: &Client, line: &str) -> Flow {
            self.router.route(client.id, line).await.expect("route line")
        }
    }

    #[tokio::test]
    async fn empty_lines_produce_nothing() {
        let harness = Harness::new();
        let mut alice = harness.named("10.0.0.1:1", "alice").await;
        let mut bob = harness.named("10.0.0.2:2", "bob").await;
        alice.peer.drain();

        assert_eq!(harness.send(&alice, "").await, Flow::Continue);
        assert_eq!(harness.send(&alice, "   ").await, Flow::Continue);
        assert!(alice.peer.drain().is_empty());
        assert!(bob.peer.drain().is_empty());
    }

    #[tokio::test]
    async fn first_nick_announces_join_to_others_only() {
        let harness = Harness::new();
        let mut watcher = harness.named("10.0.0.1:1", "watcher").await;
        let mut alice = harness.connect("10.0.0.2:2").await;

        harness.send(&alice, "/nick  alice ").await;

        assert_eq!(alice.peer.drain(), vec!["[Server] Username set to alice"]);
        assert_eq!(watcher.peer.drain(), vec!["[Server] alice has joined the chat"]);
    }

    #[tokio::test]
    async fn changing_nick_announces_old_and_new() {
        let harness = Harness::new();
        let mut watcher = harness.named("10.0.0.1:1", "watcher").await;
        let mut alice = harness.named("10.0.0.2:2", "alice").await;
        watcher.peer.drain();

        harness.send(&alice, "/nick alicia").await;
        assert_eq!(alice.peer.drain(), vec!["[Server] Username set to alicia"]);
        assert_eq!(
            watcher.peer.drain(),
            vec!["[Server] alice changed nickname to alicia"]
        );

        harness.send(&alice, "/nick alicia").await;
        assert_eq!(alice.peer.drain(), vec!["[Server] Username set to alicia"]);
        assert!(watcher.peer.drain().is_empty());
    }

    #[tokio::test]
    async fn invalid_nick_is_reported_to_sender_only() {
        let harness = Harness::new();
        let mut watcher = harness.named("10.0.0.1:1", "watcher").await;
        let mut anon = harness.connect("10.0.0.2:2").await;

        harness.send(&anon, "/nick ").await;
        harness
            .send(&anon, &format!("/nick {}", "x".repeat(20)))
            .await;

        assert_eq!(
            anon.peer.drain(),
            vec!["[Server] Invalid username", "[Server] Invalid username"]
        );
        assert!(watcher.peer.drain().is_empty());
        assert_eq!(harness.router.registry().nicknames().await, vec!["watcher"]);
    }

    #[tokio::test]
    async fn taken_nick_is_refused_and_holder_is_unaffected() {
        let harness = Harness::new();
        let mut alice = harness.named("10.0.0.1:1", "alice").await;
        let mut bob = harness.connect("10.0.0.2:2").await;

        harness.send(&bob, "/nick alice").await;

        assert_eq!(bob.peer.drain(), vec!["[Server] Username 'alice' is already taken"]);
        assert!(alice.peer.drain().is_empty());
        let holder = harness
            .router
            .registry()
            .find_by_nickname("alice")
            .await
            .expect("alice still registered");
        assert_eq!(holder.id, alice.id);
    }

    #[tokio::test]
    async fn list_excludes_anonymous_and_listips_includes_everyone() {
        let harness = Harness::new();
        let mut alice = harness.named("10.0.0.1:1", "alice").await;
        let _anon = harness.connect("10.0.0.2:2").await;
        let _bob = harness.named("10.0.0.3:3", "bob").await;
        alice.peer.drain();

        harness.send(&alice, "/list").await;
        harness.send(&alice, "/listips").await;

        assert_eq!(
            alice.peer.drain(),
            vec![
                "[Server] alice, bob",
                "[Server] 10.0.0.1:1, 10.0.0.2:2, 10.0.0.3:3"
            ]
        );
    }

    #[tokio::test]
    async fn anonymous_chat_is_refused_and_not_broadcast() {
        let harness = Harness::new();
        let mut watcher = harness.named("10.0.0.1:1", "watcher").await;
        let mut anon = harness.connect("10.0.0.2:2").await;

        harness.send(&anon, "hi").await;

        assert_eq!(
            anon.peer.drain(),
            vec!["[Server] Please set a username first using /nick <username>"]
        );
        assert!(watcher.peer.drain().is_empty());
    }

    #[tokio::test]
    async fn chat_reaches_everyone_but_the_sender() {
        let harness = Harness::new();
        let mut alice = harness.named("10.0.0.1:1", "alice").await;
        let mut bob = harness.named("10.0.0.2:2", "bob").await;
        let mut carol = harness.named("10.0.0.3:3", "carol").await;
        alice.peer.drain();
        bob.peer.drain();

        harness.send(&alice, "hi all").await;

        assert!(alice.peer.drain().is_empty());
        assert_eq!(bob.peer.drain(), vec!["[09:30:00] alice: hi all"]);
        assert_eq!(carol.peer.drain(), vec!["[09:30:00] alice: hi all"]);
    }

    #[tokio::test]
    async fn unknown_slash_commands_are_chat() {
        let harness = Harness::new();
        let alice = harness.named("10.0.0.1:1", "alice").await;
        let mut bob = harness.named("10.0.0.2:2", "bob").await;

        harness.send(&alice, "/shrug").await;

        assert_eq!(bob.peer.drain(), vec!["[09:30:00] alice: /shrug"]);
    }

    #[tokio::test]
    async fn private_message_reaches_only_target_with_echo() {
        let harness = Harness::new();
        let mut alice = harness.named("10.0.0.1:1", "alice").await;
        let mut bob = harness.named("10.0.0.2:2", "bob").await;
        let mut carol = harness.named("10.0.0.3:3", "carol").await;
        alice.peer.drain();
        bob.peer.drain();

        harness.send(&alice, "/pm bob see you at noon").await;

        assert_eq!(bob.peer.drain(), vec!["[09:30:00] [PM from alice]: see you at noon"]);
        assert_eq!(alice.peer.drain(), vec!["[09:30:00] [PM to bob]: see you at noon"]);
        assert!(carol.peer.drain().is_empty());
    }

    #[tokio::test]
    async fn private_message_to_missing_user_yields_one_reply() {
        let harness = Harness::new();
        let mut alice = harness.named("10.0.0.1:1", "alice").await;
        let mut carol = harness.named("10.0.0.2:2", "carol").await;
        alice.peer.drain();

        harness.send(&alice, "/pm bob hello").await;

        assert_eq!(alice.peer.drain(), vec!["[Server] User 'bob' not found"]);
        assert!(carol.peer.drain().is_empty());
    }

    #[tokio::test]
    async fn anonymous_private_message_to_missing_user_is_looked_up() {
        let harness = Harness::new();
        let mut anonymous = harness.connect("10.0.0.1:1").await;
        let mut carol = harness.named("10.0.0.2:2", "carol").await;

        harness.send(&anonymous, "/pm bob hello").await;

        assert_eq!(anonymous.peer.drain(), vec!["[Server] User 'bob' not found"]);
        assert!(carol.peer.drain().is_empty());
    }

    #[tokio::test]
    async fn malformed_private_message_gets_usage() {
        let harness = Harness::new();
        let mut alice = harness.named("10.0.0.1:1", "alice").await;

        harness.send(&alice, "/pm bob").await;

        assert_eq!(
            alice.peer.drain(),
            vec!["[Server] Usage: /pm <username> <message>"]
        );
    }

    #[tokio::test]
    async fn exit_ends_the_session_without_a_reply() {
        let harness = Harness::new();
        let mut alice = harness.named("10.0.0.1:1", "alice").await;

        assert_eq!(harness.send(&alice, "/exit").await, Flow::Exit);
        assert!(alice.peer.drain().is_empty());
    }

    #[tokio::test]
    async fn failed_recipient_is_skipped_but_stays_registered() {
        let harness = Harness::new();
        let alice = harness.named("10.0.0.1:1", "alice").await;
        let stalled = harness.named("10.0.0.2:2", "stalled").await;
        let mut carol = harness.named("10.0.0.3:3", "carol").await;
        stalled.sink.fail_writes();

        let delivered = harness.router.broadcast(alice.id, "[Server] ping").await;

        assert_eq!(delivered, 1);
        assert_eq!(carol.peer.drain().last().map(String::as_str), Some("[Server] ping"));
        assert!(harness.router.registry().peer(stalled.id).await.is_some());
    }

    #[tokio::test]
    async fn reply_failure_is_returned_to_the_session_task() {
        let harness = Harness::new();
        let alice = harness.named("10.0.0.1:1", "alice").await;
        alice.sink.fail_writes();

        assert!(harness.router.route(alice.id, "/list").await.is_err());
    }

    #[tokio::test]
    async fn double_teardown_announces_and_closes_once() {
        let harness = Harness::new();
        let alice = harness.named("10.0.0.1:1", "alice").await;
        let mut bob = harness.named("10.0.0.2:2", "bob").await;

        let (first, second) = tokio::join!(
            harness.router.teardown(alice.id),
            harness.router.teardown(alice.id)
        );

        assert!(first ^ second);
        assert_eq!(alice.sink.close_calls(), 1);
        assert_eq!(bob.peer.drain(), vec!["[Server] alice has left the chat"]);
        assert!(harness.router.registry().peer(alice.id).await.is_none());
    }

    #[tokio::test]
    async fn anonymous_teardown_is_silent() {
        let harness = Harness::new();
        let anon = harness.connect("10.0.0.1:1").await;
        let mut bob = harness.named("10.0.0.2:2", "bob").await;

        assert!(harness.router.teardown(anon.id).await);
        assert!(bob.peer.drain().is_empty());
        assert_eq!(anon.sink.close_calls(), 1);
    }

    #[tokio::test]
    async fn lines_from_removed_sessions_are_ignored() {
        let harness = Harness::new();
        let alice = harness.named("10.0.0.1:1", "alice").await;
        let mut bob = harness.named("10.0.0.2:2", "bob").await;
        harness.router.teardown(alice.id).await;
        bob.peer.drain();

        assert_eq!(harness.send(&alice, "still here?").await, Flow::Exit);
        assert!(bob.peer.drain().is_empty());
    }
}
