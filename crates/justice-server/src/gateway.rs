//! Per-connection lifecycle for case rooms.
//!
//! A connection is admitted, replayed the room's history, announced, then
//! served until either side goes away. The writer half owns the socket sink
//! and forwards the connection's queue plus periodic pings; the reader half
//! validates inbound frames and turns them into room messages or turns.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use justice_core::errors::InboundError;
use justice_core::ids::{CaseId, ConnectionId, ParticipantId};
use justice_core::messages::Message;
use justice_core::turns::{TurnState, TurnStatus};

use crate::broadcast::Broadcaster;
use crate::rooms::Admission;
use crate::sessions::{SessionError, SessionService};

/// Which protocol a room endpoint speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomMode {
    /// Plain case chat: inbound `{"content": ...}`.
    Chat,
    /// Adversarial session room: inbound frames tagged by `type`.
    Adversarial,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    /// Longest accepted message, in characters.
    pub max_message_len: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            max_message_len: 4000,
        }
    }
}

#[derive(Deserialize)]
struct ChatFrame {
    content: String,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CourtFrame {
    HumanInput {
        content: String,
        #[serde(default, alias = "expectedTurn")]
        expected_turn: Option<u32>,
    },
    Chat {
        content: String,
    },
    Start,
}

fn status_line(state: &TurnState) -> String {
    match (state.status, state.current_speaker, state.winner) {
        (TurnStatus::Open, Some(speaker), _) => {
            format!("Session in progress: {} has the floor.", speaker.label())
        }
        (TurnStatus::Closed, _, Some(winner)) => {
            format!("Session concluded: {} prevailed.", winner.label())
        }
        _ => "No session in progress.".to_string(),
    }
}

pub struct SessionGateway {
    broadcaster: Arc<Broadcaster>,
    sessions: Arc<SessionService>,
    config: GatewayConfig,
}

impl SessionGateway {
    pub fn new(
        broadcaster: Arc<Broadcaster>,
        sessions: Arc<SessionService>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            broadcaster,
            sessions,
            config,
        }
    }

    /// Drive one connection from admission to removal.
    pub async fn serve<S, R, E>(
        &self,
        mode: RoomMode,
        case_id: CaseId,
        identity: ParticipantId,
        mut sink: S,
        mut stream: R,
    ) where
        S: Sink<WsMessage> + Unpin + Send + 'static,
        S::Error: Display,
        R: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
        E: Display + Send,
    {
        let (admission, history) = match self.broadcaster.join(&case_id, &identity).await {
            Ok(joined) => joined,
            Err(e) => {
                info!(case_id = %case_id, identity = %identity, error = %e, "admission refused");
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: e.close_reason().into(),
                };
                if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                    debug!(error = %e, "failed to send close frame");
                }
                return;
            }
        };
        let Admission {
            handle, receiver, ..
        } = admission;
        let connection_id = handle.id.clone();

        let mut writer = tokio::spawn(write_loop(
            sink,
            history,
            receiver,
            self.config.heartbeat_interval,
            connection_id.clone(),
        ));

        self.announce(&case_id, Message::joined(&case_id, &identity)).await;

        if mode == RoomMode::Adversarial {
            self.auto_start(&case_id, &identity).await;
        }

        let ctx = Inbound {
            mode,
            case_id: &case_id,
            identity: &identity,
            reply: &handle,
        };
        tokio::select! {
            _ = &mut writer => {
                debug!(connection_id = %connection_id, "writer finished");
            }
            _ = self.read_loop(&ctx, &mut stream) => {
                debug!(connection_id = %connection_id, "reader finished");
            }
        }
        writer.abort();

        self.broadcaster.rooms().remove(&case_id, &connection_id);
        info!(
            case_id = %case_id,
            connection_id = %connection_id,
            identity = %identity,
            "connection closed"
        );
        self.announce(&case_id, Message::left(&case_id, &identity)).await;
    }

    async fn announce(&self, case_id: &CaseId, message: Message) {
        if let Err(e) = self.broadcaster.publish(case_id, message).await {
            warn!(case_id = %case_id, error = %e, "failed to publish room notice");
        }
    }

    /// A seated party arriving opens the session if none is running.
    async fn auto_start(&self, case_id: &CaseId, identity: &ParticipantId) {
        match self.sessions.party_of(case_id, identity).await {
            Ok(Some(party)) => match self.sessions.start(case_id).await {
                Ok(_) => {}
                Err(SessionError::OpponentMissing(_)) => {
                    debug!(
                        case_id = %case_id,
                        party = %party,
                        "session waits for second participant"
                    );
                }
                Err(e) => {
                    warn!(
                        case_id = %case_id,
                        party = %party,
                        error = %e,
                        "session auto-start failed"
                    );
                }
            },
            Ok(None) => {}
            Err(e) => warn!(case_id = %case_id, error = %e, "seat lookup failed"),
        }
    }

    async fn read_loop<R, E>(&self, ctx: &Inbound<'_>, stream: &mut R)
    where
        R: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
        E: Display + Send,
    {
        loop {
            let frame = match tokio::time::timeout(self.config.idle_timeout, stream.next()).await {
                Err(_) => {
                    info!(case_id = %ctx.case_id, connection_id = %ctx.reply.id, "idle timeout");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    debug!(connection_id = %ctx.reply.id, error = %e, "socket read failed");
                    return;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                WsMessage::Text(text) => {
                    if let Err(e) = self.on_text(ctx, text.as_str()).await {
                        ctx.reject(e);
                    }
                }
                WsMessage::Binary(_) => {
                    ctx.reject(InboundError::Validation("binary frames are not accepted".into()))
                }
                WsMessage::Close(_) => return,
                // Pings and pongs only keep the connection alive.
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            }
        }
    }

    async fn on_text(&self, ctx: &Inbound<'_>, raw: &str) -> Result<(), InboundError> {
        match ctx.mode {
            RoomMode::Chat => {
                let frame: ChatFrame = serde_json::from_str(raw)
                    .map_err(|e| InboundError::Validation(e.to_string()))?;
                let content = self.validate_content(&frame.content)?;
                self.publish_chat(ctx, content).await;
            }
            RoomMode::Adversarial => {
                let frame: CourtFrame = serde_json::from_str(raw)
                    .map_err(|e| InboundError::Validation(e.to_string()))?;
                match frame {
                    CourtFrame::Chat { content } => {
                        let content = self.validate_content(&content)?;
                        self.publish_chat(ctx, content).await;
                    }
                    CourtFrame::HumanInput {
                        content,
                        expected_turn,
                    } => {
                        let content = self.validate_content(&content)?;
                        if let Err(e) = self
                            .sessions
                            .submit_as(ctx.case_id, ctx.identity, Some(content), expected_turn)
                            .await
                        {
                            debug!(
                                case_id = %ctx.case_id,
                                identity = %ctx.identity,
                                error = %e,
                                "turn rejected"
                            );
                            ctx.send(Message::error(ctx.case_id, e.to_string()));
                        }
                    }
                    CourtFrame::Start => match self.sessions.start(ctx.case_id).await {
                        Ok(state) => {
                            let report = Message::turn_update(
                                ctx.case_id,
                                status_line(&state),
                                json!({ "state": state }),
                            );
                            ctx.send(report);
                        }
                        Err(e) => ctx.send(Message::error(ctx.case_id, e.to_string())),
                    },
                }
            }
        }
        Ok(())
    }

    fn validate_content<'a>(&self, content: &'a str) -> Result<&'a str, InboundError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(InboundError::Validation("content must not be empty".into()));
        }
        let len = content.chars().count();
        if len > self.config.max_message_len {
            return Err(InboundError::Validation(format!(
                "content is {len} characters, limit is {}",
                self.config.max_message_len
            )));
        }
        Ok(content)
    }

    async fn publish_chat(&self, ctx: &Inbound<'_>, content: &str) {
        let message = Message::chat(ctx.case_id, ctx.identity, content);
        if let Err(e) = self.broadcaster.publish(ctx.case_id, message).await {
            warn!(case_id = %ctx.case_id, error = %e, "chat message not persisted");
            ctx.send(Message::error(ctx.case_id, "Message could not be delivered"));
        }
    }
}

/// Where an inbound frame came from and how to answer its sender.
struct Inbound<'a> {
    mode: RoomMode,
    case_id: &'a CaseId,
    identity: &'a ParticipantId,
    reply: &'a crate::rooms::ConnectionHandle,
}

impl Inbound<'_> {
    /// Sender-only delivery. Never persisted.
    fn send(&self, message: Message) {
        if let Err(e) = self.reply.deliver(message) {
            warn!(connection_id = %self.reply.id, error = %e, "reply dropped");
        }
    }

    fn reject(&self, error: InboundError) {
        debug!(connection_id = %self.reply.id, error = %error, "inbound frame rejected");
        self.send(Message::error(self.case_id, error.to_string()));
    }
}

async fn write_loop<S>(
    mut sink: S,
    history: Vec<Message>,
    mut rx: mpsc::Receiver<Message>,
    heartbeat: Duration,
    connection_id: ConnectionId,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    for message in history {
        if send_json(&mut sink, &message).await.is_err() {
            return;
        }
    }

    let mut ping = tokio::time::interval(heartbeat);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(message) => {
                    if send_json(&mut sink, &message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(vec![].into())).await {
                    debug!(connection_id = %connection_id, error = %e, "ping failed");
                    break;
                }
                trace!(connection_id = %connection_id, "sent ping");
            }
        }
    }
}

async fn send_json<S>(sink: &mut S, message: &Message) -> Result<(), ()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(message_id = %message.id, error = %e, "message not serializable, skipped");
            return Ok(());
        }
    };
    sink.send(WsMessage::Text(text.into())).await.map_err(|e| {
        debug!(error = %e, "socket write failed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use justice_core::messages::MessageKind;
    use justice_core::turns::Party;
    use justice_llm::mock::ScriptedEvaluator;

    use crate::rooms::RoomRegistry;
    use crate::testing::{aaa, bbb, stranger, Fixture};

    struct Harness {
        fx: Fixture,
        gateway: Arc<SessionGateway>,
        rooms: Arc<RoomRegistry>,
    }

    fn harness(evaluator: ScriptedEvaluator, config: GatewayConfig) -> Harness {
        let fx = Fixture::new();
        let stack = fx.stack(evaluator, Party::A);
        let gateway = Arc::new(SessionGateway::new(stack.broadcaster, stack.sessions, config));
        Harness {
            fx,
            gateway,
            rooms: stack.rooms,
        }
    }

    fn chat_harness() -> Harness {
        harness(ScriptedEvaluator::new([]).with_default(1.0), GatewayConfig::default())
    }

    struct Client {
        out: UnboundedReceiver<WsMessage>,
        inbound: UnboundedSender<Result<WsMessage, Infallible>>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Client {
        fn send(&self, raw: &str) {
            self.inbound
                .unbounded_send(Ok(WsMessage::Text(raw.to_string().into())))
                .unwrap();
        }

        async fn next_frame(&mut self) -> WsMessage {
            tokio::time::timeout(Duration::from_secs(5), self.out.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
        }

        async fn next(&mut self) -> Message {
            loop {
                if let WsMessage::Text(text) = self.next_frame().await {
                    return serde_json::from_str(text.as_str()).unwrap();
                }
            }
        }

        async fn next_matching(&mut self, pred: impl Fn(&Message) -> bool) -> Message {
            loop {
                let msg = self.next().await;
                if pred(&msg) {
                    return msg;
                }
            }
        }

        async fn disconnect(self) {
            drop(self.inbound);
            self.task.await.unwrap();
        }
    }

    fn connect(h: &Harness, mode: RoomMode, case: &CaseId, identity: ParticipantId) -> Client {
        let (sink, out) = unbounded::<WsMessage>();
        let (inbound, stream) = unbounded::<Result<WsMessage, Infallible>>();
        let gateway = h.gateway.clone();
        let case = case.clone();
        let task = tokio::spawn(async move {
            gateway.serve(mode, case, identity, sink, stream).await;
        });
        Client { out, inbound, task }
    }

    #[tokio::test]
    async fn chat_message_reaches_everyone_in_order() {
        let h = chat_harness();
        let case = h.fx.two_party_case();
        let mut alice = connect(&h, RoomMode::Chat, &case, aaa());
        assert_eq!(alice.next().await.content, "User 0xaaa joined the chat");
        let mut bob = connect(&h, RoomMode::Chat, &case, bbb());
        // Bob replays Alice's join, then sees his own.
        assert_eq!(bob.next().await.content, "User 0xaaa joined the chat");
        assert_eq!(bob.next().await.content, "User 0xbbb joined the chat");
        assert_eq!(alice.next().await.content, "User 0xbbb joined the chat");

        alice.send(r#"{"content":"  The invoice was paid in full.  "}"#);
        for client in [&mut alice, &mut bob] {
            let msg = client.next().await;
            assert_eq!(msg.kind, MessageKind::Chat);
            assert_eq!(msg.content, "The invoice was paid in full.");
            assert_eq!(msg.sender_identity, aaa());
            assert_eq!(msg.room_id, case);
            assert_eq!(msg.sequence, Some(3));
        }
    }

    #[tokio::test]
    async fn unauthorized_identity_is_closed_with_reason() {
        let h = chat_harness();
        let case = h.fx.two_party_case();
        let mut intruder = connect(&h, RoomMode::Chat, &case, stranger());
        match intruder.next_frame().await {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(frame.reason.as_str(), "Not authorized to join this case")
            }
            other => panic!("expected close, got {other:?}"),
        }
        intruder.task.await.unwrap();
        assert!(!h.rooms.contains_room(&case));
        assert_eq!(h.fx.messages.count(&case).unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_case_is_closed_with_reason() {
        let h = chat_harness();
        let mut client = connect(&h, RoomMode::Chat, &CaseId::from_raw("case_nope"), aaa());
        match client.next_frame().await {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.reason.as_str(), "Case not found"),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_payload_answers_sender_only() {
        let h = chat_harness();
        let case = h.fx.two_party_case();
        let mut alice = connect(&h, RoomMode::Chat, &case, aaa());
        alice.next().await;
        let mut bob = connect(&h, RoomMode::Chat, &case, bbb());
        bob.next().await;
        bob.next().await;
        alice.next().await;

        alice.send(r#"{"text":"wrong field"}"#);
        let err = alice.next().await;
        assert_eq!(err.kind, MessageKind::Error);
        assert!(err.content.starts_with("Invalid message format:"));
        assert!(err.sequence.is_none());

        alice.send(r#"{"content":"   "}"#);
        let err = alice.next().await;
        assert_eq!(err.content, "Invalid message format: content must not be empty");

        // The connection is still usable and Bob saw none of it.
        alice.send(r#"{"content":"ok"}"#);
        assert_eq!(alice.next().await.content, "ok");
        let seen = bob.next().await;
        assert_eq!(seen.content, "ok");
        assert_eq!(h.fx.messages.count(&case).unwrap(), 3);
    }

    #[tokio::test]
    async fn overlong_content_is_rejected() {
        let config = GatewayConfig {
            max_message_len: 5,
            ..Default::default()
        };
        let h = harness(ScriptedEvaluator::new([]), config);
        let case = h.fx.two_party_case();
        let mut alice = connect(&h, RoomMode::Chat, &case, aaa());
        alice.next().await;
        alice.send(r#"{"content":"far too long"}"#);
        let err = alice.next().await;
        assert_eq!(err.kind, MessageKind::Error);
        assert!(err.content.contains("limit is 5"));
    }

    #[tokio::test]
    async fn joiner_replays_history_in_order() {
        let h = chat_harness();
        let case = h.fx.two_party_case();
        let mut alice = connect(&h, RoomMode::Chat, &case, aaa());
        alice.next().await;
        for i in 0..3 {
            alice.send(&format!(r#"{{"content":"point {i}"}}"#));
            alice.next().await;
        }

        let mut bob = connect(&h, RoomMode::Chat, &case, bbb());
        let mut seqs = Vec::new();
        for _ in 0..5 {
            seqs.push(bob.next().await.sequence.unwrap());
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn disconnect_removes_member_and_announces() {
        let h = chat_harness();
        let case = h.fx.two_party_case();
        let mut alice = connect(&h, RoomMode::Chat, &case, aaa());
        alice.next().await;
        let mut bob = connect(&h, RoomMode::Chat, &case, bbb());
        bob.next().await;
        bob.next().await;

        alice.disconnect().await;
        let left = bob
            .next_matching(|m| m.content.contains("left"))
            .await;
        assert_eq!(left.content, "User 0xaaa left the chat");
        assert_eq!(h.rooms.members(&case).len(), 1);

        bob.disconnect().await;
        assert!(!h.rooms.contains_room(&case));

        // Rejoining replays everything, including the departures.
        let mut again = connect(&h, RoomMode::Chat, &case, aaa());
        let mut contents = Vec::new();
        for _ in 0..5 {
            contents.push(again.next().await.content);
        }
        assert_eq!(contents[2], "User 0xaaa left the chat");
        assert_eq!(contents[3], "User 0xbbb left the chat");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_dropped() {
        let h = chat_harness();
        let case = h.fx.two_party_case();
        let client = connect(&h, RoomMode::Chat, &case, aaa());
        let Client {
            out: _out,
            inbound: _inbound,
            task,
        } = client;
        task.await.unwrap();
        assert!(!h.rooms.contains_room(&case));
    }

    #[tokio::test]
    async fn adversarial_room_opens_session_and_plays_automated_turns() {
        let h = harness(ScriptedEvaluator::new([6.0, 2.0]), GatewayConfig::default());
        let case = h.fx.human_ai_case();
        let mut alice = connect(&h, RoomMode::Adversarial, &case, aaa());
        assert_eq!(alice.next().await.kind, MessageKind::System);
        let opened = alice.next().await;
        assert_eq!(opened.kind, MessageKind::TurnUpdate);
        assert_eq!(opened.data.unwrap()["event"]["event"], "session_opened");
        assert_eq!(alice.next().await.content, "Party A, please present your argument.");

        alice.send(r#"{"type":"human_input","content":"Delivery was three weeks late.","expected_turn":0}"#);
        let recorded = alice.next().await;
        assert_eq!(recorded.data.as_ref().unwrap()["event"]["event"], "turn_recorded");
        assert!(recorded.content.starts_with("Party A: Delivery was three weeks late."));

        let reply = alice
            .next_matching(|m| {
                m.data.as_ref().is_some_and(|d| {
                    d["event"]["event"] == "turn_recorded" && d["event"]["entry"]["speaker"] == "b"
                })
            })
            .await;
        assert_eq!(reply.data.unwrap()["state"]["current_speaker"], "a");
    }

    #[tokio::test]
    async fn out_of_turn_input_is_rejected_to_sender() {
        let h = harness(ScriptedEvaluator::new([]).with_default(1.0), GatewayConfig::default());
        let case = h.fx.two_party_case();
        let mut alice = connect(&h, RoomMode::Adversarial, &case, aaa());
        alice.next_matching(|m| m.content.ends_with("please present your argument.")).await;
        let mut bob = connect(&h, RoomMode::Adversarial, &case, bbb());
        bob.next_matching(|m| m.content == "User 0xbbb joined the chat").await;

        bob.send(r#"{"type":"human_input","content":"Objection!"}"#);
        let err = bob.next().await;
        assert_eq!(err.kind, MessageKind::Error);
        assert!(err.content.starts_with("out of turn"));
        assert!(err.sequence.is_none());
    }

    #[tokio::test]
    async fn start_frame_reports_running_session() {
        let h = chat_harness();
        let case = h.fx.two_party_case();
        let mut alice = connect(&h, RoomMode::Adversarial, &case, aaa());
        alice.next_matching(|m| m.content.ends_with("please present your argument.")).await;

        alice.send(r#"{"type":"start"}"#);
        let report = alice.next().await;
        assert_eq!(report.kind, MessageKind::TurnUpdate);
        assert_eq!(report.content, "Session in progress: Party A has the floor.");
        assert!(report.sequence.is_none());

        alice.send(r#"{"type":"chat","content":"Ready when you are."}"#);
        let chat = alice.next().await;
        assert_eq!(chat.kind, MessageKind::Chat);

        alice.send(r#"{"type":"verdict"}"#);
        assert_eq!(alice.next().await.kind, MessageKind::Error);
    }

    #[tokio::test]
    async fn lone_party_waits_for_opponent() {
        let h = chat_harness();
        let case = h.fx.lone_human_case();
        let mut alice = connect(&h, RoomMode::Adversarial, &case, aaa());
        assert_eq!(alice.next().await.content, "User 0xaaa joined the chat");

        alice.send(r#"{"type":"start"}"#);
        let err = alice.next().await;
        assert_eq!(err.kind, MessageKind::Error);
        assert!(err.content.ends_with("is waiting for its second participant"));
        // Only the join notice reached the ledger.
        assert_eq!(h.fx.messages.count(&case).unwrap(), 1);
    }
}
