//! Room worker task
//!
//! One Tokio task per live room. The worker owns the room's [`RoomRouter`]
//! exclusively, so commands apply strictly in arrival order and the router
//! needs no locking. Deliveries go straight onto the per-session outbound
//! queues; a slow consumer loses frames instead of stalling the room.

use std::sync::Arc;
use std::time::Duration;

use parlor_core::Environment;
use parlor_core::room::UserId;
use parlor_proto::{ErrorPayload, Frame, FrameHeader, Opcode, Payload, ProtocolError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::SharedState;
use crate::router::{CommandContext, FanoutScope, RoomAction, RoomCommand, RoomRouter};
use crate::server_error::room_error_payload;
use crate::storage::Storage;

/// One command in flight to a room worker.
pub(crate) struct CommandEnvelope {
    /// Identity of the issuing user.
    pub(crate) context: CommandContext,
    /// Session the command arrived on, for requester-skipping fan-out.
    /// `None` for server-originated commands such as implicit leaves.
    pub(crate) session_id: Option<u64>,
    /// The command itself.
    pub(crate) command: RoomCommand,
    /// Present when the gateway awaits the reply in line. The worker routes
    /// the reply frame here instead of through the outbound queue.
    pub(crate) reply: Option<oneshot::Sender<Frame>>,
}

/// Task that drains one room's command inbox.
pub(crate) struct RoomWorker<E: Environment, S> {
    router: RoomRouter<E::Instant>,
    inbox: mpsc::Receiver<CommandEnvelope>,
    shared: Arc<SharedState>,
    storage: S,
    env: E,
    tick_interval: Duration,
}

impl<E, S> RoomWorker<E, S>
where
    E: Environment,
    S: Storage,
{
    pub(crate) fn new(
        router: RoomRouter<E::Instant>,
        inbox: mpsc::Receiver<CommandEnvelope>,
        shared: Arc<SharedState>,
        storage: S,
        env: E,
        tick_interval: Duration,
    ) -> Self {
        Self {
            router,
            inbox,
            shared,
            storage,
            env,
            tick_interval,
        }
    }

    /// Runs until every sender to the inbox is dropped.
    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                envelope = self.inbox.recv() => {
                    match envelope {
                        Some(envelope) => self.process(envelope).await,
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    let actions = self.router.tick(&self.env);
                    if !actions.is_empty() {
                        self.execute(actions, None, None).await;
                    }
                }
            }
        }

        tracing::debug!(room_id = %self.router.room_id(), "room worker stopped");
    }

    async fn process(&mut self, envelope: CommandEnvelope) {
        let CommandEnvelope {
            context,
            session_id,
            command,
            reply,
        } = envelope;

        match self.router.handle(&context, command, &self.env, &self.storage) {
            Ok(actions) => self.execute(actions, session_id, reply).await,
            Err(err) => {
                tracing::debug!(
                    room_id = %self.router.room_id(),
                    user_id = context.sender,
                    error = %err,
                    "command rejected"
                );
                let frame = match self.error_frame(&context, room_error_payload(&err)) {
                    Ok(frame) => frame,
                    Err(encode_err) => {
                        tracing::error!(error = %encode_err, "failed to encode error frame");
                        return;
                    }
                };
                if let Some(channel) = reply {
                    let _ = channel.send(frame);
                } else if let Some(session_id) = session_id {
                    self.send_to_session(session_id, frame).await;
                }
            }
        }
    }

    /// Delivers the actions produced by one command or tick.
    ///
    /// Broadcasts resolve membership here, after the command already
    /// mutated the roster, so a departure in the same batch is excluded
    /// from its own fan-out.
    async fn execute(
        &mut self,
        actions: Vec<RoomAction>,
        requester: Option<u64>,
        mut reply: Option<oneshot::Sender<Frame>>,
    ) {
        let stamp = self.env.wall_clock_ms();

        for action in actions {
            match action {
                RoomAction::Reply(mut frame) => {
                    frame.header.set_timestamp_ms(stamp);
                    if let Some(channel) = reply.take() {
                        if channel.send(frame).is_err() {
                            tracing::debug!(
                                room_id = %self.router.room_id(),
                                "requester gone before reply"
                            );
                        }
                    } else if let Some(session_id) = requester {
                        self.send_to_session(session_id, frame).await;
                    }
                }
                RoomAction::Broadcast { mut frame, scope } => {
                    frame.header.set_timestamp_ms(stamp);
                    self.broadcast(frame, scope, requester).await;
                }
                RoomAction::SendToUser { user_id, mut frame } => {
                    frame.header.set_timestamp_ms(stamp);
                    self.send_to_user(user_id, frame).await;
                }
                RoomAction::MembershipChanged { user_id, joined } => {
                    let room_id = self.router.room_id();
                    let mut membership = self.shared.membership.write().await;
                    if joined {
                        membership.record_join(user_id, room_id);
                    } else {
                        membership.record_leave(user_id, room_id);
                    }
                }
            }
        }
    }

    async fn broadcast(&self, frame: Frame, scope: FanoutScope, requester: Option<u64>) {
        let members = self.router.member_user_ids();
        let registry = self.shared.registry.read().await;

        for user_id in members {
            if matches!(scope, FanoutScope::SkipUser(skip) if skip == user_id) {
                continue;
            }
            for session_id in registry.sessions_of(user_id) {
                if matches!(scope, FanoutScope::SkipRequester) && Some(session_id) == requester {
                    continue;
                }
                if let Some(outbound) = registry.outbound(session_id) {
                    queue_frame(&outbound, session_id, frame.clone());
                }
            }
        }
    }

    async fn send_to_user(&self, user_id: UserId, frame: Frame) {
        let registry = self.shared.registry.read().await;
        for session_id in registry.sessions_of(user_id) {
            if let Some(outbound) = registry.outbound(session_id) {
                queue_frame(&outbound, session_id, frame.clone());
            }
        }
    }

    async fn send_to_session(&self, session_id: u64, frame: Frame) {
        let registry = self.shared.registry.read().await;
        if let Some(outbound) = registry.outbound(session_id) {
            queue_frame(&outbound, session_id, frame);
        }
    }

    fn error_frame(
        &self,
        context: &CommandContext,
        payload: ErrorPayload,
    ) -> Result<Frame, ProtocolError> {
        let mut header = FrameHeader::new(Opcode::Error);
        header.set_room_id(self.router.room_id());
        header.set_request_id(context.request_id);
        header.set_timestamp_ms(self.env.wall_clock_ms());
        Payload::Error(payload).into_frame(header)
    }
}

/// Queues a frame without waiting. A full queue drops the frame for that
/// session; the client resynchronizes over history. A closed queue means
/// the session's gateway task is already tearing down.
pub(crate) fn queue_frame(outbound: &mpsc::Sender<Frame>, session_id: u64, frame: Frame) {
    match outbound.try_send(frame) {
        Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(session_id, "outbound queue full, dropping frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    use parlor_core::room::{RoomDefinition, RoomKind};
    use parlor_proto::Opcode;
    use parlor_proto::payloads::room::MessageKind;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::timeout;

    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::registry::SessionHandle;
    use crate::storage::MemoryStorage;
    use crate::system_env::SystemEnv;

    const ROOM: u128 = 0x8000_0000_0000_0000_0000_0000_0000_0042;

    async fn spawn_room() -> (mpsc::Sender<CommandEnvelope>, Arc<SharedState>) {
        let shared = Arc::new(SharedState::new(Arc::new(MemoryDirectory::new())));
        let storage = MemoryStorage::new();
        let definition = RoomDefinition {
            id: ROOM,
            kind: RoomKind::Topic,
            capacity: 10,
            private: false,
            creator: 1,
            allow_list: BTreeSet::new(),
        };
        storage.create_room(&definition).unwrap();

        let (inbox_tx, inbox_rx) = mpsc::channel(16);
        let worker = RoomWorker::new(
            RoomRouter::new(definition),
            inbox_rx,
            shared.clone(),
            storage,
            SystemEnv::new(),
            Duration::from_millis(100),
        );
        tokio::spawn(worker.run());
        (inbox_tx, shared)
    }

    async fn register_session(
        shared: &SharedState,
        session_id: u64,
        user_id: u64,
    ) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(16);
        let handle = SessionHandle {
            user_id,
            username: None,
            outbound: tx,
        };
        assert!(shared.registry.write().await.register(session_id, handle));
        rx
    }

    fn envelope(
        sender: u64,
        session_id: u64,
        command: RoomCommand,
        reply: Option<oneshot::Sender<Frame>>,
    ) -> CommandEnvelope {
        CommandEnvelope {
            context: CommandContext {
                sender,
                username: None,
                request_id: 1,
            },
            session_id: Some(session_id),
            command,
            reply,
        }
    }

    async fn join(inbox: &mpsc::Sender<CommandEnvelope>, sender: u64, session_id: u64) -> Frame {
        let (tx, rx) = oneshot::channel();
        inbox
            .send(envelope(sender, session_id, RoomCommand::Join, Some(tx)))
            .await
            .unwrap();
        timeout(Duration::from_secs(1), rx)
            .await
            .expect("join timed out")
            .expect("worker dropped reply")
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("recv timed out")
            .expect("outbound channel closed")
    }

    #[tokio::test]
    async fn join_reply_routes_through_the_oneshot() {
        let (inbox, shared) = spawn_room().await;
        let _rx = register_session(&shared, 100, 1).await;

        let frame = join(&inbox, 1, 100).await;
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::Ack));
        assert_eq!(frame.header.room_id(), ROOM);
    }

    #[tokio::test]
    async fn errors_flow_back_to_the_requester() {
        let (inbox, shared) = spawn_room().await;
        let _rx = register_session(&shared, 100, 1).await;

        // Sending without joining first is a membership error.
        let (tx, rx) = oneshot::channel();
        inbox
            .send(envelope(
                1,
                100,
                RoomCommand::Send {
                    content: "hi".to_owned(),
                    kind: MessageKind::Text,
                    reply_to: None,
                },
                Some(tx),
            ))
            .await
            .unwrap();

        let frame = timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::Error));
        assert_eq!(frame.header.request_id(), 1);
    }

    #[tokio::test]
    async fn message_fanout_skips_only_the_sending_session() {
        let (inbox, shared) = spawn_room().await;
        let mut sender_rx = register_session(&shared, 100, 1).await;
        let mut second_device_rx = register_session(&shared, 101, 1).await;
        let mut peer_rx = register_session(&shared, 200, 2).await;

        join(&inbox, 1, 100).await;
        join(&inbox, 2, 200).await;

        // Drain the join fan-out: the second device saw both joins, the
        // sending session only the peer's.
        assert_eq!(
            recv_frame(&mut second_device_rx).await.header.opcode_enum(),
            Some(Opcode::MemberJoined)
        );
        assert_eq!(
            recv_frame(&mut second_device_rx).await.header.opcode_enum(),
            Some(Opcode::MemberJoined)
        );
        assert_eq!(
            recv_frame(&mut sender_rx).await.header.opcode_enum(),
            Some(Opcode::MemberJoined)
        );

        let (tx, rx) = oneshot::channel();
        inbox
            .send(envelope(
                1,
                100,
                RoomCommand::Send {
                    content: "multi-device".to_owned(),
                    kind: MessageKind::Text,
                    reply_to: None,
                },
                Some(tx),
            ))
            .await
            .unwrap();
        timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();

        // The peer and the sender's other device both receive the event.
        assert_eq!(
            recv_frame(&mut peer_rx).await.header.opcode_enum(),
            Some(Opcode::RoomMessageEvent)
        );
        assert_eq!(
            recv_frame(&mut second_device_rx).await.header.opcode_enum(),
            Some(Opcode::RoomMessageEvent)
        );
        // The issuing session does not; its queue is empty again.
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn membership_changes_update_the_shared_index() {
        let (inbox, shared) = spawn_room().await;
        let _rx = register_session(&shared, 100, 1).await;

        join(&inbox, 1, 100).await;
        assert_eq!(shared.membership.read().await.rooms_of(1), vec![ROOM]);

        let (tx, rx) = oneshot::channel();
        inbox
            .send(envelope(1, 100, RoomCommand::Leave, Some(tx)))
            .await
            .unwrap();
        timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();

        assert!(shared.membership.read().await.rooms_of(1).is_empty());
    }
}
