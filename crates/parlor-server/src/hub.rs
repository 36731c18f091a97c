//! Room hub
//!
//! Lazily spawns one worker task per live room and routes command envelopes
//! to worker inboxes. Topic and broadcast rooms are loaded from storage on
//! first use; direct rooms are synthesized from the peer pair on first
//! contact. Workers stay resident once spawned.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parlor_core::room::{
    RoomDefinition, RoomKind, UserId, direct_peers, direct_room_id, is_direct_room_id,
};
use parlor_core::{Environment, RoomError};
use tokio::sync::{Mutex, mpsc};

use crate::SharedState;
use crate::router::RoomRouter;
use crate::server_error::ServerError;
use crate::storage::Storage;
use crate::worker::{CommandEnvelope, RoomWorker};

/// Routes commands to per-room worker tasks.
pub(crate) struct RoomHub<E: Environment, S> {
    rooms: Mutex<HashMap<u128, mpsc::Sender<CommandEnvelope>>>,
    shared: Arc<SharedState>,
    storage: S,
    env: E,
    worker_channel_capacity: usize,
    tick_interval: Duration,
}

impl<E, S> RoomHub<E, S>
where
    E: Environment,
    S: Storage,
{
    pub(crate) fn new(
        shared: Arc<SharedState>,
        storage: S,
        env: E,
        worker_channel_capacity: usize,
        tick_interval: Duration,
    ) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            shared,
            storage,
            env,
            worker_channel_capacity,
            tick_interval,
        }
    }

    /// Routes one envelope to the room's worker, spawning it on first use.
    ///
    /// # Errors
    ///
    /// `UnknownRoom` when no such room exists, `RoomBusy` when the worker's
    /// inbox is full.
    pub(crate) async fn dispatch(
        &self,
        room_id: u128,
        envelope: CommandEnvelope,
    ) -> Result<(), ServerError> {
        let inbox = self.worker_inbox(room_id).await?;
        deliver(&inbox, room_id, envelope)
    }

    /// Routes one envelope into the direct room between two users,
    /// synthesizing the room on first contact.
    ///
    /// Returns the canonical room id so the caller can stamp it into
    /// follow-up frames.
    pub(crate) async fn dispatch_direct(
        &self,
        a: UserId,
        b: UserId,
        envelope: CommandEnvelope,
    ) -> Result<u128, ServerError> {
        let room_id = direct_room_id(a, b);

        let inbox = {
            let mut rooms = self.rooms.lock().await;
            match rooms.get(&room_id) {
                Some(inbox) => inbox.clone(),
                None => {
                    let definition = RoomDefinition::direct(a, b);
                    // Idempotent: a restart re-creates the same definition
                    // over the stored one.
                    self.storage.create_room(&definition)?;
                    let inbox = self.spawn_worker(definition).await?;
                    rooms.insert(room_id, inbox.clone());
                    inbox
                }
            }
        };

        deliver(&inbox, room_id, envelope)?;
        Ok(room_id)
    }

    /// Persists a new room definition.
    ///
    /// The worker spawns lazily on the first join, not here. Creating an
    /// id that already exists is a no-op ack; definitions are immutable
    /// apart from the allow list.
    pub(crate) fn create_room(
        &self,
        room_id: u128,
        kind: RoomKind,
        capacity: u32,
        private: bool,
        creator: UserId,
    ) -> Result<(), ServerError> {
        if kind == RoomKind::Direct {
            return Err(RoomError::Malformed(
                "direct rooms are synthesized, not created".to_string(),
            )
            .into());
        }
        if is_direct_room_id(room_id) {
            return Err(RoomError::Malformed(
                "explicit room ids must set the top bit".to_string(),
            )
            .into());
        }
        let capacity = RoomDefinition::validate_capacity(capacity)?;

        let definition = RoomDefinition {
            id: room_id,
            kind,
            capacity,
            private,
            creator,
            allow_list: BTreeSet::new(),
        };
        self.storage.create_room(&definition)?;
        tracing::info!(room_id = %room_id, ?kind, capacity, private, "room created");
        Ok(())
    }

    async fn worker_inbox(&self, room_id: u128) -> Result<mpsc::Sender<CommandEnvelope>, ServerError> {
        let mut rooms = self.rooms.lock().await;
        if let Some(inbox) = rooms.get(&room_id) {
            return Ok(inbox.clone());
        }

        let definition = self
            .storage
            .load_room(room_id)?
            .ok_or(RoomError::UnknownRoom(room_id))?;
        let inbox = self.spawn_worker(definition).await?;
        rooms.insert(room_id, inbox.clone());
        Ok(inbox)
    }

    async fn spawn_worker(
        &self,
        definition: RoomDefinition,
    ) -> Result<mpsc::Sender<CommandEnvelope>, ServerError> {
        let room_id = definition.id;
        let latest = self.storage.latest_sequence(room_id)?;
        let mut router = RoomRouter::resume(definition, latest);

        if router.is_direct() {
            // Direct rooms carry their fixed roster from the start and
            // never emit join events, so index the membership here.
            let (a, b) = direct_peers(room_id);
            let usernames = self.shared.directory.resolve_usernames(&[a, b]);
            router.seed_direct_members(self.env.wall_clock_ms(), &usernames);

            let mut membership = self.shared.membership.write().await;
            membership.record_join(a, room_id);
            membership.record_join(b, room_id);
        }

        tracing::info!(
            room_id = %room_id,
            resumed_at_sequence = latest.unwrap_or(0),
            "room worker started"
        );

        let (inbox_tx, inbox_rx) = mpsc::channel(self.worker_channel_capacity);
        let worker = RoomWorker::new(
            router,
            inbox_rx,
            self.shared.clone(),
            self.storage.clone(),
            self.env.clone(),
            self.tick_interval,
        );
        tokio::spawn(worker.run());
        Ok(inbox_tx)
    }
}

/// Hands an envelope to a worker without waiting.
///
/// A full inbox is the backpressure signal: the client sees `overloaded`
/// and retries. A closed inbox means the worker task died, which a healthy
/// server never does.
fn deliver(
    inbox: &mpsc::Sender<CommandEnvelope>,
    room_id: u128,
    envelope: CommandEnvelope,
) -> Result<(), ServerError> {
    inbox.try_send(envelope).map_err(|err| match err {
        mpsc::error::TrySendError::Full(_) => ServerError::RoomBusy(room_id),
        mpsc::error::TrySendError::Closed(_) => {
            ServerError::Internal(format!("room {room_id:032x} worker stopped"))
        }
    })
}

#[cfg(test)]
mod tests {
    use parlor_proto::payloads::room::MessageKind;
    use parlor_proto::{Frame, Opcode};
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::router::{CommandContext, RoomCommand};
    use crate::storage::MemoryStorage;
    use crate::system_env::SystemEnv;

    const ROOM: u128 = 0x8000_0000_0000_0000_0000_0000_0000_00AB;

    fn hub() -> RoomHub<SystemEnv, MemoryStorage> {
        let shared = Arc::new(SharedState::new(Arc::new(MemoryDirectory::new())));
        RoomHub::new(
            shared,
            MemoryStorage::new(),
            SystemEnv::new(),
            16,
            Duration::from_millis(100),
        )
    }

    fn envelope(
        sender: u64,
        command: RoomCommand,
        reply: Option<oneshot::Sender<Frame>>,
    ) -> CommandEnvelope {
        CommandEnvelope {
            context: CommandContext {
                sender,
                username: None,
                request_id: 1,
            },
            session_id: Some(sender),
            command,
            reply,
        }
    }

    async fn await_reply(rx: oneshot::Receiver<Frame>) -> Frame {
        timeout(Duration::from_secs(1), rx)
            .await
            .expect("reply timed out")
            .expect("worker dropped reply")
    }

    #[tokio::test]
    async fn dispatching_to_an_unknown_room_fails() {
        let hub = hub();
        let err = hub
            .dispatch(ROOM, envelope(1, RoomCommand::Join, None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Room(RoomError::UnknownRoom(id)) if id == ROOM
        ));
    }

    #[tokio::test]
    async fn created_rooms_accept_joins() {
        let hub = hub();
        hub.create_room(ROOM, RoomKind::Topic, 8, false, 1).unwrap();

        let (tx, rx) = oneshot::channel();
        hub.dispatch(ROOM, envelope(1, RoomCommand::Join, Some(tx)))
            .await
            .unwrap();
        let frame = await_reply(rx).await;
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::Ack));
    }

    #[tokio::test]
    async fn create_room_validates_kind_id_and_capacity() {
        let hub = hub();

        // Direct rooms cannot be created explicitly.
        assert!(hub.create_room(ROOM, RoomKind::Direct, 2, true, 1).is_err());
        // Explicit ids must stay out of the direct id space.
        assert!(hub.create_room(42, RoomKind::Topic, 8, false, 1).is_err());
        // Capacity bounds come from the room rules.
        assert!(hub.create_room(ROOM, RoomKind::Topic, 0, false, 1).is_err());

        assert!(hub.create_room(ROOM, RoomKind::Topic, 8, false, 1).is_ok());
    }

    #[tokio::test]
    async fn direct_dispatch_synthesizes_one_room_per_pair() {
        let hub = hub();

        let send = RoomCommand::Send {
            content: "psst".to_owned(),
            kind: MessageKind::Text,
            reply_to: None,
        };
        let (tx, rx) = oneshot::channel();
        let room_id = hub
            .dispatch_direct(7, 3, envelope(7, send, Some(tx)))
            .await
            .unwrap();
        assert_eq!(room_id, direct_room_id(3, 7));
        assert_eq!(await_reply(rx).await.header.opcode_enum(), Some(Opcode::Ack));

        // The reverse direction lands in the same room.
        let (tx, rx) = oneshot::channel();
        let reply = RoomCommand::Send {
            content: "heard you".to_owned(),
            kind: MessageKind::Text,
            reply_to: None,
        };
        let second = hub
            .dispatch_direct(3, 7, envelope(3, reply, Some(tx)))
            .await
            .unwrap();
        assert_eq!(second, room_id);
        await_reply(rx).await;

        // Both peers are indexed as members of the synthesized room.
        let membership = hub.shared.membership.read().await;
        assert_eq!(membership.rooms_of(3), vec![room_id]);
        assert_eq!(membership.rooms_of(7), vec![room_id]);
    }

    #[tokio::test]
    async fn full_worker_inboxes_surface_backpressure() {
        let shared = Arc::new(SharedState::new(Arc::new(MemoryDirectory::new())));
        let storage = MemoryStorage::new();
        let hub = RoomHub::new(shared, storage, SystemEnv::new(), 1, Duration::from_secs(3600));
        hub.create_room(ROOM, RoomKind::Topic, 8, false, 1).unwrap();

        // First dispatch spawns the worker and fills the one-slot inbox;
        // keep flooding until the worker falls behind.
        let mut saw_busy = false;
        for _ in 0..64 {
            match hub.dispatch(ROOM, envelope(1, RoomCommand::Join, None)).await {
                Ok(()) => {}
                Err(ServerError::RoomBusy(id)) => {
                    assert_eq!(id, ROOM);
                    saw_busy = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(saw_busy, "expected at least one busy rejection");
    }
}
