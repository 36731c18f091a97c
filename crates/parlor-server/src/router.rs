//! Room command router
//!
//! Applies one decoded client command against one room's state and returns
//! the frames to deliver. The router is the single authority for a room's
//! roster, sequence numbers, typing indicators, reactions, receipts, and
//! restrictions; the worker that owns it executes the returned actions
//! against live sessions. Storage calls are synchronous and fail closed:
//! a message that cannot be persisted is never fanned out.
//!
//! Generic over `I` (Instant type) to support virtual time in tests.

use std::collections::HashMap;
use std::time::Duration;

use parlor_core::mentions::resolve_mentions;
use parlor_core::moderation::{ModerationState, RestrictionKind, required_role};
use parlor_core::reactions::ReactionBoard;
use parlor_core::receipts::ReceiptLog;
use parlor_core::room::{Member, RoomDefinition, Roster, UserId, direct_peers};
use parlor_core::sequencer::Sequencer;
use parlor_core::typing::{TYPING_IDLE_TIMEOUT, TypingTracker};
use parlor_core::{Environment, RoomError};
use parlor_proto::payloads::moderation::{
    AuditEntry, ModerationEvent, ModerationKind, ModerationLogResponse, RoleEvent,
};
use parlor_proto::payloads::notify::{NotificationEvent, NotificationKind};
use parlor_proto::payloads::reactions::ReadListResponse;
use parlor_proto::payloads::room::{
    HistoryResponse, MemberJoined, MemberLeft, MessageKind, MessageRecord, Role,
};
use parlor_proto::payloads::session::Ack;
use parlor_proto::{Frame, FrameHeader, Payload};

use crate::storage::Storage;

/// Longest accepted text message body, in bytes.
pub const MAX_MESSAGE_CONTENT_BYTES: usize = 4096;

/// Longest accepted reaction emoji, in bytes. Grapheme clusters with
/// modifiers fit comfortably; arbitrary strings do not.
pub const MAX_EMOJI_BYTES: usize = 64;

/// Hard cap on one history page. Requests above this are clamped, a limit
/// of zero selects it outright.
pub const HISTORY_PAGE_LIMIT: usize = 100;

/// Audit entries returned when the request does not name a limit.
const AUDIT_LOG_DEFAULT_LIMIT: usize = 50;

/// Notification previews truncate the source content to this many bytes.
const NOTIFICATION_PREVIEW_BYTES: usize = 120;

/// Identity of the session that issued a command.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Authenticated user behind the session.
    pub sender: UserId,
    /// Display name from the user directory, when known.
    pub username: Option<String>,
    /// Client request id, echoed in the reply frame.
    pub request_id: u32,
}

/// One decoded client request addressed to a single room.
#[derive(Debug, Clone)]
pub enum RoomCommand {
    /// Enter the room.
    Join,
    /// Leave the room explicitly.
    Leave,
    /// Drop membership because the user's last session disconnected.
    ImplicitLeave,
    /// Authorize a user to join a private room.
    Invite {
        /// User to add to the allow list.
        user_id: UserId,
    },
    /// Append a message to the room log.
    Send {
        /// Message body, or attachment URL for non-text kinds.
        content: String,
        /// Content category.
        kind: MessageKind,
        /// Message this one replies to, if any.
        reply_to: Option<u64>,
    },
    /// Page through history, newest first.
    History {
        /// Exclusive upper sequence bound; absent means from the newest.
        before_sequence: Option<u64>,
        /// Page size before clamping.
        limit: u32,
    },
    /// Start or stop the typing indicator.
    Typing {
        /// True while composing.
        active: bool,
    },
    /// Add or remove a reaction on a message.
    ToggleReaction {
        /// Reacted message.
        message_id: u64,
        /// Emoji being toggled.
        emoji: String,
    },
    /// Record a read receipt.
    MarkRead {
        /// Message that was read.
        message_id: u64,
    },
    /// List who has read a message.
    ReadList {
        /// Message being queried.
        message_id: u64,
    },
    /// Change a member's role.
    ChangeRole {
        /// Member whose role changes.
        user_id: UserId,
        /// New role.
        role: Role,
    },
    /// Apply a moderation action.
    Moderate {
        /// Action to apply.
        kind: ModerationKind,
        /// Target user, for user-directed kinds.
        target_user: Option<UserId>,
        /// Target message, for deletions.
        target_message: Option<u64>,
        /// Reason recorded in the audit log and shown to the target.
        reason: String,
        /// Restriction window for mutes and bans. Absent means permanent.
        duration_ms: Option<u64>,
    },
    /// Page the moderation audit log, newest first.
    ModerationLog {
        /// Maximum entries to return; absent means the server default.
        limit: Option<u32>,
    },
}

/// Which member sessions a broadcast reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutScope {
    /// Every member session.
    All,
    /// Every member session except those owned by the requester.
    SkipRequester,
    /// Every member session except those owned by this user.
    SkipUser(UserId),
}

/// Deliveries produced by one command, in emit order.
///
/// The reply to the requester always comes first; state-change events
/// follow. The worker resolves `Broadcast` against the roster at execute
/// time, so a departure emitted by the same command already excludes the
/// departed user.
#[derive(Debug, Clone)]
pub enum RoomAction {
    /// Send to the requesting session only.
    Reply(Frame),
    /// Fan out to current member sessions.
    Broadcast {
        /// Frame to deliver.
        frame: Frame,
        /// Sessions to exclude.
        scope: FanoutScope,
    },
    /// Send to every live session of one user, member or not.
    SendToUser {
        /// Recipient.
        user_id: UserId,
        /// Frame to deliver.
        frame: Frame,
    },
    /// Membership changed; the worker updates the shared membership index.
    MembershipChanged {
        /// Affected user.
        user_id: UserId,
        /// True on join, false on departure.
        joined: bool,
    },
}

/// Room state machine: one per live room, owned by that room's worker.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
pub struct RoomRouter<I = std::time::Instant> {
    definition: RoomDefinition,
    roster: Roster,
    sequencer: Sequencer,
    typing: TypingTracker<I>,
    reactions: ReactionBoard,
    receipts: ReceiptLog,
    moderation: ModerationState<I>,
}

impl<I> std::fmt::Debug for RoomRouter<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRouter")
            .field("room_id", &self.definition.id)
            .field("members", &self.roster.len())
            .field("next_sequence", &self.sequencer.peek())
            .finish_non_exhaustive()
    }
}

impl<I> RoomRouter<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Creates the router for a freshly created room.
    #[must_use]
    pub fn new(definition: RoomDefinition) -> Self {
        Self::with_sequencer(definition, Sequencer::fresh())
    }

    /// Creates the router for a room recovered from storage.
    ///
    /// `latest_sequence` is the highest stored sequence; the next accepted
    /// message lands directly after it.
    #[must_use]
    pub fn resume(definition: RoomDefinition, latest_sequence: Option<u64>) -> Self {
        Self::with_sequencer(definition, Sequencer::resume_after(latest_sequence))
    }

    fn with_sequencer(definition: RoomDefinition, sequencer: Sequencer) -> Self {
        Self {
            definition,
            roster: Roster::new(),
            sequencer,
            typing: TypingTracker::new(TYPING_IDLE_TIMEOUT),
            reactions: ReactionBoard::new(),
            receipts: ReceiptLog::new(),
            moderation: ModerationState::new(),
        }
    }

    /// Installs the fixed two-member roster of a direct room.
    ///
    /// Direct rooms have no join handshake; both peers are members from the
    /// moment the room exists. A self-conversation seats a single member.
    pub fn seed_direct_members(&mut self, joined_at_ms: u64, usernames: &HashMap<UserId, String>) {
        let (a, b) = direct_peers(self.definition.id);
        for user_id in [a, b] {
            self.roster.insert(Member {
                user_id,
                username: usernames.get(&user_id).cloned(),
                role: Role::Member,
                joined_at_ms,
            });
        }
    }

    /// Room this router serves.
    #[must_use]
    pub fn room_id(&self) -> u128 {
        self.definition.id
    }

    /// True for pairwise direct-message rooms.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.definition.is_direct()
    }

    /// User ids of the current members.
    #[must_use]
    pub fn member_user_ids(&self) -> Vec<UserId> {
        self.roster.user_ids().collect()
    }

    /// Applies `command` and returns the deliveries it produced.
    ///
    /// On error nothing was changed except where noted on the individual
    /// operations (a failed persist still consumes a sequence probe before
    /// resynchronizing). The worker maps the error to a single Error frame
    /// for the requesting session.
    pub fn handle<E, S>(
        &mut self,
        ctx: &CommandContext,
        command: RoomCommand,
        env: &E,
        storage: &S,
    ) -> Result<Vec<RoomAction>, RoomError>
    where
        E: Environment<Instant = I>,
        S: Storage,
    {
        match command {
            RoomCommand::Join => self.handle_join(ctx, env),
            RoomCommand::Leave => self.handle_leave(ctx, env),
            RoomCommand::ImplicitLeave => self.handle_implicit_leave(ctx.sender, env),
            RoomCommand::Invite { user_id } => self.handle_invite(ctx, user_id, storage),
            RoomCommand::Send { content, kind, reply_to } => {
                self.handle_send(ctx, content, kind, reply_to, env, storage)
            }
            RoomCommand::History { before_sequence, limit } => {
                self.handle_history(ctx, before_sequence, limit, storage)
            }
            RoomCommand::Typing { active } => self.handle_typing(ctx, active, env),
            RoomCommand::ToggleReaction { message_id, emoji } => {
                self.handle_toggle_reaction(ctx, message_id, &emoji, env, storage)
            }
            RoomCommand::MarkRead { message_id } => {
                self.handle_mark_read(ctx, message_id, env, storage)
            }
            RoomCommand::ReadList { message_id } => self.handle_read_list(ctx, message_id, storage),
            RoomCommand::ChangeRole { user_id, role } => self.handle_change_role(ctx, user_id, role),
            RoomCommand::Moderate { kind, target_user, target_message, reason, duration_ms } => {
                self.handle_moderate(ctx, kind, target_user, target_message, reason, duration_ms, env, storage)
            }
            RoomCommand::ModerationLog { limit } => self.handle_moderation_log(ctx, limit),
        }
    }

    /// Periodic maintenance: expires idle typing indicators and lapsed
    /// restrictions. Returns the stop events to fan out.
    pub fn tick<E>(&mut self, env: &E) -> Vec<RoomAction>
    where
        E: Environment<Instant = I>,
    {
        let now = env.now();
        let mut actions = Vec::new();

        for event in self.typing.sweep(now) {
            let user_id = event.user_id;
            match self.event_frame(user_id, Payload::TypingEvent(event)) {
                Ok(frame) => actions.push(RoomAction::Broadcast {
                    frame,
                    scope: FanoutScope::SkipUser(user_id),
                }),
                Err(err) => {
                    tracing::warn!(room_id = %self.definition.id, error = %err, "dropping typing expiry event");
                }
            }
        }

        self.moderation.purge_expired(now);
        actions
    }

    fn handle_join<E>(&mut self, ctx: &CommandContext, env: &E) -> Result<Vec<RoomAction>, RoomError>
    where
        E: Environment<Instant = I>,
    {
        if let Some(role) = self.roster.role_of(ctx.sender) {
            // Usually a second device joining a room the user already
            // occupies. Report the standing membership.
            let reply = self.reply_frame(ctx, Payload::Ack(Ack::joined(role)))?;
            return Ok(vec![RoomAction::Reply(reply)]);
        }

        if self.definition.is_direct() {
            return Err(RoomError::Unauthorized(
                "direct rooms admit only their two peers".to_string(),
            ));
        }

        self.moderation.check_join(ctx.sender, env.now())?;

        if self.definition.private && !self.definition.allows(ctx.sender) {
            return Err(RoomError::Unauthorized("room is invite only".to_string()));
        }

        if self.roster.len() >= self.definition.capacity as usize {
            return Err(RoomError::Capacity { capacity: self.definition.capacity });
        }

        let role = self.join_role(ctx.sender);
        let joined_at_ms = env.wall_clock_ms();
        self.roster.insert(Member {
            user_id: ctx.sender,
            username: ctx.username.clone(),
            role,
            joined_at_ms,
        });

        tracing::debug!(room_id = %self.definition.id, user_id = ctx.sender, ?role, "member joined");

        let reply = self.reply_frame(ctx, Payload::Ack(Ack::joined(role)))?;
        let joined = Payload::MemberJoined(MemberJoined {
            user_id: ctx.sender,
            username: ctx.username.clone(),
            role,
            joined_at_ms,
        });
        Ok(vec![
            RoomAction::Reply(reply),
            RoomAction::Broadcast {
                frame: self.event_frame(ctx.sender, joined)?,
                scope: FanoutScope::SkipRequester,
            },
            RoomAction::MembershipChanged { user_id: ctx.sender, joined: true },
        ])
    }

    /// Role granted to a fresh member.
    ///
    /// The first occupant of a room administers it, as does the recorded
    /// creator whenever they join.
    fn join_role(&self, user_id: UserId) -> Role {
        if self.roster.is_empty() || user_id == self.definition.creator {
            Role::Admin
        } else {
            Role::Member
        }
    }

    fn handle_leave<E>(&mut self, ctx: &CommandContext, env: &E) -> Result<Vec<RoomAction>, RoomError>
    where
        E: Environment<Instant = I>,
    {
        if self.definition.is_direct() {
            return Err(RoomError::Malformed("cannot leave a direct room".to_string()));
        }

        let mut actions = vec![RoomAction::Reply(self.reply_frame(ctx, Payload::Ack(Ack::empty()))?)];
        // Leaving twice is a no-op: nothing to drop, nothing to announce.
        if self.roster.contains(ctx.sender) {
            self.drop_membership(ctx.sender, env, &mut actions)?;
        }
        Ok(actions)
    }

    /// Membership drop driven by the user's last session disconnecting.
    ///
    /// Idempotent and silent: there is no session left to reply to. Direct
    /// rosters are permanent, so only the typing indicator is cleared there.
    fn handle_implicit_leave<E>(&mut self, user_id: UserId, env: &E) -> Result<Vec<RoomAction>, RoomError>
    where
        E: Environment<Instant = I>,
    {
        let mut actions = Vec::new();

        if self.definition.is_direct() {
            if let Some(event) = self.typing.clear_user(user_id, env.now()) {
                actions.push(RoomAction::Broadcast {
                    frame: self.event_frame(user_id, Payload::TypingEvent(event))?,
                    scope: FanoutScope::SkipUser(user_id),
                });
            }
            return Ok(actions);
        }

        if !self.roster.contains(user_id) {
            return Ok(actions);
        }

        tracing::debug!(room_id = %self.definition.id, user_id, "implicit leave");
        self.drop_membership(user_id, env, &mut actions)?;
        Ok(actions)
    }

    /// Removes `user_id` from the roster and emits the departure events.
    ///
    /// Shared by explicit leave, implicit leave, kick, and ban; the caller
    /// has already verified membership. A live typing indicator is cleared
    /// first so no client is left rendering a ghost typist.
    fn drop_membership<E>(
        &mut self,
        user_id: UserId,
        env: &E,
        actions: &mut Vec<RoomAction>,
    ) -> Result<(), RoomError>
    where
        E: Environment<Instant = I>,
    {
        self.roster.remove(user_id);

        if let Some(event) = self.typing.clear_user(user_id, env.now()) {
            actions.push(RoomAction::Broadcast {
                frame: self.event_frame(user_id, Payload::TypingEvent(event))?,
                scope: FanoutScope::SkipUser(user_id),
            });
        }

        actions.push(RoomAction::Broadcast {
            frame: self.event_frame(user_id, Payload::MemberLeft(MemberLeft { user_id }))?,
            scope: FanoutScope::All,
        });
        actions.push(RoomAction::MembershipChanged { user_id, joined: false });
        Ok(())
    }

    fn handle_invite<S>(
        &mut self,
        ctx: &CommandContext,
        user_id: UserId,
        storage: &S,
    ) -> Result<Vec<RoomAction>, RoomError>
    where
        S: Storage,
    {
        let role = self.ensure_member(ctx.sender)?;
        if role < Role::Admin {
            return Err(RoomError::Unauthorized("invites require the admin role".to_string()));
        }
        if !self.definition.private {
            return Err(RoomError::Malformed("only private rooms keep an allow list".to_string()));
        }

        if self.definition.allow_list.insert(user_id) {
            // The allow list must survive a restart; roll the insert back
            // if the definition cannot be stored so memory never runs
            // ahead of disk.
            if let Err(err) = storage.update_room(&self.definition) {
                self.definition.allow_list.remove(&user_id);
                return Err(RoomError::Persistence(err.to_string()));
            }
            tracing::debug!(room_id = %self.definition.id, user_id, invited_by = ctx.sender, "user invited");
        }

        Ok(vec![RoomAction::Reply(self.reply_frame(ctx, Payload::Ack(Ack::empty()))?)])
    }

    fn handle_send<E, S>(
        &mut self,
        ctx: &CommandContext,
        content: String,
        kind: MessageKind,
        reply_to: Option<u64>,
        env: &E,
        storage: &S,
    ) -> Result<Vec<RoomAction>, RoomError>
    where
        E: Environment<Instant = I>,
        S: Storage,
    {
        self.ensure_member(ctx.sender)?;
        self.moderation.check_send(ctx.sender, env.now())?;
        validate_content(&content, kind)?;

        let sequence = self.sequencer.assign(self.definition.id)?;
        let id = env.random_u64();
        let mentions = match kind {
            MessageKind::Text => resolve_mentions(&content, &self.roster.usernames(), ctx.sender),
            MessageKind::File | MessageKind::Image => Vec::new(),
        };
        let record = MessageRecord {
            id,
            sender_id: ctx.sender,
            sequence,
            kind,
            content,
            reply_to,
            mentions: mentions.clone(),
            created_at_ms: env.wall_clock_ms(),
        };

        if let Err(err) = storage.append_message(self.definition.id, &record) {
            // Storage is the sequence authority. Resynchronize so the next
            // accepted message lands directly after the last stored one.
            if let Ok(latest) = storage.latest_sequence(self.definition.id) {
                self.sequencer = Sequencer::resume_after(latest);
            }
            tracing::warn!(room_id = %self.definition.id, sequence, error = %err, "message persist failed");
            return Err(RoomError::Persistence(err.to_string()));
        }

        let mut actions =
            vec![RoomAction::Reply(self.reply_frame(ctx, Payload::Ack(Ack::message(id, sequence)))?)];

        let mut event = self.event_frame(ctx.sender, Payload::RoomMessageEvent(record.clone()))?;
        event.header.set_sequence(sequence);
        actions.push(RoomAction::Broadcast { frame: event, scope: FanoutScope::SkipRequester });

        for mentioned in &mentions {
            let note = NotificationEvent {
                id: env.random_u64(),
                kind: NotificationKind::Mention,
                actor: ctx.sender,
                message_id: Some(id),
                preview: Some(preview_of(&record.content)),
                created_at_ms: record.created_at_ms,
            };
            actions.push(RoomAction::SendToUser {
                user_id: *mentioned,
                frame: self.event_frame(ctx.sender, Payload::NotificationEvent(note))?,
            });
        }

        if let Some(parent_id) = reply_to {
            // The reference is stored regardless; only the author courtesy
            // notification needs the parent to still be readable.
            match storage.load_message(self.definition.id, parent_id) {
                Ok(Some(parent)) => {
                    let author = parent.record.sender_id;
                    if !parent.deleted && author != ctx.sender && !mentions.contains(&author) {
                        let note = NotificationEvent {
                            id: env.random_u64(),
                            kind: NotificationKind::Reply,
                            actor: ctx.sender,
                            message_id: Some(id),
                            preview: Some(preview_of(&record.content)),
                            created_at_ms: record.created_at_ms,
                        };
                        actions.push(RoomAction::SendToUser {
                            user_id: author,
                            frame: self.event_frame(ctx.sender, Payload::NotificationEvent(note))?,
                        });
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(room_id = %self.definition.id, parent_id, error = %err, "reply target lookup failed");
                }
            }
        }

        Ok(actions)
    }

    fn handle_history<S>(
        &self,
        ctx: &CommandContext,
        before_sequence: Option<u64>,
        limit: u32,
        storage: &S,
    ) -> Result<Vec<RoomAction>, RoomError>
    where
        S: Storage,
    {
        self.ensure_member(ctx.sender)?;

        let limit =
            if limit == 0 { HISTORY_PAGE_LIMIT } else { (limit as usize).min(HISTORY_PAGE_LIMIT) };
        let messages = storage
            .load_history(self.definition.id, before_sequence, limit)
            .map_err(|err| RoomError::Persistence(err.to_string()))?;

        let reply = self.reply_frame(ctx, Payload::HistoryResponse(HistoryResponse { messages }))?;
        Ok(vec![RoomAction::Reply(reply)])
    }

    fn handle_typing<E>(
        &mut self,
        ctx: &CommandContext,
        active: bool,
        env: &E,
    ) -> Result<Vec<RoomAction>, RoomError>
    where
        E: Environment<Instant = I>,
    {
        self.ensure_member(ctx.sender)?;

        let mut actions = vec![RoomAction::Reply(self.reply_frame(ctx, Payload::Ack(Ack::empty()))?)];
        if let Some(event) = self.typing.set(ctx.sender, active, env.now()) {
            actions.push(RoomAction::Broadcast {
                frame: self.event_frame(ctx.sender, Payload::TypingEvent(event))?,
                scope: FanoutScope::SkipUser(ctx.sender),
            });
        }
        Ok(actions)
    }

    fn handle_toggle_reaction<E, S>(
        &mut self,
        ctx: &CommandContext,
        message_id: u64,
        emoji: &str,
        env: &E,
        storage: &S,
    ) -> Result<Vec<RoomAction>, RoomError>
    where
        E: Environment<Instant = I>,
        S: Storage,
    {
        self.ensure_member(ctx.sender)?;

        if emoji.is_empty() {
            return Err(RoomError::Malformed("emoji is empty".to_string()));
        }
        if emoji.len() > MAX_EMOJI_BYTES {
            return Err(RoomError::Malformed(format!("emoji exceeds {MAX_EMOJI_BYTES} bytes")));
        }

        let stored = storage
            .load_message(self.definition.id, message_id)
            .map_err(|err| RoomError::Persistence(err.to_string()))?
            .filter(|stored| !stored.deleted)
            .ok_or(RoomError::UnknownMessage(message_id))?;

        let event = self.reactions.toggle(message_id, ctx.sender, emoji);
        let added = event.added;
        let emoji_text = event.emoji.clone();

        let mut actions = vec![RoomAction::Reply(self.reply_frame(ctx, Payload::Ack(Ack::empty()))?)];
        actions.push(RoomAction::Broadcast {
            frame: self.event_frame(ctx.sender, Payload::ReactionEvent(event))?,
            scope: FanoutScope::All,
        });

        // Removing a reaction is not notification-worthy.
        let author = stored.record.sender_id;
        if added && author != ctx.sender {
            let note = NotificationEvent {
                id: env.random_u64(),
                kind: NotificationKind::Reaction,
                actor: ctx.sender,
                message_id: Some(message_id),
                preview: Some(emoji_text),
                created_at_ms: env.wall_clock_ms(),
            };
            actions.push(RoomAction::SendToUser {
                user_id: author,
                frame: self.event_frame(ctx.sender, Payload::NotificationEvent(note))?,
            });
        }

        Ok(actions)
    }

    fn handle_mark_read<E, S>(
        &mut self,
        ctx: &CommandContext,
        message_id: u64,
        env: &E,
        storage: &S,
    ) -> Result<Vec<RoomAction>, RoomError>
    where
        E: Environment<Instant = I>,
        S: Storage,
    {
        self.ensure_member(ctx.sender)?;

        let stored = storage
            .load_message(self.definition.id, message_id)
            .map_err(|err| RoomError::Persistence(err.to_string()))?
            .filter(|stored| !stored.deleted)
            .ok_or(RoomError::UnknownMessage(message_id))?;

        let mut actions = vec![RoomAction::Reply(self.reply_frame(ctx, Payload::Ack(Ack::empty()))?)];
        if let Some(event) = self.receipts.mark(message_id, ctx.sender, env.wall_clock_ms()) {
            // Receipts surface to the message author only, never room-wide.
            actions.push(RoomAction::SendToUser {
                user_id: stored.record.sender_id,
                frame: self.event_frame(ctx.sender, Payload::ReceiptEvent(event))?,
            });
        }
        Ok(actions)
    }

    fn handle_read_list<S>(
        &self,
        ctx: &CommandContext,
        message_id: u64,
        storage: &S,
    ) -> Result<Vec<RoomAction>, RoomError>
    where
        S: Storage,
    {
        self.ensure_member(ctx.sender)?;

        let stored = storage
            .load_message(self.definition.id, message_id)
            .map_err(|err| RoomError::Persistence(err.to_string()))?
            .filter(|stored| !stored.deleted)
            .ok_or(RoomError::UnknownMessage(message_id))?;
        if stored.record.sender_id != ctx.sender {
            return Err(RoomError::Unauthorized(
                "read lists are visible to the message author only".to_string(),
            ));
        }

        let readers = self.receipts.readers(message_id).to_vec();
        let reply = self
            .reply_frame(ctx, Payload::ReadListResponse(ReadListResponse { message_id, readers }))?;
        Ok(vec![RoomAction::Reply(reply)])
    }

    fn handle_change_role(
        &mut self,
        ctx: &CommandContext,
        user_id: UserId,
        role: Role,
    ) -> Result<Vec<RoomAction>, RoomError> {
        let actor_role = self.ensure_member(ctx.sender)?;
        if self.definition.is_direct() {
            return Err(RoomError::Malformed("direct rooms have no roles to change".to_string()));
        }
        if actor_role < Role::Admin {
            return Err(RoomError::Unauthorized("role changes require the admin role".to_string()));
        }
        if self.roster.set_role(user_id, role).is_none() {
            return Err(RoomError::NotAMember { user_id });
        }

        tracing::debug!(room_id = %self.definition.id, user_id, ?role, changed_by = ctx.sender, "role changed");

        Ok(vec![
            RoomAction::Reply(self.reply_frame(ctx, Payload::Ack(Ack::empty()))?),
            RoomAction::Broadcast {
                frame: self.event_frame(ctx.sender, Payload::RoleEvent(RoleEvent { user_id, role }))?,
                scope: FanoutScope::All,
            },
        ])
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_moderate<E, S>(
        &mut self,
        ctx: &CommandContext,
        kind: ModerationKind,
        target_user: Option<UserId>,
        target_message: Option<u64>,
        reason: String,
        duration_ms: Option<u64>,
        env: &E,
        storage: &S,
    ) -> Result<Vec<RoomAction>, RoomError>
    where
        E: Environment<Instant = I>,
        S: Storage,
    {
        let actor_role = self.ensure_member(ctx.sender)?;
        let duration = duration_ms.map(Duration::from_millis);
        if actor_role < required_role(kind, duration) {
            return Err(RoomError::Unauthorized(format!("{kind:?} requires a higher role")));
        }

        match kind {
            ModerationKind::DeleteMessage => {
                let message_id = target_message.ok_or_else(|| {
                    RoomError::Malformed("message deletion requires a target message".to_string())
                })?;
                self.apply_delete(ctx, message_id, reason, env, storage)
            }
            ModerationKind::Warn
            | ModerationKind::Mute
            | ModerationKind::Kick
            | ModerationKind::Ban
            | ModerationKind::Lift => {
                let target = target_user.ok_or_else(|| {
                    RoomError::Malformed("this moderation kind requires a target user".to_string())
                })?;
                self.apply_user_action(ctx, actor_role, kind, target, reason, duration, env)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_user_action<E>(
        &mut self,
        ctx: &CommandContext,
        actor_role: Role,
        kind: ModerationKind,
        target: UserId,
        reason: String,
        duration: Option<Duration>,
        env: &E,
    ) -> Result<Vec<RoomAction>, RoomError>
    where
        E: Environment<Instant = I>,
    {
        if target == ctx.sender {
            return Err(RoomError::Malformed("cannot moderate yourself".to_string()));
        }

        if let Some(target_role) = self.roster.role_of(target) {
            if target_role >= actor_role {
                return Err(RoomError::Unauthorized("cannot moderate a peer".to_string()));
            }
        } else if matches!(kind, ModerationKind::Warn | ModerationKind::Mute | ModerationKind::Kick)
        {
            // Bans may be pre-emptive and lifts may outlive the membership;
            // the other kinds only mean something for current members.
            return Err(RoomError::NotAMember { user_id: target });
        }

        let now = env.now();
        match kind {
            ModerationKind::Mute => {
                self.moderation.impose(target, RestrictionKind::Mute, ctx.sender, &reason, duration, now);
            }
            ModerationKind::Ban => {
                self.moderation.impose(target, RestrictionKind::Ban, ctx.sender, &reason, duration, now);
            }
            ModerationKind::Lift => {
                // Lifting with nothing active is still a success.
                self.moderation.lift(target);
            }
            ModerationKind::Warn | ModerationKind::Kick | ModerationKind::DeleteMessage => {}
        }

        let issued_at_ms = env.wall_clock_ms();
        self.moderation.record(AuditEntry {
            kind,
            actor: ctx.sender,
            target_user: Some(target),
            target_message: None,
            reason: reason.clone(),
            issued_at_ms,
            duration_ms: duration.map(|d| d.as_millis() as u64),
        });

        tracing::info!(
            room_id = %self.definition.id,
            ?kind,
            actor = ctx.sender,
            target,
            "moderation action applied"
        );

        let event = ModerationEvent {
            kind,
            actor: ctx.sender,
            target_user: Some(target),
            target_message: None,
            reason: reason.clone(),
            duration_ms: duration.map(|d| d.as_millis() as u64),
        };

        let mut actions = vec![RoomAction::Reply(self.reply_frame(ctx, Payload::Ack(Ack::empty()))?)];

        // Kicks and bans are room-visible; warns, mutes, and lifts reach
        // the target alone.
        if matches!(kind, ModerationKind::Kick | ModerationKind::Ban) {
            actions.push(RoomAction::Broadcast {
                frame: self.event_frame(ctx.sender, Payload::ModerationEvent(event))?,
                scope: FanoutScope::All,
            });
            if self.roster.contains(target) {
                self.drop_membership(target, env, &mut actions)?;
            }
        } else {
            actions.push(RoomAction::SendToUser {
                user_id: target,
                frame: self.event_frame(ctx.sender, Payload::ModerationEvent(event))?,
            });
        }

        let note = NotificationEvent {
            id: env.random_u64(),
            kind: NotificationKind::Moderation,
            actor: ctx.sender,
            message_id: None,
            preview: if reason.is_empty() { None } else { Some(reason) },
            created_at_ms: issued_at_ms,
        };
        actions.push(RoomAction::SendToUser {
            user_id: target,
            frame: self.event_frame(ctx.sender, Payload::NotificationEvent(note))?,
        });

        Ok(actions)
    }

    /// Tombstones a message. Idempotent: deleting an already-deleted
    /// message is acknowledged and audited but fans out nothing new.
    fn apply_delete<E, S>(
        &mut self,
        ctx: &CommandContext,
        message_id: u64,
        reason: String,
        env: &E,
        storage: &S,
    ) -> Result<Vec<RoomAction>, RoomError>
    where
        E: Environment<Instant = I>,
        S: Storage,
    {
        let stored = storage
            .load_message(self.definition.id, message_id)
            .map_err(|err| RoomError::Persistence(err.to_string()))?
            .ok_or(RoomError::UnknownMessage(message_id))?;

        let newly_deleted = !stored.deleted
            && storage
                .tombstone_message(self.definition.id, message_id)
                .map_err(|err| RoomError::Persistence(err.to_string()))?;

        let issued_at_ms = env.wall_clock_ms();
        self.moderation.record(AuditEntry {
            kind: ModerationKind::DeleteMessage,
            actor: ctx.sender,
            target_user: None,
            target_message: Some(message_id),
            reason: reason.clone(),
            issued_at_ms,
            duration_ms: None,
        });

        let mut actions = vec![RoomAction::Reply(self.reply_frame(ctx, Payload::Ack(Ack::empty()))?)];

        if newly_deleted {
            // Reaction and receipt state for a tombstoned message is dead
            // weight from here on.
            self.reactions.remove_message(message_id);
            self.receipts.remove_message(message_id);

            tracing::info!(room_id = %self.definition.id, message_id, actor = ctx.sender, "message deleted");

            let event = ModerationEvent {
                kind: ModerationKind::DeleteMessage,
                actor: ctx.sender,
                target_user: None,
                target_message: Some(message_id),
                reason: reason.clone(),
                duration_ms: None,
            };
            actions.push(RoomAction::Broadcast {
                frame: self.event_frame(ctx.sender, Payload::ModerationEvent(event))?,
                scope: FanoutScope::All,
            });
        }

        let author = stored.record.sender_id;
        if author != ctx.sender {
            let note = NotificationEvent {
                id: env.random_u64(),
                kind: NotificationKind::Moderation,
                actor: ctx.sender,
                message_id: Some(message_id),
                preview: if reason.is_empty() { None } else { Some(reason) },
                created_at_ms: issued_at_ms,
            };
            actions.push(RoomAction::SendToUser {
                user_id: author,
                frame: self.event_frame(ctx.sender, Payload::NotificationEvent(note))?,
            });
        }

        Ok(actions)
    }

    fn handle_moderation_log(
        &self,
        ctx: &CommandContext,
        limit: Option<u32>,
    ) -> Result<Vec<RoomAction>, RoomError> {
        let role = self.ensure_member(ctx.sender)?;
        if role < Role::Moderator {
            return Err(RoomError::Unauthorized(
                "the audit log requires the moderator role".to_string(),
            ));
        }

        let limit = limit.map_or(AUDIT_LOG_DEFAULT_LIMIT, |n| n as usize);
        let entries = self.moderation.recent_audit(limit);
        let reply =
            self.reply_frame(ctx, Payload::ModerationLogResponse(ModerationLogResponse { entries }))?;
        Ok(vec![RoomAction::Reply(reply)])
    }

    fn ensure_member(&self, user_id: UserId) -> Result<Role, RoomError> {
        self.roster.role_of(user_id).ok_or(RoomError::NotAMember { user_id })
    }

    /// Frame addressed back to the requesting session.
    fn reply_frame(&self, ctx: &CommandContext, payload: Payload) -> Result<Frame, RoomError> {
        let mut header = FrameHeader::new(payload.opcode());
        header.set_room_id(self.definition.id);
        header.set_request_id(ctx.request_id);
        payload.into_frame(header).map_err(|err| RoomError::Internal(err.to_string()))
    }

    /// Server-originated event frame attributed to `sender_id`.
    fn event_frame(&self, sender_id: UserId, payload: Payload) -> Result<Frame, RoomError> {
        let mut header = FrameHeader::new(payload.opcode());
        header.set_room_id(self.definition.id);
        header.set_sender_id(sender_id);
        payload.into_frame(header).map_err(|err| RoomError::Internal(err.to_string()))
    }
}

/// Rejects empty bodies and oversized text. Attachment kinds carry a URL
/// produced out-of-band; only presence is checked.
fn validate_content(content: &str, kind: MessageKind) -> Result<(), RoomError> {
    match kind {
        MessageKind::Text => {
            if content.trim().is_empty() {
                return Err(RoomError::Malformed("message content is empty".to_string()));
            }
            if content.len() > MAX_MESSAGE_CONTENT_BYTES {
                return Err(RoomError::Malformed(format!(
                    "message content exceeds {MAX_MESSAGE_CONTENT_BYTES} bytes"
                )));
            }
        }
        MessageKind::File | MessageKind::Image => {
            if content.is_empty() {
                return Err(RoomError::Malformed("attachment URL is empty".to_string()));
            }
        }
    }
    Ok(())
}

/// Truncates `content` to the preview budget on a char boundary.
fn preview_of(content: &str) -> String {
    if content.len() <= NOTIFICATION_PREVIEW_BYTES {
        return content.to_string();
    }
    let mut cut = NOTIFICATION_PREVIEW_BYTES;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    content[..cut].to_string()
}
