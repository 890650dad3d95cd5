//! Call lifecycle for a room's single call slot.
//!
//! ```text
//! IDLE ──initiate──▶ INITIATED ─(callee reached)─▶ RINGING
//!                        │                            │
//!                        ├──────────accept────────────┴──▶ CONNECTED
//!                        │
//!                        └─▶ REJECTED | TIMED_OUT | ENDED | FAILED  (slot back to IDLE)
//! ```
//!
//! The slot remembers the last resolved call so late operations on it are
//! told `CallAlreadyResolved` rather than `UnknownCall`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::{
    error::{ChatError, ChatResult},
    identity::{Identity, Role, RoomKey},
};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Initiated,
    Ringing,
    Connected,
    Rejected,
    TimedOut,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Rejected | CallState::TimedOut | CallState::Ended | CallState::Failed
        )
    }

    fn is_unanswered(self) -> bool {
        matches!(self, CallState::Initiated | CallState::Ringing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    PeerDisconnected,
}

/// Snapshot of a call as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallInfo {
    pub call_id: Uuid,
    pub room_id: RoomKey,
    pub caller_email: String,
    pub caller_type: Role,
    pub callee_email: String,
    pub kind: CallKind,
    pub state: CallState,
    #[serde(with = "time::serde::rfc3339")]
    pub initiated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
}

impl CallInfo {
    pub fn new(room_id: RoomKey, caller: &Identity, callee_email: String, kind: CallKind) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            room_id,
            caller_email: caller.email.clone(),
            caller_type: caller.role,
            callee_email,
            kind,
            state: CallState::Initiated,
            initiated_at: OffsetDateTime::now_utc(),
            ended_at: None,
        }
    }

    pub fn involves(&self, email: &str) -> bool {
        self.caller_email == email || self.callee_email == email
    }
}

struct ActiveCall {
    info: CallInfo,
    timer: Option<AbortHandle>,
}

/// The room's call slot. Empty means IDLE.
#[derive(Default)]
pub struct CallSlot {
    active: Option<ActiveCall>,
    last_resolved: Option<(Uuid, CallState)>,
}

impl CallSlot {
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn current(&self) -> Option<&CallInfo> {
        self.active.as_ref().map(|call| &call.info)
    }

    pub fn last_resolved(&self) -> Option<(Uuid, CallState)> {
        self.last_resolved
    }

    pub fn ensure_idle(&self) -> ChatResult<()> {
        match self.active {
            Some(_) => Err(ChatError::CallAlreadyActive),
            None => Ok(()),
        }
    }

    /// Occupies the slot with a freshly initiated call.
    pub fn begin(&mut self, info: CallInfo, timer: Option<AbortHandle>) -> ChatResult<&CallInfo> {
        if self.active.is_some() {
            if let Some(timer) = timer {
                timer.abort();
            }
            return Err(ChatError::CallAlreadyActive);
        }
        let call = self.active.insert(ActiveCall { info, timer });
        Ok(&call.info)
    }

    /// Marks an unanswered call as having reached the callee.
    pub fn ringing(&mut self, call_id: Uuid) -> Option<&CallInfo> {
        let call = self.active.as_mut().filter(|c| c.info.call_id == call_id)?;
        if call.info.state == CallState::Initiated {
            call.info.state = CallState::Ringing;
        }
        Some(&call.info)
    }

    pub fn accept(&mut self, call_id: Uuid, by: &Identity) -> ChatResult<CallInfo> {
        let call = self.lookup(call_id)?;
        if !call.info.state.is_unanswered() {
            return Err(ChatError::CallAlreadyResolved(call_id));
        }
        if call.info.callee_email != by.email {
            return Err(ChatError::validation("only the callee can accept a call"));
        }
        if let Some(timer) = call.timer.take() {
            timer.abort();
        }
        call.info.state = CallState::Connected;
        Ok(call.info.clone())
    }

    pub fn reject(&mut self, call_id: Uuid, by: &Identity) -> ChatResult<CallInfo> {
        let call = self.lookup(call_id)?;
        if !call.info.state.is_unanswered() {
            return Err(ChatError::CallAlreadyResolved(call_id));
        }
        if call.info.callee_email != by.email {
            return Err(ChatError::validation("only the callee can reject a call"));
        }
        Ok(self.resolve(CallState::Rejected))
    }

    /// Hang-up by either participant, answered or not.
    pub fn end(&mut self, call_id: Uuid, by: &Identity) -> ChatResult<CallInfo> {
        self.participant_resolves(call_id, by, CallState::Ended)
    }

    pub fn fail(&mut self, call_id: Uuid, by: &Identity) -> ChatResult<CallInfo> {
        self.participant_resolves(call_id, by, CallState::Failed)
    }

    /// Timer callback. Only acts if `call_id` is still the current call and it
    /// is still unanswered; a stale timer is a no-op.
    pub fn expire(&mut self, call_id: Uuid) -> Option<CallInfo> {
        let call = self.active.as_mut()?;
        if call.info.call_id != call_id || !call.info.state.is_unanswered() {
            return None;
        }
        // The caller is the timer task itself; it must not abort itself.
        call.timer = None;
        Some(self.resolve(CallState::TimedOut))
    }

    /// Ends the current call if `email` is one of its participants.
    pub fn force_end(&mut self, email: &str) -> Option<CallInfo> {
        let call = self.active.as_ref()?;
        if !call.info.involves(email) {
            return None;
        }
        Some(self.resolve(CallState::Ended))
    }

    fn participant_resolves(
        &mut self,
        call_id: Uuid,
        by: &Identity,
        state: CallState,
    ) -> ChatResult<CallInfo> {
        let call = self.lookup(call_id)?;
        if !call.info.involves(&by.email) {
            return Err(ChatError::validation("only a call participant can do that"));
        }
        Ok(self.resolve(state))
    }

    fn lookup(&mut self, call_id: Uuid) -> ChatResult<&mut ActiveCall> {
        match self.active.as_mut() {
            Some(call) if call.info.call_id == call_id => Ok(call),
            _ => match self.last_resolved {
                Some((resolved, _)) if resolved == call_id => {
                    Err(ChatError::CallAlreadyResolved(call_id))
                }
                _ => Err(ChatError::UnknownCall(call_id)),
            },
        }
    }

    fn resolve(&mut self, state: CallState) -> CallInfo {
        debug_assert!(state.is_terminal());
        let Some(ActiveCall { mut info, timer }) = self.active.take() else {
            unreachable!("resolve is only called with an active call");
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        info.state = state;
        info.ended_at = Some(OffsetDateTime::now_utc());
        self.last_resolved = Some((info.call_id, state));
        info
    }
}
