//! Call session state machine.
//!
//! At most one [`CallSession`] exists at a time. It is owned by the
//! [`SessionController`] and only ever changed through its methods, all of
//! which run on the network context.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use futures_util::future::LocalBoxFuture;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::backend::Backend;
use crate::errors::PicallError;
use crate::interactive::UiHandle;
use crate::media::{MediaBackend, MediaSession, PeerEvent, RemoteTrack};
use crate::signaling::{
    Candidate, CallVersion, InboundSignal, REASON_INVITE_TIMEOUT, Signal, SignalKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Outbound invite sent, waiting for an answer.
    Inviting,
    /// Inbound invite, waiting for the local user.
    Ringing,
    Active,
    Rejected,
    TimedOut,
    Ending,
}

/// The one call in progress.
pub struct CallSession {
    call_id: String,
    room_id: String,
    state: CallState,
    /// Echoed on every message of this call.
    version: CallVersion,
    media: Option<MediaSession>,
}

impl CallSession {
    fn new(call_id: String, room_id: String, state: CallState, version: CallVersion) -> Self {
        Self {
            call_id,
            room_id,
            state,
            version,
            media: None,
        }
    }

    fn is_live(&self, call_id: &str) -> bool {
        self.call_id == call_id && self.state != CallState::Ending
    }
}

type SignalHandler = fn(&Rc<SessionController>, InboundSignal) -> LocalBoxFuture<'_, ()>;

/// One handler per signaling kind.
const SIGNAL_HANDLERS: [(SignalKind, SignalHandler); 4] = [
    (SignalKind::Invite, on_invite),
    (SignalKind::Answer, on_answer),
    (SignalKind::Hangup, on_hangup),
    (SignalKind::Candidates, on_candidates),
];

pub struct SessionController {
    backend: Rc<dyn Backend>,
    media: Rc<dyn MediaBackend>,
    ui: UiHandle,
    lifetime_ms: u64,
    session: RefCell<Option<CallSession>>,
    /// Bumped on every state change of the session.
    changes: watch::Sender<u64>,
    teardowns: Cell<u64>,
    last_ended: RefCell<Option<(String, CallState)>>,
}

impl SessionController {
    pub fn new(
        backend: Rc<dyn Backend>,
        media: Rc<dyn MediaBackend>,
        ui: UiHandle,
        lifetime_ms: u64,
    ) -> Self {
        Self {
            backend,
            media,
            ui,
            lifetime_ms,
            session: RefCell::new(None),
            changes: watch::channel(0).0,
            teardowns: Cell::new(0),
            last_ended: RefCell::new(None),
        }
    }

    /// Current state; `Idle` when there is no session.
    pub fn state(&self) -> CallState {
        self.session
            .borrow()
            .as_ref()
            .map_or(CallState::Idle, |s| s.state)
    }

    pub fn current_call_id(&self) -> Option<String> {
        self.session.borrow().as_ref().map(|s| s.call_id.clone())
    }

    /// Completed teardowns since start.
    pub fn teardown_count(&self) -> u64 {
        self.teardowns.get()
    }

    /// Id and final state of the most recently ended call.
    pub fn last_ended(&self) -> Option<(String, CallState)> {
        self.last_ended.borrow().clone()
    }

    /// Place a call in `room_id`. Returns the new call id.
    pub async fn start_call(self: &Rc<Self>, room_id: &str) -> Result<String, PicallError> {
        let call_id = {
            let mut slot = self.session.borrow_mut();
            if let Some(existing) = slot.as_ref() {
                tracing::info!(call_id = %existing.call_id, state = ?existing.state, "call already in progress");
                return Err(PicallError::CallInProgress);
            }
            let call_id = Uuid::new_v4().to_string();
            *slot = Some(CallSession::new(
                call_id.clone(),
                room_id.to_string(),
                CallState::Inviting,
                CallVersion::default(),
            ));
            call_id
        };
        tracing::info!(call_id = %call_id, room_id, "placing call");

        let _ = self.ui.show_call_overlay();

        let invite = Signal::invite(&call_id, self.lifetime_ms);
        if let Err(e) = self.send_signal(room_id, &invite).await {
            tracing::warn!(call_id = %call_id, "failed to send invite: {e}");
            self.notify("Call Error", format!("Could not send the call invite: {e}"));
        }

        if self.is_live(&call_id) {
            self.open_media(&call_id).await;
        }
        Ok(call_id)
    }

    /// Hang up the call in progress.
    pub async fn end_call(self: &Rc<Self>) -> Result<(), PicallError> {
        let (call_id, room_id, version) = {
            let slot = self.session.borrow();
            match slot.as_ref() {
                Some(s) if s.state != CallState::Ending => {
                    (s.call_id.clone(), s.room_id.clone(), s.version.clone())
                }
                _ => return Err(PicallError::NoActiveCall),
            }
        };
        tracing::info!(call_id = %call_id, "ending call");

        let hangup = Signal::hangup(&call_id, version);
        if let Err(e) = self.send_signal(&room_id, &hangup).await {
            tracing::warn!(call_id = %call_id, "failed to send hangup: {e}");
            self.notify("Call Error", format!("Could not send the hangup: {e}"));
        }

        self.teardown(&call_id).await;
        Ok(())
    }

    /// Route an inbound signaling message to its handler.
    pub async fn dispatch(self: &Rc<Self>, inbound: InboundSignal) {
        let kind = inbound.signal.kind();
        match SIGNAL_HANDLERS.iter().find(|(k, _)| *k == kind) {
            Some((_, handler)) => handler(self, inbound).await,
            None => tracing::debug!(kind = ?kind, "no handler for signal"),
        }
    }

    /// Release the session's media and return to `Idle`. Runs at most once
    /// per session; later calls for the same call id return `false`.
    pub async fn teardown(&self, call_id: &str) -> bool {
        let (media, outcome) = {
            let mut slot = self.session.borrow_mut();
            match slot.as_mut() {
                Some(s) if s.is_live(call_id) => {
                    let outcome = std::mem::replace(&mut s.state, CallState::Ending);
                    (s.media.take(), outcome)
                }
                _ => return false,
            }
        };
        tracing::info!(call_id, outcome = ?outcome, "tearing down call");
        self.bump();

        if let Some(media) = media {
            media.close().await;
        }
        if let Err(e) = self.ui.restore_chat_view().await {
            tracing::debug!(call_id, "could not restore chat view: {e}");
        }

        {
            let mut slot = self.session.borrow_mut();
            if slot.as_ref().is_some_and(|s| s.call_id == call_id) {
                *slot = None;
            }
        }
        self.teardowns.set(self.teardowns.get() + 1);
        *self.last_ended.borrow_mut() = Some((call_id.to_string(), outcome));
        self.bump();
        true
    }

    fn is_live(&self, call_id: &str) -> bool {
        self.session
            .borrow()
            .as_ref()
            .is_some_and(|s| s.is_live(call_id))
    }

    fn is_in_state(&self, call_id: &str, state: CallState) -> bool {
        self.session
            .borrow()
            .as_ref()
            .is_some_and(|s| s.call_id == call_id && s.state == state)
    }

    fn bump(&self) {
        self.changes.send_modify(|n| *n += 1);
    }

    /// Completes once the session for `call_id` is no longer in `state`.
    async fn left_state(&self, call_id: &str, state: CallState) {
        let mut changes = self.changes.subscribe();
        while self.is_in_state(call_id, state) {
            if changes.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Move a live session from `from` to `to`. False if it was not in `from`.
    fn transition(&self, call_id: &str, from: CallState, to: CallState) -> bool {
        {
            let mut slot = self.session.borrow_mut();
            match slot.as_mut() {
                Some(s) if s.call_id == call_id && s.state == from => {
                    s.state = to;
                    tracing::info!(call_id, from = ?from, to = ?to, "call state changed");
                }
                _ => return false,
            }
        }
        self.bump();
        true
    }

    fn notify(&self, title: &str, message: String) {
        let _ = self.ui.notice(title, message);
    }

    async fn send_signal(&self, room_id: &str, signal: &Signal) -> Result<String, PicallError> {
        let content = signal.to_content()?;
        self.backend
            .send(room_id, signal.event_type(), content)
            .await
    }

    async fn open_media(self: &Rc<Self>, call_id: &str) {
        let (mut media, events) = match MediaSession::open(self.media.as_ref(), &self.ui) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(call_id, "failed to open media: {e}");
                self.notify("Call Error", format!("Could not start media: {e}"));
                self.teardown(call_id).await;
                return;
            }
        };

        let pump = tokio::task::spawn_local(pump_peer_events(
            Rc::downgrade(self),
            call_id.to_string(),
            events,
        ));
        media.set_event_pump(pump);

        let orphaned = {
            let mut slot = self.session.borrow_mut();
            match slot.as_mut() {
                Some(s) if s.is_live(call_id) => {
                    s.media = Some(media);
                    None
                }
                _ => Some(media),
            }
        };
        if let Some(media) = orphaned {
            tracing::debug!(call_id, "call ended while media opened, closing it");
            media.close().await;
        }
    }

    async fn forward_local_candidate(&self, call_id: &str, candidate: Candidate) {
        if candidate.media_id().is_none() {
            tracing::debug!(call_id, "dropping local candidate without media id");
            return;
        }
        let target = {
            let slot = self.session.borrow();
            slot.as_ref()
                .filter(|s| s.is_live(call_id))
                .map(|s| (s.room_id.clone(), s.version.clone()))
        };
        let Some((room_id, version)) = target else {
            return;
        };

        let candidate = Candidate::new(
            &candidate.candidate,
            candidate.sdp_mid,
            candidate.sdp_mline_index,
        );
        let signal = Signal::candidate(call_id, version, candidate);
        if let Err(e) = self.send_signal(&room_id, &signal).await {
            tracing::warn!(call_id, "failed to send candidate: {e}");
            self.notify("Call Error", format!("Could not send a network candidate: {e}"));
        }
    }

    fn attach_remote_track(&self, call_id: &str, track: RemoteTrack) {
        let mut slot = self.session.borrow_mut();
        match slot.as_mut() {
            Some(s) if s.is_live(call_id) => match s.media.as_mut() {
                Some(media) => media.attach_remote(track),
                None => tracing::debug!(call_id, "remote track before media opened, ignoring"),
            },
            _ => tracing::debug!(call_id, "remote track for a finished call, ignoring"),
        }
    }

    /// Prompt the local user about an inbound invite and act on the answer.
    /// The prompt is withdrawn if the call stops ringing first.
    async fn resolve_invite(self: Rc<Self>, call_id: String, caller: String) {
        let mut prompt = self
            .ui
            .confirm("Video Call", format!("Accept call from {caller}?"));
        let answer = tokio::select! {
            answer = &mut prompt => answer,
            _ = self.left_state(&call_id, CallState::Ringing) => {
                prompt.cancel();
                tracing::info!(call_id = %call_id, "call stopped ringing, withdrawing prompt");
                return;
            }
        };

        let accepted = match answer {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(call_id = %call_id, "call prompt failed: {e}");
                false
            }
        };

        if !self.is_in_state(&call_id, CallState::Ringing) {
            tracing::info!(call_id = %call_id, "call changed while prompting, ignoring answer");
            return;
        }

        if accepted {
            self.accept(&call_id).await;
        } else {
            self.reject(&call_id).await;
        }
    }

    async fn accept(self: &Rc<Self>, call_id: &str) {
        let Some((room_id, version)) = self.route(call_id) else {
            return;
        };
        if let Err(e) = self.ui.show_call_overlay().await {
            tracing::debug!(call_id, "could not show call overlay: {e}");
        }

        let answer = Signal::answer(call_id, version);
        if let Err(e) = self.send_signal(&room_id, &answer).await {
            tracing::warn!(call_id, "failed to send answer: {e}");
            self.notify("Call Error", format!("Could not answer the call: {e}"));
        }

        if self.transition(call_id, CallState::Ringing, CallState::Active) {
            self.open_media(call_id).await;
        }
    }

    async fn reject(&self, call_id: &str) {
        let Some((room_id, version)) = self.route(call_id) else {
            return;
        };
        if !self.transition(call_id, CallState::Ringing, CallState::Rejected) {
            return;
        }

        let hangup = Signal::hangup(call_id, version);
        if let Err(e) = self.send_signal(&room_id, &hangup).await {
            tracing::warn!(call_id, "failed to send hangup: {e}");
            self.notify("Call Error", format!("Could not decline the call: {e}"));
        }
        self.teardown(call_id).await;
    }

    fn route(&self, call_id: &str) -> Option<(String, CallVersion)> {
        self.session
            .borrow()
            .as_ref()
            .filter(|s| s.is_live(call_id))
            .map(|s| (s.room_id.clone(), s.version.clone()))
    }
}

/// Forward a session's peer events until the channel closes or the
/// controller goes away.
async fn pump_peer_events(
    controller: Weak<SessionController>,
    call_id: String,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(ctl) = controller.upgrade() else {
            break;
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                ctl.forward_local_candidate(&call_id, candidate).await
            }
            PeerEvent::RemoteTrack(track) => ctl.attach_remote_track(&call_id, track),
        }
    }
    tracing::debug!(call_id = %call_id, "peer event pump ended");
}

fn on_invite(ctl: &Rc<SessionController>, inbound: InboundSignal) -> LocalBoxFuture<'_, ()> {
    Box::pin(async move {
        let Signal::Invite(invite) = inbound.signal else {
            return;
        };
        if inbound.sender == ctl.backend.user_id() {
            tracing::debug!(call_id = %invite.call_id, "ignoring own invite");
            return;
        }
        if invite.is_expired(inbound.age_ms) {
            tracing::info!(call_id = %invite.call_id, age_ms = ?inbound.age_ms, "ignoring expired invite");
            return;
        }

        {
            let mut slot = ctl.session.borrow_mut();
            if let Some(existing) = slot.as_ref() {
                tracing::info!(
                    call_id = %invite.call_id,
                    busy_with = %existing.call_id,
                    "ignoring invite while another call is in progress"
                );
                return;
            }
            *slot = Some(CallSession::new(
                invite.call_id.clone(),
                inbound.room_id.clone(),
                CallState::Ringing,
                invite.version.clone(),
            ));
        }
        tracing::info!(call_id = %invite.call_id, caller = %inbound.sender, "incoming call");

        tokio::task::spawn_local(ctl.clone().resolve_invite(invite.call_id, inbound.sender));
    })
}

fn on_answer(ctl: &Rc<SessionController>, inbound: InboundSignal) -> LocalBoxFuture<'_, ()> {
    Box::pin(async move {
        let Signal::Answer(answer) = inbound.signal else {
            return;
        };
        if inbound.sender == ctl.backend.user_id() {
            return;
        }
        if !ctl.transition(&answer.call_id, CallState::Inviting, CallState::Active) {
            tracing::debug!(call_id = %answer.call_id, "answer does not match a pending invite");
            return;
        }

        if answer.answer.sdp.is_empty() {
            return;
        }
        let peer = ctl
            .session
            .borrow()
            .as_ref()
            .and_then(|s| s.media.as_ref().map(MediaSession::peer));
        if let Some(peer) = peer {
            if let Err(e) = peer.apply_answer(&answer.answer.sdp).await {
                tracing::warn!(call_id = %answer.call_id, "failed to apply answer: {e}");
            }
        }
    })
}

fn on_hangup(ctl: &Rc<SessionController>, inbound: InboundSignal) -> LocalBoxFuture<'_, ()> {
    Box::pin(async move {
        let Signal::Hangup(hangup) = inbound.signal else {
            return;
        };
        let matched = {
            let mut slot = ctl.session.borrow_mut();
            match slot.as_mut() {
                Some(s) if s.is_live(&hangup.call_id) => {
                    if s.state == CallState::Inviting {
                        s.state = if hangup.reason.as_deref() == Some(REASON_INVITE_TIMEOUT) {
                            CallState::TimedOut
                        } else {
                            CallState::Rejected
                        };
                    }
                    true
                }
                _ => false,
            }
        };

        if matched {
            tracing::info!(call_id = %hangup.call_id, reason = ?hangup.reason, "remote hangup");
            ctl.teardown(&hangup.call_id).await;
        } else {
            tracing::debug!(call_id = %hangup.call_id, "hangup for unknown call");
        }
    })
}

fn on_candidates(ctl: &Rc<SessionController>, inbound: InboundSignal) -> LocalBoxFuture<'_, ()> {
    Box::pin(async move {
        let Signal::Candidates(batch) = inbound.signal else {
            return;
        };
        if inbound.sender == ctl.backend.user_id() {
            return;
        }
        let peer = {
            let slot = ctl.session.borrow();
            slot.as_ref()
                .filter(|s| s.is_live(&batch.call_id))
                .and_then(|s| s.media.as_ref().map(MediaSession::peer))
        };
        let Some(peer) = peer else {
            tracing::debug!(call_id = %batch.call_id, "candidates for no open media, dropping");
            return;
        };

        for candidate in &batch.candidates {
            if let Err(e) = peer.add_remote_candidate(candidate).await {
                tracing::warn!(call_id = %batch.call_id, "failed to add remote candidate: {e}");
            }
        }
    })
}
