//! Call lifecycle state machine.
//!
//! `CallSession` performs no I/O. Every input returns the list of effects the
//! owner must carry out in order, so each transition is applied atomically.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::AudioFormat;
use crate::crypto::{ChaChaCipher, CipherSuite, IdentityKey, KeyAgreement, KeyExchangePayload, Role};
use crate::error::SessionError;
use crate::pipeline::MediaParams;
use crate::signaling::{MediaDescription, MessageBody, SignalingEvent, SignalingMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    KeyExchange,
    Active,
    Closing,
    Closed,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Closed | CallState::Failed)
    }

    /// Still negotiating: no media yet and no teardown requested
    pub fn is_setup(self) -> bool {
        matches!(self, CallState::Idle | CallState::Connecting | CallState::KeyExchange)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Terminal result of a call, reported exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Completed { reason: String },
    Failed(SessionError),
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Completed { .. })
    }
}

/// Work the session owner must perform, in order
#[derive(Debug)]
pub enum Effect {
    Send(SignalingMessage),
    StartMedia(MediaParams),
    StopMedia,
    ArmTeardownTimer,
    Terminated(CallOutcome),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name this endpoint puts in `sender`
    pub local_id: String,
    /// Peer to address messages to; learned from the offer when answering
    pub peer_id: Option<String>,
    pub codec: String,
    pub format: AudioFormat,
    pub pre_shared_secret: Option<String>,
    /// Accepted peer identities; empty accepts any verified identity
    pub trusted_peers: Vec<VerifyingKey>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_id: "parley".to_string(),
            peer_id: None,
            codec: "pcm".to_string(),
            format: AudioFormat::default(),
            pre_shared_secret: None,
            trusted_peers: Vec::new(),
        }
    }
}

/// An Offer waiting for the local side to accept or decline it
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub session_id: Uuid,
    /// `sender` of the Offer; set by the rendezvous server when relayed
    pub caller: String,
    pub media: MediaDescription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallDecision {
    Accept,
    Decline { reason: String },
}

/// Decides whether an incoming call is answered
pub trait IncomingCallPolicy: Send + Sync {
    fn decide(&self, call: &IncomingCall) -> CallDecision;
}

/// Answers every caller
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl IncomingCallPolicy for AcceptAll {
    fn decide(&self, _call: &IncomingCall) -> CallDecision {
        CallDecision::Accept
    }
}

/// Answers only callers whose identifier is listed
#[derive(Debug, Clone, Default)]
pub struct AllowedCallers {
    callers: Vec<String>,
}

impl AllowedCallers {
    pub fn new(callers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { callers: callers.into_iter().map(Into::into).collect() }
    }
}

impl IncomingCallPolicy for AllowedCallers {
    fn decide(&self, call: &IncomingCall) -> CallDecision {
        if self.callers.iter().any(|c| *c == call.caller) {
            CallDecision::Accept
        } else {
            CallDecision::Decline { reason: format!("{} is not an allowed caller", call.caller) }
        }
    }
}

pub struct CallSession {
    config: SessionConfig,
    identity: IdentityKey,
    suite: Arc<dyn CipherSuite>,
    policy: Arc<dyn IncomingCallPolicy>,
    state: CallState,
    session_id: Uuid,
    role: Option<Role>,
    peer_id: Option<String>,
    local_media: Option<SocketAddr>,
    remote_media: Option<SocketAddr>,
    agreement: Option<KeyAgreement>,
    peer_fingerprint: Option<String>,
    media_running: bool,
    closing_reason: Option<String>,
    outcome: Option<CallOutcome>,
}

impl CallSession {
    pub fn new(config: SessionConfig, identity: IdentityKey) -> Self {
        let peer_id = config.peer_id.clone();
        Self {
            config,
            identity,
            suite: Arc::new(ChaChaCipher),
            policy: Arc::new(AcceptAll),
            state: CallState::Idle,
            session_id: Uuid::nil(),
            role: None,
            peer_id,
            local_media: None,
            remote_media: None,
            agreement: None,
            peer_fingerprint: None,
            media_running: false,
            closing_reason: None,
            outcome: None,
        }
    }

    pub fn with_cipher_suite(mut self, suite: Arc<dyn CipherSuite>) -> Self {
        self.suite = suite;
        self
    }

    pub fn with_incoming_policy(mut self, policy: Arc<dyn IncomingCallPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn outcome(&self) -> Option<&CallOutcome> {
        self.outcome.as_ref()
    }

    pub fn peer_fingerprint(&self) -> Option<&str> {
        self.peer_fingerprint.as_deref()
    }

    pub fn remote_media(&self) -> Option<SocketAddr> {
        self.remote_media
    }

    /// Record the data endpoint bound for this call
    pub fn set_local_media(&mut self, addr: SocketAddr) {
        self.local_media = Some(addr);
    }

    /// Start an outgoing call
    pub fn dial(&mut self) -> Vec<Effect> {
        if self.state != CallState::Idle {
            warn!("dial ignored in state {}", self.state);
            return Vec::new();
        }
        let Some(media) = self.local_media_description() else {
            return self.fail(SessionError::Resource("no local media endpoint".into()), false);
        };

        self.session_id = Uuid::new_v4();
        self.role = Some(Role::Initiator);
        self.transition(CallState::Connecting);
        vec![Effect::Send(self.message(MessageBody::Offer { media }))]
    }

    pub fn handle_event(&mut self, event: SignalingEvent) -> Vec<Effect> {
        match event {
            SignalingEvent::Message(message) => self.handle_message(message),
            SignalingEvent::Invalid(reason) => {
                if self.state.is_terminal() {
                    return Vec::new();
                }
                self.fail(SessionError::Protocol(reason), true)
            }
            SignalingEvent::Closed => self.channel_closed(),
        }
    }

    pub fn handle_message(&mut self, message: SignalingMessage) -> Vec<Effect> {
        if self.state.is_terminal() {
            debug!("Ignoring {} after call ended", message.body.kind());
            return Vec::new();
        }
        if let MessageBody::Hello { .. } = message.body {
            return Vec::new();
        }

        let opens_session = self.state == CallState::Idle && matches!(message.body, MessageBody::Offer { .. });
        if !opens_session && message.session_id != self.session_id {
            warn!("Ignoring {} for unknown session {}", message.body.kind(), message.session_id);
            return Vec::new();
        }

        debug!("Signaling <- {} in {}", message.body.kind(), self.state);
        let SignalingMessage { session_id, sender, body, .. } = message;

        match (self.state, body) {
            (CallState::Idle, MessageBody::Offer { media }) => {
                let call = IncomingCall { session_id, caller: sender, media };
                match self.policy.decide(&call) {
                    CallDecision::Accept => {
                        self.session_id = session_id;
                        self.role = Some(Role::Responder);
                        self.peer_id = Some(call.caller);
                        self.transition(CallState::Connecting);
                        self.accept_offer(call.media)
                    }
                    CallDecision::Decline { reason } => self.decline(&call, reason),
                }
            }
            (CallState::Connecting, MessageBody::Reject { reason }) if self.role == Some(Role::Initiator) => {
                info!("Peer declined the call: {}", reason);
                self.finish(CallState::Failed, CallOutcome::Failed(SessionError::Declined(reason)))
            }
            (CallState::Connecting, MessageBody::Answer { media }) if self.role == Some(Role::Initiator) => {
                if let Err(e) = self.check_media(&media) {
                    return self.fail(e, true);
                }
                self.remote_media = Some(media.media_addr);
                self.enter_key_exchange(Vec::new())
            }
            (CallState::KeyExchange, MessageBody::KeyExchange { payload }) => self.complete_key_exchange(&payload),
            (CallState::Connecting | CallState::KeyExchange, MessageBody::Bye { reason, ack: false }) => {
                info!("Peer ended call during setup: {}", reason);
                let mut effects = vec![Effect::Send(self.message(MessageBody::Bye {
                    reason: reason.clone(),
                    ack: true,
                }))];
                effects.extend(self.finish(CallState::Closed, CallOutcome::Completed { reason }));
                effects
            }
            (CallState::Active, MessageBody::Bye { reason, ack: false }) => {
                info!("Peer hung up: {}", reason);
                self.transition(CallState::Closing);
                let mut effects = vec![
                    Effect::StopMedia,
                    Effect::Send(self.message(MessageBody::Bye { reason: reason.clone(), ack: true })),
                ];
                self.media_running = false;
                effects.extend(self.finish(CallState::Closed, CallOutcome::Completed { reason }));
                effects
            }
            (CallState::Closing, MessageBody::Bye { ack, .. }) => {
                let mut effects = Vec::new();
                if !ack {
                    let reason = self.closing_reason.clone().unwrap_or_default();
                    effects.push(Effect::Send(self.message(MessageBody::Bye { reason, ack: true })));
                }
                let reason = self.closing_reason.clone().unwrap_or_else(|| "hangup".to_string());
                effects.extend(self.finish(CallState::Closed, CallOutcome::Completed { reason }));
                effects
            }
            (_, MessageBody::Error { reason }) => {
                warn!("Peer reported error: {}", reason);
                self.fail(SessionError::Remote(reason), false)
            }
            (CallState::Closing, body) => {
                debug!("Ignoring {} while closing", body.kind());
                Vec::new()
            }
            (state, body) => {
                self.fail(SessionError::Protocol(format!("unexpected {} in {}", body.kind(), state)), true)
            }
        }
    }

    /// Local user ends the call
    pub fn hangup(&mut self, reason: impl Into<String>) -> Vec<Effect> {
        let reason = reason.into();
        match self.state {
            CallState::Idle => self.finish(CallState::Closed, CallOutcome::Completed { reason }),
            CallState::Connecting | CallState::KeyExchange | CallState::Active => {
                info!("Hanging up: {}", reason);
                self.transition(CallState::Closing);
                let mut effects = Vec::new();
                if self.media_running {
                    self.media_running = false;
                    effects.push(Effect::StopMedia);
                }
                effects.push(Effect::Send(self.message(MessageBody::Bye { reason: reason.clone(), ack: false })));
                effects.push(Effect::ArmTeardownTimer);
                self.closing_reason = Some(reason);
                effects
            }
            CallState::Closing | CallState::Closed | CallState::Failed => Vec::new(),
        }
    }

    /// The peer never acknowledged our Bye
    pub fn teardown_timeout(&mut self) -> Vec<Effect> {
        if self.state != CallState::Closing {
            return Vec::new();
        }
        debug!("Bye not acknowledged, closing anyway");
        let reason = self.closing_reason.clone().unwrap_or_else(|| "hangup".to_string());
        self.finish(CallState::Closed, CallOutcome::Completed { reason })
    }

    /// Negotiation took too long
    pub fn setup_timeout(&mut self) -> Vec<Effect> {
        if !self.state.is_setup() {
            return Vec::new();
        }
        self.fail(SessionError::SetupTimeout, self.state != CallState::Idle)
    }

    pub fn channel_closed(&mut self) -> Vec<Effect> {
        match self.state {
            CallState::Closed | CallState::Failed => Vec::new(),
            CallState::Closing => {
                let reason = self.closing_reason.clone().unwrap_or_else(|| "hangup".to_string());
                self.finish(CallState::Closed, CallOutcome::Completed { reason })
            }
            _ => self.fail(SessionError::ChannelClosed, false),
        }
    }

    /// A device, socket or pipeline could not be acquired
    pub fn resource_failed(&mut self, error: SessionError) -> Vec<Effect> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        let notify = self.state != CallState::Idle;
        self.fail(error, notify)
    }

    /// Turn the caller away and keep waiting for another Offer
    fn decline(&self, call: &IncomingCall, reason: String) -> Vec<Effect> {
        info!("Declining call {} from {}: {}", call.session_id, call.caller, reason);
        let reject = SignalingMessage::new(call.session_id, self.config.local_id.clone(), MessageBody::Reject { reason })
            .to(Some(call.caller.clone()));
        vec![Effect::Send(reject)]
    }

    fn accept_offer(&mut self, media: MediaDescription) -> Vec<Effect> {
        if let Err(e) = self.check_media(&media) {
            return self.fail(e, true);
        }
        let Some(local) = self.local_media_description() else {
            return self.fail(SessionError::Resource("no local media endpoint".into()), true);
        };
        self.remote_media = Some(media.media_addr);
        let answer = Effect::Send(self.message(MessageBody::Answer { media: local }));
        self.enter_key_exchange(vec![answer])
    }

    fn enter_key_exchange(&mut self, mut effects: Vec<Effect>) -> Vec<Effect> {
        let role = self.role.unwrap_or(Role::Initiator);
        let agreement = KeyAgreement::new(self.identity.clone(), role, self.session_id)
            .with_pre_shared_secret(self.config.pre_shared_secret.clone())
            .with_trusted_peers(self.config.trusted_peers.clone());
        let payload = agreement.local_payload();
        self.agreement = Some(agreement);

        self.transition(CallState::KeyExchange);
        effects.push(Effect::Send(self.message(MessageBody::KeyExchange { payload })));
        effects
    }

    fn complete_key_exchange(&mut self, payload: &KeyExchangePayload) -> Vec<Effect> {
        let (Some(agreement), Some(remote_media)) = (self.agreement.as_mut(), self.remote_media) else {
            return self.fail(SessionError::Protocol("key exchange before negotiation".into()), true);
        };

        match agreement.complete(payload, self.suite.clone()) {
            Ok(crypto) => {
                self.agreement = None;
                self.peer_fingerprint = crypto.peer_fingerprint();
                if let Some(ref fp) = self.peer_fingerprint {
                    info!("Peer identity verified: {}", fp);
                }
                self.media_running = true;
                self.transition(CallState::Active);
                vec![Effect::StartMedia(MediaParams { remote_media, crypto })]
            }
            Err(e) => self.fail(SessionError::KeyExchange(e.to_string()), true),
        }
    }

    fn check_media(&self, remote: &MediaDescription) -> Result<(), SessionError> {
        let format = &self.config.format;
        if remote.codec != self.config.codec
            || remote.sample_rate != format.sample_rate
            || remote.channels != format.channels
            || remote.frame_duration_ms != format.frame_duration_ms
        {
            return Err(SessionError::Protocol(format!(
                "incompatible media: peer offers {} {} Hz/{} ch/{} ms, local is {} {} Hz/{} ch/{} ms",
                remote.codec, remote.sample_rate, remote.channels, remote.frame_duration_ms,
                self.config.codec, format.sample_rate, format.channels, format.frame_duration_ms,
            )));
        }
        Ok(())
    }

    fn local_media_description(&self) -> Option<MediaDescription> {
        let format = &self.config.format;
        self.local_media.map(|media_addr| MediaDescription {
            media_addr,
            codec: self.config.codec.clone(),
            sample_rate: format.sample_rate,
            channels: format.channels,
            frame_duration_ms: format.frame_duration_ms,
        })
    }

    fn message(&self, body: MessageBody) -> SignalingMessage {
        SignalingMessage::new(self.session_id, self.config.local_id.clone(), body).to(self.peer_id.clone())
    }

    fn transition(&mut self, next: CallState) {
        if self.state != next {
            info!("Call {}: {} -> {}", self.session_id, self.state, next);
            self.state = next;
        }
    }

    fn fail(&mut self, err: SessionError, notify_peer: bool) -> Vec<Effect> {
        error!("Call {} failed in {}: {}", self.session_id, self.state, err);
        let mut effects = Vec::new();
        if self.media_running {
            self.media_running = false;
            effects.push(Effect::StopMedia);
        }
        if notify_peer {
            effects.push(Effect::Send(self.message(MessageBody::Error { reason: err.to_string() })));
        }
        effects.extend(self.finish(CallState::Failed, CallOutcome::Failed(err)));
        effects
    }

    fn finish(&mut self, state: CallState, outcome: CallOutcome) -> Vec<Effect> {
        self.agreement = None;
        self.transition(state);
        self.outcome = Some(outcome.clone());

        let mut effects = Vec::new();
        if self.media_running {
            self.media_running = false;
            effects.push(Effect::StopMedia);
        }
        effects.push(Effect::Terminated(outcome));
        effects
    }
}
