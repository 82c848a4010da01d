use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::error::SessionError;
use crate::pipeline::MediaEngine;
use crate::session::{CallOutcome, CallSession, CallState, Effect};
use crate::signaling::SignalingChannel;

/// Timing and addressing for one call controller
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// Local address the media socket binds to
    pub media_ip: IpAddr,
    /// Give up if the call is not Active this long after leaving Idle
    pub setup_timeout: Duration,
    /// Wait this long for a Bye acknowledgement
    pub teardown_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            media_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            setup_timeout: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCommand {
    Hangup(String),
}

/// What an observer can see of a running call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatus {
    pub state: CallState,
    pub peer_fingerprint: Option<String>,
}

/// Owner-side handle of a spawned call
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    status: watch::Receiver<CallStatus>,
    task: JoinHandle<CallOutcome>,
}

impl CallHandle {
    pub fn hangup(&self, reason: impl Into<String>) {
        if self.commands.send(CallCommand::Hangup(reason.into())).is_err() {
            debug!("Hangup ignored, call already finished");
        }
    }

    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.status.borrow().state
    }

    /// Wait until the call reaches `state` or ends; returns the state reached
    pub async fn wait_for(&mut self, state: CallState) -> CallState {
        let reached = self.status
            .wait_for(|s| s.state == state || s.state.is_terminal())
            .await
            .map(|s| s.state);
        reached.unwrap_or_else(|_| self.status.borrow().state)
    }

    /// Wait for the terminal outcome
    pub async fn join(self) -> CallOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => CallOutcome::Failed(SessionError::Resource(format!("call task: {}", e))),
        }
    }
}

enum Start {
    Dial,
    Answer,
}

/// Drives one `CallSession`, serializing signaling, commands and timers
pub struct CallController {
    session: CallSession,
    channel: SignalingChannel,
    media: Box<dyn MediaEngine>,
    settings: ControllerSettings,
    teardown_deadline: Option<Instant>,
}

impl CallController {
    pub fn new(
        session: CallSession,
        channel: SignalingChannel,
        media: Box<dyn MediaEngine>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            session,
            channel,
            media,
            settings,
            teardown_deadline: None,
        }
    }

    /// Place an outgoing call
    pub fn spawn_dial(self) -> CallHandle {
        self.spawn(Start::Dial)
    }

    /// Wait for an incoming offer on the channel
    pub fn spawn_answer(self) -> CallHandle {
        self.spawn(Start::Answer)
    }

    fn spawn(self, start: Start) -> CallHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CallStatus {
            state: CallState::Idle,
            peer_fingerprint: None,
        });
        let task = tokio::spawn(self.run(start, commands_rx, status_tx));
        CallHandle { commands: commands_tx, status: status_rx, task }
    }

    async fn run(
        mut self,
        start: Start,
        mut commands: mpsc::UnboundedReceiver<CallCommand>,
        status: watch::Sender<CallStatus>,
    ) -> CallOutcome {
        let initial = match self.media.bind(self.settings.media_ip).await {
            Ok(mut local) => {
                // A wildcard bind is advertised on the interface that reaches the peer
                if local.ip().is_unspecified() {
                    if let Some(signaling) = self.channel.local_addr() {
                        local.set_ip(signaling.ip());
                    }
                }
                self.session.set_local_media(local);
                match start {
                    Start::Dial => self.session.dial(),
                    Start::Answer => Vec::new(),
                }
            }
            Err(e) => self.session.resource_failed(e),
        };

        let mut outcome = self.apply(initial).await;
        self.publish(&status);

        // Setup is timed from the first step out of Idle; an answering side waits in Idle without limit
        let mut setup_started: Option<Instant> = None;

        while outcome.is_none() {
            let state = self.session.state();
            if state != CallState::Idle {
                setup_started.get_or_insert_with(Instant::now);
            }
            let setup_deadline = setup_started
                .filter(|_| state.is_setup())
                .map(|started| started + self.settings.setup_timeout);
            let teardown_deadline = self.teardown_deadline;
            let far = Instant::now() + self.settings.setup_timeout;

            let effects = tokio::select! {
                event = self.channel.recv() => self.session.handle_event(event),
                Some(command) = commands.recv() => match command {
                    CallCommand::Hangup(reason) => self.session.hangup(reason),
                },
                _ = sleep_until(setup_deadline.unwrap_or(far)), if setup_deadline.is_some() => {
                    self.session.setup_timeout()
                }
                _ = sleep_until(teardown_deadline.unwrap_or(far)), if teardown_deadline.is_some() => {
                    self.session.teardown_timeout()
                }
            };

            outcome = self.apply(effects).await;
            self.publish(&status);
        }

        let outcome = outcome.unwrap_or_else(|| CallOutcome::Completed { reason: "ended".into() });
        if let Some(stats) = self.media.stats() {
            info!("Call media: sent={} received={} played={} concealed={} auth_failures={}",
                  stats.transport.datagrams_sent, stats.transport.accepted,
                  stats.frames_played, stats.frames_concealed, stats.transport.auth_failures);
            if let Some(jitter) = stats.jitter {
                info!("Jitter buffer: target={:?} jitter={:?} lost={} late={} loss_rate={:.2}%",
                      jitter.target_delay, jitter.jitter, jitter.packets_lost,
                      jitter.late_packets, jitter.loss_rate() * 100.0);
            }
        }
        info!("Call {} ended: {:?}", self.session.session_id(), outcome);
        outcome
    }

    /// Carry out effects in order; returns the outcome once the session terminates
    async fn apply(&mut self, effects: Vec<Effect>) -> Option<CallOutcome> {
        let mut queue: VecDeque<Effect> = effects.into();
        let mut outcome = None;

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Send(message) => {
                    if let Err(e) = self.channel.send(message) {
                        warn!("Signaling channel unusable: {}", e);
                        queue.extend(self.session.channel_closed());
                    }
                }
                Effect::StartMedia(params) => {
                    if let Err(e) = self.media.start(params).await {
                        warn!("Media start failed: {}", e);
                        queue.extend(self.session.resource_failed(e));
                    }
                }
                Effect::StopMedia => self.media.stop().await,
                Effect::ArmTeardownTimer => {
                    self.teardown_deadline = Some(Instant::now() + self.settings.teardown_timeout);
                }
                Effect::Terminated(result) => {
                    self.media.stop().await;
                    self.channel.close();
                    self.teardown_deadline = None;
                    outcome = Some(result);
                }
            }
        }
        outcome
    }

    fn publish(&self, status: &watch::Sender<CallStatus>) {
        let next = CallStatus {
            state: self.session.state(),
            peer_fingerprint: self.session.peer_fingerprint().map(str::to_string),
        };
        status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
