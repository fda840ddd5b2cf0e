//! ScreenCast handshake
//!
//! `CreateSession -> SelectSources -> Start`, each step correlated by a fresh
//! request token, followed by `OpenPipeWireRemote` once per recording.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::OwnedFd;

use anyhow::{Context, Result, bail};

use super::token::{Request, Session};
use super::{
    Broker, BrokerCall, CreateSessionOptions, PORTAL_RESPONSE_CANCELLED, PORTAL_RESPONSE_OTHER,
    PortalReply, RequestToken, ResponseListener, SelectSourcesOptions, SessionHandle,
    SessionToken, SourceTypes, StartOptions, StreamDescriptor, TokenGenerator,
};

/// Handshake step awaiting a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreateSession,
    SelectSources,
    Start,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::CreateSession => "CreateSession",
            Step::SelectSources => "SelectSources",
            Step::Start => "Start",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    NegotiatingSession,
    SelectingSources,
    Starting,
    Done,
    Failed,
}

impl NegotiationState {
    fn awaiting(self) -> Option<Step> {
        match self {
            NegotiationState::NegotiatingSession => Some(Step::CreateSession),
            NegotiationState::SelectingSources => Some(Step::SelectSources),
            NegotiationState::Starting => Some(Step::Start),
            _ => None,
        }
    }
}

/// Result of a completed handshake
#[derive(Debug)]
pub enum StreamsOutcome {
    Streams(Vec<StreamDescriptor>),
    /// The portal answered a step with a non-zero response code
    NoStreams { step: Step, response: u32 },
}

/// A call together with the token its reply will be correlated by
#[derive(Debug)]
struct PendingCall {
    token: RequestToken,
    call: BrokerCall,
}

enum Transition {
    Call(PendingCall),
    Done(Vec<StreamDescriptor>),
    Failed { step: Step, response: u32 },
}

/// Drives the ScreenCast handshake against a [`Broker`]
pub struct Negotiator<B: Broker> {
    broker: B,
    requests: TokenGenerator<Request>,
    sessions: TokenGenerator<Session>,
    /// Live listeners, at most one per token, removed once they fire
    pending: HashMap<RequestToken, B::Listener>,
    state: NegotiationState,
    session: Option<SessionHandle>,
}

impl<B: Broker> Negotiator<B> {
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            requests: TokenGenerator::new(),
            sessions: TokenGenerator::new(),
            pending: HashMap::new(),
            state: NegotiationState::Idle,
            session: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    #[cfg(test)]
    /// Number of listeners still registered
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Run the handshake up to `Start`
    ///
    /// A non-zero response code at any step ends the handshake with
    /// [`StreamsOutcome::NoStreams`]; bus faults are returned as errors.
    pub async fn get_streams(&mut self) -> Result<StreamsOutcome> {
        if self.state != NegotiationState::Idle {
            bail!("ScreenCast handshake already ran ({:?})", self.state);
        }

        let mut next = self.begin();
        loop {
            let reply = match self.request(next).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.state = NegotiationState::Failed;
                    return Err(e);
                }
            };

            match self.advance(reply)? {
                Transition::Call(call) => next = call,
                Transition::Done(streams) => return Ok(StreamsOutcome::Streams(streams)),
                Transition::Failed { step, response } => {
                    return Ok(StreamsOutcome::NoStreams { step, response });
                }
            }
        }
    }

    /// Exchange the negotiated session for a PipeWire remote fd
    pub async fn open_pipewire_remote(&self) -> Result<OwnedFd> {
        let session = self
            .session
            .as_ref()
            .context("No ScreenCast session has been created")?;
        self.broker.open_pipewire_remote(session).await
    }

    fn begin(&mut self) -> PendingCall {
        let session_token: SessionToken = self.sessions.mint();
        let token = self.requests.mint();
        self.state = NegotiationState::NegotiatingSession;
        PendingCall {
            token,
            call: BrokerCall::CreateSession(CreateSessionOptions {
                handle_token: token.to_string(),
                session_handle_token: session_token.to_string(),
            }),
        }
    }

    /// Register the listener for `pending.token`, then issue the call and wait
    async fn request(&mut self, pending: PendingCall) -> Result<PortalReply> {
        let PendingCall { token, call } = pending;
        let path = token.object_path(self.broker.sender())?;

        let listener = self.broker.listen(&path).await?;
        if self.pending.insert(token, listener).is_some() {
            bail!("Request token {} is already in flight", token);
        }

        if let Err(e) = self.broker.call(&call).await {
            self.pending.remove(&token);
            return Err(e);
        }

        let reply = match self.pending.get_mut(&token) {
            Some(listener) => listener.next_response().await,
            None => bail!("Listener for request {} vanished", token),
        };
        self.pending.remove(&token);
        reply
    }

    fn advance(&mut self, mut reply: PortalReply) -> Result<Transition> {
        let Some(step) = self.state.awaiting() else {
            bail!("No handshake step is waiting for a reply ({:?})", self.state);
        };

        if !reply.is_success() {
            let reason = match reply.response {
                PORTAL_RESPONSE_CANCELLED => " (cancelled by user)",
                PORTAL_RESPONSE_OTHER => " (other error)",
                _ => "",
            };
            log::warn!("{} failed: response {}{}", step, reply.response, reason);
            self.state = NegotiationState::Failed;
            return Ok(Transition::Failed {
                step,
                response: reply.response,
            });
        }

        match step {
            Step::CreateSession => {
                let session = match reply.results.session_handle() {
                    Some(handle) => SessionHandle::parse(handle.to_string()),
                    None => Err(anyhow::anyhow!("CreateSession reply has no session_handle")),
                };
                let session = match session {
                    Ok(session) => session,
                    Err(e) => {
                        self.state = NegotiationState::Failed;
                        return Err(e);
                    }
                };
                log::info!("Session {} created", session);
                self.session = Some(session.clone());
                self.state = NegotiationState::SelectingSources;

                let token = self.requests.mint();
                Ok(Transition::Call(PendingCall {
                    token,
                    call: BrokerCall::SelectSources {
                        session,
                        options: SelectSourcesOptions {
                            handle_token: token.to_string(),
                            multiple: false,
                            types: (SourceTypes::MONITOR | SourceTypes::WINDOW).bits(),
                        },
                    },
                }))
            }
            Step::SelectSources => {
                log::info!("Sources selected");
                let session = self
                    .session
                    .clone()
                    .context("Session lost before Start")?;
                self.state = NegotiationState::Starting;

                let token = self.requests.mint();
                Ok(Transition::Call(PendingCall {
                    token,
                    call: BrokerCall::Start {
                        session,
                        parent_window: String::new(),
                        options: StartOptions {
                            handle_token: token.to_string(),
                        },
                    },
                }))
            }
            Step::Start => {
                let streams = reply.results.take_streams();
                log::info!("Portal returned {} stream(s)", streams.len());
                self.state = NegotiationState::Done;
                Ok(Transition::Done(streams))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::testing::{BrokerEvent as Event, FakeBroker};
    use crate::portal::ResponseResults;

    fn happy_path() -> Vec<PortalReply> {
        vec![
            PortalReply::success(ResponseResults::with_session_handle("/s/1")),
            PortalReply::success(ResponseResults::default()),
            PortalReply::success(ResponseResults::with_streams(vec![StreamDescriptor::new(
                42,
            )])),
        ]
    }

    #[tokio::test]
    async fn test_full_handshake_yields_streams() {
        let broker = FakeBroker::with_replies(happy_path());
        let mut negotiator = Negotiator::new(broker.clone());

        let outcome = negotiator.get_streams().await.unwrap();
        match outcome {
            StreamsOutcome::Streams(streams) => {
                assert_eq!(streams.len(), 1);
                assert_eq!(streams[0].node_id, 42);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(broker.methods(), vec!["CreateSession", "SelectSources", "Start"]);
        assert_eq!(negotiator.state(), NegotiationState::Done);
        assert_eq!(negotiator.session().unwrap().to_string(), "/s/1");
        assert_eq!(negotiator.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_listener_registered_before_each_call() {
        let broker = FakeBroker::with_replies(happy_path());
        let mut negotiator = Negotiator::new(broker.clone());
        negotiator.get_streams().await.unwrap();

        let prefix = "/org/freedesktop/portal/desktop/request/1_42";
        assert_eq!(
            broker.events(),
            vec![
                Event::Listen(format!("{}/u1", prefix)),
                Event::Call("CreateSession", "u1".to_string()),
                Event::Listen(format!("{}/u2", prefix)),
                Event::Call("SelectSources", "u2".to_string()),
                Event::Listen(format!("{}/u3", prefix)),
                Event::Call("Start", "u3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_call_arguments() {
        let broker = FakeBroker::with_replies(happy_path());
        let mut negotiator = Negotiator::new(broker.clone());
        negotiator.get_streams().await.unwrap();

        let calls = broker.calls();
        match &calls[0] {
            BrokerCall::CreateSession(options) => {
                assert_eq!(options.session_handle_token, "u1");
            }
            other => panic!("unexpected call: {:?}", other),
        }
        match &calls[1] {
            BrokerCall::SelectSources { session, options } => {
                assert_eq!(session.to_string(), "/s/1");
                assert!(!options.multiple);
                assert_eq!(options.types, 3);
            }
            other => panic!("unexpected call: {:?}", other),
        }
        match &calls[2] {
            BrokerCall::Start {
                session,
                parent_window,
                ..
            } => {
                assert_eq!(session.to_string(), "/s/1");
                assert_eq!(parent_window, "");
            }
            other => panic!("unexpected call: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_select_sources_failure_stops_before_start() {
        let broker = FakeBroker::with_replies(vec![
            PortalReply::success(ResponseResults::with_session_handle("/s/1")),
            PortalReply::failure(PORTAL_RESPONSE_CANCELLED),
        ]);
        let mut negotiator = Negotiator::new(broker.clone());

        let outcome = negotiator.get_streams().await.unwrap();
        assert!(matches!(
            outcome,
            StreamsOutcome::NoStreams {
                step: Step::SelectSources,
                response: 1
            }
        ));
        assert_eq!(broker.methods(), vec!["CreateSession", "SelectSources"]);
        assert_eq!(negotiator.state(), NegotiationState::Failed);
        assert_eq!(negotiator.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_any_failing_step_is_terminal() {
        for failing in 0..3 {
            let mut replies = happy_path();
            replies[failing] = PortalReply::failure(PORTAL_RESPONSE_OTHER);
            let broker = FakeBroker::with_replies(replies);
            let mut negotiator = Negotiator::new(broker.clone());

            let outcome = negotiator.get_streams().await.unwrap();
            assert!(matches!(
                outcome,
                StreamsOutcome::NoStreams { response: 2, .. }
            ));
            assert_eq!(broker.methods().len(), failing + 1);
        }
    }

    #[tokio::test]
    async fn test_transport_error_clears_registry() {
        let broker = FakeBroker::default();
        broker.script.lock().unwrap().fail_calls = true;
        let mut negotiator = Negotiator::new(broker);

        assert!(negotiator.get_streams().await.is_err());
        assert_eq!(negotiator.pending_requests(), 0);
        assert_eq!(negotiator.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_missing_session_handle_is_an_error() {
        let broker = FakeBroker::with_replies(vec![PortalReply::success(
            ResponseResults::default(),
        )]);
        let mut negotiator = Negotiator::new(broker);
        assert!(negotiator.get_streams().await.is_err());
        assert!(negotiator.session().is_none());
    }

    #[tokio::test]
    async fn test_handshake_runs_once() {
        let broker = FakeBroker::with_replies(happy_path());
        let mut negotiator = Negotiator::new(broker);
        negotiator.get_streams().await.unwrap();
        assert!(negotiator.get_streams().await.is_err());
    }

    #[tokio::test]
    async fn test_open_remote_needs_session() {
        let broker = FakeBroker::with_replies(happy_path());
        let mut negotiator = Negotiator::new(broker.clone());
        assert!(negotiator.open_pipewire_remote().await.is_err());

        negotiator.get_streams().await.unwrap();
        assert!(negotiator.open_pipewire_remote().await.is_ok());
        assert_eq!(
            broker.events().last(),
            Some(&Event::OpenRemote("/s/1".to_string()))
        );
    }

    #[test]
    fn test_stray_reply_is_rejected() {
        let mut negotiator = Negotiator::new(FakeBroker::default());
        assert!(
            negotiator
                .advance(PortalReply::success(ResponseResults::default()))
                .is_err()
        );
    }
}
