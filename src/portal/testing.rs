//! Scripted broker used by the negotiator and recorder tests

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use zbus::zvariant::OwnedObjectPath;

use super::{Broker, BrokerCall, PortalReply, ResponseListener, SessionHandle};

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Listen(String),
    Call(&'static str, String),
    OpenRemote(String),
}

#[derive(Default)]
pub struct Script {
    pub replies: VecDeque<PortalReply>,
    pub events: Vec<BrokerEvent>,
    pub calls: Vec<BrokerCall>,
    pub fail_calls: bool,
}

/// Answers each request with the next scripted reply, or never once the script runs out
#[derive(Clone, Default)]
pub struct FakeBroker {
    pub script: Arc<Mutex<Script>>,
}

impl FakeBroker {
    pub fn with_replies(replies: Vec<PortalReply>) -> Self {
        let broker = Self::default();
        broker.script.lock().unwrap().replies = replies.into();
        broker
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.script.lock().unwrap().events.clone()
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.calls().iter().map(|c| c.method()).collect()
    }
}

pub struct FakeListener {
    reply: Option<PortalReply>,
}

impl ResponseListener for FakeListener {
    async fn next_response(&mut self) -> Result<PortalReply> {
        match self.reply.take() {
            Some(reply) => Ok(reply),
            None => futures::future::pending().await,
        }
    }
}

impl Broker for FakeBroker {
    type Listener = FakeListener;

    fn sender(&self) -> &str {
        "1_42"
    }

    async fn listen(&self, request_path: &OwnedObjectPath) -> Result<FakeListener> {
        let mut script = self.script.lock().unwrap();
        script
            .events
            .push(BrokerEvent::Listen(request_path.as_str().to_string()));
        Ok(FakeListener {
            reply: script.replies.pop_front(),
        })
    }

    async fn call(&self, call: &BrokerCall) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        if script.fail_calls {
            bail!("bus went away");
        }
        script.events.push(BrokerEvent::Call(
            call.method(),
            call.handle_token().to_string(),
        ));
        script.calls.push(call.clone());
        Ok(())
    }

    async fn open_pipewire_remote(&self, session: &SessionHandle) -> Result<OwnedFd> {
        self.script
            .lock()
            .unwrap()
            .events
            .push(BrokerEvent::OpenRemote(session.to_string()));
        Ok(std::fs::File::open("/dev/null")?.into())
    }
}

/// Successful CreateSession, SelectSources and Start replies offering `node_ids`
pub fn handshake_replies(node_ids: &[u32]) -> Vec<PortalReply> {
    use super::{ResponseResults, StreamDescriptor};

    vec![
        PortalReply::success(ResponseResults::with_session_handle("/s/1")),
        PortalReply::success(ResponseResults::default()),
        PortalReply::success(ResponseResults::with_streams(
            node_ids.iter().map(|id| StreamDescriptor::new(*id)).collect(),
        )),
    ]
}
