//! Transport seam between the negotiator and the desktop portal

use std::collections::HashMap;
use std::os::fd::OwnedFd;

use anyhow::{Context, Result};
use futures::StreamExt;
use zbus::zvariant::{self, OwnedObjectPath};

use super::token::sender_path_segment;
use super::{
    BrokerCall, DESKTOP_NAME, DESKTOP_PATH, PortalReply, REQUEST_IFACE, ResponseResults,
    SCREENCAST_IFACE, SessionHandle,
};

/// Session broker the handshake talks to
///
/// Implemented over D-Bus by [`PortalBroker`]; tests drive the negotiator with
/// a scripted implementation instead.
#[allow(async_fn_in_trait)]
pub trait Broker {
    type Listener: ResponseListener;

    /// Caller's unique bus name in the form used inside portal object paths
    fn sender(&self) -> &str;

    /// Subscribe to the `Response` signal of the request object at `request_path`
    ///
    /// The subscription must be live when this returns.
    async fn listen(&self, request_path: &OwnedObjectPath) -> Result<Self::Listener>;

    /// Issue a request-correlated ScreenCast method call
    async fn call(&self, call: &BrokerCall) -> Result<()>;

    /// Exchange the session for a PipeWire remote file descriptor
    async fn open_pipewire_remote(&self, session: &SessionHandle) -> Result<OwnedFd>;
}

/// One-shot subscription to a request's reply
#[allow(async_fn_in_trait)]
pub trait ResponseListener {
    async fn next_response(&mut self) -> Result<PortalReply>;
}

/// [`Broker`] backed by `org.freedesktop.portal.Desktop` on the session bus
pub struct PortalBroker {
    connection: zbus::Connection,
    screencast: zbus::Proxy<'static>,
    sender: String,
}

impl PortalBroker {
    /// Connect to the session bus and bind the ScreenCast interface
    pub async fn connect() -> Result<Self> {
        let connection = zbus::Connection::session()
            .await
            .context("Failed to connect to the session bus")?;
        Self::new(connection).await
    }

    pub async fn new(connection: zbus::Connection) -> Result<Self> {
        let sender = connection
            .unique_name()
            .map(|name| sender_path_segment(name.as_str()))
            .context("Session bus connection has no unique name")?;

        let screencast = zbus::Proxy::new(&connection, DESKTOP_NAME, DESKTOP_PATH, SCREENCAST_IFACE)
            .await
            .context("Failed to create ScreenCast portal proxy")?;

        log::debug!("Connected to portal as {}", sender);

        Ok(Self {
            connection,
            screencast,
            sender,
        })
    }
}

impl Broker for PortalBroker {
    type Listener = PortalListener;

    fn sender(&self) -> &str {
        &self.sender
    }

    async fn listen(&self, request_path: &OwnedObjectPath) -> Result<PortalListener> {
        let request = zbus::Proxy::new(
            &self.connection,
            DESKTOP_NAME,
            request_path.as_str().to_owned(),
            REQUEST_IFACE,
        )
        .await
        .with_context(|| format!("Failed to create Request proxy for {}", request_path.as_str()))?;

        let signals = request
            .receive_signal("Response")
            .await
            .with_context(|| format!("Failed to subscribe to {}", request_path.as_str()))?;

        Ok(PortalListener { signals })
    }

    async fn call(&self, call: &BrokerCall) -> Result<()> {
        let reply = match call {
            BrokerCall::CreateSession(options) => {
                self.screencast.call_method("CreateSession", &(options,)).await
            }
            BrokerCall::SelectSources { session, options } => {
                self.screencast
                    .call_method("SelectSources", &(session.path(), options))
                    .await
            }
            BrokerCall::Start {
                session,
                parent_window,
                options,
            } => {
                self.screencast
                    .call_method("Start", &(session.path(), parent_window.as_str(), options))
                    .await
            }
        }
        .with_context(|| format!("{} call failed", call.method()))?;

        let handle: OwnedObjectPath = reply
            .body()
            .deserialize()
            .with_context(|| format!("{} returned no request handle", call.method()))?;
        log::debug!("{} pending on {}", call.method(), handle.as_str());

        Ok(())
    }

    async fn open_pipewire_remote(&self, session: &SessionHandle) -> Result<OwnedFd> {
        let options: HashMap<&str, zvariant::Value<'_>> = HashMap::new();
        let reply = self
            .screencast
            .call_method("OpenPipeWireRemote", &(session.path(), options))
            .await
            .context("OpenPipeWireRemote call failed")?;

        let fd: zvariant::OwnedFd = reply
            .body()
            .deserialize()
            .context("OpenPipeWireRemote returned no file descriptor")?;

        Ok(fd.into())
    }
}

/// Match rule on one request's `Response` signal, removed when dropped
pub struct PortalListener {
    signals: zbus::proxy::SignalStream<'static>,
}

impl ResponseListener for PortalListener {
    async fn next_response(&mut self) -> Result<PortalReply> {
        let message = self
            .signals
            .next()
            .await
            .context("Request closed before the portal replied")?;

        let (response, results): (u32, ResponseResults) = message
            .body()
            .deserialize()
            .context("Malformed Response signal")?;

        Ok(PortalReply { response, results })
    }
}
