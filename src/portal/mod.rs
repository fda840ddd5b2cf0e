//! ScreenCast portal client
//!
//! This module contains the D-Bus types for the `org.freedesktop.portal.ScreenCast`
//! handshake and the negotiator that drives it.

mod broker;
mod negotiator;
#[cfg(test)]
pub(crate) mod testing;
mod token;

pub use broker::{Broker, PortalBroker, ResponseListener};
pub use negotiator::{Negotiator, StreamsOutcome};
pub use token::{RequestToken, SessionToken, TokenGenerator};

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;

use anyhow::{Context, Result};
use serde::Deserialize;
use zbus::zvariant::{self, OwnedObjectPath, OwnedValue};

/// Portal response status codes
pub const PORTAL_RESPONSE_SUCCESS: u32 = 0;
pub const PORTAL_RESPONSE_CANCELLED: u32 = 1;
pub const PORTAL_RESPONSE_OTHER: u32 = 2;

/// D-Bus service name of the desktop portal
pub const DESKTOP_NAME: &str = "org.freedesktop.portal.Desktop";

/// D-Bus object path of the desktop portal
pub const DESKTOP_PATH: &str = "/org/freedesktop/portal/desktop";

pub const SCREENCAST_IFACE: &str = "org.freedesktop.portal.ScreenCast";
pub const REQUEST_IFACE: &str = "org.freedesktop.portal.Request";

/// Bitmask of capture source kinds offered to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceTypes(u32);

impl SourceTypes {
    pub const MONITOR: Self = Self(1);
    pub const WINDOW: Self = Self(2);

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for SourceTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Session object handed out by the portal after `CreateSession`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle(OwnedObjectPath);

impl SessionHandle {
    pub fn parse(handle: String) -> Result<Self> {
        let path = OwnedObjectPath::try_from(handle.clone())
            .with_context(|| format!("Portal returned invalid session handle: {}", handle))?;
        Ok(Self(path))
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Options for `CreateSession`
#[derive(zvariant::SerializeDict, zvariant::Type, Clone, Debug)]
#[zvariant(signature = "a{sv}")]
pub struct CreateSessionOptions {
    pub handle_token: String,
    pub session_handle_token: String,
}

/// Options for `SelectSources`
#[derive(zvariant::SerializeDict, zvariant::Type, Clone, Debug)]
#[zvariant(signature = "a{sv}")]
pub struct SelectSourcesOptions {
    pub handle_token: String,
    pub multiple: bool,
    pub types: u32,
}

/// Options for `Start`
#[derive(zvariant::SerializeDict, zvariant::Type, Clone, Debug)]
#[zvariant(signature = "a{sv}")]
pub struct StartOptions {
    pub handle_token: String,
}

/// One request-correlated method call on the ScreenCast interface
#[derive(Debug, Clone)]
pub enum BrokerCall {
    CreateSession(CreateSessionOptions),
    SelectSources {
        session: SessionHandle,
        options: SelectSourcesOptions,
    },
    Start {
        session: SessionHandle,
        parent_window: String,
        options: StartOptions,
    },
}

impl BrokerCall {
    /// D-Bus method name
    pub fn method(&self) -> &'static str {
        match self {
            BrokerCall::CreateSession(_) => "CreateSession",
            BrokerCall::SelectSources { .. } => "SelectSources",
            BrokerCall::Start { .. } => "Start",
        }
    }

    /// Correlation token carried by the call
    pub fn handle_token(&self) -> &str {
        match self {
            BrokerCall::CreateSession(options) => &options.handle_token,
            BrokerCall::SelectSources { options, .. } => &options.handle_token,
            BrokerCall::Start { options, .. } => &options.handle_token,
        }
    }
}

#[derive(Deserialize, zvariant::Type, Debug)]
struct RawStream(u32, HashMap<String, OwnedValue>);

/// Result dictionary of a `Request::Response` signal
#[derive(zvariant::DeserializeDict, zvariant::Type, Debug, Default)]
#[zvariant(signature = "a{sv}")]
pub struct ResponseResults {
    session_handle: Option<String>,
    streams: Option<Vec<RawStream>>,
}

impl ResponseResults {
    #[cfg(test)]
    pub fn with_session_handle(handle: &str) -> Self {
        Self {
            session_handle: Some(handle.to_string()),
            streams: None,
        }
    }

    #[cfg(test)]
    pub fn with_streams(streams: Vec<StreamDescriptor>) -> Self {
        Self {
            session_handle: None,
            streams: Some(
                streams
                    .into_iter()
                    .map(|s| RawStream(s.node_id, s.properties))
                    .collect(),
            ),
        }
    }

    pub fn session_handle(&self) -> Option<&str> {
        self.session_handle.as_deref()
    }

    pub fn take_streams(&mut self) -> Vec<StreamDescriptor> {
        self.streams
            .take()
            .unwrap_or_default()
            .into_iter()
            .map(|RawStream(node_id, properties)| StreamDescriptor {
                node_id,
                properties,
            })
            .collect()
    }
}

/// Body of a `Request::Response` signal
#[derive(Debug)]
pub struct PortalReply {
    pub response: u32,
    pub results: ResponseResults,
}

impl PortalReply {
    #[cfg(test)]
    pub fn success(results: ResponseResults) -> Self {
        Self {
            response: PORTAL_RESPONSE_SUCCESS,
            results,
        }
    }

    #[cfg(test)]
    pub fn failure(response: u32) -> Self {
        Self {
            response,
            results: ResponseResults::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.response == PORTAL_RESPONSE_SUCCESS
    }
}

/// A PipeWire stream returned by `Start`
#[derive(Debug)]
pub struct StreamDescriptor {
    /// PipeWire node id
    pub node_id: u32,
    pub properties: HashMap<String, OwnedValue>,
}

impl StreamDescriptor {
    #[cfg(test)]
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            properties: HashMap::new(),
        }
    }

    /// Kind of source the user picked, when the portal reports it
    pub fn source_type(&self) -> Option<SourceTypes> {
        self.properties
            .get("source_type")
            .and_then(|v| v.downcast_ref::<u32>().ok())
            .map(SourceTypes)
    }
}
