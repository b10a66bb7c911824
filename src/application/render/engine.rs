//! Contract of the headless-browser capability the worker pool drives.
//!
//! The pool only needs to open a session, navigate with an interceptor
//! attached, wait on a completion signal, extract the document and observe
//! the sub-requests the page issued. Engines are black boxes behind these two
//! traits.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use url::Url;

use super::types::RenderError;
use crate::{
    application::interceptor::ResourceInterceptor,
    domain::{render::WaitTier, types::ResourceType},
};

/// Completion signal awaited after navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// No request in flight for `quiet`.
    NetworkIdle { quiet: Duration },
    /// At most two requests in flight for `quiet`.
    NetworkQuiet { quiet: Duration },
    /// `DOMContentLoaded` fired, then `grace` elapsed.
    DomReady { grace: Duration },
}

impl WaitCondition {
    pub fn tier(&self) -> WaitTier {
        match self {
            WaitCondition::NetworkIdle { .. } => WaitTier::NetworkIdle,
            WaitCondition::NetworkQuiet { .. } => WaitTier::NetworkQuiet,
            WaitCondition::DomReady { .. } => WaitTier::DomReady,
        }
    }
}

/// Final document of a rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContent {
    pub html: String,
    /// HTTP status of the main document response.
    pub status: u16,
}

/// One sub-request observed during a render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    pub url: String,
    pub resource_type: ResourceType,
    pub blocked: bool,
}

#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, RenderError>;
}

#[async_trait]
pub trait BrowserSession: Send {
    /// Start loading `url`. Every sub-request is filtered through `interceptor`.
    async fn navigate(
        &mut self,
        url: &Url,
        interceptor: Arc<ResourceInterceptor>,
    ) -> Result<(), RenderError>;

    /// Wait for `condition`, failing with [`RenderError::Timeout`] after `timeout`.
    async fn wait_for(
        &mut self,
        condition: WaitCondition,
        timeout: Duration,
    ) -> Result<(), RenderError>;

    async fn content(&mut self) -> Result<PageContent, RenderError>;

    /// Sub-requests seen since the last navigation.
    fn network_events(&self) -> Vec<NetworkEvent>;

    async fn close(self: Box<Self>);
}
