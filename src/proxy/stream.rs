//! Response body for a relay stream.
//!
//! Wraps the pipeline output so the session is torn down whenever actix drops
//! the body, which is how a listener disconnect shows up.

use crate::audio::pipeline::PipelineOutput;
use crate::proxy::session::{SessionManager, StreamSession};
use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tracing::info;

pub struct SessionStream {
    session: Arc<StreamSession>,
    output: PipelineOutput,
    manager: Weak<SessionManager>,
    bytes_sent: u64,
}

impl SessionStream {
    pub(crate) fn new(
        session: Arc<StreamSession>,
        output: PipelineOutput,
        manager: Weak<SessionManager>,
    ) -> Self {
        Self {
            session,
            output,
            manager,
            bytes_sent: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }
}

impl Stream for SessionStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.output).poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &polled {
            self.bytes_sent += chunk.len() as u64;
        }
        polled
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        info!(
            session_id = %self.session.id,
            bytes_sent = self.bytes_sent,
            "Stream closed"
        );
        match self.manager.upgrade() {
            Some(manager) => manager.release(&self.session),
            None => self.session.pipeline.stop(),
        }
    }
}
