//! Messages from the update engine to whatever front-end hosts it
//!
//! The engine never renders anything. It pushes [`UiEvent`]s into a channel
//! and, for questions, waits on a oneshot answered by the front-end.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::coordinator::CoordinatorState;
use crate::log_debug;

const MODULE: &str = "events";

/// A yes/no question for the user
#[derive(Debug)]
pub struct ConfirmationRequest {
    pub prompt: String,
    responder: oneshot::Sender<bool>,
}

impl ConfirmationRequest {
    pub fn new(prompt: impl Into<String>) -> (Self, oneshot::Receiver<bool>) {
        let (responder, receiver) = oneshot::channel();
        (
            Self {
                prompt: prompt.into(),
                responder,
            },
            receiver,
        )
    }

    /// Answer the question. Dropping the request unanswered declines it.
    pub fn resolve(self, accepted: bool) {
        // The asker may have been cancelled meanwhile
        let _ = self.responder.send(accepted);
    }
}

#[derive(Debug)]
pub enum UiEvent {
    Status { text: String, duration: Duration },
    MessageBox(String),
    /// Enable or disable the run/files/REPL/plotter controls
    Controls(bool),
    Confirm(ConfirmationRequest),
    /// The managed board went away; close any file/REPL/plotter session on it
    SessionTeardown { port: String, board_type: String },
    State(CoordinatorState),
}

/// Sending half used by the engine
#[derive(Debug, Clone)]
pub struct UiHandle {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl UiHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            log_debug!(MODULE, "No front-end listening, event dropped");
        }
    }

    pub fn status_short(&self, text: impl Into<String>) {
        self.send(UiEvent::Status {
            text: text.into(),
            duration: config::status::SHORT,
        });
    }

    pub fn status_always(&self, text: impl Into<String>) {
        self.send(UiEvent::Status {
            text: text.into(),
            duration: config::status::PERSISTENT,
        });
    }

    pub fn message_box(&self, text: impl Into<String>) {
        self.send(UiEvent::MessageBox(text.into()));
    }

    pub fn set_controls(&self, enabled: bool) {
        self.send(UiEvent::Controls(enabled));
    }

    /// Ask a question and wait for the answer
    ///
    /// `None` when cancelled first. A front-end that goes away without
    /// answering counts as a decline.
    pub async fn confirm(&self, prompt: &str, cancel: &CancellationToken) -> Option<bool> {
        let (request, answer) = ConfirmationRequest::new(prompt);
        self.send(UiEvent::Confirm(request));

        tokio::select! {
            _ = cancel.cancelled() => None,
            answer = answer => Some(answer.unwrap_or(false)),
        }
    }
}
