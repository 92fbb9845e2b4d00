//! User-visible notifications for inbound messages.
//!
//! Notification display and sound playback are best effort: [`dispatch`]
//! logs and discards every failure so message processing never stalls on
//! them.

use std::io::Write;

use crate::chat::model::ConversationId;

/// A notification about an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The conversation that received the message.
    pub conversation: ConversationId,
    /// Resolved sender name (or raw id when resolution failed).
    pub sender_name: String,
    /// Short preview of the message body.
    pub preview: String,
}

/// Errors a notifier may report. Always swallowed by [`dispatch`].
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Sound playback failed.
    #[error("sound playback failed: {0}")]
    Sound(String),
    /// Visual notification failed.
    #[error("notification display failed: {0}")]
    Display(String),
}

/// Presents notifications to the user.
pub trait Notifier: Send {
    /// Show a visual notification.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Display`] if the notification could not be shown.
    fn show(&self, notification: &Notification) -> Result<(), NotifyError>;

    /// Play the notification sound.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Sound`] if playback failed.
    fn play_sound(&self) -> Result<(), NotifyError>;
}

/// Show a notification and play the sound, discarding any failure.
pub fn dispatch<N: Notifier + ?Sized>(notifier: &N, notification: &Notification) {
    if let Err(e) = notifier.show(notification) {
        tracing::debug!(error = %e, conversation = %notification.conversation, "notification not shown");
    }
    if let Err(e) = notifier.play_sound() {
        tracing::debug!(error = %e, "notification sound failed");
    }
}

/// Rings the terminal bell and prints a line on stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn show(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut stderr = std::io::stderr().lock();
        writeln!(
            stderr,
            "[{}] {}: {}",
            notification.conversation, notification.sender_name, notification.preview
        )
        .map_err(|e| NotifyError::Display(e.to_string()))
    }

    fn play_sound(&self) -> Result<(), NotifyError> {
        let mut stderr = std::io::stderr().lock();
        stderr
            .write_all(b"\x07")
            .and_then(|()| stderr.flush())
            .map_err(|e| NotifyError::Sound(e.to_string()))
    }
}

/// Does nothing. Used when notifications are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn show(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Ok(())
    }

    fn play_sound(&self) -> Result<(), NotifyError> {
        Ok(())
    }
}
