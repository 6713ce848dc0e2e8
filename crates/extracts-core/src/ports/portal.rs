//! Portal capability.
//!
//! Two seams: [`LoginDriver`] is the browser the login state machine steers one screen at
//! a time, [`Portal`] is the order API used once a [`Session`] exists.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Credentials, OrderStatus, Session};

#[derive(Debug, Clone, Error)]
pub enum PortalError {
    /// Network failure, 5xx, element that did not appear in time.
    #[error("transient portal failure: {0}")]
    Transient(String),

    #[error("credentials rejected: {0}")]
    InvalidCredentials(String),

    /// The portal no longer accepts the session cookies.
    #[error("session expired")]
    SessionExpired,

    #[error("unexpected portal response: {0}")]
    Unexpected(String),
}

/// Screens that may appear after the credential form is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepMarker {
    SmsPrompt,
    Captcha,
    AnomalyQuestion,
    MessengerOptOut,
}

/// Browser-level login driver. Owned by one session manager per process.
#[async_trait]
pub trait LoginDriver: Send + Sync {
    /// Start the browser.
    async fn open(&self) -> Result<(), PortalError>;

    /// Whether the current browser state is signed in.
    async fn is_authenticated(&self) -> Result<bool, PortalError>;

    async fn enter_credentials(&self, credentials: &Credentials) -> Result<(), PortalError>;

    /// Submit the credential form. May trigger SMS dispatch.
    async fn submit_credentials(&self) -> Result<(), PortalError>;

    /// Text of the screen if `marker` is currently displayed.
    async fn detect(&self, marker: StepMarker) -> Result<Option<String>, PortalError>;

    /// Type `value` into the screen identified by `marker` and continue.
    async fn fill(&self, marker: StepMarker, value: &str) -> Result<(), PortalError>;

    /// Save the CAPTCHA challenge image under `dir` and return its path.
    async fn save_captcha_image(&self, dir: &Path) -> Result<PathBuf, PortalError>;

    async fn skip_messenger_opt_out(&self) -> Result<(), PortalError>;

    async fn current_url(&self) -> Result<String, PortalError>;

    /// Cookie set of the signed-in browser.
    async fn session(&self) -> Result<Session, PortalError>;

    /// Drop browser state after a failed login.
    async fn reset(&self) -> Result<(), PortalError>;

    async fn close(&self);
}

/// Result of placing an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOrder {
    pub status: OrderStatus,
    pub external_order_number: Option<String>,
    /// Set when the portal settled the order immediately (e.g. unknown cadastral number).
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalStatus {
    pub ready: bool,
    pub status_text: String,
}

#[async_trait]
pub trait Portal: Send + Sync {
    async fn place_order(
        &self,
        session: &Session,
        cadastral_number: &str,
    ) -> Result<PlacedOrder, PortalError>;

    async fn check_status(
        &self,
        session: &Session,
        external_order_number: &str,
    ) -> Result<ExternalStatus, PortalError>;

    /// Download the artifact into `dest_dir` and return the file path.
    async fn download_artifact(
        &self,
        session: &Session,
        external_order_number: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, PortalError>;
}

/// Tells operators that a challenge is waiting for them.
#[async_trait]
pub trait ChallengeNotifier: Send + Sync {
    async fn captcha_pending(&self, subject: &str, image: &Path);
}

/// Notifier that only logs where the CAPTCHA image was saved.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl ChallengeNotifier for LogNotifier {
    async fn captcha_pending(&self, subject: &str, image: &Path) {
        tracing::info!(subject, image = %image.display(), "captcha waiting for an operator");
    }
}
