//! Login state machine.
//!
//! ```text
//! NotAuthenticated -> CheckingStatus -> Authenticated
//!                                    -> SubmittingCredentials -> [SmsStep] -> [CaptchaStep]
//!                                       -> [AnomalyStep] -> [MessengerOptOutStep]
//!                                       -> AwaitingRedirect -> Authenticated
//! ```
//!
//! Bracketed steps run only when their screen is detected. The browser is a single
//! resource: a [`SessionLease`] holds it exclusively until dropped.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::broker::CodeBroker;
use crate::domain::{CodeKind, Operator, ProcessError, Session};
use crate::ports::{AnswerStore, ChallengeNotifier, LoginDriver, StepMarker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    NotAuthenticated,
    CheckingStatus,
    SubmittingCredentials,
    SmsStep,
    CaptchaStep,
    AnomalyStep,
    MessengerOptOutStep,
    AwaitingRedirect,
    Authenticated,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// How long to wait for an operator to hand in a code.
    pub code_timeout: Duration,
    /// How long to wait for the portal to redirect after the last login screen.
    pub redirect_timeout: Duration,
    pub redirect_poll: Duration,
    /// Domain the redirect must land on.
    pub target_domain: String,
    pub captcha_dir: PathBuf,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            code_timeout: Duration::from_secs(300),
            redirect_timeout: Duration::from_secs(60),
            redirect_poll: Duration::from_millis(500),
            target_domain: "rosreestr.ru".to_string(),
            captcha_dir: PathBuf::from("captcha"),
        }
    }
}

#[derive(Default)]
struct SessionSlot {
    session: Option<Session>,
    /// Set when a holder reported the session unusable; the browser is reset before reuse.
    stale: bool,
}

/// Exclusive hold on the authenticated browser.
pub struct SessionLease {
    slot: OwnedMutexGuard<SessionSlot>,
    session: Session,
}

impl SessionLease {
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Forget the session, e.g. after the portal rejected it. The next acquire logs in again.
    pub fn invalidate(mut self) {
        self.slot.session = None;
        self.slot.stale = true;
    }
}

pub struct AuthSessionManager {
    driver: Arc<dyn LoginDriver>,
    broker: Arc<CodeBroker>,
    answers: Arc<dyn AnswerStore>,
    notifier: Arc<dyn ChallengeNotifier>,
    settings: AuthSettings,
    slot: Arc<AsyncMutex<SessionSlot>>,
    last_trace: Mutex<Vec<AuthState>>,
}

impl AuthSessionManager {
    pub fn new(
        driver: Arc<dyn LoginDriver>,
        broker: Arc<CodeBroker>,
        answers: Arc<dyn AnswerStore>,
        notifier: Arc<dyn ChallengeNotifier>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            driver,
            broker,
            answers,
            notifier,
            settings,
            slot: Arc::new(AsyncMutex::new(SessionSlot::default())),
            last_trace: Mutex::new(Vec::new()),
        }
    }

    /// States visited by the most recent `acquire`.
    pub fn last_trace(&self) -> Vec<AuthState> {
        self.last_trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait for exclusive use of the browser and make sure it is signed in as `operator`.
    ///
    /// A failed login resets the browser so the next attempt starts clean.
    pub async fn acquire(&self, operator: &Operator) -> Result<SessionLease, ProcessError> {
        let mut slot = Arc::clone(&self.slot).lock_owned().await;
        if slot.stale {
            if let Err(e) = self.driver.reset().await {
                tracing::warn!(error = %e, "browser reset failed");
            }
            slot.stale = false;
        }
        let mut trace = vec![AuthState::NotAuthenticated];

        let result = self.establish(operator, &mut trace).await;
        *self
            .last_trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = trace;

        match result {
            Ok(session) => {
                slot.session = Some(session.clone());
                Ok(SessionLease { slot, session })
            }
            Err(err) => {
                slot.session = None;
                tracing::warn!(subject = %operator.username, error = %err, "authentication failed");
                if let Err(reset) = self.driver.reset().await {
                    tracing::warn!(error = %reset, "browser reset failed");
                }
                Err(err)
            }
        }
    }

    pub async fn close(&self) {
        self.slot.lock().await.session = None;
        self.driver.close().await;
    }

    fn enter(trace: &mut Vec<AuthState>, state: AuthState) {
        tracing::debug!(?state, "auth state");
        trace.push(state);
    }

    async fn establish(
        &self,
        operator: &Operator,
        trace: &mut Vec<AuthState>,
    ) -> Result<Session, ProcessError> {
        Self::enter(trace, AuthState::CheckingStatus);
        if !self.driver.is_authenticated().await? {
            tracing::info!(subject = %operator.username, "not signed in, logging in");
            self.login(operator, trace).await?;
        }
        let session = self.driver.session().await?;
        Self::enter(trace, AuthState::Authenticated);
        Ok(session)
    }

    async fn login(
        &self,
        operator: &Operator,
        trace: &mut Vec<AuthState>,
    ) -> Result<(), ProcessError> {
        let subject = operator.username.as_str();

        Self::enter(trace, AuthState::SubmittingCredentials);
        self.driver.enter_credentials(&operator.credentials).await?;

        // Submitting the form dispatches the SMS, so the slot must exist first.
        self.broker.subscribe(subject, CodeKind::Sms)?;
        let sms_prompt = match self.submit_and_detect_sms().await {
            Ok(prompt) => prompt,
            Err(err) => {
                self.broker.cancel(subject, CodeKind::Sms);
                return Err(err);
            }
        };

        if sms_prompt.is_some() {
            Self::enter(trace, AuthState::SmsStep);
            let code = self
                .broker
                .wait_for_code(subject, CodeKind::Sms, self.settings.code_timeout)
                .await?;
            self.driver.fill(StepMarker::SmsPrompt, &code).await?;
        } else {
            self.broker.cancel(subject, CodeKind::Sms);
        }

        if self.driver.detect(StepMarker::Captcha).await?.is_some() {
            Self::enter(trace, AuthState::CaptchaStep);
            self.solve_captcha(subject).await?;
        }

        if let Some(text) = self.driver.detect(StepMarker::AnomalyQuestion).await? {
            Self::enter(trace, AuthState::AnomalyStep);
            self.answer_anomaly(subject, &text).await?;
        }

        if self
            .driver
            .detect(StepMarker::MessengerOptOut)
            .await?
            .is_some()
        {
            Self::enter(trace, AuthState::MessengerOptOutStep);
            self.driver.skip_messenger_opt_out().await?;
        }

        Self::enter(trace, AuthState::AwaitingRedirect);
        self.await_redirect().await
    }

    async fn submit_and_detect_sms(&self) -> Result<Option<String>, ProcessError> {
        self.driver.submit_credentials().await?;
        Ok(self.driver.detect(StepMarker::SmsPrompt).await?)
    }

    async fn solve_captcha(&self, subject: &str) -> Result<(), ProcessError> {
        let image = self
            .driver
            .save_captcha_image(&self.settings.captcha_dir)
            .await?;

        let result = async {
            self.broker.subscribe(subject, CodeKind::Captcha)?;
            self.notifier.captcha_pending(subject, &image).await;
            let code = self
                .broker
                .wait_for_code(subject, CodeKind::Captcha, self.settings.code_timeout)
                .await?;
            self.driver.fill(StepMarker::Captcha, &code).await?;
            Ok::<(), ProcessError>(())
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&image).await {
            tracing::warn!(image = %image.display(), error = %e, "could not remove captcha image");
        }
        result
    }

    async fn answer_anomaly(&self, subject: &str, screen: &str) -> Result<(), ProcessError> {
        let question = screen
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string();

        match self.answers.lookup(&question, subject).await? {
            Some(answer) => {
                tracing::info!(subject, %question, "answering anomaly question");
                self.driver.fill(StepMarker::AnomalyQuestion, &answer).await?;
                Ok(())
            }
            None => {
                tracing::warn!(subject, %question, "anomaly question has no stored answer");
                Err(ProcessError::UnansweredAnomalyQuestion { question })
            }
        }
    }

    async fn await_redirect(&self) -> Result<(), ProcessError> {
        let deadline = Instant::now() + self.settings.redirect_timeout;
        loop {
            let url = self.driver.current_url().await?;
            if url.contains(&self.settings.target_domain) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProcessError::AuthenticationFailed(format!(
                    "no redirect to {} within {:?} (stuck at {url})",
                    self.settings.target_domain, self.settings.redirect_timeout
                )));
            }
            tokio::time::sleep(self.settings.redirect_poll).await;
        }
    }
}
