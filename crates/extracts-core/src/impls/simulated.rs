//! Scripted stand-in for the portal and its login pages.
//!
//! Drives the full login flow (SMS, CAPTCHA, anomaly question, messenger opt-out) and the
//! order API from a [`Scenario`], for local runs and tests.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use zip::write::SimpleFileOptions;

use crate::domain::{Cookie, Credentials, OrderStatus, Session};
use crate::ports::{ExternalStatus, LoginDriver, PlacedOrder, Portal, PortalError, StepMarker};

/// What the simulated artifact download produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Zip,
    Empty,
    Garbage,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    /// Password the portal accepts. `None` accepts any.
    pub password: Option<String>,
    /// When set, the SMS screen appears and expects this code.
    pub sms_code: Option<String>,
    /// When set, the CAPTCHA screen appears and expects this answer.
    pub captcha_answer: Option<String>,
    /// When set, this question is asked; any non-empty answer passes.
    pub anomaly_question: Option<String>,
    pub messenger_opt_out: bool,
    /// URL polls before the portal redirects to the cabinet.
    pub redirect_after_polls: u32,
    /// Transient failures returned by `place_order` before it succeeds.
    pub place_failures: u32,
    pub placed_status: OrderStatus,
    /// `check_status` calls per order before it reports ready.
    pub ready_after_checks: u32,
    pub artifact: ArtifactKind,
    pub domain: String,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            password: None,
            sms_code: None,
            captcha_answer: None,
            anomaly_question: None,
            messenger_opt_out: false,
            redirect_after_polls: 1,
            place_failures: 0,
            placed_status: OrderStatus::Registered,
            ready_after_checks: 1,
            artifact: ArtifactKind::Zip,
            domain: "rosreestr.ru".to_string(),
        }
    }
}

#[derive(Default)]
struct SimState {
    opened: bool,
    authenticated: bool,
    submitted: bool,
    entered: Option<Credentials>,
    pending: Vec<StepMarker>,
    filled: Vec<(StepMarker, String)>,
    polls: u32,
    logins: u32,
    place_calls: u32,
    orders_placed: u32,
    checks: HashMap<String, u32>,
}

type SmsHook = Box<dyn Fn() + Send + Sync>;

pub struct SimulatedPortal {
    scenario: Mutex<Scenario>,
    state: Mutex<SimState>,
    on_sms_dispatch: Mutex<Option<SmsHook>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedPortal {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario: Mutex::new(scenario),
            state: Mutex::new(SimState::default()),
            on_sms_dispatch: Mutex::new(None),
        }
    }

    /// Called right after the portal "sends" an SMS, i.e. when credentials are submitted.
    pub fn on_sms_dispatch(&self, hook: impl Fn() + Send + Sync + 'static) {
        *locked(&self.on_sms_dispatch) = Some(Box::new(hook));
    }

    pub fn update_scenario(&self, change: impl FnOnce(&mut Scenario)) {
        change(&mut locked(&self.scenario));
    }

    /// Drop the portal-side session, as if cookies expired.
    pub fn expire_session(&self) {
        locked(&self.state).authenticated = false;
    }

    pub fn place_calls(&self) -> u32 {
        locked(&self.state).place_calls
    }

    pub fn logins(&self) -> u32 {
        locked(&self.state).logins
    }

    /// Values typed into each login screen, in order.
    pub fn filled(&self) -> Vec<(StepMarker, String)> {
        locked(&self.state).filled.clone()
    }

    fn screen_text(&self, marker: StepMarker) -> String {
        match marker {
            StepMarker::SmsPrompt => "Введите код из SMS".to_string(),
            StepMarker::Captcha => "Введите символы с картинки".to_string(),
            StepMarker::AnomalyQuestion => {
                let question = locked(&self.scenario)
                    .anomaly_question
                    .clone()
                    .unwrap_or_default();
                format!("Подтвердите, что вы не робот\n\n{question}\n")
            }
            StepMarker::MessengerOptOut => "Подключите мессенджер MAX".to_string(),
        }
    }

    fn require_session(&self) -> Result<(), PortalError> {
        if locked(&self.state).authenticated {
            Ok(())
        } else {
            Err(PortalError::SessionExpired)
        }
    }
}

#[async_trait]
impl LoginDriver for SimulatedPortal {
    async fn open(&self) -> Result<(), PortalError> {
        locked(&self.state).opened = true;
        Ok(())
    }

    async fn is_authenticated(&self) -> Result<bool, PortalError> {
        let state = locked(&self.state);
        if !state.opened {
            return Err(PortalError::Unexpected("browser is not open".into()));
        }
        Ok(state.authenticated)
    }

    async fn enter_credentials(&self, credentials: &Credentials) -> Result<(), PortalError> {
        locked(&self.state).entered = Some(credentials.clone());
        Ok(())
    }

    async fn submit_credentials(&self) -> Result<(), PortalError> {
        let scenario = locked(&self.scenario).clone();
        let sms_sent = {
            let mut state = locked(&self.state);
            let Some(entered) = state.entered.clone() else {
                return Err(PortalError::Unexpected("credential form is empty".into()));
            };
            if let Some(expected) = &scenario.password
                && &entered.password != expected
            {
                return Err(PortalError::InvalidCredentials(
                    "login or password is incorrect".into(),
                ));
            }
            state.submitted = true;
            state.polls = 0;
            state.pending.clear();
            if scenario.sms_code.is_some() {
                state.pending.push(StepMarker::SmsPrompt);
            }
            if scenario.captcha_answer.is_some() {
                state.pending.push(StepMarker::Captcha);
            }
            if scenario.anomaly_question.is_some() {
                state.pending.push(StepMarker::AnomalyQuestion);
            }
            if scenario.messenger_opt_out {
                state.pending.push(StepMarker::MessengerOptOut);
            }
            scenario.sms_code.is_some()
        };
        if sms_sent && let Some(hook) = locked(&self.on_sms_dispatch).as_ref() {
            hook();
        }
        Ok(())
    }

    async fn detect(&self, marker: StepMarker) -> Result<Option<String>, PortalError> {
        let showing = locked(&self.state).pending.first() == Some(&marker);
        Ok(showing.then(|| self.screen_text(marker)))
    }

    async fn fill(&self, marker: StepMarker, value: &str) -> Result<(), PortalError> {
        let scenario = locked(&self.scenario).clone();
        let mut state = locked(&self.state);
        if state.pending.first() != Some(&marker) {
            return Err(PortalError::Unexpected(format!("{marker:?} is not displayed")));
        }
        let expected = match marker {
            StepMarker::SmsPrompt => scenario.sms_code,
            StepMarker::Captcha => scenario.captcha_answer,
            StepMarker::AnomalyQuestion | StepMarker::MessengerOptOut => None,
        };
        if let Some(expected) = expected
            && expected != value
        {
            return Err(PortalError::InvalidCredentials(format!(
                "{marker:?} rejected the entered value"
            )));
        }
        state.filled.push((marker, value.to_string()));
        state.pending.remove(0);
        Ok(())
    }

    async fn save_captcha_image(&self, dir: &Path) -> Result<PathBuf, PortalError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PortalError::Unexpected(e.to_string()))?;
        let path = dir.join(format!("captcha-{}.png", Utc::now().timestamp_millis()));
        tokio::fs::write(&path, b"\x89PNG\r\n\x1a\n")
            .await
            .map_err(|e| PortalError::Unexpected(e.to_string()))?;
        Ok(path)
    }

    async fn skip_messenger_opt_out(&self) -> Result<(), PortalError> {
        let mut state = locked(&self.state);
        if state.pending.first() != Some(&StepMarker::MessengerOptOut) {
            return Err(PortalError::Unexpected("messenger screen is not displayed".into()));
        }
        state.pending.remove(0);
        Ok(())
    }

    async fn current_url(&self) -> Result<String, PortalError> {
        let redirect_after = locked(&self.scenario).redirect_after_polls;
        let mut state = locked(&self.state);
        if state.authenticated {
            return Ok("https://lk.rosreestr.ru/my-applications".into());
        }
        if state.submitted && state.pending.is_empty() {
            state.polls += 1;
            if state.polls >= redirect_after {
                state.authenticated = true;
                state.logins += 1;
                return Ok("https://lk.rosreestr.ru/my-applications".into());
            }
        }
        Ok("https://esia.gosuslugi.ru/login/".into())
    }

    async fn session(&self) -> Result<Session, PortalError> {
        let domain = locked(&self.scenario).domain.clone();
        let state = locked(&self.state);
        if !state.authenticated {
            return Err(PortalError::SessionExpired);
        }
        Ok(Session {
            cookies: vec![Cookie {
                name: "SESSION".into(),
                value: format!("sim-{}", state.logins),
                domain,
            }],
            established_at: Utc::now(),
        })
    }

    async fn reset(&self) -> Result<(), PortalError> {
        let mut state = locked(&self.state);
        state.authenticated = false;
        state.submitted = false;
        state.entered = None;
        state.pending.clear();
        state.polls = 0;
        Ok(())
    }

    async fn close(&self) {
        locked(&self.state).opened = false;
    }
}

fn zip_bytes(entry: &str) -> Result<Vec<u8>, PortalError> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        writer
            .start_file(entry, SimpleFileOptions::default())
            .map_err(|e| PortalError::Unexpected(e.to_string()))?;
        writer
            .write_all(b"<extract><object/></extract>")
            .map_err(|e| PortalError::Unexpected(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| PortalError::Unexpected(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

#[async_trait]
impl Portal for SimulatedPortal {
    async fn place_order(
        &self,
        _session: &Session,
        cadastral_number: &str,
    ) -> Result<PlacedOrder, PortalError> {
        self.require_session()?;
        let status = {
            let mut scenario = locked(&self.scenario);
            let mut state = locked(&self.state);
            state.place_calls += 1;
            if scenario.place_failures > 0 {
                scenario.place_failures -= 1;
                return Err(PortalError::Transient("portal returned 503".into()));
            }
            state.orders_placed += 1;
            scenario.placed_status.clone()
        };
        tracing::debug!(cadastral_number, %status, "simulated order placed");

        let placed = match status {
            OrderStatus::Registered => PlacedOrder {
                external_order_number: Some(format!(
                    "80-{:08}",
                    locked(&self.state).orders_placed
                )),
                status,
                is_complete: false,
            },
            other => PlacedOrder {
                status: other,
                external_order_number: None,
                is_complete: true,
            },
        };
        Ok(placed)
    }

    async fn check_status(
        &self,
        _session: &Session,
        external_order_number: &str,
    ) -> Result<ExternalStatus, PortalError> {
        self.require_session()?;
        let ready_after = locked(&self.scenario).ready_after_checks;
        let mut state = locked(&self.state);
        let checks = state
            .checks
            .entry(external_order_number.to_string())
            .or_default();
        *checks += 1;
        let ready = *checks >= ready_after;
        Ok(ExternalStatus {
            ready,
            status_text: if ready { "Выполнено" } else { "В работе" }.to_string(),
        })
    }

    async fn download_artifact(
        &self,
        _session: &Session,
        external_order_number: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, PortalError> {
        self.require_session()?;
        let artifact = locked(&self.scenario).artifact;
        let bytes = match artifact {
            ArtifactKind::Zip => zip_bytes(&format!("{external_order_number}.xml"))?,
            ArtifactKind::Empty => Vec::new(),
            ArtifactKind::Garbage => b"<html>Service unavailable</html>".to_vec(),
        };
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| PortalError::Transient(e.to_string()))?;
        let path = dest_dir.join(format!("{external_order_number}.zip"));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PortalError::Transient(e.to_string()))?;
        Ok(path)
    }
}
