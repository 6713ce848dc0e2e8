//! Local worker: simulated portal, in-memory storage, codes typed on stdin.
//!
//! ```text
//! extracts-worker 77:01:0004011:1047 50:21:0110114:2520
//! ```
//!
//! Stdin commands:
//!
//! ```text
//! sms <subject> <message text>
//! captcha <subject> <answer>
//! order <cadastral number>
//! answer <subject> <question> => <answer>
//! unanswered
//! ```

use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::io::{AsyncBufReadExt, BufReader};

use extracts_core::app::{Worker, WorkerBuilder};
use extracts_core::config::WorkerConfig;
use extracts_core::domain::{CodeKind, Credentials, NewOrder, Operator, OperatorId};
use extracts_core::impls::{
    InMemoryAnswerStore, InMemoryOperatorDirectory, InMemoryOrderRepository, Scenario,
    SimulatedPortal,
};
use extracts_core::observability::init_tracing;
use extracts_core::ports::{Clock, SystemClock};
use extracts_core::schedule::JsonScheduleStore;

const PASSWORD_ENV: &str = "EXTRACTS_OPERATOR_PASSWORD";
const SIM_SMS_CODE_ENV: &str = "EXTRACTS_SIM_SMS_CODE";
const OWNER_ID: i64 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::load().context("loading worker configuration")?;
    init_tracing(&config.log);

    let password = std::env::var(PASSWORD_ENV).unwrap_or_default();
    let operator = Operator {
        id: OperatorId(1),
        username: config.operator_username.clone(),
        credentials: Credentials {
            login: config.operator_username.clone(),
            password: password.clone(),
        },
    };

    let scenario = Scenario {
        password: (!password.is_empty()).then_some(password),
        sms_code: std::env::var(SIM_SMS_CODE_ENV).ok(),
        domain: config.portal.target_domain.clone(),
        ..Scenario::default()
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let portal = Arc::new(SimulatedPortal::new(scenario));
    let answers = Arc::new(InMemoryAnswerStore::new());

    let mut builder = WorkerBuilder::new(config.clone())
        .clock(Arc::clone(&clock))
        .orders(Arc::new(InMemoryOrderRepository::new(clock)))
        .operators(Arc::new(InMemoryOperatorDirectory::new([operator])))
        .answers(answers.clone())
        .login_driver(portal.clone())
        .portal(portal);
    if let Some(path) = &config.schedule.state_path {
        let store = JsonScheduleStore::open(path)
            .await
            .with_context(|| format!("opening schedule state {}", path.display()))?;
        builder = builder.schedule_store(Arc::new(store));
    }
    let worker = builder.build().context("wiring the worker")?;

    for number in std::env::args().skip(1) {
        submit(&worker, &number).await?;
    }

    let running = worker.start().await.context("starting the worker")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = handle_command(&worker, &answers, line.trim()).await {
                        tracing::warn!(error = %e, "command rejected");
                    }
                }
                Ok(None) => {
                    tracing::debug!("stdin closed, waiting for a shutdown signal");
                    stdin_open = false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    stdin_open = false;
                }
            },
        }
    }

    running.shutdown().await;
    Ok(())
}

async fn submit(worker: &Worker, cadastral_number: &str) -> anyhow::Result<()> {
    worker
        .submit_order(NewOrder {
            owner_id: OWNER_ID,
            cadastral_number: cadastral_number.to_string(),
        })
        .await
        .with_context(|| format!("submitting order for {cadastral_number}"))?;
    Ok(())
}

async fn handle_command(
    worker: &Worker,
    answers: &InMemoryAnswerStore,
    line: &str,
) -> anyhow::Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "order" => submit(worker, rest.trim()).await,
        "unanswered" => {
            for (question, subject) in answers.unanswered().await {
                println!("{subject}\t{question}");
            }
            Ok(())
        }
        "answer" => {
            let (subject, qa) = rest
                .trim()
                .split_once(' ')
                .context("usage: answer <subject> <question> => <answer>")?;
            let (question, answer) = qa
                .split_once("=>")
                .context("usage: answer <subject> <question> => <answer>")?;
            answers
                .set_answer(question.trim(), subject, answer.trim())
                .await;
            tracing::info!(subject, "answer stored");
            Ok(())
        }
        kind => {
            let kind: CodeKind = match kind.parse() {
                Ok(kind) => kind,
                Err(e) => bail!(e),
            };
            let (subject, text) = rest
                .trim()
                .split_once(' ')
                .context("usage: <sms|captcha> <subject> <text>")?;
            let receipt = worker.intake().deliver(subject, kind, text);
            println!("{}", serde_json::to_string(&receipt)?);
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
