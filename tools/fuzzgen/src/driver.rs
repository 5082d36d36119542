//! Runs a harness executable repeatedly against a protocol server and reports
//! each run's exit status as the session outcome.
//!
//! The harness learns where to connect and which session id to use from the
//! `FUZZGEN_ENDPOINT` and `FUZZGEN_SESSION` environment variables. Exit code 0
//! is a success; anything else, including a harness that could not be waited
//! on, is a failure.

use crate::errors::FuzzError;
use crate::protocol::SessionId;
use crate::runtime::{ProcessOutput, ProcessRequest, ProcessRunner};
use crate::transport::Client;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ENDPOINT_ENV: &str = "FUZZGEN_ENDPOINT";
pub const SESSION_ENV: &str = "FUZZGEN_SESSION";

#[derive(Debug, Clone)]
pub struct DriveOptions {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub count: u64,
    pub endpoint: String,
    pub session_prefix: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriveSummary {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    /// Runs whose harness could not be waited on; counted as failures too.
    pub harness_errors: u64,
}

impl DriveOptions {
    fn session(&self, run: u64) -> SessionId {
        SessionId(format!("{}-{run}", self.session_prefix).into_bytes())
    }

    fn request(&self, session: &SessionId) -> ProcessRequest {
        ProcessRequest {
            program: self.program.clone(),
            args: self.args.clone(),
            env: vec![
                (ENDPOINT_ENV.to_string(), self.endpoint.clone()),
                (SESSION_ENV.to_string(), session.to_string()),
            ],
            cwd: self.cwd.clone(),
        }
    }
}

pub async fn drive(
    runner: Arc<dyn ProcessRunner>,
    options: &DriveOptions,
) -> Result<DriveSummary, FuzzError> {
    let mut client = Client::connect(options.endpoint.as_str()).await?;
    let mut summary = DriveSummary::default();
    info!(
        program = %options.program,
        count = options.count,
        endpoint = %options.endpoint,
        "driving harness"
    );

    for run in 0..options.count {
        let session = options.session(run);
        let request = options.request(&session);
        let runner = Arc::clone(&runner);
        let outcome = tokio::task::spawn_blocking(move || run_harness(runner.as_ref(), request))
            .await
            .map_err(|e| FuzzError::Process(e.to_string()))??;

        let success = match &outcome {
            Ok(output) => output.success(),
            Err(err) => {
                warn!(session = %session, error = %err, "harness did not finish");
                summary.harness_errors += 1;
                false
            }
        };
        client.terminate(&session, success).await?;

        summary.runs += 1;
        if success {
            summary.successes += 1;
        } else {
            summary.failures += 1;
        }
        debug!(session = %session, success, "run reported");
    }

    info!(
        runs = summary.runs,
        successes = summary.successes,
        failures = summary.failures,
        "drive finished"
    );
    Ok(summary)
}

/// Outer error: the harness could not be started. Inner error: it started but
/// could not be waited on, in which case it is killed.
fn run_harness(
    runner: &dyn ProcessRunner,
    request: ProcessRequest,
) -> Result<Result<ProcessOutput, FuzzError>, FuzzError> {
    let handle = runner.spawn(request)?;
    match runner.wait(handle) {
        Ok(output) => Ok(Ok(output)),
        Err(err) => {
            if let Err(kill_err) = runner.kill(handle) {
                debug!(error = %kill_err, "kill after failed wait");
            }
            Ok(Err(err))
        }
    }
}
