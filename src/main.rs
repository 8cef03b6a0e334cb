//! Deribit streaming session runner
//!
//! Loads config.toml and the API key pair, opens an authenticated session,
//! subscribes to the configured channels and logs every push until Ctrl-C.
//! A failed session is replaced by a new one according to the `[retry]`
//! policy.

use anyhow::Context;
use deribit_stream::infrastructure::config::Config;
use deribit_stream::infrastructure::credentials::Credentials;
use deribit_stream::infrastructure::logging::init_logging;
use deribit_stream::{PushEvent, SessionClient, SessionError, SessionEvent, SessionOptions};
use std::time::Duration;

const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Main application state
pub struct StreamApp {
    config: Config,
    credentials: Credentials,
}

impl StreamApp {
    pub fn new(config: Config, credentials: Credentials) -> Self {
        Self { config, credentials }
    }

    /// Run sessions until Ctrl-C or until retries are exhausted
    pub async fn run(&self) -> anyhow::Result<()> {
        let policy = self.config.retry.policy();
        let mut attempt = 0;

        loop {
            let mut reached_ready = false;
            let error = match self.run_session(&mut reached_ready).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if reached_ready {
                attempt = 0;
            }
            attempt += 1;

            let Some(delay) = policy.delay_for(attempt) else {
                return Err(error).context(format!(
                    "session failed after {} attempts",
                    policy.max_attempts()
                ));
            };
            tracing::warn!(error = %error, attempt, ?delay, "Session ended, reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// One session from connect to shutdown or failure
    ///
    /// `Ok` only when shutdown was requested.
    async fn run_session(&self, reached_ready: &mut bool) -> Result<(), SessionError> {
        let session_config = &self.config.session;
        let options = SessionOptions::from_config(session_config, self.credentials.clone());

        tracing::info!(uri = %session_config.uri, channels = ?options.default_channels, "Connecting");
        let mut client = SessionClient::connect(&session_config.uri, options)?;
        let mut pushes = client.push_events().ok_or(SessionError::Closed)?;
        let mut events = client.events().ok_or(SessionError::Closed)?;

        let ready = tokio::select! {
            result = client.wait_ready(session_config.ready_timeout()) => result,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                client.disconnect().await;
                return Ok(());
            }
        };
        if let Err(e) = ready {
            client.disconnect().await;
            return Err(e);
        }
        *reached_ready = true;
        tracing::info!(subscriptions = ?client.snapshot().subscriptions, "Session streaming");

        let mut metrics_tick = tokio::time::interval(METRICS_INTERVAL);
        metrics_tick.tick().await;

        loop {
            tokio::select! {
                Some(push) = pushes.recv() => log_push(&push),
                event = events.recv() => match event {
                    Some(SessionEvent::Failed(e)) => return Err(e),
                    Some(SessionEvent::Closed) | None => return Err(SessionError::Closed),
                    Some(event) => log_event(&event),
                },
                _ = metrics_tick.tick() => {
                    let metrics = client.metrics();
                    tracing::info!(
                        frames = metrics.frames_received,
                        pushes = metrics.pushes_delivered,
                        unrecognized = metrics.unrecognized_frames,
                        parse_errors = metrics.parse_errors,
                        rate = metrics.frame_rate,
                        "Session metrics"
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown requested");
                    client.disconnect().await;
                    return Ok(());
                }
            }
        }
    }
}

fn log_push(push: &PushEvent) {
    tracing::info!(channel = %push.channel, data = %push.data, "Push");
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Error(e) => tracing::warn!(error = %e, "Session error"),
        SessionEvent::Unrecognized(raw) => tracing::debug!(frame = %raw, "Unrecognized frame"),
        other => tracing::info!(event = ?other, "Session event"),
    }
}

fn load_credentials(config: &Config) -> anyhow::Result<Credentials> {
    match Credentials::from_file(&config.credentials.path) {
        Ok(credentials) => Ok(credentials),
        Err(file_error) => {
            tracing::warn!(error = %file_error, "Credentials file unusable, trying environment");
            Credentials::from_env().with_context(|| {
                format!(
                    "no credentials in {} or the environment",
                    config.credentials.path.display()
                )
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let _guards = init_logging(&config.logging).context("failed to initialize logging")?;

    let credentials = load_credentials(&config)?;
    let app = StreamApp::new(config, credentials);
    app.run().await
}
