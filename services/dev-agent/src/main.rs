//! devsync Dev Agent
//!
//! Runs dev mode for one project against a mirror device. File instructions
//! are read from stdin as JSON lines, e.g.
//! `{"action":"change","file":"/abs/path/main.py"}`, typically piped from a
//! file watcher.
//!
//! ## Lifecycle
//!
//! - **Startup**: open the project and state store, register the device and
//!   upload the project if the device is out of sync
//! - **Run**: push every instruction read from stdin to the session
//! - **Shutdown**: on EOF wait for pending drains, on Ctrl-C stop immediately

use std::sync::Arc;

use anyhow::{Context, Result};
use devsync_agent::{AgentConfig, DevSession, Device, Project, ProjectDir, UploadOutcome};
use devsync_agent::event_log::log_events;
use devsync_agent::mirror::MirrorDevice;
use devsync_agent::state::StateStore;
use devsync_instructions::FileInstruction;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AgentConfig::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting devsync dev agent");
    info!(
        project_dir = %config.project_dir.display(),
        mirror_dir = %config.mirror_dir.display(),
        device = %config.device_name,
        state_db = %config.state_db.display(),
        settle_delay_ms = config.drain.settle_delay.as_millis() as u64,
        "Configuration loaded"
    );

    let project: Arc<dyn Project> = Arc::new(ProjectDir::open(&config.project_dir).await?);

    if let Some(parent) = config.state_db.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = Arc::new(StateStore::open(&config.state_db)?);

    let mut session = DevSession::new(Arc::clone(&project), store, config.drain);

    let device: Arc<dyn Device> = Arc::new(MirrorDevice::new(
        config.device_name.clone(),
        config.mirror_dir.clone(),
    )?);
    let manager = session.add_device(device).await?;

    // Log every session event
    let events_handle = tokio::spawn(log_events(session.subscribe()));

    match manager.upload_if_needed().await {
        Ok(UploadOutcome::Uploaded(report)) => {
            info!(applied = report.applied.len(), "Project uploaded on start")
        }
        Ok(outcome) => info!(outcome = ?outcome, "No upload needed"),
        Err(e) => error!(error = %e, "Initial upload failed"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<FileInstruction>(&line) {
                        Ok(instruction) => {
                            session.push(instruction);
                        }
                        Err(e) => warn!(error = %e, line = %line, "Ignoring malformed instruction"),
                    },
                    Ok(None) => {
                        info!("Input closed, waiting for pending drains");
                        session.wait_idle().await;
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read instructions");
                        break;
                    }
                }
            }
        }
    }

    session.stop().await;
    drop(session);
    let _ = events_handle.await;

    info!("Dev agent shutdown complete");
    Ok(())
}
