//! `linebatch run`: process pending records through the HTTP transform.

use std::process::ExitCode;

use anyhow::Result;
use linebatch_core::{CancellationToken, Engine, EngineConfig};
use tracing::{info, warn};

use crate::http_transform::HttpTransform;

/// Conventional exit status for a run interrupted by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

pub async fn run(config: EngineConfig, endpoint: &str, response_field: &str) -> Result<ExitCode> {
    let transform = HttpTransform::new(endpoint, response_field)?;
    info!(
        endpoint = %transform.endpoint(),
        input = %config.input_path.display(),
        output = %config.output_path.display(),
        "starting run"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight records");
            on_signal.cancel();
        }
    });

    let summary = Engine::new(config, transform.into_hooks())
        .run_until_cancelled(cancel)
        .await?;

    println!("{summary}");
    if summary.cancelled {
        Ok(ExitCode::from(EXIT_CANCELLED))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
