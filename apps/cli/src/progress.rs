//! Spinner shown while waiting on a transfer

use crate::output::format_bytes;
use console::style;
use ferry_core::{CompletionFuture, FerryCore};
use ferry_types::{CoreEvent, TaskKey, TaskRunner, TransferResult};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Follows one transfer through the core events
pub struct TransferSpinner {
    bar: ProgressBar,
    key: TaskKey,
    name: String,
}

impl TransferSpinner {
    pub fn new(runner: &TaskRunner) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_message(format!("{} queued", runner.filename));
        Self {
            bar,
            key: runner.key(),
            name: runner.filename.clone(),
        }
    }

    pub fn handle_event(&self, event: &CoreEvent) {
        match event {
            CoreEvent::TransferStarted { key, rank } if *key == self.key => {
                if *rank > 0 {
                    self.bar.set_message(format!("{} resumed at block {}", self.name, rank));
                } else {
                    self.bar.set_message(format!("{} started", self.name));
                }
            }
            CoreEvent::TransferProgress { key, rank, bytes } if *key == self.key => {
                self.bar
                    .set_message(format!("{} block {} ({})", self.name, rank, format_bytes(*bytes)));
            }
            CoreEvent::TransferStatusChanged { key, info, .. } if *key == self.key => {
                self.bar.set_message(format!("{} {}", self.name, info));
            }
            _ => {}
        }
    }

    pub fn finish(&self, result: &TransferResult) {
        if result.success {
            self.bar
                .finish_with_message(format!("{} {} done", style("✓").green().bold(), self.name));
        } else {
            self.bar.abandon_with_message(format!(
                "{} {} failed: {}",
                style("✗").red().bold(),
                self.name,
                result.message.as_deref().unwrap_or(result.code.message())
            ));
        }
    }
}

/// Wait for `completion`, animating a spinner meanwhile
pub async fn wait_with_spinner(
    core: &FerryCore,
    runner: &TaskRunner,
    completion: CompletionFuture,
) -> anyhow::Result<TransferResult> {
    let spinner = TransferSpinner::new(runner);
    let mut events = core.subscribe();
    let wait = completion.wait();
    tokio::pin!(wait);

    loop {
        tokio::select! {
            result = &mut wait => {
                let result = result?;
                spinner.finish(&result);
                return Ok(result);
            }
            event = events.recv() => match event {
                Ok(event) => spinner.handle_event(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    let result = (&mut wait).await?;
                    spinner.finish(&result);
                    return Ok(result);
                }
            }
        }
    }
}
