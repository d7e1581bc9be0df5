// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The summary printed at the end of a build.

use colored::Colorize;
use indicatif::{HumanBytes, HumanDuration};
use itertools::Itertools;

use crate::{
    config::BuildConfiguration,
    orchestrator::{BuildState, OutputRecord, Phase, PhaseOutcome},
};

/// Formats an error and its chain of causes on one line.
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    std::iter::successors(Some(error), |e| e.source()).join(": ")
}

/// Renders a human-readable report of a finished (or failed) build.
pub fn render(
    state: &BuildState,
    config: &BuildConfiguration,
    outputs: &[OutputRecord],
) -> String {
    let mut lines = vec![format!(
        "{} {} ({} disk, {})",
        "Build report for".bold(),
        state.vm_name,
        config.disk_format,
        state.working_disk_path
    )];

    if state.reused_working_disk {
        lines.push(format!("  {}", "reused existing working disk".dimmed()));
    }

    lines.push(format!("  {}", "Phases".bold()));
    let label_width =
        Phase::PIPELINE.iter().map(|p| p.label().len()).max().unwrap_or(0);
    for record in &state.records {
        let (mark, status) = match record.outcome {
            PhaseOutcome::Completed => {
                ("✓", format!("{}", HumanDuration(record.elapsed)))
            }
            PhaseOutcome::Skipped => ("-", "skipped".to_string()),
            PhaseOutcome::Failed => (
                "⚠",
                format!("failed after {}", HumanDuration(record.elapsed)),
            ),
        };
        lines.push(format!(
            "    {mark} {:label_width$}  {status}",
            record.phase.label()
        ));
    }

    if !outputs.is_empty() {
        lines.push(format!("  {}", "Outputs".bold()));
    }

    for output in outputs {
        let format = output.format.name();
        match &output.conversion {
            Ok(converted) => lines.push(format!(
                "    {format:5} {} ({}, converted in {})",
                converted.path,
                HumanBytes(converted.size),
                HumanDuration(converted.duration)
            )),
            Err(e) => {
                lines.push(format!(
                    "    {format:5} conversion failed: {}",
                    error_chain(e)
                ));
                continue;
            }
        }

        match &output.compression {
            None => {}
            Some(Ok(artifact)) => lines.push(format!(
                "          {} via {}: {} ({}, {:.1}% smaller)",
                artifact.scheme,
                artifact.mechanism,
                artifact.path,
                HumanBytes(artifact.compressed_size),
                artifact.ratio * 100.0
            )),
            Some(Err(e)) => lines.push(format!(
                "          compression ({}) failed: {}",
                config.compression.scheme_for(output.format),
                error_chain(e)
            )),
        }
    }

    lines.push(format!(
        "  {} {}",
        "Total elapsed:".bold(),
        HumanDuration(state.elapsed())
    ));

    let failed_outputs = outputs.iter().filter(|o| o.failed()).count();
    let result = if state.current_phase == Phase::Failed {
        let failed_phase = state
            .records
            .iter()
            .rev()
            .find(|r| r.outcome == PhaseOutcome::Failed)
            .map(|r| r.phase.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let last = match state.last_completed() {
            Some(phase) => format!("last successful phase: {phase}"),
            None => "no phase completed".to_string(),
        };
        format!("failed in phase {failed_phase} ({last})").red().bold()
    } else if failed_outputs > 0 {
        format!(
            "completed with {failed_outputs} of {} outputs failed",
            outputs.len()
        )
        .yellow()
        .bold()
    } else {
        "succeeded".green().bold()
    };
    lines.push(format!("  {} {result}", "Result:".bold()));

    lines.join("\n")
}
