//! Renders the fio job file for a run.

use std::path::Path;

use disk_tunnel_summary_model::EnginePolicy;

use crate::plan::PhasePlan;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobFileError {
    #[error("Phase plan is empty")]
    EmptyPlan,
    #[error("Phase '{0}' has a zero duration")]
    ZeroDuration(String),
    #[error("Option '{key}' of phase '{phase}' contains a line break")]
    MultilineOption { phase: String, key: String },
    #[error("Target file path is not valid UTF-8")]
    NonUtf8Path,
}

/// Render a job file with a `[global]` section shared by every phase and one section per phase.
///
/// Phases run one after the other because each section starts with `stonewall`, and each is
/// bounded by `runtime` with `time_based` so the engine keeps going for the full duration.
pub fn render_job_file(
    run_id: &str,
    target_file: &Path,
    size_bytes: u64,
    plan: &PhasePlan,
    policy: &EnginePolicy,
) -> Result<String, JobFileError> {
    if plan.phases.is_empty() {
        return Err(JobFileError::EmptyPlan);
    }

    let filename = target_file.to_str().ok_or(JobFileError::NonUtf8Path)?;

    let mut out = String::new();
    push_line(&mut out, &format!("; disk-tunnel run {run_id}"));
    push_line(&mut out, "[global]");
    push_line(&mut out, &format!("filename={}", escape_filename(filename)));
    push_line(&mut out, &format!("size={size_bytes}"));
    push_line(&mut out, &format!("ioengine={}", policy.ioengine));
    push_line(&mut out, &format!("direct={}", u8::from(policy.direct_io)));
    if policy.thread_mode {
        push_line(&mut out, "thread=1");
    }
    push_line(&mut out, "time_based=1");

    for (index, phase) in plan.phases.iter().enumerate() {
        if phase.duration_secs == 0 {
            return Err(JobFileError::ZeroDuration(phase.name.clone()));
        }

        push_line(&mut out, "");
        push_line(&mut out, &format!("[{}]", section_name(index, &phase.name)));
        push_line(&mut out, "stonewall");
        push_line(&mut out, &format!("runtime={}", phase.duration_secs));
        for (key, value) in &phase.options {
            if key.contains(['\n', '\r']) || value.contains(['\n', '\r']) {
                return Err(JobFileError::MultilineOption {
                    phase: phase.name.clone(),
                    key: key.clone(),
                });
            }
            if value.is_empty() {
                push_line(&mut out, key);
            } else {
                push_line(&mut out, &format!("{key}={value}"));
            }
        }
    }

    Ok(out)
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    out.push('\n');
}

/// fio splits `filename` on `:`, so colons that are part of the path must be escaped.
fn escape_filename(filename: &str) -> String {
    filename.replace(':', "\\:")
}

/// Section names are reported back as job names, keep them to a safe character set.
fn section_name(index: usize, name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned == "global" {
        format!("phase{index}")
    } else {
        cleaned
    }
}
