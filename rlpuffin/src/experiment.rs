use std::fmt::Display;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use itertools::Itertools;

use crate::orchestrator::Mode;

#[must_use]
pub fn format_title(backend: &str, mode: Mode, title: Option<&str>, index: usize) -> String {
    let date = Local::now().format("%Y-%m-%d");
    let hour = Local::now().format("%H-%M-%S");
    let title = title
        .unwrap_or(crate::MAYBE_GIT_REF.unwrap_or("campaign"))
        .split_whitespace()
        .join("-");

    format!(
        "{date}--{backend}-{mode}__{title}--{hour}--{index}",
        date = date,
        backend = backend,
        mode = mode,
        title = title,
        hour = hour,
        index = index
    )
}

/// Creates a fresh experiment directory below `root`, bumping the index while the name
/// is taken.
pub fn create_experiment_dir(
    root: &Path,
    backend: &str,
    mode: Mode,
    title: Option<&str>,
) -> Result<PathBuf, io::Error> {
    let mut index = 0;
    let mut path = root.join(format_title(backend, mode, title, index));
    while path.exists() {
        index += 1;
        path = root.join(format_title(backend, mode, title, index));
    }

    fs::create_dir_all(&path)?;
    Ok(path)
}

pub struct ExperimentDetails<'a> {
    pub backend: &'a str,
    pub mode: Mode,
    pub target: &'a Path,
    pub duration: Duration,
    pub launched_with: &'a [String],
}

pub fn write_experiment_markdown(
    directory: &Path,
    title: impl Display,
    description_text: impl Display,
    details: &ExperimentDetails,
) -> Result<String, io::Error> {
    let full_description = format!(
        "# Experiment: {title}\n\
                * Fuzzer: {backend}\n\
                * Mode: {mode}\n\
                * Target: {target}\n\
                * Duration: {duration}s\n\
                * Date: {date}\n\
                * Git Ref: {git_ref}\n\
                * Launched with: {command}\n\
                * Log: [rlpuffin.log](./rlpuffin.log)\n\n\
                {description}\n",
        title = &title,
        backend = details.backend,
        mode = details.mode,
        target = details.target.display(),
        duration = details.duration.as_secs(),
        date = Local::now().to_rfc3339(),
        git_ref = crate::MAYBE_GIT_REF.unwrap_or("unknown"),
        command = details.launched_with.iter().join(" "),
        description = description_text
    );

    fs::create_dir_all(directory)?;

    let mut file = File::create(directory.join("README.md"))?;
    file.write_all(full_description.as_bytes())?;
    Ok(full_description)
}
