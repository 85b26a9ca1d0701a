//! On-disk layout of the store: a single TOML document.
//!
//! ```toml
//! [config]
//! default_timeout = "10m"
//!
//! [variables]
//! TARGET = "release"
//!
//! [task.build]
//! command = "cargo build --profile $TARGET"
//!
//! [job.nightly]
//! tasks = ["build"]
//! next_run_id = 1
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{job::Job, task::Task};

const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

/// The `[config]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Applies to tasks without their own `timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout: Option<String>,
    /// Newest runs kept per job; unset keeps everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_timeout: None,
            history_limit: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct StoreDocument {
    #[serde(default)]
    pub config: Settings,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default, rename = "task")]
    pub tasks: BTreeMap<String, Task>,
    #[serde(default, rename = "job")]
    pub jobs: BTreeMap<String, Job>,
}

/// Borrowed view used for writing, so saving never clones the store.
#[derive(Debug, Serialize)]
pub(super) struct StoreDocumentRef<'a> {
    pub config: &'a Settings,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<&'a str, &'a str>,
    #[serde(rename = "task", skip_serializing_if = "BTreeMap::is_empty")]
    pub tasks: BTreeMap<&'a str, &'a Task>,
    #[serde(rename = "job", skip_serializing_if = "BTreeMap::is_empty")]
    pub jobs: BTreeMap<&'a str, &'a Job>,
}

pub(super) fn parse(contents: &str) -> Result<StoreDocument, toml::de::Error> {
    toml::from_str(contents)
}

pub(super) fn render(document: &StoreDocumentRef<'_>) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(document)
}
