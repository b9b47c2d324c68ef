//! Pre-flight checks run before the server starts.
//!
//! Missing model files only degrade the service; a build without an
//! inference backend cannot answer anything and is reported as fatal.

use std::{fmt, path::Path};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    adapter::{self, AdapterConfig},
    config::AppConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Missing,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Warning => "warning",
            CheckStatus::Missing => "missing",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckItem {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    pub items: Vec<CheckItem>,
}

impl SetupReport {
    pub fn backend_available(&self) -> bool {
        self.status_of("inference backend") == Some(CheckStatus::Ok)
    }

    /// True when every on-disk artifact needed by the engine was found.
    pub fn model_files_present(&self) -> bool {
        self.items
            .iter()
            .filter(|item| item.name != "inference backend")
            .all(|item| item.status != CheckStatus::Missing)
    }

    pub fn status_of(&self, name: &str) -> Option<CheckStatus> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .map(|item| item.status)
    }

    pub fn log(&self) {
        for item in &self.items {
            match item.status {
                CheckStatus::Ok => info!(check = item.name, detail = %item.detail, "ok"),
                status => warn!(check = item.name, %status, detail = %item.detail, "setup check failed"),
            }
        }
    }
}

pub fn run_checks(config: &AppConfig) -> SetupReport {
    let mut items = vec![backend_check()];
    items.push(file_check("base model", &config.base_model_path));

    items.push(if config.tokenizer_path.exists() {
        ok("tokenizer", config.tokenizer_path.display().to_string())
    } else {
        CheckItem {
            name: "tokenizer",
            status: CheckStatus::Warning,
            detail: format!(
                "{} not found; will fetch `{}` from the hub",
                config.tokenizer_path.display(),
                config.base_model_id
            ),
        }
    });

    items.extend(adapter_checks(&config.adapter_path));
    SetupReport { items }
}

fn adapter_checks(dir: &Path) -> Vec<CheckItem> {
    if !dir.is_dir() {
        return vec![missing(
            "adapter directory",
            format!("{} does not exist", dir.display()),
        )];
    }

    let config_item = match AdapterConfig::load(dir) {
        Ok(config) => ok(
            "adapter config",
            format!("rank {} alpha {}", config.r, config.lora_alpha),
        ),
        Err(err) => missing("adapter config", err.to_string()),
    };

    vec![
        ok("adapter directory", dir.display().to_string()),
        config_item,
        file_check("adapter weights", &adapter::weights_path(dir)),
    ]
}

fn backend_check() -> CheckItem {
    #[cfg(feature = "tch-backend")]
    {
        let detail = if tch::Cuda::is_available() {
            format!("libtorch with {} CUDA device(s)", tch::Cuda::device_count())
        } else {
            "libtorch (cpu only)".to_string()
        };
        ok("inference backend", detail)
    }
    #[cfg(not(feature = "tch-backend"))]
    {
        missing(
            "inference backend",
            "built without the `tch-backend` feature".to_string(),
        )
    }
}

fn file_check(name: &'static str, path: &Path) -> CheckItem {
    if path.is_file() {
        ok(name, path.display().to_string())
    } else {
        missing(name, format!("{} not found", path.display()))
    }
}

fn ok(name: &'static str, detail: String) -> CheckItem {
    CheckItem {
        name,
        status: CheckStatus::Ok,
        detail,
    }
}

fn missing(name: &'static str, detail: String) -> CheckItem {
    CheckItem {
        name,
        status: CheckStatus::Missing,
        detail,
    }
}
