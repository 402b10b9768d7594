// Manual-intervention alerts written as JSON files for operators and external tooling.

use crate::error::ManualIntervention;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertRecord<'a> {
    node_id: &'a str,
    raised_at: DateTime<Utc>,
    #[serde(flatten)]
    intervention: &'a ManualIntervention,
}

/// Write `intervention` to `<dir>/<service>-<unix-secs>.json`; returns the file path.
pub fn write_alert(
    dir: &Path,
    node_id: &str,
    intervention: &ManualIntervention,
    raised_at: DateTime<Utc>,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "{}-{}.json",
        intervention.service,
        raised_at.timestamp()
    ));
    let record = AlertRecord {
        node_id,
        raised_at,
        intervention,
    };
    std::fs::write(&path, serde_json::to_vec_pretty(&record)?)?;
    Ok(path)
}
