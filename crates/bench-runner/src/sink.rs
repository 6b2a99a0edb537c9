use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const FACTS_DIR: &str = "facts";
const FACTS_TRIALS_FILE: &str = "trials.jsonl";
const FACTS_RUN_MANIFEST_FILE: &str = "run_manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifestRecord {
    pub schema_version: String,
    pub run_id: String,
    pub created_at: String,
    pub task: String,
    pub trials_planned: usize,
    pub concurrent: bool,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRow {
    pub run_id: String,
    pub trial_id: String,
    pub passed: bool,
    pub answer_submitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_digest: Option<String>,
    pub message: String,
    pub trial_dir: String,
}

/// Machine-readable per-session facts, one append-only row per trial.
pub trait RunSink {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()>;
    fn append_trial_row(&mut self, row: &TrialRow) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlRunSink {
    run_manifest_path: PathBuf,
    trials_writer: BufWriter<File>,
}

impl JsonlRunSink {
    pub fn new(session_dir: &Path) -> Result<Self> {
        let facts_dir = session_dir.join(FACTS_DIR);
        fs::create_dir_all(&facts_dir)?;
        Ok(Self {
            run_manifest_path: facts_dir.join(FACTS_RUN_MANIFEST_FILE),
            trials_writer: open_append(facts_dir.join(FACTS_TRIALS_FILE))?,
        })
    }
}

impl RunSink for JsonlRunSink {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()> {
        fs::write(&self.run_manifest_path, serde_json::to_vec_pretty(run)?)?;
        Ok(())
    }

    fn append_trial_row(&mut self, row: &TrialRow) -> Result<()> {
        serde_json::to_writer(&mut self.trials_writer, row)?;
        self.trials_writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.trials_writer.flush()?;
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}
