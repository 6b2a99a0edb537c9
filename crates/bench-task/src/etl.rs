use crate::{GradeReport, Task};
use anyhow::{Context, Result};
use bench_core::{ensure_dir, run_python, sha256_bytes, unified_diff};
use chrono::{NaiveDate, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub const ENTRY_POINT: &str = "run_etl";

const CYCLES: usize = 10;
const ROWS_PER_CYCLE: usize = 100;
const LATE_CYCLE: usize = 8;
const RERUN_CYCLE: usize = 5;
const EXPECTED_ROWS: i64 = 1001;
// Deliberately not lexicographically ordered across month boundaries.
const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";
const MISSING_ENTRY_MARKER: &str = "ETLBENCH_MISSING_ENTRY_POINT";

// Reference broken artifact. Seeded bugs: no primary key, textual
// DD/MM/YYYY watermark compared as a string, strict `>` boundary, no
// deterministic ordering, blind append on re-run.
const BROKEN_CODE: &str = r#"import sqlite3
from datetime import datetime


def run_etl():
    dest = sqlite3.connect(WAREHOUSE_DB)
    dest_c = dest.cursor()

    # Create table if not exists
    dest_c.execute('''CREATE TABLE IF NOT EXISTS dim_orders
                      (order_id INTEGER,
                       customer_id INTEGER,
                       amount REAL,
                       created_at TEXT,
                       loaded_at TEXT)''')

    # High watermark from the load timestamp column
    try:
        dest_c.execute("SELECT MAX(created_at) FROM dim_orders")
        watermark = dest_c.fetchone()[0]
    except sqlite3.Error:
        watermark = None
    if watermark is None:
        watermark = '01/01/1900 00:00:00'
    if VERBOSE:
        print(f"current watermark: {watermark}")

    source = sqlite3.connect(SOURCE_DB)
    src_c = source.cursor()
    src_c.execute(
        "SELECT order_id, customer_id, amount, created_at FROM orders "
        f"WHERE created_at > '{watermark}'")
    rows = src_c.fetchall()
    if not rows:
        if VERBOSE:
            print("no new data found")
        dest.close()
        source.close()
        return

    if VERBOSE:
        print(f"extracting {len(rows)} rows")
    loaded_at = datetime.now().strftime("%d/%m/%Y %H:%M:%S")
    dest_c.executemany(
        "INSERT INTO dim_orders VALUES (?, ?, ?, ?, ?)",
        [row + (loaded_at,) for row in rows])
    dest.commit()
    dest.close()
    source.close()


if __name__ == "__main__":
    run_etl()
"#;

/// The ETL debugging task: the agent is handed [`BROKEN_CODE`] and graded by
/// replaying a ten-cycle synthetic ingestion workload against whatever it
/// submits.
pub struct EtlFixTask {
    pipeline_timeout: Duration,
}

impl EtlFixTask {
    pub fn new() -> Self {
        Self {
            pipeline_timeout: Duration::from_secs(60),
        }
    }

    fn persist_artifacts(&self, trial_dir: &Path, code: &str) -> Result<()> {
        ensure_dir(trial_dir)?;
        fs::write(trial_dir.join("submitted_code.py"), code)
            .context("writing submitted_code.py")?;
        let diff = unified_diff(
            &self.broken_code(),
            code,
            "broken_code.py",
            "submitted_code.py",
        );
        fs::write(trial_dir.join("submitted_code.diff"), diff)
            .context("writing submitted_code.diff")?;
        Ok(())
    }

    fn invoke_pipeline(
        &self,
        code: &str,
        source_db: &Path,
        warehouse_db: &Path,
        verbose: bool,
        cycle: usize,
    ) -> std::result::Result<(), GradeReport> {
        let driver = build_driver(code, source_db, warehouse_db, verbose);
        match run_python(&driver, self.pipeline_timeout) {
            Ok(out) if out.timed_out => Err(GradeReport::fail(format!(
                "pipeline run timed out on cycle {}",
                cycle + 1
            ))),
            Ok(out) if out.success() => {
                let stdout = out.stdout.trim();
                if verbose && !stdout.is_empty() {
                    debug!(cycle = cycle + 1, %stdout, "pipeline output");
                }
                Ok(())
            }
            Ok(out) if out.stderr.contains(MISSING_ENTRY_MARKER) => Err(GradeReport::fail(
                format!("Missing required function: {}", ENTRY_POINT),
            )),
            Ok(out) => Err(GradeReport::fail(format!(
                "pipeline run failed on cycle {}: {}",
                cycle + 1,
                stderr_tail(&out.stderr)
            ))),
            Err(e) => Err(GradeReport::fail(format!(
                "pipeline run failed on cycle {}: {:#}",
                cycle + 1,
                e
            ))),
        }
    }
}

impl Default for EtlFixTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for EtlFixTask {
    fn name(&self) -> &str {
        "task_etl"
    }

    fn setup(&self) -> Result<()> {
        info!(task = self.name(), "task setup ok");
        Ok(())
    }

    fn prompt(&self) -> String {
        format!(
            r#"You are a senior data engineer fixing a broken incremental ETL job.

The environment provides two variables to the code under test:
- SOURCE_DB: path to the source SQLite database (read-only).
- WAREHOUSE_DB: path to the destination SQLite database.

Find and fix all bugs so that after 10 simulated days of incremental loads,
the final table matches exactly the result of loading all data from scratch:
no duplicates, no missing rows. The job is scheduled and may run more than
once per day, so re-running it against unchanged source data must not change
the warehouse. Business users sometimes backfill historical orders, so rows
can arrive in the source out of timestamp order.

Hint: is the current watermark column always unique and increasing for
incremental loads?

Rules:
- Use the `python_expression` tool to test and debug while you work.
- Submit the complete fixed code as a string with the `submit_answer` tool;
  do not output code directly.
- Preserve the original structure except where a fix requires otherwise, and
  comment the non-obvious decisions.
- The fixed code must still define a `{entry}()` function taking no
  arguments that performs one incremental load cycle.

Here is the broken code:
```python
{broken}
```
"#,
            entry = ENTRY_POINT,
            broken = self.broken_code()
        )
    }

    fn broken_code(&self) -> String {
        BROKEN_CODE.to_string()
    }

    fn grade(&self, trial_dir: &Path, submission: Option<&str>, verbose: bool) -> GradeReport {
        let Some(code) = submission else {
            return GradeReport::fail("no answer was submitted; nothing to grade");
        };
        if let Err(e) = self.persist_artifacts(trial_dir, code) {
            return GradeReport::fail(format!("failed to persist submitted artifact: {:#}", e));
        }
        info!(
            trial_dir = %trial_dir.display(),
            digest = %sha256_bytes(code.as_bytes()),
            "grading submitted artifact"
        );

        let source_db = trial_dir.join("source.db");
        let warehouse_db = trial_dir.join("warehouse.db");
        let conn = match prepare_source(&source_db, &warehouse_db) {
            Ok(conn) => conn,
            Err(e) => return GradeReport::fail(format!("grading setup failed: {:#}", e)),
        };

        let base_date = NaiveDate::from_ymd_opt(2023, 1, 25).expect("valid base date");
        let mut rng = StdRng::seed_from_u64(trial_seed(trial_dir));
        let mut order_id: i64 = 1;

        for cycle in 0..CYCLES {
            debug!(cycle = cycle + 1, "grader cycle");
            let day = base_date + chrono::Duration::days(cycle as i64);
            if let Err(e) = insert_cycle_rows(&conn, day, &mut rng, &mut order_id) {
                return GradeReport::fail(format!(
                    "source data insertion failed on cycle {}: {:#}",
                    cycle + 1,
                    e
                ));
            }

            // Late-arriving row: logically a day-two timestamp, inserted
            // after nine days of rows already exist. Breaks any watermark
            // derived from wall-clock timestamps.
            if cycle == LATE_CYCLE {
                let late_at = (base_date + chrono::Duration::days(1))
                    .and_hms_opt(12, 0, 0)
                    .expect("valid late timestamp");
                if let Err(e) = insert_order(&conn, order_id, rng.gen_range(1..=1000), 100.0, late_at)
                {
                    return GradeReport::fail(format!(
                        "source data insertion failed on cycle {}: {:#}",
                        cycle + 1,
                        e
                    ));
                }
                order_id += 1;
            }

            if let Err(report) =
                self.invoke_pipeline(code, &source_db, &warehouse_db, verbose, cycle)
            {
                return report;
            }
            // Idempotency probe: a second run with no new source data.
            if cycle == RERUN_CYCLE {
                if let Err(report) =
                    self.invoke_pipeline(code, &source_db, &warehouse_db, verbose, cycle)
                {
                    return report;
                }
            }
        }
        drop(conn);

        validate_warehouse(&warehouse_db)
    }
}

fn build_driver(code: &str, source_db: &Path, warehouse_db: &Path, verbose: bool) -> String {
    // Rebinding __name__ keeps an `if __name__ == "__main__"` guard in the
    // submission inert, matching exec-into-a-namespace semantics.
    format!(
        "SOURCE_DB = r\"{source}\"\n\
         WAREHOUSE_DB = r\"{warehouse}\"\n\
         VERBOSE = {verbose}\n\
         __name__ = \"etl_submission\"\n\
         \n\
         {code}\n\
         \n\
         if \"{entry}\" not in dir():\n\
         {indent}import sys\n\
         {indent}sys.stderr.write(\"{marker}\")\n\
         {indent}raise SystemExit(3)\n\
         {entry}()\n",
        source = source_db.display(),
        warehouse = warehouse_db.display(),
        verbose = if verbose { "True" } else { "False" },
        code = code,
        entry = ENTRY_POINT,
        indent = "    ",
        marker = MISSING_ENTRY_MARKER,
    )
}

/// Removes any stores left by an earlier grade of the same trial directory
/// and creates a fresh source schema.
fn prepare_source(source_db: &Path, warehouse_db: &Path) -> Result<Connection> {
    for stale in [source_db, warehouse_db] {
        if stale.exists() {
            fs::remove_file(stale)
                .with_context(|| format!("removing stale store {}", stale.display()))?;
        }
    }
    let conn = Connection::open(source_db)
        .with_context(|| format!("opening source store {}", source_db.display()))?;
    conn.execute(
        "CREATE TABLE orders (
            order_id INTEGER PRIMARY KEY,
            customer_id INTEGER,
            amount REAL,
            created_at TEXT
         )",
        [],
    )
    .context("creating orders schema")?;
    Ok(conn)
}

fn insert_cycle_rows(
    conn: &Connection,
    day: NaiveDate,
    rng: &mut StdRng,
    order_id: &mut i64,
) -> Result<()> {
    for _ in 0..ROWS_PER_CYCLE {
        let created_at = day
            .and_hms_opt(
                rng.gen_range(0..24),
                rng.gen_range(0..60),
                rng.gen_range(0..60),
            )
            .expect("valid random time of day");
        let amount = (rng.gen_range(10.0..500.0_f64) * 100.0).round() / 100.0;
        insert_order(conn, *order_id, rng.gen_range(1..=1000), amount, created_at)?;
        *order_id += 1;
    }
    Ok(())
}

fn insert_order(
    conn: &Connection,
    order_id: i64,
    customer_id: i64,
    amount: f64,
    created_at: NaiveDateTime,
) -> Result<()> {
    conn.execute(
        "INSERT INTO orders (order_id, customer_id, amount, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            order_id,
            customer_id,
            amount,
            created_at.format(TIMESTAMP_FORMAT).to_string()
        ],
    )
    .with_context(|| format!("inserting order {}", order_id))?;
    Ok(())
}

/// Both checks are computed and reported independently; the overall pass
/// requires both.
fn validate_warehouse(warehouse_db: &Path) -> GradeReport {
    let (row_count, duplicate_ids) = match warehouse_checks(warehouse_db) {
        Ok(counts) => counts,
        Err(e) => return GradeReport::fail(format!("warehouse validation failed: {:#}", e)),
    };
    let count_ok = row_count == EXPECTED_ROWS;
    let unique_ok = duplicate_ids == 0;
    let message = format!(
        "row count check: {} (expected {}, actual {})\n\
         duplicate order_id check: {} (expected 0, actual {})",
        check_word(count_ok),
        EXPECTED_ROWS,
        row_count,
        check_word(unique_ok),
        duplicate_ids
    );
    GradeReport {
        passed: count_ok && unique_ok,
        message,
    }
}

fn warehouse_checks(warehouse_db: &Path) -> Result<(i64, i64)> {
    let conn = Connection::open(warehouse_db)
        .with_context(|| format!("opening warehouse store {}", warehouse_db.display()))?;
    let row_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM dim_orders", [], |row| row.get(0))
        .context("counting warehouse rows")?;
    let duplicate_ids: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM (
                SELECT order_id FROM dim_orders GROUP BY order_id HAVING COUNT(*) > 1
             )",
            [],
            |row| row.get(0),
        )
        .context("counting duplicated order ids")?;
    Ok((row_count, duplicate_ids))
}

fn check_word(ok: bool) -> &'static str {
    if ok {
        "passed"
    } else {
        "FAILED"
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(6);
    lines[start..].join("\n")
}

/// Workload seeding is deterministic per trial directory, so a trial's
/// synthetic table is reproducible after the fact.
fn trial_seed(trial_dir: &Path) -> u64 {
    let digest = sha256_bytes(trial_dir.to_string_lossy().as_bytes());
    let hex = digest.trim_start_matches("sha256:");
    u64::from_str_radix(&hex[..16], 16).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::python_available;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    // A corrected submission: identifier watermark, primary key, upsert,
    // deterministic extraction order.
    const FIXED_CODE: &str = r#"import sqlite3
from datetime import datetime


def run_etl():
    dest = sqlite3.connect(WAREHOUSE_DB)
    dest_c = dest.cursor()
    dest_c.execute('''CREATE TABLE IF NOT EXISTS dim_orders
                      (order_id INTEGER PRIMARY KEY,
                       customer_id INTEGER,
                       amount REAL,
                       created_at TEXT,
                       loaded_at TEXT)''')

    # order_id is unique and strictly increasing, unlike created_at
    dest_c.execute("SELECT MAX(order_id) FROM dim_orders")
    watermark = dest_c.fetchone()[0]
    if watermark is None:
        watermark = 0

    source = sqlite3.connect(SOURCE_DB)
    rows = source.execute(
        "SELECT order_id, customer_id, amount, created_at FROM orders "
        "WHERE order_id > ? ORDER BY order_id", (watermark,)).fetchall()
    if rows:
        loaded_at = datetime.now().strftime("%Y-%m-%d %H:%M:%S")
        dest_c.executemany(
            "INSERT OR REPLACE INTO dim_orders VALUES (?, ?, ?, ?, ?)",
            [row + (loaded_at,) for row in rows])
        dest.commit()
    dest.close()
    source.close()


if __name__ == "__main__":
    run_etl()
"#;

    fn temp_trial_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!("etlbench_task_{}_{}", label, nanos))
    }

    #[test]
    fn absent_submission_fails_with_diagnostic() {
        let task = EtlFixTask::new();
        let dir = temp_trial_dir("absent");
        let report = task.grade(&dir, None, false);
        assert!(!report.passed);
        assert!(!report.message.is_empty());
    }

    #[test]
    fn driver_binds_stores_and_neutralizes_main_guard() {
        let driver = build_driver(
            "def run_etl():\n    pass\n",
            Path::new("/tmp/s.db"),
            Path::new("/tmp/w.db"),
            true,
        );
        assert!(driver.contains("SOURCE_DB = r\"/tmp/s.db\""));
        assert!(driver.contains("WAREHOUSE_DB = r\"/tmp/w.db\""));
        assert!(driver.contains("VERBOSE = True"));
        assert!(driver.contains("__name__ = \"etl_submission\""));
        assert!(driver.ends_with("run_etl()\n"));
    }

    #[test]
    fn trial_seed_is_stable_per_directory() {
        let a = trial_seed(Path::new("/sandbox/run_001"));
        assert_eq!(a, trial_seed(Path::new("/sandbox/run_001")));
        assert_ne!(a, trial_seed(Path::new("/sandbox/run_002")));
    }

    #[test]
    fn missing_entry_point_reports_required_function() {
        if !python_available() {
            return;
        }
        let task = EtlFixTask::new();
        let dir = temp_trial_dir("noentry");
        let report = task.grade(&dir, Some("x = 1\n"), false);
        assert!(!report.passed);
        assert!(report.message.contains("Missing required function: run_etl"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn execution_fault_is_tagged_with_cycle() {
        if !python_available() {
            return;
        }
        let task = EtlFixTask::new();
        let dir = temp_trial_dir("raises");
        let report = task.grade(&dir, Some("def run_etl():\n    raise RuntimeError('kaput')\n"), false);
        assert!(!report.passed);
        assert!(report.message.contains("cycle 1"));
        assert!(report.message.contains("kaput"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn broken_reference_artifact_fails_grading() {
        if !python_available() {
            return;
        }
        let task = EtlFixTask::new();
        let dir = temp_trial_dir("broken");
        let broken = task.broken_code();
        let report = task.grade(&dir, Some(&broken), false);
        assert!(!report.passed, "broken artifact must not pass: {}", report.message);
        // Both validation lines are always reported.
        assert!(report.message.contains("row count check"));
        assert!(report.message.contains("duplicate order_id check"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrected_artifact_passes_grading() {
        if !python_available() {
            return;
        }
        let task = EtlFixTask::new();
        let dir = temp_trial_dir("fixed");
        let report = task.grade(&dir, Some(FIXED_CODE), false);
        assert!(report.passed, "fixed artifact should pass: {}", report.message);
        assert!(report.message.contains("actual 1001"));
        // Grading persisted the artifact and its audit diff.
        assert!(dir.join("submitted_code.py").exists());
        assert!(dir.join("submitted_code.diff").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn regrade_of_same_trial_dir_resets_stores() {
        if !python_available() {
            return;
        }
        let task = EtlFixTask::new();
        let dir = temp_trial_dir("regrade");
        let first = task.grade(&dir, Some(FIXED_CODE), false);
        let second = task.grade(&dir, Some(FIXED_CODE), false);
        assert!(first.passed, "{}", first.message);
        assert!(second.passed, "{}", second.message);
        let _ = fs::remove_dir_all(dir);
    }
}
