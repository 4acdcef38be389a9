//! Scheduled job engine: declarative schedules, isolated execution, and
//! conditional delivery.
//!
//! Jobs persist as a pretty-printed JSON array at `<dataDir>/jobs.json`; per
//! job run logs append to `<dataDir>/runs/<jobId>.jsonl`. A tick loop
//! computes due jobs from their stamped `next_run_at_ms` and fires each run
//! on its own task with a 10-minute budget. Runs execute in fresh isolated
//! sessions (`cron-{jobId}-{runId}`) so scheduled activity never pollutes
//! interactive history.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// An agent prefixes its output with this token to say "I ran, nothing worth
/// reporting" — the run is recorded but not announced.
pub const SILENT_TOKEN: &str = "NO_ALERT";

const RUN_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const TICK_INTERVAL: Duration = Duration::from_secs(1);
const RUN_LOG_LIMIT: usize = 50;
const RUN_OUTPUT_LIMIT: usize = 4000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Schedule {
    /// "cron" | "every" | "at"
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expr: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub every_ms: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tz: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Payload {
    /// "agentTurn" | "systemEvent"
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Delivery {
    /// "announce" | "none"
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobState {
    #[serde(default)]
    pub next_run_at_ms: i64,
    #[serde(default)]
    pub last_run_at_ms: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remark: String,
    pub enabled: bool,
    pub schedule: Schedule,
    pub payload: Payload,
    pub delivery: Delivery,
    pub agent_id: String,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub state: JobState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub job_id: String,
    pub run_id: String,
    pub started_at: i64,
    pub ended_at: i64,
    /// "ok" | "error"
    pub status: String,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub announced: bool,
}

/// Arguments to one isolated run. The executor derives the session id as
/// `cron-{job_id}-{run_id}`.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub agent_id: String,
    pub model: String,
    pub job_id: String,
    pub run_id: String,
    pub message: String,
}

/// Runs an agent turn in a fresh isolated session, returning the full text.
pub type CronRunFn =
    Arc<dyn Fn(CancellationToken, RunArgs) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// Delivers announce-mode output to the user.
pub type AnnounceFn = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

pub struct Engine {
    data_dir: PathBuf,
    jobs: RwLock<HashMap<String, Job>>,
    run_fn: CronRunFn,
    announce: Option<AnnounceFn>,
}

impl Engine {
    pub fn new(data_dir: impl Into<PathBuf>, run_fn: CronRunFn, announce: Option<AnnounceFn>) -> Self {
        Self {
            data_dir: data_dir.into(),
            jobs: RwLock::new(HashMap::new()),
            run_fn,
            announce,
        }
    }

    /// Read jobs.json and stamp next-run times for enabled jobs.
    pub fn load(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.data_dir.join("runs"))?;

        let path = self.data_dir.join("jobs.json");
        let loaded: Vec<Job> = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| anyhow::anyhow!("parse jobs.json: {}", e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let mut jobs = self.jobs.write().expect("jobs lock");
        for mut job in loaded {
            if job.enabled {
                job.state.next_run_at_ms = compute_next_run(&job.schedule, now).unwrap_or(0);
            }
            jobs.insert(job.id.clone(), job);
        }
        info!(count = jobs.len(), "loaded cron jobs");
        Ok(())
    }

    /// Start the tick loop. Runs until the token is cancelled.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(TICK_INTERVAL) => {
                        for job in self.advance_due_jobs() {
                            let engine = Arc::clone(&self);
                            tokio::spawn(async move {
                                engine.execute_job(job).await;
                            });
                        }
                    }
                }
            }
        });
    }

    /// Collect jobs whose next run is due, advancing (or expiring) their
    /// schedule first so a slow run cannot double-fire the same slot.
    fn advance_due_jobs(&self) -> Vec<Job> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<Job> = {
            let jobs = self.jobs.read().expect("jobs lock");
            jobs.values()
                .filter(|j| {
                    j.enabled && j.state.next_run_at_ms > 0 && j.state.next_run_at_ms <= now_ms
                })
                .cloned()
                .collect()
        };
        if due.is_empty() {
            return due;
        }

        {
            let mut jobs = self.jobs.write().expect("jobs lock");
            for fired in &due {
                if let Some(j) = jobs.get_mut(&fired.id) {
                    if j.schedule.kind == "at" {
                        // One-shot: fire once, then disable in place.
                        j.enabled = false;
                        j.state.next_run_at_ms = 0;
                    } else {
                        j.state.next_run_at_ms =
                            compute_next_run(&j.schedule, Utc::now()).unwrap_or(0);
                    }
                }
            }
        }
        if let Err(e) = self.save() {
            error!("jobs save failed: {}", e);
        }
        due
    }

    pub fn add(&self, mut job: Job) -> anyhow::Result<Job> {
        if job.id.is_empty() {
            job.id = format!("job-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        }
        if job.created_at_ms == 0 {
            job.created_at_ms = Utc::now().timestamp_millis();
        }
        if job.enabled {
            job.state.next_run_at_ms = compute_next_run(&job.schedule, Utc::now()).unwrap_or(0);
        }
        self.jobs
            .write()
            .expect("jobs lock")
            .insert(job.id.clone(), job.clone());
        self.save()?;
        Ok(job)
    }

    pub fn update(&self, id: &str, patch: Job) -> anyhow::Result<Job> {
        let updated = {
            let mut jobs = self.jobs.write().expect("jobs lock");
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("job {:?} not found", id))?;
            if !patch.name.is_empty() {
                job.name = patch.name;
            }
            if !patch.remark.is_empty() {
                job.remark = patch.remark;
            }
            job.enabled = patch.enabled;
            if !patch.schedule.expr.is_empty()
                || patch.schedule.every_ms > 0
                || !patch.schedule.kind.is_empty()
            {
                job.schedule = patch.schedule;
            }
            if !patch.payload.message.is_empty() {
                job.payload = patch.payload;
            }
            if !patch.delivery.mode.is_empty() {
                job.delivery = patch.delivery;
            }
            if !patch.agent_id.is_empty() {
                job.agent_id = patch.agent_id;
            }
            job.state.next_run_at_ms = if job.enabled {
                compute_next_run(&job.schedule, Utc::now()).unwrap_or(0)
            } else {
                0
            };
            job.clone()
        };
        self.save()?;
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> anyhow::Result<()> {
        {
            let mut jobs = self.jobs.write().expect("jobs lock");
            if jobs.remove(id).is_none() {
                anyhow::bail!("job {:?} not found", id);
            }
        }
        self.save()
    }

    /// Fire a job immediately, off-schedule.
    pub fn run_now(self: Arc<Self>, id: &str) -> anyhow::Result<()> {
        let job = self
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("job {:?} not found", id))?;
        tokio::spawn(async move {
            self.execute_job(job).await;
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().expect("jobs lock").get(id).cloned()
    }

    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().expect("jobs lock").values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        jobs
    }

    /// Jobs for one agent; `"*"` = all.
    pub fn list_by_agent(&self, agent_id: &str) -> Vec<Job> {
        self.list()
            .into_iter()
            .filter(|j| agent_id == "*" || j.agent_id == agent_id)
            .collect()
    }

    /// Last 50 run records for a job, oldest first.
    pub fn list_runs(&self, job_id: &str) -> anyhow::Result<Vec<RunRecord>> {
        let path = self.data_dir.join("runs").join(format!("{}.jsonl", job_id));
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records: Vec<RunRecord> = data
            .lines()
            .filter(|l| !l.is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        if records.len() > RUN_LOG_LIMIT {
            records = records.split_off(records.len() - RUN_LOG_LIMIT);
        }
        Ok(records)
    }

    async fn execute_job(&self, job: Job) {
        let started_at = Utc::now().timestamp_millis();
        let agent_id = if job.agent_id.is_empty() {
            "main".to_string()
        } else {
            job.agent_id.clone()
        };
        let run_id = format!("run-{}", &uuid::Uuid::new_v4().to_string()[..8]);

        let mut record = RunRecord {
            job_id: job.id.clone(),
            run_id: run_id.clone(),
            started_at,
            ended_at: 0,
            status: String::new(),
            output: String::new(),
            error: String::new(),
            announced: false,
        };

        let mut output = String::new();
        match job.payload.kind.as_str() {
            "agentTurn" | "" => {
                let cancel = CancellationToken::new();
                let args = RunArgs {
                    agent_id: agent_id.clone(),
                    model: job.payload.model.clone(),
                    job_id: job.id.clone(),
                    run_id: run_id.clone(),
                    message: job.payload.message.clone(),
                };
                let result = tokio::time::timeout(RUN_TIMEOUT, (self.run_fn)(cancel.clone(), args)).await;
                match result {
                    Ok(Ok(text)) => {
                        record.status = "ok".into();
                        output = text;
                        record.output = bound_output(&output);
                    }
                    Ok(Err(e)) => {
                        record.status = "error".into();
                        record.error = e.to_string();
                    }
                    Err(_) => {
                        cancel.cancel();
                        record.status = "error".into();
                        record.error = format!("run timed out after {:?}", RUN_TIMEOUT);
                    }
                }
            }
            // systemEvent injects into the agent session without an LLM
            // round-trip; no announce.
            "systemEvent" => {
                record.status = "ok".into();
                record.output = "(system event)".into();
            }
            other => {
                record.status = "error".into();
                record.error = format!("unknown payload kind: {}", other);
            }
        }

        record.ended_at = Utc::now().timestamp_millis();

        if record.status == "ok" && job.delivery.mode == "announce" {
            if let Some(announce) = &self.announce {
                let trimmed = output.trim();
                if !trimmed.is_empty() && !trimmed.starts_with(SILENT_TOKEN) {
                    announce(&agent_id, &job.name, trimmed);
                    record.announced = true;
                }
            }
        }

        {
            let mut jobs = self.jobs.write().expect("jobs lock");
            if let Some(j) = jobs.get_mut(&job.id) {
                j.state.last_run_at_ms = started_at;
                j.state.last_status = record.status.clone();
            }
        }
        if let Err(e) = self.save() {
            error!(job = %job.id, "job state save failed: {}", e);
        }
        self.append_run_record(&record);

        match record.status.as_str() {
            "ok" => info!(job = %job.id, run = %run_id, announced = record.announced, "cron run ok"),
            _ => warn!(job = %job.id, run = %run_id, "cron run failed: {}", record.error),
        }
    }

    fn append_run_record(&self, record: &RunRecord) {
        use std::io::Write;
        let path = self
            .data_dir
            .join("runs")
            .join(format!("{}.jsonl", record.job_id));
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                let line = serde_json::to_string(record).unwrap_or_default();
                writeln!(f, "{}", line)
            });
        if let Err(e) = result {
            error!(job = %record.job_id, "run record append failed: {}", e);
        }
    }

    /// Persist the whole jobs list atomically (temp file + rename).
    fn save(&self) -> anyhow::Result<()> {
        let jobs = self.list();
        let path = self.data_dir.join("jobs.json");
        std::fs::create_dir_all(&self.data_dir)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&jobs)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn bound_output(output: &str) -> String {
    if output.chars().count() <= RUN_OUTPUT_LIMIT {
        return output.to_string();
    }
    let mut bounded: String = output.chars().take(RUN_OUTPUT_LIMIT).collect();
    bounded.push('…');
    bounded
}

/// Next fire time in unix ms, or None for unschedulable entries.
///
/// - `every` — now + interval.
/// - `cron` / `at` — croner parse of the expression, with the job timezone
///   applied; a failing 5-field parse is retried with a `"0 "` seconds
///   prefix before giving up.
pub fn compute_next_run(schedule: &Schedule, now: DateTime<Utc>) -> Option<i64> {
    match schedule.kind.as_str() {
        "every" => {
            if schedule.every_ms <= 0 {
                return None;
            }
            Some(now.timestamp_millis() + schedule.every_ms)
        }
        _ => {
            let cron = parse_cron_expr(&schedule.expr)?;
            if schedule.tz.is_empty() {
                cron.find_next_occurrence(&now, false)
                    .ok()
                    .map(|t| t.timestamp_millis())
            } else {
                let tz: chrono_tz::Tz = schedule.tz.parse().ok()?;
                cron.find_next_occurrence(&now.with_timezone(&tz), false)
                    .ok()
                    .map(|t| t.timestamp_millis())
            }
        }
    }
}

fn parse_cron_expr(expr: &str) -> Option<Cron> {
    let expr = expr.trim();
    if expr.is_empty() {
        return None;
    }
    // 5- and 6-field expressions both parse; a failing 5-field expression
    // gets one more chance with an explicit seconds column.
    if let Ok(cron) = Cron::new(expr).with_seconds_optional().parse() {
        return Some(cron);
    }
    Cron::new(&format!("0 {}", expr))
        .with_seconds_optional()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ok_run(output: &'static str) -> (CronRunFn, Arc<Mutex<Vec<RunArgs>>>) {
        let calls: Arc<Mutex<Vec<RunArgs>>> = Arc::new(Mutex::new(Vec::new()));
        let calls2 = calls.clone();
        let f: CronRunFn = Arc::new(move |_cancel, args| {
            calls2.lock().unwrap().push(args);
            Box::pin(async move { Ok(output.to_string()) })
        });
        (f, calls)
    }

    fn announce_recorder() -> (AnnounceFn, Arc<Mutex<Vec<(String, String, String)>>>) {
        let calls: Arc<Mutex<Vec<(String, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let calls2 = calls.clone();
        let f: AnnounceFn = Arc::new(move |agent, job, output| {
            calls2
                .lock()
                .unwrap()
                .push((agent.to_string(), job.to_string(), output.to_string()));
        });
        (f, calls)
    }

    fn every_job(id: &str, message: &str, delivery: &str) -> Job {
        Job {
            id: id.into(),
            name: format!("job {}", id),
            enabled: true,
            schedule: Schedule {
                kind: "every".into(),
                every_ms: 60_000,
                ..Default::default()
            },
            payload: Payload {
                kind: "agentTurn".into(),
                message: message.into(),
                model: String::new(),
            },
            delivery: Delivery {
                mode: delivery.into(),
            },
            agent_id: "main".into(),
            ..Default::default()
        }
    }

    async fn wait_for_run(engine: &Arc<Engine>, job_id: &str) -> RunRecord {
        for _ in 0..300 {
            let runs = engine.list_runs(job_id).unwrap();
            if let Some(r) = runs.last() {
                return r.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no run record for {}", job_id);
    }

    #[tokio::test]
    async fn silent_token_suppresses_announce() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _) = ok_run("NO_ALERT\nInbox empty.");
        let (announce, announced) = announce_recorder();
        let engine = Arc::new(Engine::new(dir.path(), run, Some(announce)));
        engine.load().unwrap();
        engine.add(every_job("j1", "Any new emails?", "announce")).unwrap();

        engine.clone().run_now("j1").unwrap();
        let record = wait_for_run(&engine, "j1").await;
        assert_eq!(record.status, "ok");
        assert!(!record.announced);
        assert!(announced.lock().unwrap().is_empty());
        assert!(record.output.contains("Inbox empty"));
    }

    #[tokio::test]
    async fn announce_fires_for_real_output() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _) = ok_run("You have 3 new emails.");
        let (announce, announced) = announce_recorder();
        let engine = Arc::new(Engine::new(dir.path(), run, Some(announce)));
        engine.load().unwrap();
        engine.add(every_job("j2", "Any new emails?", "announce")).unwrap();

        engine.clone().run_now("j2").unwrap();
        let record = wait_for_run(&engine, "j2").await;
        assert!(record.announced);
        let calls = announced.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "main");
        assert_eq!(calls[0].2, "You have 3 new emails.");
    }

    #[tokio::test]
    async fn delivery_none_never_announces() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _) = ok_run("important output");
        let (announce, announced) = announce_recorder();
        let engine = Arc::new(Engine::new(dir.path(), run, Some(announce)));
        engine.load().unwrap();
        engine.add(every_job("j3", "check", "none")).unwrap();

        engine.clone().run_now("j3").unwrap();
        let record = wait_for_run(&engine, "j3").await;
        assert!(!record.announced);
        assert!(announced.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_fn_receives_job_and_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (run, calls) = ok_run("done");
        let engine = Arc::new(Engine::new(dir.path(), run, None));
        engine.load().unwrap();
        engine.add(every_job("j4", "hello", "none")).unwrap();

        engine.clone().run_now("j4").unwrap();
        wait_for_run(&engine, "j4").await;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].agent_id, "main");
        assert_eq!(calls[0].job_id, "j4");
        assert!(calls[0].run_id.starts_with("run-"));
        assert_eq!(calls[0].message, "hello");
    }

    #[tokio::test]
    async fn failing_run_is_recorded_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let run: CronRunFn = Arc::new(|_cancel, _args| {
            Box::pin(async { Err(anyhow::anyhow!("agent not found")) })
        });
        let engine = Arc::new(Engine::new(dir.path(), run, None));
        engine.load().unwrap();
        engine.add(every_job("j5", "x", "announce")).unwrap();

        engine.clone().run_now("j5").unwrap();
        let record = wait_for_run(&engine, "j5").await;
        assert_eq!(record.status, "error");
        assert!(record.error.contains("agent not found"));
        assert!(!record.announced);

        let job = engine.get("j5").unwrap();
        assert_eq!(job.state.last_status, "error");
        assert!(job.state.last_run_at_ms > 0);
    }

    #[tokio::test]
    async fn jobs_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (run, _) = ok_run("x");
            let engine = Arc::new(Engine::new(dir.path(), run, None));
            engine.load().unwrap();
            engine.add(every_job("keep", "msg", "none")).unwrap();
        }
        let (run, _) = ok_run("x");
        let engine = Arc::new(Engine::new(dir.path(), run, None));
        engine.load().unwrap();
        let jobs = engine.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "keep");
        assert!(jobs[0].state.next_run_at_ms > 0);
    }

    #[tokio::test]
    async fn long_output_is_bounded_in_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let big: &'static str = Box::leak("y".repeat(10_000).into_boxed_str());
        let (run, _) = ok_run(big);
        let engine = Arc::new(Engine::new(dir.path(), run, None));
        engine.load().unwrap();
        engine.add(every_job("j6", "x", "none")).unwrap();

        engine.clone().run_now("j6").unwrap();
        let record = wait_for_run(&engine, "j6").await;
        assert_eq!(record.output.chars().count(), RUN_OUTPUT_LIMIT + 1);
        assert!(record.output.ends_with('…'));
    }

    #[tokio::test]
    async fn run_log_keeps_last_50() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _) = ok_run("x");
        let engine = Arc::new(Engine::new(dir.path(), run, None));
        engine.load().unwrap();
        for i in 0..60 {
            engine.append_run_record(&RunRecord {
                job_id: "j7".into(),
                run_id: format!("run-{}", i),
                started_at: i,
                ended_at: i,
                status: "ok".into(),
                output: String::new(),
                error: String::new(),
                announced: false,
            });
        }
        let runs = engine.list_runs("j7").unwrap();
        assert_eq!(runs.len(), RUN_LOG_LIMIT);
        assert_eq!(runs[0].run_id, "run-10");
        assert_eq!(runs.last().unwrap().run_id, "run-59");
    }

    #[tokio::test]
    async fn unknown_payload_kind_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _) = ok_run("x");
        let engine = Arc::new(Engine::new(dir.path(), run, None));
        engine.load().unwrap();
        let mut job = every_job("j8", "x", "none");
        job.payload.kind = "telepathy".into();
        engine.add(job).unwrap();

        engine.clone().run_now("j8").unwrap();
        let record = wait_for_run(&engine, "j8").await;
        assert_eq!(record.status, "error");
        assert!(record.error.contains("telepathy"));
    }

    #[test]
    fn next_run_for_every_schedules_ahead() {
        let now = Utc::now();
        let schedule = Schedule {
            kind: "every".into(),
            every_ms: 300_000,
            ..Default::default()
        };
        let next = compute_next_run(&schedule, now).unwrap();
        assert_eq!(next, now.timestamp_millis() + 300_000);
    }

    #[test]
    fn next_run_for_cron_expression() {
        let now = Utc::now();
        let schedule = Schedule {
            kind: "cron".into(),
            expr: "0 9 * * *".into(),
            ..Default::default()
        };
        let next = compute_next_run(&schedule, now).unwrap();
        assert!(next > now.timestamp_millis());
        assert!(next <= now.timestamp_millis() + 24 * 3600 * 1000 + 1000);
    }

    #[test]
    fn cron_timezone_is_applied() {
        let now = Utc::now();
        let utc = compute_next_run(
            &Schedule {
                kind: "cron".into(),
                expr: "0 9 * * *".into(),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        let shanghai = compute_next_run(
            &Schedule {
                kind: "cron".into(),
                expr: "0 9 * * *".into(),
                tz: "Asia/Shanghai".into(),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        // 09:00 Shanghai is 01:00 UTC — different instants except when the
        // two windows collapse, which cannot happen for both at once.
        assert_ne!(utc, shanghai);
    }

    #[test]
    fn invalid_expressions_yield_none() {
        assert!(compute_next_run(
            &Schedule {
                kind: "cron".into(),
                expr: "not a cron".into(),
                ..Default::default()
            },
            Utc::now()
        )
        .is_none());
        assert!(compute_next_run(
            &Schedule {
                kind: "every".into(),
                every_ms: 0,
                ..Default::default()
            },
            Utc::now()
        )
        .is_none());
    }

    #[tokio::test]
    async fn update_and_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (run, _) = ok_run("x");
        let engine = Arc::new(Engine::new(dir.path(), run, None));
        engine.load().unwrap();
        engine.add(every_job("j9", "old message", "none")).unwrap();

        let mut patch = Job::default();
        patch.enabled = true;
        patch.payload = Payload {
            kind: "agentTurn".into(),
            message: "new message".into(),
            model: String::new(),
        };
        let updated = engine.update("j9", patch).unwrap();
        assert_eq!(updated.payload.message, "new message");

        engine.remove("j9").unwrap();
        assert!(engine.get("j9").is_none());
        assert!(engine.remove("j9").is_err());
    }
}
