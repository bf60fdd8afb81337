use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use log::trace;
use rusqlite::OptionalExtension;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::database::{Database, DbConn};
use crate::error::AutoscanError;
use crate::migrate::Migrator;
use crate::scan::Scan;
use crate::targets::Target;

/// Injectable wall clock so tests can freeze and advance time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const SQLITE_UPSERT: &str = "\
INSERT INTO scan (folder, priority, time) VALUES (?1, ?2, ?3) \
ON CONFLICT (folder) DO UPDATE SET \
priority = MAX(excluded.priority, scan.priority), \
time = excluded.time";

const POSTGRES_UPSERT: &str = "\
INSERT INTO scan (folder, priority, time) VALUES ($1, $2, $3) \
ON CONFLICT (folder) DO UPDATE SET \
priority = GREATEST(excluded.priority, scan.priority), \
time = excluded.time";

const SQLITE_GET_AVAILABLE: &str = "\
SELECT folder, priority, time FROM scan WHERE time < ?1 \
ORDER BY priority DESC, time ASC, folder ASC LIMIT 1";

const POSTGRES_GET_AVAILABLE: &str = "\
SELECT folder, priority, time FROM scan WHERE time < $1 \
ORDER BY priority DESC, time ASC, folder ASC LIMIT 1";

const SQLITE_DELETE: &str = "DELETE FROM scan WHERE folder = ?1";
const POSTGRES_DELETE: &str = "DELETE FROM scan WHERE folder = $1";

const COUNT_REMAINING: &str = "SELECT COUNT(1) FROM scan";

/// Durable fingerprint-keyed store of pending scans.
struct ScanStore {
    db: Arc<Database>,
    clock: Clock,
}

impl ScanStore {
    /// Inserts or coalesces every scan inside one transaction. On folder
    /// conflict the row keeps the highest priority and takes the new time.
    fn upsert(&self, scans: &[Scan]) -> Result<(), AutoscanError> {
        match &mut *self.db.conn() {
            DbConn::Sqlite(conn) => {
                let tx = conn.transaction()?;
                for scan in scans {
                    tx.execute(
                        SQLITE_UPSERT,
                        rusqlite::params![scan.folder, scan.priority, scan.time.timestamp_millis()],
                    )?;
                }
                tx.commit()?;
            }
            DbConn::Postgres(client) => {
                let mut tx = client.transaction()?;
                for scan in scans {
                    tx.execute(
                        POSTGRES_UPSERT,
                        &[&scan.folder, &scan.priority, &scan.time.timestamp_millis()],
                    )?;
                }
                tx.commit()?;
            }
        }

        Ok(())
    }

    /// Returns the single best due scan: priority descending, then oldest,
    /// then folder order. `NoScans` when nothing has aged past `min_age`.
    fn get_available(&self, min_age: Duration) -> Result<Scan, AutoscanError> {
        let min_age = chrono::Duration::from_std(min_age)
            .map_err(|err| AutoscanError::Fatal(format!("minimum age out of range: {err}")))?;
        let cutoff = ((self.clock)() - min_age).timestamp_millis();

        let row = match &mut *self.db.conn() {
            DbConn::Sqlite(conn) => conn
                .query_row(SQLITE_GET_AVAILABLE, [cutoff], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i32>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .optional()
                .map_err(|err| AutoscanError::Fatal(format!("get available scan: {err}")))?,
            DbConn::Postgres(client) => client
                .query_opt(POSTGRES_GET_AVAILABLE, &[&cutoff])
                .map_err(|err| AutoscanError::Fatal(format!("get available scan: {err}")))?
                .map(|row| (row.get(0), row.get(1), row.get(2))),
        };

        let (folder, priority, millis) = row.ok_or(AutoscanError::NoScans)?;
        let time = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| AutoscanError::Fatal(format!("bad scan time: {millis}")))?;

        Ok(Scan {
            folder,
            priority,
            time,
        })
    }

    fn delete(&self, folder: &str) -> Result<(), AutoscanError> {
        match &mut *self.db.conn() {
            DbConn::Sqlite(conn) => {
                conn.execute(SQLITE_DELETE, [folder])
                    .map_err(|err| AutoscanError::Fatal(format!("delete scan: {err}")))?;
            }
            DbConn::Postgres(client) => {
                client
                    .execute(POSTGRES_DELETE, &[&folder])
                    .map_err(|err| AutoscanError::Fatal(format!("delete scan: {err}")))?;
            }
        }

        Ok(())
    }

    fn remaining(&self) -> Result<i64, AutoscanError> {
        match &mut *self.db.conn() {
            DbConn::Sqlite(conn) => Ok(conn.query_row(COUNT_REMAINING, [], |row| row.get(0))?),
            DbConn::Postgres(client) => {
                let row = client.query_one(COUNT_REMAINING, &[])?;
                Ok(row.get(0))
            }
        }
    }
}

pub struct ProcessorConfig {
    pub anchors: Vec<PathBuf>,
    pub minimum_age: Duration,
}

/// The heart of the pipeline: accepts scans from every trigger, selects due
/// work, and fans it out to all targets before removing the row.
pub struct Processor {
    anchors: Vec<PathBuf>,
    minimum_age: Duration,
    store: ScanStore,
    processed: AtomicI64,
}

impl Processor {
    pub fn new(config: ProcessorConfig, db: Arc<Database>) -> Result<Self, AutoscanError> {
        Self::with_clock(config, db, Arc::new(Utc::now))
    }

    pub fn with_clock(
        config: ProcessorConfig,
        db: Arc<Database>,
        clock: Clock,
    ) -> Result<Self, AutoscanError> {
        let migrator = Migrator::new(&db)?;
        migrator.migrate(&db, "processor")?;

        Ok(Self {
            anchors: config.anchors,
            minimum_age: config.minimum_age,
            store: ScanStore { db, clock },
            processed: AtomicI64::new(0),
        })
    }

    /// Entry point for every trigger. Safe for concurrent callers; the whole
    /// batch commits atomically.
    pub fn submit(&self, scans: Vec<Scan>) -> Result<(), AutoscanError> {
        if scans.is_empty() {
            return Ok(());
        }

        self.store.upsert(&scans)
    }

    /// Probes every target in parallel. A fatal error wins over an
    /// unavailable one when both occur.
    pub async fn check_availability(
        &self,
        targets: &[Arc<dyn Target>],
    ) -> Result<(), AutoscanError> {
        let results = join_all(targets.iter().map(|target| target.available())).await;
        join_target_results(results)
    }

    /// Executes one dispatch cycle: fetch the best due scan, verify anchors,
    /// fan out to all targets, and delete the row only when every target
    /// acknowledged it. Failures leave the row for a later retry.
    pub async fn process(&self, targets: &[Arc<dyn Target>]) -> Result<(), AutoscanError> {
        let scan = self.store.get_available(self.minimum_age)?;

        for anchor in &self.anchors {
            if !file_exists(anchor) {
                return Err(AutoscanError::AnchorUnavailable(
                    anchor.display().to_string(),
                ));
            }
        }

        trace!("Dispatching scan: {}", scan.folder);
        let results = join_all(targets.iter().map(|target| target.scan(&scan))).await;
        join_target_results(results)?;

        self.store.delete(&scan.folder)?;
        self.processed.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    pub fn scans_remaining(&self) -> Result<i64, AutoscanError> {
        self.store.remaining()
    }

    pub fn scans_processed(&self) -> i64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Test-only view of the datastore contents, ordered by folder.
    #[cfg(test)]
    pub(crate) fn all_scans(&self) -> Vec<Scan> {
        match &mut *self.store.db.conn() {
            DbConn::Sqlite(conn) => {
                let mut stmt = conn
                    .prepare("SELECT folder, priority, time FROM scan ORDER BY folder ASC")
                    .unwrap();
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i32>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    })
                    .unwrap();

                rows.map(|row| {
                    let (folder, priority, millis) = row.unwrap();
                    Scan {
                        folder,
                        priority,
                        time: Utc.timestamp_millis_opt(millis).unwrap(),
                    }
                })
                .collect()
            }
            DbConn::Postgres(_) => unreachable!("tests run on sqlite"),
        }
    }
}

/// Joins parallel target results, preferring a fatal error over an
/// unavailable one so the driving loop halts rather than spinning.
fn join_target_results(results: Vec<Result<(), AutoscanError>>) -> Result<(), AutoscanError> {
    let mut unavailable = None;

    for result in results {
        match result {
            Ok(()) => {}
            Err(err @ AutoscanError::TargetUnavailable(_)) => {
                if unavailable.is_none() {
                    unavailable = Some(err);
                }
            }
            Err(err) => return Err(err),
        }
    }

    match unavailable {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn file_exists(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Succeed,
        Unavailable,
        Fatal,
    }

    struct MockTarget {
        available: Mutex<Behavior>,
        scan: Mutex<Behavior>,
        scan_calls: AtomicUsize,
    }

    impl MockTarget {
        fn new(available: Behavior, scan: Behavior) -> Arc<Self> {
            Arc::new(Self {
                available: Mutex::new(available),
                scan: Mutex::new(scan),
                scan_calls: AtomicUsize::new(0),
            })
        }

        fn set_available(&self, behavior: Behavior) {
            *self.available.lock().unwrap() = behavior;
        }

        fn result(behavior: Behavior) -> Result<(), AutoscanError> {
            match behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Unavailable => Err(AutoscanError::TargetUnavailable("503".into())),
                Behavior::Fatal => Err(AutoscanError::Fatal("401".into())),
            }
        }
    }

    #[async_trait]
    impl Target for MockTarget {
        async fn available(&self) -> Result<(), AutoscanError> {
            Self::result(*self.available.lock().unwrap())
        }

        async fn scan(&self, _scan: &Scan) -> Result<(), AutoscanError> {
            self.scan_calls.fetch_add(1, Ordering::Relaxed);
            Self::result(*self.scan.lock().unwrap())
        }
    }

    struct TestClock {
        millis: Arc<AtomicI64>,
    }

    impl TestClock {
        fn new(start: DateTime<Utc>) -> (Self, Clock) {
            let millis = Arc::new(AtomicI64::new(start.timestamp_millis()));
            let shared = Arc::clone(&millis);
            let clock: Clock = Arc::new(move || {
                Utc.timestamp_millis_opt(shared.load(Ordering::Relaxed))
                    .unwrap()
            });
            (Self { millis }, clock)
        }

        fn advance(&self, duration: Duration) {
            self.millis
                .fetch_add(duration.as_millis() as i64, Ordering::Relaxed);
        }
    }

    fn processor(minimum_age: Duration, clock: Clock, anchors: Vec<PathBuf>) -> Processor {
        let db = Arc::new(Database::open_sqlite_memory().unwrap());
        Processor::with_clock(
            ProcessorConfig {
                anchors,
                minimum_age,
            },
            db,
            clock,
        )
        .unwrap()
    }

    fn scan(folder: &str, priority: i32, time: DateTime<Utc>) -> Scan {
        Scan {
            folder: folder.to_owned(),
            priority,
            time,
        }
    }

    fn stored_row(proc: &Processor, folder: &str) -> Option<(i32, i64)> {
        match &mut *proc.store.db.conn() {
            DbConn::Sqlite(conn) => conn
                .query_row(
                    "SELECT priority, time FROM scan WHERE folder = ?1",
                    [folder],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .unwrap(),
            DbConn::Postgres(_) => unreachable!("tests run on sqlite"),
        }
    }

    #[test]
    fn submissions_coalesce_per_folder() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (_, clock) = TestClock::new(start);
        let proc = processor(Duration::from_secs(600), clock, vec![]);

        proc.submit(vec![scan("/m/A", 2, start)]).unwrap();
        proc.submit(vec![scan("/m/A", 5, start + chrono::Duration::milliseconds(1))])
            .unwrap();
        proc.submit(vec![scan("/m/A", 3, start + chrono::Duration::milliseconds(2))])
            .unwrap();

        assert_eq!(proc.scans_remaining().unwrap(), 1);
        assert_eq!(
            stored_row(&proc, "/m/A"),
            Some((5, start.timestamp_millis() + 2))
        );
    }

    #[test]
    fn minimum_age_gates_availability() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (ticker, clock) = TestClock::new(start);
        let proc = processor(Duration::from_secs(120), clock, vec![]);

        // both rows are one minute old
        let written = start - chrono::Duration::seconds(60);
        proc.submit(vec![scan("/m/A", 1, written), scan("/m/B", 3, written)])
            .unwrap();

        assert!(matches!(
            proc.store.get_available(proc.minimum_age),
            Err(AutoscanError::NoScans)
        ));

        // 90 seconds later both are due; higher priority first
        ticker.advance(Duration::from_secs(90));
        let first = proc.store.get_available(proc.minimum_age).unwrap();
        assert_eq!(first.folder, "/m/B");

        proc.store.delete(&first.folder).unwrap();
        let second = proc.store.get_available(proc.minimum_age).unwrap();
        assert_eq!(second.folder, "/m/A");
    }

    #[test]
    fn due_scans_order_by_priority_then_age_then_folder() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (_, clock) = TestClock::new(start);
        let proc = processor(Duration::from_secs(60), clock, vec![]);

        let old = start - chrono::Duration::seconds(600);
        let older = start - chrono::Duration::seconds(900);
        proc.submit(vec![
            scan("/m/low-old", 1, older),
            scan("/m/b", 5, old),
            scan("/m/a", 5, old),
            scan("/m/high-young", 5, old + chrono::Duration::seconds(1)),
        ])
        .unwrap();

        let order: Vec<String> = std::iter::from_fn(|| {
            let next = proc.store.get_available(proc.minimum_age).ok()?;
            proc.store.delete(&next.folder).unwrap();
            Some(next.folder)
        })
        .collect();

        assert_eq!(order, vec!["/m/a", "/m/b", "/m/high-young", "/m/low-old"]);
    }

    #[tokio::test]
    async fn process_deletes_row_on_success() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (_, clock) = TestClock::new(start);
        let proc = processor(Duration::from_secs(60), clock, vec![]);

        proc.submit(vec![scan("/m/A", 1, start - chrono::Duration::seconds(120))])
            .unwrap();

        let one = MockTarget::new(Behavior::Succeed, Behavior::Succeed);
        let two = MockTarget::new(Behavior::Succeed, Behavior::Succeed);
        let targets: Vec<Arc<dyn Target>> = vec![one.clone(), two.clone()];

        proc.process(&targets).await.unwrap();

        assert_eq!(proc.scans_remaining().unwrap(), 0);
        assert_eq!(proc.scans_processed(), 1);
        assert_eq!(one.scan_calls.load(Ordering::Relaxed), 1);
        assert_eq!(two.scan_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn process_keeps_row_when_a_target_fails() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (_, clock) = TestClock::new(start);
        let proc = processor(Duration::from_secs(60), clock, vec![]);

        proc.submit(vec![scan("/m/A", 1, start - chrono::Duration::seconds(120))])
            .unwrap();

        let ok = MockTarget::new(Behavior::Succeed, Behavior::Succeed);
        let down = MockTarget::new(Behavior::Succeed, Behavior::Unavailable);
        let targets: Vec<Arc<dyn Target>> = vec![ok, down];

        let err = proc.process(&targets).await.unwrap_err();
        assert!(matches!(err, AutoscanError::TargetUnavailable(_)));
        assert_eq!(proc.scans_remaining().unwrap(), 1);
        assert_eq!(proc.scans_processed(), 0);
    }

    #[tokio::test]
    async fn process_returns_no_scans_when_queue_is_empty() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (_, clock) = TestClock::new(start);
        let proc = processor(Duration::from_secs(60), clock, vec![]);

        let err = proc.process(&[]).await.unwrap_err();
        assert!(matches!(err, AutoscanError::NoScans));
    }

    #[tokio::test]
    async fn missing_anchor_blocks_dispatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let present = dir.path().join("mounted");
        std::fs::write(&present, "ok").unwrap();
        let missing = dir.path().join("not-mounted");

        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (_, clock) = TestClock::new(start);
        let proc = processor(Duration::from_secs(60), clock, vec![present, missing]);

        proc.submit(vec![scan("/m/A", 1, start - chrono::Duration::seconds(120))])
            .unwrap();

        let target = MockTarget::new(Behavior::Succeed, Behavior::Succeed);
        let targets: Vec<Arc<dyn Target>> = vec![target.clone()];

        let err = proc.process(&targets).await.unwrap_err();
        assert!(matches!(err, AutoscanError::AnchorUnavailable(_)));
        assert_eq!(target.scan_calls.load(Ordering::Relaxed), 0);
        assert_eq!(proc.scans_remaining().unwrap(), 1);
    }

    #[tokio::test]
    async fn availability_recovers_after_target_restored() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (_, clock) = TestClock::new(start);
        let proc = processor(Duration::from_secs(60), clock, vec![]);

        let healthy = MockTarget::new(Behavior::Succeed, Behavior::Succeed);
        let flaky = MockTarget::new(Behavior::Unavailable, Behavior::Succeed);
        let targets: Vec<Arc<dyn Target>> = vec![healthy, flaky.clone()];

        let err = proc.check_availability(&targets).await.unwrap_err();
        assert!(matches!(err, AutoscanError::TargetUnavailable(_)));

        flaky.set_available(Behavior::Succeed);
        proc.check_availability(&targets).await.unwrap();
    }

    #[tokio::test]
    async fn availability_prefers_fatal_over_unavailable() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (_, clock) = TestClock::new(start);
        let proc = processor(Duration::from_secs(60), clock, vec![]);

        let down = MockTarget::new(Behavior::Unavailable, Behavior::Succeed);
        let broken = MockTarget::new(Behavior::Fatal, Behavior::Succeed);
        let targets: Vec<Arc<dyn Target>> = vec![down, broken];

        let err = proc.check_availability(&targets).await.unwrap_err();
        assert!(matches!(err, AutoscanError::Fatal(_)));
    }
}
