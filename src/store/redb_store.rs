use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::Result;
use crate::scheduler::{Application, Job};
use crate::store::Store;

/// Applications keyed by appid, JSON values.
const APPLICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");

/// Jobs keyed by job id, JSON values.
const JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("jobs");

/// Scalar bookkeeping, currently only the job id high-water mark.
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const MAX_ISSUED_KEY: &str = "max_issued_job_id";

/// Store backed by a redb file. Each write is its own transaction and is
/// durable once the call returns.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open the database at `path`, creating it and its tables if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;

        let txn = db.begin_write()?;
        {
            txn.open_table(APPLICATIONS)?;
            txn.open_table(JOBS)?;
            txn.open_table(META)?;
        }
        txn.commit()?;

        tracing::info!(path = %path.as_ref().display(), "Opened job store");
        Ok(Self { db })
    }

    fn bump_max_issued(txn: &redb::WriteTransaction, id: u64) -> Result<()> {
        let mut meta = txn.open_table(META)?;
        let current = meta.get(MAX_ISSUED_KEY)?.map(|v| v.value()).unwrap_or(0);
        if id > current {
            meta.insert(MAX_ISSUED_KEY, id)?;
        }
        Ok(())
    }
}

impl Store for RedbStore {
    fn put_application(&self, app: &Application) -> Result<()> {
        let bytes = serde_json::to_vec(app)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(APPLICATIONS)?;
            table.insert(app.appid.as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get_application(&self, appid: &str) -> Result<Option<Application>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(APPLICATIONS)?;
        match table.get(appid)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn list_applications(&self) -> Result<Vec<Application>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(APPLICATIONS)?;
        let mut apps = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            apps.push(serde_json::from_slice(value.value())?);
        }
        Ok(apps)
    }

    fn put_job(&self, job: &Job) -> Result<()> {
        let bytes = serde_json::to_vec(job)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(JOBS)?;
            table.insert(job.id, bytes.as_slice())?;
        }
        Self::bump_max_issued(&txn, job.id)?;
        txn.commit()?;
        Ok(())
    }

    fn get_job(&self, id: u64) -> Result<Option<Job>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(JOBS)?;
        match table.get(id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(JOBS)?;
        let mut jobs = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            jobs.push(serde_json::from_slice(value.value())?);
        }
        Ok(jobs)
    }

    fn record_issued_job_id(&self, id: u64) -> Result<()> {
        let txn = self.db.begin_write()?;
        Self::bump_max_issued(&txn, id)?;
        txn.commit()?;
        Ok(())
    }

    fn max_issued_job_id(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META)?;
        let recorded = meta.get(MAX_ISSUED_KEY)?.map(|v| v.value()).unwrap_or(0);
        let jobs = txn.open_table(JOBS)?;
        let highest_job = jobs.last()?.map(|(k, _)| k.value()).unwrap_or(0);
        Ok(recorded.max(highest_job))
    }
}
