use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::error::Result;
use crate::scheduler::{Application, Job};
use crate::store::Store;

#[derive(Debug, Default)]
struct Tables {
    applications: BTreeMap<String, Application>,
    jobs: BTreeMap<u64, Job>,
    max_issued: u64,
}

/// Store that lives only as long as the process. Sharing one instance between
/// two job queues is how tests simulate a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn put_application(&self, app: &Application) -> Result<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.applications.insert(app.appid.clone(), app.clone());
        Ok(())
    }

    fn get_application(&self, appid: &str) -> Result<Option<Application>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.applications.get(appid).cloned())
    }

    fn list_applications(&self) -> Result<Vec<Application>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.applications.values().cloned().collect())
    }

    fn put_job(&self, job: &Job) -> Result<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.max_issued = tables.max_issued.max(job.id);
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn get_job(&self, id: u64) -> Result<Option<Job>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.jobs.get(&id).cloned())
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.jobs.values().cloned().collect())
    }

    fn record_issued_job_id(&self, id: u64) -> Result<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.max_issued = tables.max_issued.max(id);
        Ok(())
    }

    fn max_issued_job_id(&self) -> Result<u64> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.max_issued)
    }
}
