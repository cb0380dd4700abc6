//! Durable state for applications and jobs.
//!
//! The store is the source of truth across restarts: the in-memory
//! [`JobQueue`](crate::scheduler::JobQueue) index is rebuilt from it at startup,
//! and every job mutation is written here before it is considered committed.
//!
//! - [`RedbStore`]: durable, backed by a single redb file. A write returns only
//!   after its transaction has been committed to disk.
//! - [`MemoryStore`]: non-durable, for tests and throwaway runs.

pub mod memory;
pub mod redb_store;

pub use self::memory::MemoryStore;
pub use self::redb_store::RedbStore;

use crate::error::Result;
use crate::scheduler::{Application, Job};

pub trait Store: Send + Sync {
    fn put_application(&self, app: &Application) -> Result<()>;

    fn get_application(&self, appid: &str) -> Result<Option<Application>>;

    fn list_applications(&self) -> Result<Vec<Application>>;

    fn put_job(&self, job: &Job) -> Result<()>;

    fn get_job(&self, id: u64) -> Result<Option<Job>>;

    /// Every job, ordered by id ascending.
    fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Remember that `id` has been handed out, even if no job with that id is
    /// ever written.
    fn record_issued_job_id(&self, id: u64) -> Result<()>;

    /// Highest id ever issued or written; 0 for an empty store.
    fn max_issued_job_id(&self) -> Result<u64>;

    fn get_app_job(&self, id: u64) -> Result<Option<(Application, Job)>> {
        let Some(job) = self.get_job(id)? else {
            return Ok(None);
        };
        Ok(self.get_application(&job.appid)?.map(|app| (app, job)))
    }

    /// Jobs under applications owned by `owner`, ordered by id ascending.
    fn get_all_jobs(&self, owner: &str) -> Result<Vec<Job>> {
        let owned: Vec<String> = self
            .list_applications()?
            .into_iter()
            .filter(|app| app.is_owned_by(owner))
            .map(|app| app.appid)
            .collect();
        Ok(self
            .list_jobs()?
            .into_iter()
            .filter(|job| owned.contains(&job.appid))
            .collect())
    }
}
