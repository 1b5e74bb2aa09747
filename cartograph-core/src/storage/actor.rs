use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::oneshot;

use crate::errors::{CartographError, ErrorKind};
use crate::prelude::*;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&mut Connection) + Send>;

enum Command {
    Run(Job),
    Stop(oneshot::Sender<()>),
}

/// Serializes access to a blocking sqlite connection by moving it onto a
/// dedicated worker thread. Submitted closures run in arrival order and
/// answer over a oneshot reply, which is also what gives one tenant's
/// writes their total order.
#[derive(Debug, Clone)]
pub(crate) struct StorageActor {
    tx: Sender<Command>,
    label: &'static str,
}

impl StorageActor {
    /// Moves `connection` onto a worker thread and starts draining jobs.
    /// The connection is opened by the caller, so there is nothing that can
    /// fail asynchronously during startup.
    pub(crate) fn spawn(label: &'static str, mut connection: Connection) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Command>();
        thread::Builder::new()
            .name(format!("storage-{label}"))
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        Command::Run(job) => job(&mut connection),
                        Command::Stop(done) => {
                            let _ = done.send(());
                            return;
                        }
                    }
                }
            })
            .map_err(|e| ErrorKind::Storage(format!("could not start {label} worker: {e}")))?;
        Ok(StorageActor { tx, label })
    }

    fn worker_gone(&self) -> CartographError {
        ErrorKind::Storage(format!("{} worker is no longer running", self.label)).into()
    }

    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |connection| {
            let _ = reply_tx.send(f(connection));
        });
        if self.tx.send(Command::Run(job)).is_err() {
            return Err(self.worker_gone());
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.worker_gone()),
        }
    }

    /// Asks the worker to finish its queue and exit, waiting up to a short
    /// grace period. Safe to call more than once.
    pub(crate) async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Stop(done_tx)).is_err() {
            return;
        }
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, done_rx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> StorageActor {
        StorageActor::spawn("test", Connection::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn runs_jobs_in_order() {
        let actor = actor();
        actor
            .call(|conn| {
                conn.execute("CREATE TABLE t (v INTEGER)", [])?;
                conn.execute("INSERT INTO t (v) VALUES (1)", [])?;
                Ok(())
            })
            .await
            .unwrap();
        let count: i64 = actor
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 1);
        actor.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_calls_after_shutdown() {
        let actor = actor();
        actor.shutdown().await;
        let result = actor.call(|_| Ok(())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_twice_is_harmless() {
        let actor = actor();
        actor.shutdown().await;
        actor.shutdown().await;
    }
}
