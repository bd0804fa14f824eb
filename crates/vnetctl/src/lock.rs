use std::path::PathBuf;

use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{CtlError, CtlResult};

/// Take the exclusive lock guarding a state file, waiting for other `vnetctl`
/// invocations to finish. The lock is held until the guard is dropped.
pub async fn acquire(path: PathBuf) -> CtlResult<Flock<std::fs::File>> {
    debug!(lock = %path.display(), "waiting for state lock");
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CtlError::Lock(format!("open {}: {e}", path.display())))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_file, e)| CtlError::Lock(format!("flock {}: {e}", path.display())))
    })
    .await
    .map_err(|e| CtlError::Lock(format!("lock task: {e}")))?
}
