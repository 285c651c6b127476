//! Claim-retry: list ready tasks, attempt the first, fall through to the
//! next on contention. Guarantees liveness under concurrent claimers with
//! no coordination between orchestrators — each call either acquires a
//! task or concludes none is free (§4.2, invariant 9).

use anyhow::Result;

use crate::error::IsollmError;
use crate::queue::{QueueBackend, Task};

/// Try to claim the highest-priority ready task for `agent`. Returns
/// `Ok(None)` if no ready task could be claimed (either none are ready, or
/// every ready task was claimed out from under us before our attempt).
pub fn claim_next<Q: QueueBackend + ?Sized>(queue: &Q, agent: &str) -> Result<Option<Task>> {
    let ready = queue.list_ready_tasks()?;
    for candidate in ready {
        match queue.claim_task(&candidate.id, agent) {
            Ok(claimed) => return Ok(Some(claimed)),
            Err(e) if IsollmError::is_already_claimed(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}
