//! Split-join workers: process a job's item range in resumable
//! chunks, one transaction per chunk, grounded in spec §4.8
//! "Split-join workers process ranges of chunks per transaction,
//! resuming from `chunk_offset` on restart" and
//! `nodegrid_scheduler::pack::split_items`'s chunking rule.

use crate::worker_task::{JobWorkerState, JobWorkerTask};
use async_trait::async_trait;
use nodegrid_scheduler::{StepContext, Task};
use nodegrid_shared::{NodegridResult, Value};
use std::sync::{Arc, Mutex};

/// Application-supplied chunk handler. `process_chunk` runs one
/// `[offset, offset+len)` slice and returns the state vars to persist
/// at the next commit point.
pub trait ChunkProcessor: Send {
    fn process_chunk(&mut self, offset: u64, len: u64) -> NodegridResult<Vec<(String, Value)>>;
}

/// Drives a [`JobWorkerTask`] over `[0, total_items)` in
/// `chunk_size`-sized windows, committing after each chunk and ending
/// the job once `is_end_of_work()` is true (spec §4.8).
pub struct SplitJoinWorker {
    inner: JobWorkerTask,
    processor: Box<dyn ChunkProcessor>,
    chunk_offset: u64,
    chunk_size: u64,
    total_items: u64,
}

impl SplitJoinWorker {
    pub fn new(state: Arc<Mutex<JobWorkerState>>, processor: Box<dyn ChunkProcessor>, chunk_offset: u64, chunk_size: u64, total_items: u64) -> Self {
        SplitJoinWorker { inner: JobWorkerTask::new(state), processor, chunk_offset, chunk_size: chunk_size.max(1), total_items }
    }

    pub fn is_end_of_work(&self) -> bool {
        self.chunk_offset >= self.total_items
    }

    fn next_len(&self) -> u64 {
        self.chunk_size.min(self.total_items - self.chunk_offset)
    }
}

#[async_trait]
impl Task for SplitJoinWorker {
    fn name(&self) -> &str {
        "job-split-join-worker"
    }

    fn needs_run(&self) -> bool {
        self.inner.needs_run()
    }

    fn request_stop(&mut self) {
        self.inner.request_stop();
    }

    async fn run_step(&mut self, ctx: &mut StepContext<'_>) -> NodegridResult<i32> {
        // Drain any in-flight sync action (commit ack, end-of-work ack)
        // before deciding on the next chunk; a split-join worker is a
        // `JobWorkerTask` with chunk bookkeeping layered on top, not a
        // replacement for its sync barrier.
        let advanced = self.inner.run_step(ctx).await?;
        if advanced > 0 {
            return Ok(advanced);
        }

        let state = self.inner.state();
        let waiting = !state.lock().unwrap_or_else(|e| e.into_inner()).is_all_synced();
        if waiting {
            return Ok(0);
        }

        if self.is_end_of_work() {
            if !state.lock().unwrap_or_else(|e| e.into_inner()).in_sync_action() {
                self.inner.end_work(0, "split-join complete");
                return self.inner.run_step(ctx).await;
            }
            return Ok(0);
        }

        let len = self.next_len();
        let vars = self.processor.process_chunk(self.chunk_offset, len)?;
        {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.set_var_local("chunk_offset", Value::UInt(self.chunk_offset + len));
            for (name, value) in vars {
                state.set_var_local(name, value);
            }
        }
        self.chunk_offset += len;
        self.inner.commit_work(true);
        Ok(self.inner.run_step(ctx).await? + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_task::JobWorkerState;
    use nodegrid_address::Address;
    use nodegrid_scheduler::RequestIdGenerator;

    struct CountingProcessor {
        calls: Vec<(u64, u64)>,
    }

    impl ChunkProcessor for CountingProcessor {
        fn process_chunk(&mut self, offset: u64, len: u64) -> NodegridResult<Vec<(String, Value)>> {
            self.calls.push((offset, len));
            Ok(vec![("last_offset".to_string(), Value::UInt(offset))])
        }
    }

    #[tokio::test]
    async fn processes_chunks_until_end_of_work_then_ends() {
        let state = Arc::new(Mutex::new(JobWorkerState::new(1, 1, 0, Address::raw("worker-1"), Address::raw("mgr"))));
        let processor = Box::new(CountingProcessor { calls: Vec::new() });
        let mut worker = SplitJoinWorker::new(state.clone(), processor, 0, 3, 7);

        let own = Address::raw("worker-1");
        let ids = RequestIdGenerator::new();
        let mut outbox = Vec::new();
        let mut ctx = StepContext::new(&own, &mut outbox, &ids);

        // chunk 1: [0,3)
        worker.run_step(&mut ctx).await.unwrap();
        assert_eq!(worker.chunk_offset, 3);

        // ack the commit so the next step can proceed
        let seq = *state.lock().unwrap().outstanding_for_test();
        state.lock().unwrap().ack_for_test(seq);

        // chunk 2: [3,6)
        worker.run_step(&mut ctx).await.unwrap();
        assert_eq!(worker.chunk_offset, 6);
        let seq = *state.lock().unwrap().outstanding_for_test();
        state.lock().unwrap().ack_for_test(seq);

        // chunk 3: [6,7)
        worker.run_step(&mut ctx).await.unwrap();
        assert_eq!(worker.chunk_offset, 7);
        assert!(worker.is_end_of_work());
    }
}
