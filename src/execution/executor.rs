use std::{sync::Arc, time::Duration};

use futures::future;
use log::{error, warn};
use tokio::{sync::Semaphore, task, time};

use crate::{
    client::Client,
    error::Result,
    oracle::TrainingOracle,
    params::ParameterMap,
    server::SharedClient,
};

/// The work every selected client performs during a round.
#[derive(Debug, Clone)]
pub struct LocalRound {
    /// Global parameters to synchronize with before training, if any.
    pub sync: Option<ParameterMap>,
    /// Whether `dW` is cleared before training.
    pub clear_delta: bool,
    pub epochs: usize,
}

/// What happened to each client of a round, every list is sorted by client id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundOutcome {
    /// Clients that trained successfully, with their loss.
    pub completed: Vec<(usize, f32)>,
    /// Clients whose oracle failed, they were reset and don't take part in aggregation.
    pub failed: Vec<usize>,
    /// Clients that didn't get a slot and finish in time, any started work keeps running
    /// in the background.
    pub timed_out: Vec<usize>,
    /// Clients still locked by unfinished work from an earlier round.
    pub busy: Vec<usize>,
}

impl RoundOutcome {
    /// The ids of the clients whose delta can be aggregated.
    pub fn participants(&self) -> Vec<usize> {
        self.completed.iter().map(|&(id, _)| id).collect()
    }
}

enum TaskResult {
    Completed(f32),
    Failed,
    TimedOut,
    Busy,
}

/// Runs the local work of a round concurrently, one blocking task per client.
///
/// At most `parallelism` clients train at the same time. The round only finishes once
/// every client completed, failed or ran out of time, the deadline of each client starts
/// when the round does.
pub struct RoundExecutor {
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl RoundExecutor {
    /// Creates a new `RoundExecutor`.
    ///
    /// # Arguments
    /// * `parallelism` - The maximum amount of clients training at once.
    /// * `timeout` - How long to wait for a single client, `None` waits forever.
    pub fn new(parallelism: usize, timeout: Option<Duration>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
            timeout,
        }
    }

    /// Runs `work` on every client of `clients`.
    ///
    /// # Arguments
    /// * `clients` - The selected clients with their roster position.
    /// * `work` - The local work to run.
    ///
    /// # Returns
    /// The outcome of every client.
    pub async fn execute<O>(&self, clients: Vec<(usize, SharedClient<O>)>, work: LocalRound) -> RoundOutcome
    where
        O: TrainingOracle + 'static,
    {
        let work = Arc::new(work);

        let tasks = clients.into_iter().map(|(id, shared)| {
            let work = Arc::clone(&work);
            let permits = Arc::clone(&self.permits);
            let timeout = self.timeout;

            async move {
                let run = async move {
                    let Ok(permit) = permits.acquire_owned().await else {
                        return TaskResult::Failed;
                    };

                    // The permit lives as long as the blocking work, a timed out client
                    // keeps its slot until it actually finishes.
                    let handle = task::spawn_blocking(move || {
                        let _permit = permit;
                        let Some(mut client) = shared.try_lock() else {
                            return TaskResult::Busy;
                        };

                        match run_local_round(&mut client, &work) {
                            Ok(loss) => TaskResult::Completed(loss),
                            Err(_) => TaskResult::Failed,
                        }
                    });

                    match handle.await {
                        Ok(result) => result,
                        Err(e) => {
                            error!(client = id; "local round panicked: {e}");
                            TaskResult::Failed
                        }
                    }
                };

                // The deadline covers waiting for a slot as well as the work itself.
                let result = match timeout {
                    Some(limit) => time::timeout(limit, run)
                        .await
                        .unwrap_or(TaskResult::TimedOut),
                    None => run.await,
                };

                (id, result)
            }
        });

        let mut results = future::join_all(tasks).await;
        results.sort_by_key(|&(id, _)| id);

        let mut outcome = RoundOutcome::default();
        for (id, result) in results {
            match result {
                TaskResult::Completed(loss) => outcome.completed.push((id, loss)),
                TaskResult::Failed => outcome.failed.push(id),
                TaskResult::TimedOut => {
                    warn!(client = id; "client timed out, dropped from the round");
                    outcome.timed_out.push(id);
                }
                TaskResult::Busy => {
                    warn!(client = id; "client still busy with an earlier round");
                    outcome.busy.push(id);
                }
            }
        }

        outcome
    }
}

/// Synchronizes, trains and rolls `W` back, leaving the round's update in `dW`.
///
/// On failure the client is still reset so its parameters are never left half trained.
fn run_local_round<O: TrainingOracle>(client: &mut Client<O>, work: &LocalRound) -> Result<f32> {
    if let Some(global) = &work.sync {
        client.synchronize_with(global)?;
    }

    if work.clear_delta {
        client.clear_delta();
    }

    let trained = client.compute_weight_update(work.epochs);
    client.reset()?;
    trained
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;
    use crate::testing::{client, vector, ShiftOracle};

    fn shared(id: usize, oracle: ShiftOracle) -> (usize, SharedClient<ShiftOracle>) {
        (id, Arc::new(Mutex::new(client(id, oracle))))
    }

    fn work(sync: Option<ParameterMap>) -> LocalRound {
        LocalRound {
            sync,
            clear_delta: true,
            epochs: 2,
        }
    }

    #[tokio::test]
    async fn every_client_trains_and_resets() {
        let clients = vec![
            shared(1, ShiftOracle::new(&[1., 0.]).with_loss(0.3)),
            shared(0, ShiftOracle::new(&[0., -1.]).with_loss(0.7)),
        ];
        let executor = RoundExecutor::new(2, None);

        let global = vector(&[1., 1.]);
        let outcome = executor.execute(clients.clone(), work(Some(global.clone()))).await;

        assert_eq!(outcome.completed, [(0, 0.7), (1, 0.3)]);
        assert_eq!(outcome.participants(), [0, 1]);

        let c = clients[0].1.lock();
        assert_eq!(c.params(), &global);
        assert_eq!(c.delta(), &vector(&[2., 0.]));
    }

    #[tokio::test]
    async fn failing_client_is_dropped_and_reset() {
        let clients = vec![
            shared(0, ShiftOracle::new(&[1., 0.])),
            shared(1, ShiftOracle::failing(&[5., 5.])),
        ];
        let executor = RoundExecutor::new(1, None);

        let outcome = executor.execute(clients.clone(), work(None)).await;

        assert_eq!(outcome.participants(), [0]);
        assert_eq!(outcome.failed, [1]);

        let failed = clients[1].1.lock();
        assert_eq!(failed.params(), &vector(&[0., 0.]));
        assert_eq!(failed.delta(), &vector(&[0., 0.]));
    }

    #[tokio::test]
    async fn delta_survives_rounds_when_not_cleared() {
        let clients = vec![shared(0, ShiftOracle::new(&[1., 2.]))];
        let executor = RoundExecutor::new(1, None);
        let keep = LocalRound {
            clear_delta: false,
            ..work(None)
        };

        executor.execute(clients.clone(), keep.clone()).await;
        executor.execute(clients.clone(), keep).await;

        assert_eq!(clients[0].1.lock().delta(), &vector(&[4., 8.]));
    }

    #[tokio::test]
    async fn slow_client_times_out_and_stays_busy() {
        let clients = vec![
            shared(0, ShiftOracle::new(&[1., 0.])),
            shared(1, ShiftOracle::new(&[1., 0.]).with_delay(Duration::from_millis(500))),
        ];
        let executor = RoundExecutor::new(2, Some(Duration::from_millis(50)));

        let outcome = executor.execute(clients.clone(), work(None)).await;
        assert_eq!(outcome.participants(), [0]);
        assert_eq!(outcome.timed_out, [1]);

        let outcome = executor.execute(clients[1..].to_vec(), work(None)).await;
        assert_eq!(outcome.busy, [1]);
        assert!(outcome.completed.is_empty());
    }

    #[tokio::test]
    async fn queued_clients_share_the_round_deadline() {
        let clients = vec![
            shared(0, ShiftOracle::new(&[1., 0.]).with_delay(Duration::from_millis(1000))),
            shared(1, ShiftOracle::new(&[1., 0.])),
        ];
        let executor = RoundExecutor::new(1, Some(Duration::from_millis(50)));

        let start = Instant::now();
        let outcome = executor.execute(clients, work(None)).await;

        assert!(start.elapsed() < Duration::from_millis(500), "round took {:?}", start.elapsed());
        assert!(outcome.timed_out.contains(&0));
        assert!(!outcome.participants().contains(&0));
    }
}
