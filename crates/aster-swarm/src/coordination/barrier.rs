//! Rendezvous Barriers
//!
//! A barrier is created by its first arrival and torn down as soon as the
//! required number of distinct agents has arrived or its deadline passes,
//! so the same name can be reused for the next round.
//!
//! The deadline is fixed by the first arrival. A later arrival whose own
//! timeout ends sooner withdraws its arrival when it gives up; one whose
//! timeout ends later is released by the barrier deadline.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

use super::error::{CoordinationError, CoordinationResult};

/// Outcome broadcast to every waiter of one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarrierPhase {
    Waiting,
    Released,
    TimedOut { arrived: usize },
}

struct BarrierEntry {
    round: u64,
    required: usize,
    arrivals: HashSet<String>,
    created_at: DateTime<Utc>,
    deadline: Instant,
    phase: watch::Sender<BarrierPhase>,
}

impl BarrierEntry {
    fn timeout_error(&self, name: &str) -> CoordinationError {
        CoordinationError::BarrierTimeout {
            name: name.to_string(),
            arrived: self.arrivals.len(),
            required: self.required,
        }
    }
}

/// Snapshot of a barrier that is still collecting arrivals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BarrierStatus {
    pub name: String,
    pub round: u64,
    pub required: usize,
    /// Arrived agents, sorted
    pub arrived: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::config::duration_ms")]
    pub remaining: Duration,
}

/// Barrier counters
#[derive(Debug, Default)]
pub struct BarrierCounters {
    pub released: AtomicU64,
    pub timeouts: AtomicU64,
}

/// Internally synchronized barrier table
#[derive(Default)]
pub struct BarrierRegistry {
    barriers: Mutex<HashMap<String, BarrierEntry>>,
    next_round: AtomicU64,
    counters: BarrierCounters,
}

impl BarrierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrive at `name` and wait until `required` distinct agents have arrived
    ///
    /// Arriving twice as the same agent counts once. Dropping the returned
    /// future withdraws the arrival.
    pub async fn wait(
        &self,
        name: &str,
        agent: &str,
        required: usize,
        timeout: Duration,
    ) -> CoordinationResult<()> {
        if required == 0 {
            return Err(CoordinationError::InvalidArgument(
                "barrier requires at least one arrival".to_string(),
            ));
        }

        let now = Instant::now();
        let own_deadline = deadline_after(now, timeout);

        let (round, mut phase, barrier_deadline) = {
            let mut barriers = self.barriers.lock();

            // A round whose deadline passed but was not swept yet is over
            if barriers.get(name).is_some_and(|entry| entry.deadline <= now) {
                if let Some(stale) = barriers.remove(name) {
                    self.time_out(name, stale);
                }
            }

            let entry = barriers.entry(name.to_string()).or_insert_with(|| {
                let (phase, _) = watch::channel(BarrierPhase::Waiting);
                BarrierEntry {
                    round: self.next_round.fetch_add(1, Ordering::Relaxed) + 1,
                    required,
                    arrivals: HashSet::new(),
                    created_at: Utc::now(),
                    deadline: own_deadline,
                    phase,
                }
            });

            if entry.required != required {
                return Err(CoordinationError::InvalidArgument(format!(
                    "barrier {} requires {} arrivals, not {}",
                    name, entry.required, required
                )));
            }

            entry.arrivals.insert(agent.to_string());
            debug!(
                barrier = %name,
                agent = %agent,
                arrived = entry.arrivals.len(),
                required,
                "barrier arrival"
            );

            if entry.arrivals.len() >= entry.required {
                if let Some(done) = barriers.remove(name) {
                    done.phase.send_replace(BarrierPhase::Released);
                    self.counters.released.fetch_add(1, Ordering::Relaxed);
                    debug!(barrier = %name, round = done.round, "barrier released");
                }
                return Ok(());
            }

            (entry.round, entry.phase.subscribe(), entry.deadline)
        };

        let mut guard = ArrivalGuard {
            registry: self,
            name,
            agent,
            round,
            armed: true,
        };

        let until = own_deadline.min(barrier_deadline);
        let outcome = tokio::time::timeout_at(until.into(), async {
            phase
                .wait_for(|p| *p != BarrierPhase::Waiting)
                .await
                .map(|settled| *settled)
        })
        .await;

        guard.armed = false;
        match outcome {
            Ok(Ok(settled)) => self.settle(name, required, settled),
            Ok(Err(_)) => Err(CoordinationError::Stopped),
            Err(_) => self.give_up(name, agent, round, required, &phase),
        }
    }

    fn settle(&self, name: &str, required: usize, phase: BarrierPhase) -> CoordinationResult<()> {
        match phase {
            BarrierPhase::Released => Ok(()),
            BarrierPhase::TimedOut { arrived } => Err(CoordinationError::BarrierTimeout {
                name: name.to_string(),
                arrived,
                required,
            }),
            BarrierPhase::Waiting => Err(CoordinationError::BarrierTimeout {
                name: name.to_string(),
                arrived: 0,
                required,
            }),
        }
    }

    /// The caller's timer fired; time the round out or withdraw from it
    fn give_up(
        &self,
        name: &str,
        agent: &str,
        round: u64,
        required: usize,
        phase: &watch::Receiver<BarrierPhase>,
    ) -> CoordinationResult<()> {
        let mut barriers = self.barriers.lock();
        let Some(entry) = barriers.get_mut(name).filter(|entry| entry.round == round) else {
            // Round settled between the timer firing and taking the lock
            let settled = *phase.borrow();
            return self.settle(name, required, settled);
        };

        if entry.deadline <= Instant::now() {
            let entry = barriers.remove(name);
            return match entry {
                Some(entry) => {
                    let err = entry.timeout_error(name);
                    self.time_out(name, entry);
                    Err(err)
                }
                None => self.settle(name, required, *phase.borrow()),
            };
        }

        let err = entry.timeout_error(name);
        entry.arrivals.remove(agent);
        if entry.arrivals.is_empty() && entry.phase.receiver_count() <= 1 {
            barriers.remove(name);
        }
        debug!(barrier = %name, agent = %agent, "barrier arrival withdrawn");
        Err(err)
    }

    fn time_out(&self, name: &str, entry: BarrierEntry) {
        let arrived = entry.arrivals.len();
        entry.phase.send_replace(BarrierPhase::TimedOut { arrived });
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        debug!(
            barrier = %name,
            round = entry.round,
            arrived,
            required = entry.required,
            "barrier timed out"
        );
    }

    fn withdraw(&self, name: &str, agent: &str, round: u64) {
        let mut barriers = self.barriers.lock();
        if let Some(entry) = barriers.get_mut(name).filter(|entry| entry.round == round) {
            entry.arrivals.remove(agent);
            // The dropped waiter's own receiver may still be alive here
            if entry.arrivals.is_empty() && entry.phase.receiver_count() <= 1 {
                barriers.remove(name);
            }
        }
    }

    /// Time out every barrier past its deadline; returns how many
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut barriers = self.barriers.lock();
        let expired: Vec<String> = barriers
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            if let Some(entry) = barriers.remove(name) {
                self.time_out(name, entry);
            }
        }
        expired.len()
    }

    pub fn status(&self, name: &str) -> Option<BarrierStatus> {
        let barriers = self.barriers.lock();
        let entry = barriers.get(name)?;
        let mut arrived: Vec<String> = entry.arrivals.iter().cloned().collect();
        arrived.sort();
        Some(BarrierStatus {
            name: name.to_string(),
            round: entry.round,
            required: entry.required,
            arrived,
            created_at: entry.created_at,
            remaining: entry.deadline.saturating_duration_since(Instant::now()),
        })
    }

    /// Number of barriers still collecting arrivals
    pub fn len(&self) -> usize {
        self.barriers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> &BarrierCounters {
        &self.counters
    }
}

/// Withdraws an arrival whose waiting future was dropped
struct ArrivalGuard<'a> {
    registry: &'a BarrierRegistry,
    name: &'a str,
    agent: &'a str,
    round: u64,
    armed: bool,
}

impl Drop for ArrivalGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.withdraw(self.name, self.agent, self.round);
        }
    }
}

fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}
