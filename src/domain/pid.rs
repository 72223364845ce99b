//! Process id generation for tracked background jobs.
//!
//! A process id correlates one submitted job across both services and over
//! the relay, so it must be unique under concurrent issuance without a
//! central counter: wall-clock millis + a rolling sequence + 32 random
//! bytes. The recent-id set is a memory-bounded safety net against a broken
//! clock/sequence combination, not the uniqueness mechanism itself.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

/// Opaque token identifying one tracked job. Minted once at submission,
/// never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ProcessId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum PidError {
    #[error("failed to generate unique process id after {0} attempts")]
    Exhausted(u32),
}

const MAX_ATTEMPTS: u32 = 1000;
const SEQUENCE_WRAP: u16 = 1000;
const RECENT_CAPACITY: usize = 10_000;

struct GeneratorState {
    sequence: u16,
    recent: HashSet<String>,
    insertion_order: VecDeque<String>,
}

/// Collision-checked generator for [`ProcessId`]s.
///
/// One instance per process, shared by handle; all state lives behind a
/// mutex so concurrent request handlers can mint ids safely.
pub struct ProcessIdGenerator {
    state: Mutex<GeneratorState>,
}

impl ProcessIdGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                sequence: 0,
                recent: HashSet::new(),
                insertion_order: VecDeque::new(),
            }),
        }
    }

    /// Mint a new process id. Fails only on pathological exhaustion of the
    /// collision-retry budget, which callers must treat as "cannot start
    /// job".
    pub fn generate(&self) -> Result<ProcessId, PidError> {
        let mut state = self.state.lock().expect("pid generator lock poisoned");

        for _ in 0..MAX_ATTEMPTS {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let sequence = state.sequence;
            state.sequence = (state.sequence + 1) % SEQUENCE_WRAP;

            let mut random = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut random);

            let candidate = format!("{timestamp:013}{sequence:03}{}", hex::encode(random));

            if state.recent.contains(&candidate) {
                continue;
            }

            state.recent.insert(candidate.clone());
            state.insertion_order.push_back(candidate.clone());
            if state.insertion_order.len() > RECENT_CAPACITY {
                if let Some(oldest) = state.insertion_order.pop_front() {
                    state.recent.remove(&oldest);
                }
            }

            return Ok(ProcessId(candidate));
        }

        Err(PidError::Exhausted(MAX_ATTEMPTS))
    }
}

impl Default for ProcessIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
