//! Scheduled collection rotation
//!
//! A cron expression on the collection options starts a background timer.
//! When it fires, the collection is archived under a dated name through
//! its own adapter, then reset and persisted empty.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tracing::{info, warn};

use crate::clock::archive_stamp;
use crate::error::{DbError, Result};

use super::core::Collection;

/// Background rotation timer; stopped on collection drop
pub(crate) struct RotationHandle {
    handle: Option<thread::JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
}

impl RotationHandle {
    pub(crate) fn stop(&mut self) {
        self.should_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Accept classic 5-field cron expressions by prefixing the seconds field
pub(crate) fn parse_schedule(expr: &str) -> Result<Schedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| DbError::InvalidConfig(format!("bad rotation schedule '{}': {}", expr, e)))
}

impl Collection {
    /// Start the rotation timer when the collection configures `rotate`.
    /// Returns `false` when no schedule is configured.
    pub fn start_rotation(self: &Arc<Self>) -> Result<bool> {
        let expr = match self.config.read().rotate.clone() {
            Some(e) => e,
            None => return Ok(false),
        };
        let schedule = parse_schedule(&expr)?;

        let mut slot = self.rotation.lock();
        if slot.is_some() {
            return Ok(true);
        }

        let should_stop = Arc::new(AtomicBool::new(false));
        let stop = should_stop.clone();
        let weak = Arc::downgrade(self);
        let name = self.name().to_string();

        let handle = thread::spawn(move || {
            'outer: while !stop.load(Ordering::Relaxed) {
                let next = match schedule.upcoming(Utc).next() {
                    Some(n) => n,
                    None => break,
                };
                while Utc::now() < next {
                    if stop.load(Ordering::Relaxed) {
                        break 'outer;
                    }
                    let remaining = (next - Utc::now()).num_milliseconds().max(0) as u64;
                    thread::sleep(Duration::from_millis(remaining.min(500)));
                }
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                match weak.upgrade() {
                    Some(collection) => {
                        if let Err(e) = collection.rotate_now() {
                            warn!(collection = %name, error = %e, "rotation failed");
                        }
                    }
                    None => break,
                }
            }
        });

        *slot = Some(RotationHandle {
            handle: Some(handle),
            should_stop,
        });
        Ok(true)
    }

    pub fn stop_rotation(&self) {
        if let Some(mut handle) = self.rotation.lock().take() {
            handle.stop();
        }
    }

    /// Archive the collection under a dated name, then reset and persist
    /// the empty state.
    pub fn rotate_now(&self) -> Result<String> {
        let archive = format!("{}_{}", self.name(), archive_stamp());
        self.persist(Some(&archive))?;
        self.reset()?;
        self.persist(None)?;
        info!(collection = %self.name(), archive = %archive, "collection rotated");
        Ok(archive)
    }
}
