//! The background query notifier.
//!
//! One coordinator thread per hub consumes registered result sets in
//! order: after every commit it re-evaluates each registration against the
//! latest snapshot, diffs it against the previous evaluation, and invokes
//! the callback with the change set. Deliveries for one registration are
//! strictly version-ordered because a single thread does all the work.
//!
//! Dropping the [`NotificationToken`] cancels a registration; in-flight
//! work completes but its result is discarded. An evaluation failure is
//! delivered through the callback as an error change set, after which the
//! registration stops for good.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use tarn_core::Db;
use tarn_types::{Mixed, VersionId};

use crate::results::{Entry, Results};

/// The difference between two consecutive evaluations of a `Results`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Version the new evaluation is bound to.
    pub version: VersionId,
    /// Indices (into the previous view) of entries that disappeared.
    pub deletions: Vec<usize>,
    /// Indices (into the new view) of entries that appeared.
    pub insertions: Vec<usize>,
    /// Indices (into the new view) of surviving entries whose visible
    /// values changed.
    pub modifications: Vec<usize>,
    /// Set when evaluation failed; no further deliveries follow.
    pub error: Option<String>,
}

impl ChangeSet {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
            && self.insertions.is_empty()
            && self.modifications.is_empty()
            && self.error.is_none()
    }
}

/// Callback invoked on the coordinator thread for each delivery.
pub type NotificationCallback = Box<dyn FnMut(&ChangeSet) + Send>;

struct Registration {
    id: u64,
    results: Results,
    fingerprint: Option<Vec<(Entry, Vec<Mixed>)>>,
    callback: NotificationCallback,
}

#[derive(Default)]
struct HubState {
    regs: Vec<Registration>,
    dead: HashSet<u64>,
    pending: bool,
    shutdown: bool,
    next_id: u64,
}

struct HubShared {
    state: Mutex<HubState>,
    cv: Condvar,
}

/// Keeps one registration alive; dropping it cancels the stream.
pub struct NotificationToken {
    id: u64,
    shared: Arc<HubShared>,
}

impl Drop for NotificationToken {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.dead.insert(self.id);
        state.pending = true;
        drop(state);
        self.shared.cv.notify_one();
    }
}

/// The notifier coordinator bound to one database.
pub struct NotifierHub {
    shared: Arc<HubShared>,
    handle: Option<JoinHandle<()>>,
}

impl NotifierHub {
    /// Start a coordinator for `db`. Commits wake the coordinator through
    /// a commit observer.
    #[must_use]
    pub fn new(db: &Db) -> Self {
        let shared = Arc::new(HubShared {
            state: Mutex::new(HubState::default()),
            cv: Condvar::new(),
        });

        let observer_shared = Arc::clone(&shared);
        db.add_commit_observer(Box::new(move |_version| {
            observer_shared.state.lock().pending = true;
            observer_shared.cv.notify_one();
        }));

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("tarn-notifier".to_owned())
            .spawn(move || run_coordinator(&worker_shared))
            .expect("spawning the notifier coordinator");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Register a result set. The first delivery (an empty change set)
    /// establishes the baseline; later deliveries carry diffs in version
    /// order.
    pub fn register(&self, results: Results, callback: NotificationCallback) -> NotificationToken {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.regs.push(Registration {
            id,
            results,
            fingerprint: None,
            callback,
        });
        state.pending = true;
        drop(state);
        self.cv_notify();
        NotificationToken {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    fn cv_notify(&self) {
        self.shared.cv.notify_one();
    }
}

impl Drop for NotifierHub {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.cv.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_coordinator(shared: &HubShared) {
    loop {
        let regs = {
            let mut state = shared.state.lock();
            while !state.pending && !state.shutdown {
                shared.cv.wait(&mut state);
            }
            if state.shutdown {
                return;
            }
            state.pending = false;
            std::mem::take(&mut state.regs)
        };

        let mut survivors = Vec::with_capacity(regs.len());
        for mut reg in regs {
            if shared.state.lock().dead.contains(&reg.id) {
                continue; // cancelled; discard silently
            }
            match process(&mut reg) {
                Ok(()) => survivors.push(reg),
                Err(message) => {
                    warn!(id = reg.id, %message, "notifier evaluation failed");
                    let change = ChangeSet {
                        error: Some(message),
                        ..ChangeSet::default()
                    };
                    (reg.callback)(&change);
                    // The registration stops delivering for good.
                }
            }
        }

        let mut state = shared.state.lock();
        for reg in survivors {
            if !state.dead.contains(&reg.id) {
                state.regs.push(reg);
            }
        }
        let dead = std::mem::take(&mut state.dead);
        state.regs.retain(|r| !dead.contains(&r.id));
    }
}

/// Re-evaluate one registration and deliver its diff.
fn process(reg: &mut Registration) -> std::result::Result<(), String> {
    let new = reg.results.fingerprint().map_err(|e| e.to_string())?;
    let version = reg.results.content_version().unwrap_or_default();

    let change = match &reg.fingerprint {
        None => ChangeSet {
            version,
            ..ChangeSet::default()
        },
        Some(old) => diff(old, &new, version),
    };
    let first = reg.fingerprint.is_none();
    let should_deliver = first || reg.fingerprint.as_ref() != Some(&new) || !change.is_empty();
    reg.fingerprint = Some(new);
    if should_deliver {
        debug!(id = reg.id, version = %change.version, "notifier delivery");
        (reg.callback)(&change);
    }
    Ok(())
}

fn diff(
    old: &[(Entry, Vec<Mixed>)],
    new: &[(Entry, Vec<Mixed>)],
    version: VersionId,
) -> ChangeSet {
    let mut change = ChangeSet {
        version,
        ..ChangeSet::default()
    };
    for (i, (entry, _)) in old.iter().enumerate() {
        if !new.iter().any(|(e, _)| e == entry) {
            change.deletions.push(i);
        }
    }
    for (j, (entry, values)) in new.iter().enumerate() {
        match old.iter().find(|(e, _)| e == entry) {
            None => change.insertions.push(j),
            Some((_, old_values)) => {
                if old_values != values {
                    change.modifications.push(j);
                }
            }
        }
    }
    change
}
