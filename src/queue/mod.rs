//! Queue dispatchers: dirty, lazy and log queues.
//!
//! All receivers share one contract: a settable heartbeat, `disable_loop`
//! for single-drain test runs, and a bounded maximum loop duration.
//! Handler failures are logged and the loop continues; receivers never
//! terminate on a bad record.

pub mod dirty;
pub mod lazy;
pub mod log;

pub use dirty::{DirtyData, DirtyReceiver, DirtyRejection};
pub use lazy::LazyReceiver;
pub use log::{LogReceiver, LogRecord};

use std::time::{Duration, Instant};

/// Physical queue name for a code; the default code keeps the bare name.
#[must_use]
pub(crate) fn queue_name(base: &str, code: &str) -> String {
    if code.is_empty() || code == "default" {
        base.to_string()
    } else {
        format!("{base}_{code}")
    }
}

/// Shared receiver knobs.
pub struct ReceiverOptions {
    heartbeat: Option<Box<dyn FnMut()>>,
    disable_loop: bool,
    max_loop_duration: Duration,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            heartbeat: None,
            disable_loop: false,
            max_loop_duration: Duration::from_secs(30),
        }
    }
}

impl ReceiverOptions {
    pub fn set_heartbeat(&mut self, beat: impl FnMut() + 'static) {
        self.heartbeat = Some(Box::new(beat));
    }

    /// Process the current backlog once, then return.
    pub fn disable_loop(&mut self) {
        self.disable_loop = true;
    }

    pub fn set_max_loop_duration(&mut self, duration: Duration) {
        self.max_loop_duration = duration;
    }

    fn beat(&mut self) {
        if let Some(beat) = &mut self.heartbeat {
            beat();
        }
    }
}

/// Drive `step` until the backlog drains (single-drain mode) or the loop
/// budget elapses. `step` returns whether it processed a record; it handles
/// its own errors.
pub(crate) fn run_loop(options: &mut ReceiverOptions, step: &mut dyn FnMut() -> bool) {
    let started = Instant::now();
    loop {
        while step() {
            if started.elapsed() >= options.max_loop_duration {
                options.beat();
                return;
            }
        }
        options.beat();
        if options.disable_loop || started.elapsed() >= options.max_loop_duration {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
