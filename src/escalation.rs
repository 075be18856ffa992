//! Escalation Timer
//!
//! Armed by the router on the first graceful termination signal of a
//! generation. If the dataplane has not been reaped when the timeout
//! expires, one SIGKILL is queued for that generation. A reap (or the
//! generation being retired) wakes the timer early and it exits quietly.

use crate::lifecycle::{Generation, SharedState};
use crate::signals::{Delivery, Origin, SignalInjector};
use nix::sys::signal::Signal;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Start the timer thread for `generation`.
pub fn arm(
    shared: Arc<SharedState>,
    injector: SignalInjector,
    generation: Generation,
    timeout: Duration,
) -> io::Result<JoinHandle<bool>> {
    debug!(generation, ?timeout, "escalation timer armed");
    thread::Builder::new()
        .name(format!("escalation-{}", generation))
        .spawn(move || expire(&shared, &injector, generation, timeout))
}

/// Wait out the timeout; returns whether a SIGKILL was queued.
fn expire(
    shared: &SharedState,
    injector: &SignalInjector,
    generation: Generation,
    timeout: Duration,
) -> bool {
    let (mut state, timed_out) = shared.wait_reaped(generation, timeout);
    if !timed_out || !state.is_live_generation(generation) {
        debug!(generation, "dataplane gone before escalation deadline");
        return false;
    }

    let flags = state.flags_mut(generation);
    if flags.timed_out {
        return false;
    }
    flags.timed_out = true;
    drop(state);

    info!(generation, ?timeout, "timeout: sending SIGKILL to dataplane");
    injector.send(Delivery::targeted(
        Signal::SIGKILL,
        Origin::Escalation,
        generation,
    ));
    true
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeProcess;
    use crate::signals::channel;

    #[test]
    fn test_fires_sigkill_after_timeout() {
        let shared = Arc::new(SharedState::new());
        let generation = shared.advance_generation();
        shared.publish(generation, FakeProcess::arc(5));
        let (injector, queue) = channel();

        let timer = arm(Arc::clone(&shared), injector, generation, Duration::from_millis(20)).unwrap();
        assert!(timer.join().unwrap());

        let delivery = queue.try_recv().unwrap();
        assert_eq!(
            delivery,
            Delivery::targeted(Signal::SIGKILL, Origin::Escalation, generation)
        );
        assert!(shared.lock().flags(generation).timed_out);
    }

    #[test]
    fn test_noop_when_reaped_before_deadline() {
        let shared = Arc::new(SharedState::new());
        let generation = shared.advance_generation();
        shared.publish(generation, FakeProcess::arc(5));
        let (injector, queue) = channel();

        let timer = arm(Arc::clone(&shared), injector, generation, Duration::from_secs(30)).unwrap();
        shared.lock().flags_mut(generation).reaped = true;
        shared.notify();

        assert!(!timer.join().unwrap());
        assert!(queue.try_recv().is_err());
        assert!(!shared.lock().flags(generation).timed_out);
    }

    #[test]
    fn test_noop_when_generation_superseded() {
        let shared = Arc::new(SharedState::new());
        let generation = shared.advance_generation();
        shared.publish(generation, FakeProcess::arc(5));
        let (injector, queue) = channel();

        let timer = arm(Arc::clone(&shared), injector, generation, Duration::from_secs(30)).unwrap();
        shared.retract();
        shared.advance_generation();

        assert!(!timer.join().unwrap());
        assert!(queue.try_recv().is_err());
    }

    #[test]
    fn test_only_one_kill_per_generation() {
        let shared = Arc::new(SharedState::new());
        let generation = shared.advance_generation();
        shared.publish(generation, FakeProcess::arc(5));
        let (injector, queue) = channel();

        let first = arm(Arc::clone(&shared), injector.clone(), generation, Duration::from_millis(10)).unwrap();
        assert!(first.join().unwrap());
        let second = arm(Arc::clone(&shared), injector, generation, Duration::from_millis(10)).unwrap();
        assert!(!second.join().unwrap());

        assert_eq!(queue.try_iter().count(), 1);
    }
}
