use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Runs `tick` every `period` for as long as `target` is alive.
///
/// The task only holds a weak reference, so it never keeps its owner (or the
/// runtime) alive; it ends on the first tick after the owner is dropped.
pub(crate) fn spawn_sweeper<T, F>(target: Weak<T>, period: Duration, tick: F) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(&Arc<T>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(target) = target.upgrade() else {
                break;
            };
            tick(&target);
        }
    })
}
