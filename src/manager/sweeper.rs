//! Idle timeout sweep timer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::context::{Completion, Context};

/// Post a sweep tick every `period` until the manager goes away
///
/// `pending` is set while a tick sits in the queue; the manager clears it
/// when the tick is handled. Ticks that fall due meanwhile are skipped.
pub(crate) fn spawn(period: Duration, ctx: Context, pending: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = interval.tick() => {
                    if pending.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    if !ctx.post(Completion::SweepTick) {
                        break;
                    }
                }
            }
        }
    })
}
