//! Synthetic reply-line feeds for tests and demos.
//!
//! The dispatcher's contract is defined solely by `process_line`; these
//! helpers are just producers of raw lines. `dispatch` pushes one set of
//! lines synchronously, `run_data_set` animates successive groups of lines
//! with a fixed delay between groups, the way a live actor trickles status
//! out during a long move.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};

use crate::actor::DispatcherHandle;
use crate::dispatcher::Dispatcher;
use crate::error::Result;

/// Push one set of lines synchronously, in order.
pub fn dispatch<S: AsRef<str>>(dispatcher: &mut Dispatcher, lines: &[S]) {
    for line in lines {
        dispatcher.process_line(line.as_ref());
    }
}

/// Push successive groups of lines through the actor handle, waiting
/// `delay_per_group` between groups. Each group lands back to back.
pub async fn run_data_set(
    handle: &DispatcherHandle,
    groups: &[Vec<String>],
    delay_per_group: Duration,
) -> Result<()> {
    let mut ticker = interval(delay_per_group);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for group in groups {
        ticker.tick().await;
        handle.process_lines(group.clone()).await?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::spawn;
    use crate::convert::{Arity, Converter, Field};
    use crate::keyvar::KeyVar;

    fn counter_dispatcher() -> (Dispatcher, KeyVar) {
        let mut dispatcher = Dispatcher::new("client");
        let kv = KeyVar::new("agile", "count", Arity::Exactly(1), vec![Converter::Int]);
        dispatcher.register_keyvar(&kv).unwrap();
        (dispatcher, kv)
    }

    #[test]
    fn test_dispatch_pushes_in_order() {
        let (mut dispatcher, kv) = counter_dispatcher();
        dispatch(
            &mut dispatcher,
            &[
                "client 0 agile i count=1",
                "client 0 agile i count=2",
                "client 0 agile i count=3",
            ],
        );
        assert_eq!(kv.get(), (vec![Field::Int(3)], true));
    }

    #[tokio::test]
    async fn test_run_data_set_animates_groups() {
        let (dispatcher, kv) = counter_dispatcher();
        let (handle, join) = spawn(dispatcher);

        let groups = vec![
            vec!["client 0 agile i count=1".to_string()],
            vec!["client 0 agile i count=2".to_string()],
        ];
        run_data_set(&handle, &groups, Duration::from_millis(10))
            .await
            .unwrap();

        // Give the actor a beat to drain the channel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(kv.get(), (vec![Field::Int(2)], true));

        handle.shutdown().await.unwrap();
        join.await.unwrap();
    }
}
