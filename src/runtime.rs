//! Single-task driver for a started registry.
//!
//! Periodic state pushes and inbound hub commands are handled on the same
//! task, so entity callbacks never run concurrently with an update cycle.

use crate::registry::Registry;
use crate::router::Router;
use crate::transport::InboundMessage;
use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Run update cycles every `interval` and dispatch inbound messages until
/// `shutdown` completes.
///
/// `after_cycle` runs after every update cycle (e.g. to clear a
/// [`FuncCallLimiter`](crate::helpers::FuncCallLimiter)). Failed updates are
/// logged and do not end the loop. Returns the number of completed cycles.
pub async fn run_update_loop<S, F>(
    registry: &Registry,
    router: &Router,
    mut inbound: mpsc::Receiver<InboundMessage>,
    interval: Duration,
    shutdown: S,
    mut after_cycle: F,
) -> u64
where
    S: Future<Output = ()>,
    F: FnMut(),
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut inbound_open = true;
    let mut cycles = 0;

    info!("[Runtime] Update loop running every {:?}", interval);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("[Runtime] Shutdown requested after {} cycles", cycles);
                break;
            }
            message = inbound.recv(), if inbound_open => match message {
                Some(InboundMessage { topic, payload }) => {
                    let handled = router.dispatch(&topic, &payload);
                    debug!("[Runtime] {} handled by {} handlers", topic, handled);
                }
                None => {
                    warn!("[Runtime] Inbound channel closed, commands will no longer arrive");
                    inbound_open = false;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = registry.send_updates() {
                    warn!("[Runtime] {}", e);
                }
                after_cycle();
                cycles += 1;
            }
        }
    }

    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityConfig;
    use crate::helpers::FuncCallLimiter;
    use crate::sensor::Sensor;
    use crate::switch::Switch;
    use crate::transport::{MemoryTransport, Payload};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_commands_and_updates_on_one_task() {
        let transport = Arc::new(MemoryTransport::new());
        let router = Router::new(transport.clone());
        let mut registry = Registry::new().with_settle_delay(Duration::ZERO);

        let switch = Switch::builder(EntityConfig::new("Pump"))
            .on_change(|_| {})
            .build(&router)
            .unwrap();
        registry.add_component(switch.clone(), true);

        let (tx, rx) = mpsc::channel(8);
        tx.send(InboundMessage {
            topic: switch.command_topic_name().to_string(),
            payload: "on".to_string(),
        })
        .await
        .unwrap();

        let cycles = run_update_loop(
            &registry,
            &router,
            rx,
            Duration::from_millis(5),
            tokio::time::sleep(Duration::from_millis(40)),
            || {},
        )
        .await;

        assert!(cycles >= 1);
        assert!(switch.is_on());
        assert!(
            transport
                .messages("homeassistant/switch/pump/state")
                .contains(&Payload::from("on"))
        );
    }

    #[tokio::test]
    async fn test_after_cycle_clears_limiter() {
        let transport = Arc::new(MemoryTransport::new());
        let router = Router::new(transport.clone());
        let mut registry = Registry::new();

        let limiter = FuncCallLimiter::new();
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let source = Arc::new(limiter.wrap(move || counter.fetch_add(1, Ordering::SeqCst) as f64));
        for name in ["A", "B"] {
            let source = source.clone();
            let sensor = Sensor::builder(EntityConfig::new(name), "")
                .state_fn(move || (*source)())
                .build(&router)
                .unwrap();
            registry.add_component(sensor, true);
        }

        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let cycles = run_update_loop(
            &registry,
            &router,
            rx,
            Duration::from_millis(5),
            tokio::time::sleep(Duration::from_millis(30)),
            || limiter.clear(),
        )
        .await;

        // One real read per cycle, shared by both sensors.
        assert_eq!(reads.load(Ordering::SeqCst) as u64, cycles);
        assert_eq!(
            transport.messages("homeassistant/sensor/a/state"),
            transport.messages("homeassistant/sensor/b/state")
        );
    }
}
