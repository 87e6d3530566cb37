//! Graceful shutdown cascade (spec.md section 5): warcry server, SSH
//! front-end, triggers, pushes, all bus publishers, PLC manager stop,
//! driver disconnect — in that exact order, behind one overall
//! watchdog.

use crate::plc_manager::PlcManager;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::warn;

const WATCHDOG: Duration = Duration::from_secs(2);

/// One stage's stop-signal channel plus the tasks it owns. Components
/// in a stage subscribe with `subscribe()` and select on the receiver
/// in their own run loop the way `PlcManager::spawn_polling` does.
pub struct ShutdownStage {
    name: &'static str,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
    tasks: JoinSet<()>,
}

impl ShutdownStage {
    fn new(name: &'static str) -> Self {
        let (tx, rx) = watch::channel(false);
        ShutdownStage { name, tx, rx, tasks: JoinSet::new() }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// Direct access to the stage's `JoinSet`, for components like
    /// `PlcManager::spawn_polling`/`HealthPublisher::spawn` that take
    /// a `JoinSet` themselves rather than a single future.
    pub fn tasks_mut(&mut self) -> &mut JoinSet<()> {
        &mut self.tasks
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(future);
    }

    async fn stop(&mut self) {
        let _ = self.tx.send(true);
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Coordinates the five task-bearing stages of the cascade. The PLC
/// manager itself is stopped directly (it owns no stage of its own —
/// its polling tasks already live in the caller's `JoinSet` behind the
/// same signal used for `buses`, since nothing downstream of polling
/// may observe a change after the PLC manager disconnects).
pub struct ShutdownCoordinator {
    pub warcry: ShutdownStage,
    pub ssh: ShutdownStage,
    pub triggers: ShutdownStage,
    pub pushes: ShutdownStage,
    pub buses: ShutdownStage,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        ShutdownCoordinator {
            warcry: ShutdownStage::new("warcry"),
            ssh: ShutdownStage::new("ssh"),
            triggers: ShutdownStage::new("triggers"),
            pushes: ShutdownStage::new("pushes"),
            buses: ShutdownStage::new("buses"),
        }
    }

    /// Runs the full cascade. If it has not finished within the 2s
    /// watchdog, gives up and returns anyway so the process can exit.
    pub async fn run(self, plc_manager: &PlcManager) {
        let cascade = self.drain(plc_manager);
        if tokio::time::timeout(WATCHDOG, cascade).await.is_err() {
            warn!("shutdown watchdog ({WATCHDOG:?}) expired with stages still draining; forcing exit");
        }
    }

    async fn drain(mut self, plc_manager: &PlcManager) {
        self.warcry.stop().await;
        self.ssh.stop().await;
        self.triggers.stop().await;
        self.pushes.stop().await;
        self.buses.stop().await;
        plc_manager.stop().await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::registry::DriverRegistry;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stages_drain_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut coordinator = ShutdownCoordinator::new();

        for (label, stage) in [
            ("warcry", &mut coordinator.warcry),
            ("ssh", &mut coordinator.ssh),
            ("triggers", &mut coordinator.triggers),
            ("pushes", &mut coordinator.pushes),
            ("buses", &mut coordinator.buses),
        ] {
            let mut rx = stage.subscribe();
            let order = order.clone();
            stage.spawn(async move {
                let _ = rx.changed().await;
                order.lock().unwrap().push(label);
            });
        }

        let registry = DriverRegistry::with_builtins();
        let plc_manager = PlcManager::new("acme", &[], &registry).unwrap();
        coordinator.run(&plc_manager).await;

        assert_eq!(*order.lock().unwrap(), vec!["warcry", "ssh", "triggers", "pushes", "buses"]);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_does_not_hang_forever_on_a_stuck_stage() {
        let mut coordinator = ShutdownCoordinator::new();
        let stuck_count = Arc::new(AtomicU8::new(0));
        let counter = stuck_count.clone();
        coordinator.warcry.spawn(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            // Never observes shutdown; simulates a misbehaving task.
            std::future::pending::<()>().await;
        });

        let registry = DriverRegistry::with_builtins();
        let plc_manager = PlcManager::new("acme", &[], &registry).unwrap();
        let started = tokio::time::Instant::now();
        coordinator.run(&plc_manager).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(stuck_count.load(Ordering::SeqCst), 1);
    }
}
