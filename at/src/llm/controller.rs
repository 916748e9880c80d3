//! Adaptive gateway controller
//!
//! Samples host load and gateway health on a fixed interval and drives
//! the queue's concurrency through a hysteresis state machine with a
//! standard circuit breaker (closed / open / half-open with a single
//! probe) and an emergency stop.

use std::sync::Arc;

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AdaptiveConfig;

use super::queue::{CircuitState, GatewayControl, WindowStats};

/// Controller position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Normal,
    ScaledUp,
    ScaledDown,
    CircuitOpen,
    HalfOpen,
    EmergencyStop,
}

/// One host reading
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSample {
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

/// Produces host readings; boxed so tests can script them
pub trait HostSampler: Send {
    fn sample(&mut self) -> HostSample;
}

/// Real host readings via sysinfo
pub struct SysinfoSampler {
    system: sysinfo::System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: sysinfo::System::new(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler for SysinfoSampler {
    fn sample(&mut self) -> HostSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let mem_percent = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total as f64 * 100.0
        };
        HostSample {
            cpu_percent: self.system.global_cpu_usage() as f64,
            mem_percent,
        }
    }
}

struct ControlState {
    state: ControllerState,
    up_streak: u32,
    down_streak: u32,
    err_streak: u32,
    cooldown_until: Option<Instant>,
    manual_stop: bool,
}

/// The controller
pub struct AdaptiveController {
    config: AdaptiveConfig,
    gateway: Arc<dyn GatewayControl>,
    sampler: Mutex<Box<dyn HostSampler>>,
    control: Mutex<ControlState>,
    cancel: CancellationToken,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig, gateway: Arc<dyn GatewayControl>, sampler: Box<dyn HostSampler>) -> Arc<Self> {
        Arc::new(Self {
            config,
            gateway,
            sampler: Mutex::new(sampler),
            control: Mutex::new(ControlState {
                state: ControllerState::Normal,
                up_streak: 0,
                down_streak: 0,
                err_streak: 0,
                cooldown_until: None,
                manual_stop: false,
            }),
            cancel: CancellationToken::new(),
        })
    }

    /// Current state
    pub async fn state(&self) -> ControllerState {
        self.control.lock().await.state
    }

    /// Manual emergency stop; takes effect on the next sample
    pub async fn emergency_stop(&self) {
        self.control.lock().await.manual_stop = true;
        warn!("Manual emergency stop requested");
    }

    /// Clear a manual stop
    pub async fn resume(&self) {
        self.control.lock().await.manual_stop = false;
        info!("Manual emergency stop cleared");
    }

    /// The sampling loop
    pub async fn run(self: Arc<Self>) {
        info!("Adaptive controller started");
        let interval = Duration::from_secs(self.config.sample_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let host = self.sampler.lock().await.sample();
            let window = self.gateway.window().await;
            self.step(host, window).await;
        }
        info!("Adaptive controller stopped");
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// One control decision; factored out of the loop so behavior is
    /// testable with synthetic samples
    pub async fn step(&self, host: HostSample, window: WindowStats) -> ControllerState {
        let mut control = self.control.lock().await;
        let config = &self.config;
        let now = Instant::now();

        // Emergency stop dominates everything else
        if control.manual_stop || host.mem_percent > config.emergency_mem {
            if control.state != ControllerState::EmergencyStop {
                warn!(
                    mem = host.mem_percent,
                    manual = control.manual_stop,
                    "Emergency stop: halting gateway and cancelling in-flight work"
                );
                self.gateway.set_concurrency(0).await;
                self.gateway.cancel_in_flight().await;
                control.state = ControllerState::EmergencyStop;
            }
            return control.state;
        }
        if control.state == ControllerState::EmergencyStop {
            info!("Emergency condition cleared, resuming at minimum concurrency");
            self.gateway.set_circuit(CircuitState::Closed).await;
            self.gateway.set_concurrency(1).await;
            control.state = ControllerState::Normal;
            control.up_streak = 0;
            control.down_streak = 0;
            control.err_streak = 0;
            return control.state;
        }

        match control.state {
            ControllerState::CircuitOpen => {
                if control.cooldown_until.is_some_and(|t| now >= t) {
                    info!("Circuit cooldown elapsed, probing half-open");
                    self.gateway.set_circuit(CircuitState::HalfOpen).await;
                    self.gateway.set_concurrency(1).await;
                    control.state = ControllerState::HalfOpen;
                }
                return control.state;
            }
            ControllerState::HalfOpen => {
                if window.error_rate >= config.circuit_threshold {
                    warn!(error_rate = window.error_rate, "Half-open probe failed, reopening circuit");
                    self.gateway.set_circuit(CircuitState::Open).await;
                    self.gateway.set_concurrency(0).await;
                    control.cooldown_until = Some(now + Duration::from_secs(config.cooldown_secs));
                    control.state = ControllerState::CircuitOpen;
                } else {
                    info!("Half-open probe healthy, closing circuit");
                    self.gateway.set_circuit(CircuitState::Closed).await;
                    control.state = ControllerState::Normal;
                    control.err_streak = 0;
                }
                return control.state;
            }
            _ => {}
        }

        // Breaker: sustained error rate opens the circuit
        if window.error_rate >= config.circuit_threshold {
            control.err_streak += 1;
        } else {
            control.err_streak = 0;
        }
        if control.err_streak >= config.open_window_samples {
            warn!(
                error_rate = window.error_rate,
                sustained = control.err_streak,
                "Error rate sustained, opening circuit"
            );
            self.gateway.set_circuit(CircuitState::Open).await;
            self.gateway.set_concurrency(0).await;
            control.cooldown_until = Some(now + Duration::from_secs(config.cooldown_secs));
            control.err_streak = 0;
            control.state = ControllerState::CircuitOpen;
            return control.state;
        }

        // Scaling with hysteresis
        let overloaded = host.cpu_percent > config.high_cpu
            || host.mem_percent > config.high_mem
            || window.p95_latency_ms > config.high_latency_ms;
        let hungry = window.depth > config.high_watermark
            && window.error_rate < 0.05
            && host.cpu_percent < config.scale_up_cpu;

        if overloaded {
            control.down_streak += 1;
            control.up_streak = 0;
        } else if hungry {
            control.up_streak += 1;
            control.down_streak = 0;
        } else {
            control.up_streak = 0;
            control.down_streak = 0;
            control.state = ControllerState::Normal;
        }

        if control.down_streak >= config.hysteresis {
            let current = self.gateway.concurrency().await;
            if current > 1 {
                debug!(from = current, to = current - 1, "Scaling down");
                self.gateway.set_concurrency(current - 1).await;
            }
            control.state = ControllerState::ScaledDown;
            control.down_streak = 0;
        } else if control.up_streak >= config.hysteresis {
            let current = self.gateway.concurrency().await;
            if current < config.max_workers {
                debug!(from = current, to = current + 1, "Scaling up");
                self.gateway.set_concurrency(current + 1).await;
            }
            control.state = ControllerState::ScaledUp;
            control.up_streak = 0;
        }

        control.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Gateway mock recording the knobs the controller turns
    struct MockGateway {
        concurrency: AtomicUsize,
        circuit: Mutex<CircuitState>,
        cancels: AtomicUsize,
    }

    impl MockGateway {
        fn new(concurrency: usize) -> Arc<Self> {
            Arc::new(Self {
                concurrency: AtomicUsize::new(concurrency),
                circuit: Mutex::new(CircuitState::Closed),
                cancels: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl GatewayControl for MockGateway {
        async fn set_concurrency(&self, n: usize) {
            self.concurrency.store(n, Ordering::SeqCst);
        }

        async fn concurrency(&self) -> usize {
            self.concurrency.load(Ordering::SeqCst)
        }

        async fn set_circuit(&self, state: CircuitState) {
            *self.circuit.lock().await = state;
        }

        async fn circuit(&self) -> CircuitState {
            *self.circuit.lock().await
        }

        async fn cancel_in_flight(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        async fn window(&self) -> WindowStats {
            WindowStats::default()
        }
    }

    struct IdleSampler;

    impl HostSampler for IdleSampler {
        fn sample(&mut self) -> HostSample {
            HostSample {
                cpu_percent: 10.0,
                mem_percent: 20.0,
            }
        }
    }

    fn config() -> AdaptiveConfig {
        AdaptiveConfig {
            sample_interval_secs: 1,
            high_watermark: 8,
            max_workers: 4,
            scale_up_cpu: 70.0,
            high_cpu: 85.0,
            high_mem: 90.0,
            high_latency_ms: 10_000,
            circuit_threshold: 0.5,
            open_window_samples: 3,
            cooldown_secs: 30,
            hysteresis: 2,
            emergency_mem: 97.0,
        }
    }

    fn controller(gateway: Arc<MockGateway>) -> Arc<AdaptiveController> {
        AdaptiveController::new(config(), gateway, Box::new(IdleSampler))
    }

    fn idle_host() -> HostSample {
        HostSample {
            cpu_percent: 10.0,
            mem_percent: 20.0,
        }
    }

    fn deep_queue() -> WindowStats {
        WindowStats {
            error_rate: 0.0,
            p95_latency_ms: 200,
            depth: 20,
            active: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_requires_hysteresis() {
        let gateway = MockGateway::new(2);
        let controller = controller(Arc::clone(&gateway));

        // First qualifying sample is not enough
        assert_eq!(controller.step(idle_host(), deep_queue()).await, ControllerState::Normal);
        assert_eq!(gateway.concurrency().await, 2);

        // Second consecutive sample crosses the hysteresis bar
        assert_eq!(controller.step(idle_host(), deep_queue()).await, ControllerState::ScaledUp);
        assert_eq!(gateway.concurrency().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_capped_at_max_workers() {
        let gateway = MockGateway::new(4);
        let controller = controller(Arc::clone(&gateway));

        for _ in 0..6 {
            controller.step(idle_host(), deep_queue()).await;
        }
        assert_eq!(gateway.concurrency().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruption_resets_streak() {
        let gateway = MockGateway::new(2);
        let controller = controller(Arc::clone(&gateway));

        controller.step(idle_host(), deep_queue()).await;
        // A calm sample breaks the streak
        controller.step(idle_host(), WindowStats::default()).await;
        controller.step(idle_host(), deep_queue()).await;
        assert_eq!(gateway.concurrency().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_on_cpu_floor_one() {
        let gateway = MockGateway::new(2);
        let controller = controller(Arc::clone(&gateway));

        let hot = HostSample {
            cpu_percent: 95.0,
            mem_percent: 30.0,
        };
        controller.step(hot, WindowStats::default()).await;
        let state = controller.step(hot, WindowStats::default()).await;
        assert_eq!(state, ControllerState::ScaledDown);
        assert_eq!(gateway.concurrency().await, 1);

        // Floor: never below one
        controller.step(hot, WindowStats::default()).await;
        controller.step(hot, WindowStats::default()).await;
        assert_eq!(gateway.concurrency().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_latency_scales_down() {
        let gateway = MockGateway::new(3);
        let controller = controller(Arc::clone(&gateway));

        let slow = WindowStats {
            p95_latency_ms: 60_000,
            ..Default::default()
        };
        controller.step(idle_host(), slow).await;
        controller.step(idle_host(), slow).await;
        assert_eq!(gateway.concurrency().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_sustained_errors() {
        let gateway = MockGateway::new(2);
        let controller = controller(Arc::clone(&gateway));

        let failing = WindowStats {
            error_rate: 0.6,
            ..Default::default()
        };

        controller.step(idle_host(), failing).await;
        controller.step(idle_host(), failing).await;
        assert_eq!(gateway.circuit().await, CircuitState::Closed);

        // Third sustained sample opens the circuit and halts dispatch
        let state = controller.step(idle_host(), failing).await;
        assert_eq!(state, ControllerState::CircuitOpen);
        assert_eq!(gateway.circuit().await, CircuitState::Open);
        assert_eq!(gateway.concurrency().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_and_close() {
        let gateway = MockGateway::new(2);
        let controller = controller(Arc::clone(&gateway));

        let failing = WindowStats {
            error_rate: 1.0,
            ..Default::default()
        };
        for _ in 0..3 {
            controller.step(idle_host(), failing).await;
        }
        assert_eq!(controller.state().await, ControllerState::CircuitOpen);

        // Still open before the cooldown elapses
        controller.step(idle_host(), WindowStats::default()).await;
        assert_eq!(controller.state().await, ControllerState::CircuitOpen);

        // After cooldown: half-open with exactly one probe slot
        tokio::time::advance(Duration::from_secs(31)).await;
        let state = controller.step(idle_host(), WindowStats::default()).await;
        assert_eq!(state, ControllerState::HalfOpen);
        assert_eq!(gateway.circuit().await, CircuitState::HalfOpen);
        assert_eq!(gateway.concurrency().await, 1);

        // Healthy probe closes the circuit
        let state = controller.step(idle_host(), WindowStats::default()).await;
        assert_eq!(state, ControllerState::Normal);
        assert_eq!(gateway.circuit().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let gateway = MockGateway::new(2);
        let controller = controller(Arc::clone(&gateway));

        let failing = WindowStats {
            error_rate: 1.0,
            ..Default::default()
        };
        for _ in 0..3 {
            controller.step(idle_host(), failing).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        controller.step(idle_host(), WindowStats::default()).await;
        assert_eq!(controller.state().await, ControllerState::HalfOpen);

        // Probe still failing: back to open with a fresh cooldown
        let state = controller.step(idle_host(), failing).await;
        assert_eq!(state, ControllerState::CircuitOpen);
        assert_eq!(gateway.circuit().await, CircuitState::Open);
        assert_eq!(gateway.concurrency().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_on_memory() {
        let gateway = MockGateway::new(3);
        let controller = controller(Arc::clone(&gateway));

        let swamped = HostSample {
            cpu_percent: 50.0,
            mem_percent: 98.5,
        };
        let state = controller.step(swamped, WindowStats::default()).await;
        assert_eq!(state, ControllerState::EmergencyStop);
        assert_eq!(gateway.concurrency().await, 0);
        assert_eq!(gateway.cancels.load(Ordering::SeqCst), 1);

        // Memory recovers: resume at minimum concurrency
        let state = controller.step(idle_host(), WindowStats::default()).await;
        assert_eq!(state, ControllerState::Normal);
        assert_eq!(gateway.concurrency().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_emergency_stop_and_resume() {
        let gateway = MockGateway::new(3);
        let controller = controller(Arc::clone(&gateway));

        controller.emergency_stop().await;
        let state = controller.step(idle_host(), WindowStats::default()).await;
        assert_eq!(state, ControllerState::EmergencyStop);
        assert_eq!(gateway.concurrency().await, 0);

        // Still stopped while the flag is set
        let state = controller.step(idle_host(), WindowStats::default()).await;
        assert_eq!(state, ControllerState::EmergencyStop);

        controller.resume().await;
        let state = controller.step(idle_host(), WindowStats::default()).await;
        assert_eq!(state, ControllerState::Normal);
        assert_eq!(gateway.concurrency().await, 1);
    }
}
