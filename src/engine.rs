//! Top-level context: every component constructed once, wired by handle.

use std::sync::Arc;
use std::time::Duration;

use crate::config::MonitorConfig;
use crate::error::InitError;
use crate::gate::SecureGate;
use crate::link::LinkStatus;
use crate::monitor::{ScanControl, ScanOrchestrator, ScanSummary};
use crate::notify::{AlertChannel, AlertManager, TelegramChannel};
use crate::resource::{HeapProbe, ResourceGuard};
use crate::scheduler::{
    event_queue, EventReceiver, PresentationSink, Scheduler, SchedulerHandle, StatusBoard,
};
use crate::server::AppState;
use crate::transport::{HttpTransport, Prober};
use crate::types::TargetSnapshot;

pub struct Engine {
    config: MonitorConfig,
    guard: Arc<ResourceGuard>,
    gate: SecureGate,
    link: Arc<dyn LinkStatus>,
    transport: Arc<HttpTransport>,
    control: Arc<ScanControl>,
    board: StatusBoard,
    orchestrator: ScanOrchestrator,
    events: EventReceiver,
}

impl Engine {
    /// Build with the HTTP transport as prober. `channel` replaces the
    /// configured Telegram channel when given.
    pub fn build(
        config: MonitorConfig,
        link: Arc<dyn LinkStatus>,
        heap: impl HeapProbe + 'static,
        channel: Option<Arc<dyn AlertChannel>>,
    ) -> Result<Self, InitError> {
        Self::build_with(config, link, heap, channel, None)
    }

    /// Like [`build`](Self::build), with an optional prober replacing the
    /// HTTP transport for checks (alert delivery still uses the transport).
    pub fn build_with(
        config: MonitorConfig,
        link: Arc<dyn LinkStatus>,
        heap: impl HeapProbe + 'static,
        channel: Option<Arc<dyn AlertChannel>>,
        prober: Option<Arc<dyn Prober>>,
    ) -> Result<Self, InitError> {
        let guard = Arc::new(ResourceGuard::new(config.resource.clone(), heap));
        let max_wait = config.transport.gate_wait_ms.max(config.channel.gate_wait_ms);
        let gate = SecureGate::new(Duration::from_millis(max_wait));

        let transport = Arc::new(HttpTransport::new(
            config.transport.clone(),
            config.health.clone(),
            gate.clone(),
            guard.clone(),
            link.clone(),
        )?);
        guard.register(transport.clone());

        let channel = channel.or_else(|| {
            TelegramChannel::new(&config.channel, transport.clone(), guard.clone())
                .map(|c| Arc::new(c) as Arc<dyn AlertChannel>)
        });
        if channel.is_none() {
            tracing::info!("no alert channel configured, alerts are tracked but not delivered");
        }
        let alerts = AlertManager::new(
            config.targets.len(),
            config.alert.clone(),
            channel,
            config.timezone_offset_secs,
        );

        let (tx, events) = event_queue(config.event_queue_capacity)?;
        let control = Arc::new(ScanControl::new(&config.scan, tx));
        let prober = prober.unwrap_or_else(|| transport.clone() as Arc<dyn Prober>);
        let orchestrator = ScanOrchestrator::new(
            config.targets.clone(),
            alerts,
            prober,
            guard.clone(),
            control.clone(),
            config.scan.clone(),
        );
        let board = StatusBoard::new(orchestrator.snapshots());

        Ok(Self {
            config,
            guard,
            gate,
            link,
            transport,
            control,
            board,
            orchestrator,
            events,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn guard(&self) -> &Arc<ResourceGuard> {
        &self.guard
    }

    pub fn gate(&self) -> &SecureGate {
        &self.gate
    }

    pub fn transport(&self) -> &Arc<HttpTransport> {
        &self.transport
    }

    pub fn control(&self) -> &Arc<ScanControl> {
        &self.control
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    pub fn orchestrator(&self) -> &ScanOrchestrator {
        &self.orchestrator
    }

    pub fn snapshots(&self) -> Vec<TargetSnapshot> {
        self.board.targets()
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.control.clone(),
            self.board.clone(),
            self.transport.metrics(),
            self.gate.clone(),
            self.guard.clone(),
        )
    }

    /// Send the startup announcement if the configuration asks for one.
    pub async fn announce_startup(&self) -> bool {
        if !self.config.channel.announce_startup {
            return false;
        }
        let networks = self.link.local_networks();
        self.orchestrator
            .alerts()
            .announce_startup(self.orchestrator.targets(), self.control.interval(), &networks)
            .await
    }

    /// One pass on the caller's runtime, with events applied to the board.
    pub async fn run_once(&mut self) -> Option<ScanSummary> {
        let summary = self.orchestrator.run_pass().await;
        let mut board = self.board.clone();
        self.events.drain(&mut board);
        summary
    }

    /// Hand everything to the two execution contexts.
    pub fn start(
        self,
        mut sinks: Vec<Box<dyn PresentationSink>>,
    ) -> Result<SchedulerHandle, InitError> {
        sinks.insert(0, Box::new(self.board.clone()));
        Scheduler::start(self.orchestrator, self.events, Box::new(sinks), self.guard)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("targets", &self.config.targets.len())
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}
