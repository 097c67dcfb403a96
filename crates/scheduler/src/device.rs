//! Per-device entry point: owns the scheduler thread and exposes the
//! submission, configuration and client-context operations.

use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kds_core::{PacketView, SchedulerConfig};
use tracing::{info, warn};

use crate::bitmap::BitSet;
use crate::buffer::ExecBuffer;
use crate::command::{CommandHandle, CommandSnapshot, CommandState, CommandStatus};
use crate::context::{ClaimKind, ClientContext, ContextId};
use crate::cu::{hls, CuModel};
use crate::error::{Result, SchedError};
use crate::exec::ConfigureRequest;
use crate::io::RegisterIo;
use crate::layout::BitstreamLayout;
use crate::metrics::SchedulerMetrics;
use crate::scheduler::{Control, Scheduler, Shared};

/// A command buffer plus optional routing for [`Device::submit`].
pub struct SubmitRequest {
    buffer: Box<dyn ExecBuffer>,
    cu_mask: Option<BitSet>,
    context: Option<ContextId>,
}

impl SubmitRequest {
    pub fn new(buffer: impl ExecBuffer + 'static) -> Self {
        Self::boxed(Box::new(buffer))
    }

    pub fn boxed(buffer: Box<dyn ExecBuffer>) -> Self {
        Self {
            buffer,
            cu_mask: None,
            context: None,
        }
    }

    /// Override the CU mask carried in the packet.
    pub fn eligible(mut self, mask: BitSet) -> Self {
        self.cu_mask = Some(mask);
        self
    }

    /// Submit on behalf of a registered client context.
    pub fn on_behalf_of(mut self, context: ContextId) -> Self {
        self.context = Some(context);
        self
    }
}

/// One accelerator device and its scheduler thread.
pub struct Device {
    shared: Arc<Shared>,
    control: Mutex<Sender<Control>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Validate `config` and start the scheduler thread.
    pub fn open(
        config: SchedulerConfig,
        io: Arc<dyn RegisterIo>,
        layout: Arc<dyn BitstreamLayout>,
    ) -> Result<Self> {
        config.validate()?;
        config.log_summary();

        let shared = Arc::new(Shared::new(&config, io));
        let (control, rx) = mpsc::channel();
        let scheduler = Scheduler::new(&config, Arc::clone(&shared), layout, rx);
        let worker = thread::Builder::new()
            .name(format!("kds-{}", config.device_name))
            .spawn(move || scheduler.run())?;

        info!(device = %config.device_name, mode = ?config.mode, "device opened");
        Ok(Self {
            shared,
            control: Mutex::new(control),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.device
    }

    /// Queue a command buffer.
    ///
    /// The buffer is handed back through [`ExecBuffer::release`] exactly
    /// once: on retirement, or right away if the submission is refused.
    pub fn submit(&self, request: SubmitRequest) -> Result<CommandHandle> {
        let SubmitRequest {
            buffer,
            cu_mask,
            context,
        } = request;

        let routed = self.route(buffer.words(), cu_mask, context);
        let (opcode, mask) = match routed {
            Ok(routed) => routed,
            Err(e) => {
                buffer.release();
                return Err(e);
            }
        };

        let mut cmd = match self.shared.pool.acquire() {
            Ok(cmd) => cmd,
            Err(e) => {
                buffer.release();
                return Err(e);
            }
        };
        if let Some(ctx) = context {
            if let Err(e) = self.shared.contexts.on_submit(ctx) {
                buffer.release();
                self.shared.pool.release(cmd);
                return Err(e);
            }
        }
        cmd.load(buffer, opcode, mask, context);
        let handle = cmd.handle();

        match self.shared.ingress.submit(cmd) {
            Ok(()) => Ok(handle),
            Err((e, mut cmd)) => {
                if let Some(ctx) = context {
                    self.shared.contexts.on_cancel(ctx);
                }
                if let Some(buffer) = cmd.take_buffer() {
                    buffer.release();
                }
                cmd.set_state(CommandState::Aborted);
                self.shared.pool.release(cmd);
                Err(if self.shared.is_failed() {
                    SchedError::SchedulerFailed
                } else {
                    e
                })
            }
        }
    }

    /// Validate the packet and work out the command's eligible CUs.
    fn route(
        &self,
        words: &[u32],
        cu_mask: Option<BitSet>,
        context: Option<ContextId>,
    ) -> Result<(kds_core::Opcode, BitSet)> {
        if self.shared.is_failed() {
            return Err(SchedError::SchedulerFailed);
        }
        let view = PacketView::parse(words)?;
        let opcode = view.opcode();
        let mut mask = cu_mask.unwrap_or_else(|| BitSet::from_words(view.cu_masks()));
        if let Some(ctx) = context {
            if opcode.cu_mask_offset().is_some() {
                mask = self.shared.contexts.effective_mask(ctx, mask)?;
            } else if self.shared.contexts.get(ctx).is_none() {
                return Err(SchedError::UnknownContext(ctx.as_uuid()));
            }
        }
        Ok((opcode, mask))
    }

    /// Configure the executor directly, without a CONFIGURE packet.
    pub fn configure(&self, request: ConfigureRequest) -> Result<()> {
        self.call(|reply| Control::Configure { request, reply })
    }

    /// Reset one CU. Its running commands fail.
    pub fn reset_cu(&self, cu: usize) -> Result<()> {
        self.call(|reply| Control::ResetCu { cu, reply })
    }

    /// Drop the configuration. Fails while any command is outstanding.
    pub fn reset(&self) -> Result<()> {
        self.call(|reply| Control::Reset { reply })
    }

    fn call(&self, make: impl FnOnce(Sender<Result<()>>) -> Control) -> Result<()> {
        if self.shared.is_failed() {
            return Err(SchedError::SchedulerFailed);
        }
        if self.shared.is_stopping() {
            return Err(SchedError::ShuttingDown);
        }
        let (reply, rx) = mpsc::channel();
        {
            let control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            self.shared.requests.fetch_add(1, Ordering::AcqRel);
            if control.send(make(reply)).is_err() {
                self.shared.requests.fetch_sub(1, Ordering::AcqRel);
                return Err(SchedError::ShuttingDown);
            }
        }
        self.shared.wakeup.notify();
        rx.recv().map_err(|_| SchedError::ShuttingDown)?
    }

    pub fn poll_status(&self, handle: &CommandHandle) -> CommandStatus {
        handle.status()
    }

    /// Status plus the CU and slot the command was given.
    pub fn snapshot(&self, handle: &CommandHandle) -> CommandSnapshot {
        handle.snapshot()
    }

    /// Block until `handle` reaches a terminal state.
    pub fn wait(&self, handle: &CommandHandle, timeout: Duration) -> Result<CommandStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = handle.snapshot().state;
            if state.is_terminal() {
                return Ok(state.into());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SchedError::Timeout(format!("command {}", handle.index())));
            }
            self.shared
                .completions
                .wait_while(Some(deadline - now), || !handle.snapshot().state.is_terminal());
        }
    }

    /// Block until nothing is pending, queued or running.
    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.shared.is_busy() {
            let now = Instant::now();
            if now >= deadline {
                return Err(SchedError::Timeout("device idle".into()));
            }
            self.shared
                .completions
                .wait_while(Some(deadline - now), || self.shared.is_busy());
        }
        Ok(())
    }

    // ── Client contexts ───────────────────────────────────────

    pub fn register_context(&self, pid: u32) -> Arc<ClientContext> {
        self.shared.contexts.register(pid)
    }

    pub fn unregister_context(&self, id: ContextId) -> Result<()> {
        let ctx = self.shared.contexts.unregister(id)?;
        if ctx.outstanding() > 0 {
            warn!(context = %id, outstanding = ctx.outstanding(), "context closed with commands in flight");
        }
        Ok(())
    }

    pub fn claim_cu(&self, id: ContextId, cu: usize, kind: ClaimKind) -> Result<()> {
        self.shared.contexts.claim_cu(id, cu, kind)
    }

    pub fn release_cu(&self, id: ContextId, cu: usize) -> Result<()> {
        self.shared.contexts.release_cu(id, cu)
    }

    /// Process ids of clients holding CU claims.
    pub fn live_clients(&self) -> Vec<u32> {
        self.shared.contexts.live_clients()
    }

    /// Block until a completion notification is pending for `ctx`,
    /// consuming it.
    pub fn wait_for_completion(&self, ctx: &ClientContext, timeout: Duration) -> bool {
        self.shared.contexts.wait_for_completion(ctx, timeout)
    }

    // ── Interrupts ────────────────────────────────────────────

    /// Interrupt entry for CU `cu`: acknowledge it and wake the scheduler.
    pub fn handle_interrupt(&self, cu: usize) {
        match self.shared.route(cu) {
            Some((base, CuModel::Hls)) => {
                hls::ack_interrupt(self.shared.io.as_ref(), base);
            }
            Some((_, CuModel::Acc)) => {}
            None => {
                warn!(cu, "interrupt for unconfigured CU");
                return;
            }
        }
        self.shared.intc.store(true, Ordering::Release);
        self.shared.wakeup.notify();
    }

    // ── Status ────────────────────────────────────────────────

    pub fn metrics(&self) -> SchedulerMetrics {
        self.shared.metrics()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    pub fn is_failed(&self) -> bool {
        self.shared.is_failed()
    }

    /// Stop accepting work, let in-flight commands finish within the
    /// shutdown grace period and join the scheduler thread.
    pub fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };
        self.shared.ingress.close();
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wakeup.notify();
        if worker.join().is_err() {
            warn!(device = %self.shared.device, "scheduler thread panicked");
        }
        info!(device = %self.shared.device, "device closed");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}
