use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use kds_core::Opcode;
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandState};
use crate::error::{Result, SchedError};

use super::{Control, Scheduler, MAX_SCHED_LOOP};

/// Shortest sleep between passes while draining on shutdown.
const DRAIN_TICK: Duration = Duration::from_micros(50);

impl Scheduler {
    /// Run the loop until stopped or a fatal error. Blocks the calling thread.
    ///
    /// On a stop request the loop keeps dispatching until every held command
    /// has finished or the shutdown grace period runs out; whatever is left
    /// is aborted and handed back to its owner.
    pub fn run(mut self) {
        info!(device = %self.shared.device, "scheduler loop started");
        self.publish();

        let mut passes: u64 = 0;
        loop {
            self.wait();
            if self.shared.is_stopping() || self.shared.is_failed() {
                break;
            }
            if let Err(e) = self.guarded_pass() {
                self.fail(&e);
                break;
            }
            passes += 1;
            if passes % MAX_SCHED_LOOP == 0 {
                thread::yield_now();
            }
        }

        if !self.shared.is_failed() {
            self.drain();
        }
        self.teardown();
    }

    /// One pass: control requests, ingress, then every held command.
    pub fn run_once(&mut self) -> Result<()> {
        self.handle_control();
        // Count pending work as held before it leaves ingress so the device
        // never looks idle in between.
        self.shared
            .active
            .store(self.queue.len() + self.shared.ingress.pending(), Ordering::Release);
        let moved = self.shared.ingress.drain_into(&mut self.queue);
        self.stats.submitted += moved as u64;
        let result = self.advance();
        self.stats.loop_passes += 1;
        self.publish();
        result
    }

    /// [`run_once`](Self::run_once), with a panic turned into a fatal error
    /// so teardown still hands every buffer back.
    fn guarded_pass(&mut self) -> Result<()> {
        panic::catch_unwind(AssertUnwindSafe(|| self.run_once()))
            .unwrap_or_else(|payload| Err(SchedError::LoopPanicked(panic_message(&*payload))))
    }

    /// Walk the queue in submission order. A command dispatched in this
    /// pass is queried straight away, so CONFIGURE and INIT_CU finish
    /// within the pass that started them.
    pub(super) fn advance(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.queue.len() {
            if self.queue[i].state == CommandState::Queued {
                self.try_submit(i)?;
            }
            if self.queue[i].state == CommandState::Running {
                self.try_complete(i);
            }
            if self.queue[i].state.is_terminal() {
                if let Some(cmd) = self.queue.remove(i) {
                    self.retire(cmd);
                }
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn try_submit(&mut self, i: usize) -> Result<()> {
        let is_configure = self.queue[i].opcode == Opcode::Configure;
        let outstanding = if is_configure {
            self.outstanding_except(Some(i))
        } else {
            0
        };

        let cmd = &mut self.queue[i];
        match self.exec.submit(cmd, outstanding) {
            Ok(true) => cmd.set_state(CommandState::Running),
            Ok(false) => return Ok(()),
            Err(SchedError::UnknownOpcode(op)) => {
                cmd.set_state(CommandState::Error);
                return Err(SchedError::UnknownOpcode(op));
            }
            Err(e) => {
                warn!(cmd = cmd.index(), opcode = ?cmd.opcode, error = %e, "command rejected");
                cmd.set_state(CommandState::Error);
                return Ok(());
            }
        }
        if is_configure {
            self.publish_routes();
        }
        Ok(())
    }

    fn try_complete(&mut self, i: usize) {
        let cmd = &mut self.queue[i];
        if self.exec.query(cmd) {
            cmd.set_state(CommandState::Completed);
        } else if self.exec.check_overrun(cmd) {
            self.stats.overruns += 1;
        }
    }

    /// Hand a terminal command back: free its slot, release the buffer,
    /// notify client contexts and recycle the record.
    fn retire(&mut self, mut cmd: Box<Command>) {
        match cmd.state {
            CommandState::Completed => {
                let latency = cmd.submitted_at.map(|t| t.elapsed()).unwrap_or_default();
                self.stats.record_completion(latency);
            }
            CommandState::Error => self.stats.errored += 1,
            CommandState::Aborted => self.stats.aborted += 1,
            _ => {}
        }
        self.exec.release_command_slot(&mut cmd);
        if let Some(buffer) = cmd.take_buffer() {
            buffer.release();
        }
        self.shared.contexts.notify_completion(cmd.context);
        debug!(cmd = cmd.index(), state = ?cmd.state, "command retired");
        self.shared.pool.release(cmd);
        self.shared.completions.notify();
    }

    fn handle_control(&mut self) {
        while let Ok(request) = self.control.try_recv() {
            self.shared.requests.fetch_sub(1, Ordering::AcqRel);
            match request {
                Control::Configure { request, reply } => {
                    let outstanding = self.outstanding_except(None);
                    let result = self.exec.configure(&request, outstanding);
                    if result.is_ok() {
                        self.publish_routes();
                    }
                    self.publish();
                    let _ = reply.send(result);
                }
                Control::ResetCu { cu, reply } => {
                    let (abandoned, result) = self.exec.reset_cu(cu, self.cu_reset_timeout);
                    self.fail_abandoned(&abandoned);
                    if let Err(e) = &result {
                        error!(cu, error = %e, "CU reset failed");
                    }
                    self.publish();
                    let _ = reply.send(result);
                }
                Control::Reset { reply } => {
                    let outstanding = self.outstanding_except(None);
                    let result = self.exec.reset(outstanding);
                    if result.is_ok() {
                        self.publish_routes();
                    }
                    self.publish();
                    let _ = reply.send(result);
                }
            }
        }
    }

    /// Fail the RUNNING commands a CU reset dropped from its FIFO.
    fn fail_abandoned(&mut self, abandoned: &[u32]) {
        for cmd in self.queue.iter_mut().filter(|cmd| {
            cmd.state == CommandState::Running && abandoned.contains(&cmd.index())
        }) {
            warn!(cmd = cmd.index(), cu = ?cmd.cu_idx, "command abandoned by CU reset");
            cmd.set_state(CommandState::Error);
        }
    }

    /// Keep dispatching after a stop request until the queue empties or the
    /// grace period runs out.
    fn drain(&mut self) {
        self.shared.ingress.close();
        let deadline = Instant::now() + self.shutdown_grace;
        while !self.queue.is_empty() || self.shared.ingress.pending() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    device = %self.shared.device,
                    remaining = self.queue.len(),
                    "shutdown grace period expired"
                );
                return;
            }
            if let Err(e) = self.guarded_pass() {
                self.fail(&e);
                return;
            }
            if !self.queue.is_empty() {
                thread::sleep(self.poll_interval.max(DRAIN_TICK));
            }
        }
    }

    fn fail(&mut self, err: &SchedError) {
        error!(device = %self.shared.device, error = %err, "fatal scheduler error, stopping");
        self.shared.error.store(true, Ordering::Release);
        self.shared.ingress.close();
    }

    /// Abort everything still held and publish the final metrics.
    fn teardown(&mut self) {
        let stranded = self.shared.ingress.take_all();
        self.stats.submitted += stranded.len() as u64;
        self.queue.extend(stranded);

        let mut aborted = 0;
        while let Some(mut cmd) = self.queue.pop_front() {
            if !cmd.state.is_terminal() {
                cmd.set_state(CommandState::Aborted);
                aborted += 1;
            }
            self.retire(cmd);
        }
        self.publish();
        info!(
            device = %self.shared.device,
            completed = self.stats.completed,
            aborted,
            failed = self.shared.is_failed(),
            "scheduler loop stopped"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
