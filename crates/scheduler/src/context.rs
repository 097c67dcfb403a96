//! Client contexts: CU claims, outstanding work and completion notification.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bitmap::BitSet;
use crate::error::{Result, SchedError};
use crate::ingress::Wakeup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
struct Claims {
    shared: BitSet,
    exclusive: BitSet,
}

impl Default for Claims {
    fn default() -> Self {
        Self {
            shared: BitSet::new(BitSet::CAPACITY),
            exclusive: BitSet::new(BitSet::CAPACITY),
        }
    }
}

/// One registered client.
#[derive(Debug)]
pub struct ClientContext {
    id: ContextId,
    pid: u32,
    outstanding: AtomicU32,
    trigger: AtomicU64,
    claims: Mutex<Claims>,
}

impl ClientContext {
    fn new(pid: u32) -> Self {
        Self {
            id: ContextId::new(),
            pid,
            outstanding: AtomicU32::new(0),
            trigger: AtomicU64::new(0),
            claims: Mutex::new(Claims::default()),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Commands submitted by this context that have not finished.
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Completion notifications not yet consumed by [`ClientContext::poll`].
    pub fn trigger(&self) -> u64 {
        self.trigger.load(Ordering::Acquire)
    }

    /// Consume one completion notification if any is pending.
    pub fn poll(&self) -> bool {
        self.trigger
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| t.checked_sub(1))
            .is_ok()
    }

    fn claims(&self) -> Claims {
        *self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shared_cus(&self) -> BitSet {
        self.claims().shared
    }

    pub fn exclusive_cus(&self) -> BitSet {
        self.claims().exclusive
    }

    /// Union of shared and exclusive claims.
    pub fn claimed_cus(&self) -> BitSet {
        let claims = self.claims();
        let mut all = claims.shared;
        for cu in claims.exclusive.iter_ones() {
            all.set(cu);
        }
        all
    }

    pub fn has_claims(&self) -> bool {
        !self.claimed_cus().is_empty()
    }
}

/// All clients of one device.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: RwLock<HashMap<ContextId, Arc<ClientContext>>>,
    /// Serialises conflict check and update across claimants.
    claim_lock: Mutex<()>,
    wakeup: Wakeup,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32) -> Arc<ClientContext> {
        let ctx = Arc::new(ClientContext::new(pid));
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ctx.id, Arc::clone(&ctx));
        info!(pid, context = %ctx.id, "client context registered");
        ctx
    }

    /// Remove a context. Its outstanding commands keep running; their
    /// completions simply have no owner left to account to.
    pub fn unregister(&self, id: ContextId) -> Result<Arc<ClientContext>> {
        let ctx = self
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(SchedError::UnknownContext(id.as_uuid()))?;
        let outstanding = ctx.outstanding();
        if outstanding > 0 {
            warn!(pid = ctx.pid, outstanding, "context closed with commands in flight");
        } else {
            info!(pid = ctx.pid, context = %id, "client context unregistered");
        }
        Ok(ctx)
    }

    pub fn get(&self, id: ContextId) -> Option<Arc<ClientContext>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim `cu` for a context. Exclusive claims conflict with any claim by
    /// another context; shared claims conflict with another's exclusive one.
    pub fn claim_cu(&self, id: ContextId, cu: usize, kind: ClaimKind) -> Result<()> {
        let _claiming = self.claim_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let contexts = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        let ctx = contexts
            .get(&id)
            .ok_or(SchedError::UnknownContext(id.as_uuid()))?;
        let conflict = contexts.values().filter(|c| c.id != id).any(|other| match kind {
            ClaimKind::Exclusive => other.claimed_cus().test(cu),
            ClaimKind::Shared => other.exclusive_cus().test(cu),
        });
        if conflict {
            return Err(SchedError::CuClaimConflict { cu });
        }
        let mut claims = ctx.claims.lock().unwrap_or_else(PoisonError::into_inner);
        match kind {
            ClaimKind::Shared => {
                claims.exclusive.clear(cu);
                claims.shared.set(cu);
            }
            ClaimKind::Exclusive => {
                claims.shared.clear(cu);
                claims.exclusive.set(cu);
            }
        }
        debug!(pid = ctx.pid, cu, ?kind, "CU claimed");
        Ok(())
    }

    pub fn release_cu(&self, id: ContextId, cu: usize) -> Result<()> {
        let ctx = self.get(id).ok_or(SchedError::UnknownContext(id.as_uuid()))?;
        let mut claims = ctx.claims.lock().unwrap_or_else(PoisonError::into_inner);
        claims.shared.clear(cu);
        claims.exclusive.clear(cu);
        Ok(())
    }

    /// Pids of contexts currently holding CU claims, sorted and deduplicated.
    pub fn live_clients(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.has_claims())
            .map(|c| c.pid)
            .collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    /// Restrict an eligibility mask to the context's claims, if it has any.
    pub fn effective_mask(&self, id: ContextId, mask: BitSet) -> Result<BitSet> {
        let ctx = self.get(id).ok_or(SchedError::UnknownContext(id.as_uuid()))?;
        if !ctx.has_claims() {
            return Ok(mask);
        }
        let narrowed = mask.and(&ctx.claimed_cus());
        if narrowed.is_empty() {
            return Err(SchedError::InvalidCuMask);
        }
        Ok(narrowed)
    }

    /// Account a new submission to its context.
    pub fn on_submit(&self, id: ContextId) -> Result<()> {
        let ctx = self.get(id).ok_or(SchedError::UnknownContext(id.as_uuid()))?;
        ctx.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Undo [`on_submit`](Self::on_submit) for a command that never reached
    /// the scheduler.
    pub fn on_cancel(&self, id: ContextId) {
        if let Some(ctx) = self.get(id) {
            let _ = ctx
                .outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    /// Record a finished command: every context's trigger is bumped and
    /// pollers are woken; the owner's outstanding count drops.
    pub fn notify_completion(&self, owner: Option<ContextId>) {
        {
            let contexts = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
            for ctx in contexts.values() {
                if Some(ctx.id) == owner {
                    let _ = ctx
                        .outstanding
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
                }
                ctx.trigger.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.wakeup.notify();
    }

    /// Block until `ctx` has a pending notification or `timeout` passes,
    /// consuming one notification if present.
    pub fn wait_for_completion(&self, ctx: &ClientContext, timeout: Duration) -> bool {
        self.wakeup.wait_while(Some(timeout), || ctx.trigger() == 0);
        ctx.poll()
    }
}
