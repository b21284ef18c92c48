//! Replication cycle driver.
//!
//! Lifecycle: wait for the first agreement, run the optional bootstrap cycle,
//! then loop: pull from every agreement's partner, advance its cookie, count
//! the cycle and sleep until the next interval, a replicate-now request or
//! shutdown.
//!
//! Per-agreement failures are logged and retried next cycle. Only a broken
//! synchronization primitive, or a failed strict first cycle, stops the
//! driver and puts the server into the failure state.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use dirsync_meta::types::MetaError;
use tracing::{debug, error, info, warn};

use crate::agreement::{ProgressCookie, ReplicationAgreement};
use crate::apply::ChangeApplier;
use crate::config::FirstCycleMode;
use crate::context::{ServerContext, ServerState};
use crate::error::ReplError;
use crate::rpc::PartnerSession;

/// Why the driver returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverExit {
    /// Shutdown was requested
    Shutdown,
    /// One-shot restore finished its cycle
    RestoreComplete,
}

/// Result of one pass over a partner's change stream.
struct ConsumePass {
    applied: u64,
    /// DN of a change that failed because its target or parent is missing
    missing: Option<String>,
}

/// Drives continuous pull replication for one server.
pub struct ReplicationDriver {
    ctx: Arc<ServerContext>,
    applier: ChangeApplier,
}

impl ReplicationDriver {
    /// Creates a driver over `ctx`.
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let applier = ChangeApplier::new(ctx.backend.clone(), ctx.tracker.clone());
        Self { ctx, applier }
    }

    /// Runs until shutdown, restore completion or a fatal error.
    ///
    /// A fatal error sets the server state to `Failure` before returning it.
    pub async fn run(&self) -> Result<DriverExit, ReplError> {
        match self.run_inner().await {
            Ok(exit) => Ok(exit),
            Err(ReplError::Shutdown) => Ok(DriverExit::Shutdown),
            Err(e) => {
                error!(error = %e, "replication driver stopped");
                self.ctx.set_state(ServerState::Failure)?;
                Err(e)
            }
        }
    }

    async fn run_inner(&self) -> Result<DriverExit, ReplError> {
        let config = self.ctx.config.clone();
        if config.restore_mode && self.ctx.agreements.is_empty() {
            info!("restore mode without agreements, nothing to replicate");
            return Ok(DriverExit::RestoreComplete);
        }
        if !self.wait_for_first_agreement().await? {
            return Ok(DriverExit::Shutdown);
        }

        let mut strict = false;
        match config.first_cycle_mode {
            FirstCycleMode::CopyDb if config.server.server_id != 1 => {
                self.copy_database()
                    .await
                    .map_err(|e| ReplError::FirstCycle(e.to_string()))?;
            }
            FirstCycleMode::CopyDb => {
                info!("first server of the domain, no database to copy");
            }
            FirstCycleMode::Normal => strict = true,
            FirstCycleMode::None => {}
        }

        loop {
            if self.ctx.is_shutting_down() {
                return Ok(DriverExit::Shutdown);
            }
            self.refresh_membership();

            let started = Instant::now();
            let errors = self.run_cycle().await?;
            let first_failure = errors
                .iter()
                .map(|(_, e)| e)
                .find(|e| !e.is_benign())
                .or_else(|| errors.first().map(|(_, e)| e));
            self.ctx.metrics.record_cycle(started.elapsed(), first_failure);

            if strict {
                if let Some((partner, e)) = errors.first() {
                    return Err(ReplError::FirstCycle(format!("{}: {}", partner, e)));
                }
                strict = false;
            }

            let count = self.ctx.complete_cycle();
            if count == 1 {
                info!("first replication cycle completed");
            }
            if config.restore_mode {
                info!("restore cycle completed");
                return Ok(DriverExit::RestoreComplete);
            }

            tokio::select! {
                _ = tokio::time::sleep(config.repl_interval()) => {}
                _ = self.ctx.replicate_now_requested() => {
                    debug!("replicate now requested");
                }
                _ = self.ctx.cancellation().cancelled() => return Ok(DriverExit::Shutdown),
            }
        }
    }

    /// Returns false if shutdown came first.
    async fn wait_for_first_agreement(&self) -> Result<bool, ReplError> {
        let mut rx = self.ctx.agreements.subscribe();
        if *rx.borrow() == 0 {
            info!("waiting for first replication agreement");
        }
        tokio::select! {
            res = async { rx.wait_for(|n| *n > 0).await.map(|_| ()) } => {
                res.map_err(|e| ReplError::Sync(format!("agreement signal failed: {}", e)))?;
                Ok(true)
            }
            _ = self.ctx.cancellation().cancelled() => Ok(false),
        }
    }

    fn refresh_membership(&self) {
        if self.ctx.config.system_domain_dn.is_none() {
            return;
        }
        if let Err(e) = self.ctx.raft.refresh() {
            warn!(error = %e, "cluster membership refresh failed");
        }
    }

    async fn copy_database(&self) -> Result<(), ReplError> {
        let agreement = self
            .ctx
            .agreements
            .snapshot()?
            .into_iter()
            .find(|a| !a.is_deleted())
            .ok_or_else(|| ReplError::Sync("no agreement to copy from".to_string()))?;
        let partner = agreement.partner();
        let creds = &self.ctx.config.credentials;
        info!(partner = %partner, "copying database from partner");

        let result = self
            .ctx
            .partners
            .copy_database(partner, &creds.account, &creds.password)
            .await;
        match (result, &creds.old_password) {
            (Err(ReplError::InvalidCredentials { .. }), Some(old)) => {
                self.ctx
                    .partners
                    .copy_database(partner, &creds.account, old)
                    .await
            }
            (result, _) => result,
        }
    }

    /// One pass over all agreements. Returns the per-partner failures.
    async fn run_cycle(&self) -> Result<Vec<(String, ReplError)>, ReplError> {
        let purged = self.ctx.agreements.purge_deleted()?;
        if purged > 0 {
            info!(purged = purged, "deleted agreements removed");
        }
        let agreements = self.ctx.agreements.snapshot()?;
        let mut errors = Vec::new();

        for (i, agreement) in agreements.iter().enumerate() {
            if self.ctx.is_shutting_down() {
                return Err(ReplError::Shutdown);
            }
            if agreement.is_deleted() {
                continue;
            }
            let state = self.ctx.state()?;
            if matches!(state, ServerState::ReadOnly | ServerState::Demoting) {
                debug!(partner = %agreement.partner(), state = %state, "replication paused");
                continue;
            }

            match self.replicate_agreement(agreement).await {
                Ok(applied) => {
                    self.ctx.metrics.record_success(agreement.partner());
                    if applied > 0 {
                        info!(partner = %agreement.partner(), applied = applied, "changes replicated");
                    }
                }
                Err(e @ ReplError::Sync(_)) => return Err(e),
                Err(ReplError::Shutdown) | Err(ReplError::Meta(MetaError::ShuttingDown)) => {
                    return Err(ReplError::Shutdown)
                }
                Err(e) => {
                    self.ctx.metrics.record_failure(agreement.partner());
                    if e.is_transient() {
                        debug!(partner = %agreement.partner(), error = %e, "replication attempt failed");
                    } else {
                        warn!(partner = %agreement.partner(), error = %e, "replication attempt failed");
                    }
                    errors.push((agreement.partner().to_string(), e));
                }
            }

            if i + 1 < agreements.len() {
                tokio::select! {
                    _ = tokio::time::sleep(self.ctx.config.agreement_pause()) => {}
                    _ = self.ctx.cancellation().cancelled() => return Err(ReplError::Shutdown),
                }
            }
        }
        Ok(errors)
    }

    async fn replicate_agreement(&self, agreement: &ReplicationAgreement) -> Result<u64, ReplError> {
        let session = self.ensure_session(agreement).await?;
        let result = self.consume_partner(agreement, session.as_ref()).await;
        if matches!(
            result,
            Err(ReplError::ConnectionLost { .. }) | Err(ReplError::Timeout { .. })
        ) {
            agreement.set_disconnected(false)?;
        }
        result
    }

    /// Reuses the open session or binds with the current, then the old password.
    async fn ensure_session(
        &self,
        agreement: &ReplicationAgreement,
    ) -> Result<Arc<dyn PartnerSession>, ReplError> {
        if let Some(session) = agreement.session()? {
            return Ok(session);
        }
        let partner = agreement.partner();
        let creds = &self.ctx.config.credentials;
        let retry = self.ctx.config.password_retry();
        let recently_failed =
            |at: Option<Instant>| at.map(|t| t.elapsed() < retry).unwrap_or(false);

        let mut candidates: Vec<(bool, &str)> = Vec::new();
        if !recently_failed(agreement.password_failed_at(false)?) {
            candidates.push((false, creds.password.as_str()));
        }
        if let Some(old) = &creds.old_password {
            if !recently_failed(agreement.password_failed_at(true)?) {
                candidates.push((true, old.as_str()));
            }
        }

        let mut last_err = ReplError::InvalidCredentials {
            partner: partner.to_string(),
        };
        for (old, password) in candidates {
            let connect = self.ctx.partners.connect(partner, &creds.account, password);
            match self.with_deadline(partner, connect).await {
                Ok(session) => {
                    agreement.set_password_failed(old, None)?;
                    agreement.set_connected(session.clone())?;
                    info!(partner = %partner, old_password = old, "partner connected");
                    return Ok(session);
                }
                Err(e @ ReplError::InvalidCredentials { .. }) => {
                    warn!(partner = %partner, old_password = old, "partner rejected credentials");
                    agreement.set_password_failed(old, Some(Instant::now()))?;
                    last_err = e;
                }
                Err(e) => {
                    agreement.set_disconnected(true)?;
                    return Err(e);
                }
            }
        }
        agreement.set_disconnected(true)?;
        Err(last_err)
    }

    /// Consumes the partner's stream, retrying on missing parents while
    /// progress is made and replaying from USN 0 when it is not.
    async fn consume_partner(
        &self,
        agreement: &ReplicationAgreement,
        session: &dyn PartnerSession,
    ) -> Result<u64, ReplError> {
        let partner = agreement.partner();
        let stored = agreement.cookie()?;
        let mut cookie = stored.clone();
        let mut replayed = false;
        let mut applied = 0;

        loop {
            let pass = match self.consume_pass(partner, session, &mut cookie).await {
                Ok(pass) => pass,
                Err(e) => {
                    self.commit_cookie(agreement, &settled(cookie, &stored, replayed))?;
                    return Err(e);
                }
            };
            applied += pass.applied;
            self.ctx.metrics.record_applied(partner, pass.applied);

            let Some(dn) = pass.missing else {
                break;
            };
            if pass.applied > 0 {
                debug!(partner = %partner, dn = %dn, "missing parent, retrying after progress");
                self.commit_cookie(agreement, &cookie)?;
                continue;
            }
            let due = agreement
                .last_hole_fill()?
                .map(|t| t.elapsed() >= self.ctx.config.hole_fill_retry())
                .unwrap_or(true);
            if replayed || !due {
                self.commit_cookie(agreement, &settled(cookie, &stored, replayed))?;
                return Err(ReplError::MissingParent { dn });
            }
            warn!(partner = %partner, dn = %dn, "no progress on missing parent, replaying from usn 0");
            agreement.set_last_hole_fill(Instant::now())?;
            cookie = ProgressCookie::at(0);
            replayed = true;
        }

        self.commit_cookie(agreement, &settled(cookie, &stored, replayed))?;
        Ok(applied)
    }

    async fn consume_pass(
        &self,
        partner: &str,
        session: &dyn PartnerSession,
        cookie: &mut ProgressCookie,
    ) -> Result<ConsumePass, ReplError> {
        let page_size = self.ctx.config.page_size;
        let mut applied = 0;
        loop {
            if self.ctx.is_shutting_down() {
                return Err(ReplError::Shutdown);
            }
            let page = self
                .with_deadline(partner, session.fetch_changes(cookie, page_size))
                .await?;
            let full = page.changes.len() == page_size;

            for change in &page.changes {
                match self.applier.apply(partner, change) {
                    Ok(outcome) => {
                        if let Some(report) = outcome.report() {
                            self.ctx.metrics.record_conflicts(partner, report);
                        }
                        cookie.high_watermark = change.usn;
                        cookie.record(&change.originating, change.orig_usn);
                        applied += 1;
                    }
                    Err(ReplError::MissingParent { dn }) => {
                        return Ok(ConsumePass {
                            applied,
                            missing: Some(dn),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(done) = page.sync_done {
                if done.high_watermark == cookie.high_watermark {
                    debug!(partner = %partner, usn = done.high_watermark, "sync done at stored position ignored");
                } else {
                    cookie.high_watermark = cookie.high_watermark.max(done.high_watermark);
                    cookie.merge_vector(&done);
                }
            }
            if !full {
                return Ok(ConsumePass {
                    applied,
                    missing: None,
                });
            }
        }
    }

    fn commit_cookie(&self, agreement: &ReplicationAgreement, cookie: &ProgressCookie) -> Result<(), ReplError> {
        if agreement.update_cookie(cookie.clone())? {
            agreement.persist_cookie(self.ctx.directory.as_ref())?;
        }
        Ok(())
    }

    async fn with_deadline<T>(
        &self,
        partner: &str,
        call: impl Future<Output = Result<T, ReplError>>,
    ) -> Result<T, ReplError> {
        match tokio::time::timeout(self.ctx.config.rpc_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(ReplError::Timeout {
                partner: partner.to_string(),
            }),
        }
    }
}

/// Position to keep after a pass. A replay from USN 0 restarts the scan but
/// never hands back ground the stored cookie already covered.
fn settled(mut cookie: ProgressCookie, stored: &ProgressCookie, replayed: bool) -> ProgressCookie {
    if replayed {
        cookie.high_watermark = cookie.high_watermark.max(stored.high_watermark);
        cookie.merge_vector(stored);
    }
    cookie
}
