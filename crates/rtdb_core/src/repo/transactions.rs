//! The transaction state machine.
//!
//! Transactions queue per path. Everything queued under one root path is
//! sent together as a single compare-and-put, hashed over the value the
//! handlers saw. A stale answer reruns the handlers against fresher data; a
//! conflicting set aborts them.

use super::{call_user, Repo};
use crate::connection::WriteAck;
use crate::error::{DatabaseError, ErrorCode};
use crate::event::{Event, EventMask};
use crate::listener::ListenerHandle;
use crate::query::QuerySpec;
use crate::run_loop::panic_message;
use crate::snapshot::DataSnapshot;
use crate::transaction::{
    TransactionCompletion, TransactionHandler, TransactionOutcome, TransactionRecord,
    TransactionStatus,
};
use rtdb_node::{resolve_deferred_value, Node, Path};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// Runs a handler. `Ok(None)` is a user abort; `Err` a panic.
fn run_handler(handler: &mut TransactionHandler, input: &Node) -> Result<Option<Node>, DatabaseError> {
    match catch_unwind(AssertUnwindSafe(|| handler(input))) {
        Ok(TransactionOutcome::Success(node)) => Ok(Some(node)),
        Ok(TransactionOutcome::Abort) => Ok(None),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(panic = %message, "transaction handler panicked");
            Err(DatabaseError::with_message(ErrorCode::UserCodeException, message))
        }
    }
}

impl Repo {
    pub(crate) fn start_transaction(
        &mut self,
        path: Path,
        mut handler: TransactionHandler,
        on_complete: TransactionCompletion,
        apply_locally: bool,
    ) {
        debug!(path = %path, apply_locally, "starting transaction");
        // Keeps the location listened so the handler reruns on fresh data.
        let keep_alive = ListenerHandle::allocate();
        self.add_listener(
            keep_alive,
            QuerySpec::location(path.clone()),
            EventMask::NONE,
            Box::new(|_: &Event| {}),
        );

        let input = self.tree.latest_state(&path, &[]);
        let output = match run_handler(&mut handler, &input) {
            Ok(Some(output)) => output,
            outcome => {
                let error = outcome.err();
                self.remove_listener(keep_alive);
                let snapshot = DataSnapshot::new(path, input);
                call_user("transaction completion", || on_complete(error, false, snapshot));
                return;
            }
        };

        let resolved = resolve_deferred_value(&output, &input, self.server_time());
        let write_id = self.next_write_id();
        let order = self.transactions.next_order();
        let changed = self
            .tree
            .apply_user_overwrite(write_id, &path, resolved.clone(), apply_locally);
        self.raise_events(&changed);
        self.transactions.push(TransactionRecord {
            path,
            handler,
            on_complete: Some(on_complete),
            status: TransactionStatus::Run,
            order,
            keep_alive,
            apply_locally,
            retry_count: 0,
            abort_reason: None,
            current_write_id: Some(write_id),
            current_input: input,
            current_output_raw: output,
            current_output_resolved: resolved,
            needs_rerun: false,
        });
        self.send_ready_transactions();
    }

    pub(super) fn send_ready_transactions(&mut self) {
        if !self.connected {
            return;
        }
        for root in self.transactions.root_paths() {
            self.send_transaction_queue(&root);
        }
    }

    fn send_transaction_queue(&mut self, root: &Path) {
        let indexes = self.transactions.indexes_under(root);
        let ready = indexes.iter().all(|&i| {
            let record = self.transactions.get(i);
            record.status == TransactionStatus::Run && !record.needs_rerun
        });
        if indexes.is_empty() || !ready {
            return;
        }

        let write_ids: Vec<u64> = indexes
            .iter()
            .filter_map(|&i| self.transactions.get(i).current_write_id)
            .collect();
        let latest = self.tree.latest_state(root, &write_ids);
        let hash = self.config.hasher.hash(&latest);

        let mut payload = latest;
        let mut orders = Vec::with_capacity(indexes.len());
        for &i in &indexes {
            let record = self.transactions.get_mut(i);
            record.status = TransactionStatus::Sent;
            record.retry_count += 1;
            let rel = root.relative(&record.path).unwrap_or_default();
            payload = payload.update_child(&rel, record.current_output_raw.clone());
            orders.push(record.order);
        }
        debug!(path = %root, count = orders.len(), "sending transactions");

        let run_loop = self.run_loop.clone();
        let generation = self.generation;
        let ack_root = root.clone();
        self.connection.put(
            root,
            payload.to_export_json(),
            Some(hash),
            Box::new(move |ack| {
                super::schedule(&run_loop, move |repo| {
                    repo.on_transaction_ack(generation, ack_root, orders, ack)
                });
            }),
        );
    }

    fn on_transaction_ack(&mut self, generation: u64, root: Path, orders: Vec<u64>, ack: WriteAck) {
        if generation != self.generation {
            debug!(path = %root, "ignoring transaction ack from a previous connection");
            return;
        }
        let indexes: Vec<usize> = orders
            .iter()
            .filter_map(|&order| self.transactions.position(order))
            .collect();

        match ack {
            WriteAck::Ok { .. } => {
                for &i in &indexes {
                    let record = self.transactions.get_mut(i);
                    if let Some(write_id) = record.current_write_id.take() {
                        self.tree.ack_user_write(write_id, false, None);
                    }
                }
                self.raise_events(&root);
                for &i in &indexes {
                    let record = self.transactions.get_mut(i);
                    if record.status == TransactionStatus::SentNeedsAbort {
                        let reason = record
                            .abort_reason
                            .take()
                            .unwrap_or_else(|| DatabaseError::from_code(ErrorCode::OverriddenBySet));
                        let input = record.current_input.clone();
                        record.complete(Some(reason), false, input);
                    } else {
                        let output = record.current_output_resolved.clone();
                        record.complete(None, true, output);
                    }
                }
                self.prune_completed();
                self.send_ready_transactions();
            }
            WriteAck::Stale => {
                let mut attempt = 0;
                for &i in &indexes {
                    let record = self.transactions.get_mut(i);
                    record.status = match record.status {
                        TransactionStatus::SentNeedsAbort => TransactionStatus::NeedsAbort,
                        _ => TransactionStatus::Run,
                    };
                    record.needs_rerun = true;
                    attempt = attempt.max(record.retry_count);
                }
                let delay = self.config.transactions.retry.delay_for_attempt(attempt);
                debug!(path = %root, attempt, ?delay, "transaction hash stale");
                if delay.is_zero() {
                    self.rerun_transactions(&root);
                } else if let Err(e) = self
                    .run_loop
                    .schedule_after(delay, move |repo| {
                        repo.rerun_transactions(&root);
                    })
                {
                    debug!(error = %e, "could not schedule transaction retry");
                }
            }
            WriteAck::Error(e) => {
                let error = DatabaseError::from_server(&e.code, e.message.as_deref());
                warn!(path = %root, error = %error, "transaction rejected");
                for &i in &indexes {
                    let record = self.transactions.get_mut(i);
                    if record.status != TransactionStatus::SentNeedsAbort {
                        record.abort_reason = Some(error.clone());
                    }
                    record.status = TransactionStatus::NeedsAbort;
                }
                self.rerun_transactions(&root);
            }
        }
    }

    /// Reruns every unsent transaction at or below the root-most queued path
    /// containing `changed`, and aborts the ones marked for it. Returns that
    /// root-most path.
    pub(super) fn rerun_transactions(&mut self, changed: &Path) -> Path {
        let root = self.transactions.root_most_for(changed);
        let indexes = self.transactions.indexes_under(&root);
        if indexes.is_empty() {
            return root;
        }

        let mut ignore: Vec<u64> = indexes
            .iter()
            .filter_map(|&i| self.transactions.get(i).current_write_id)
            .collect();
        let max_retries = self.config.transactions.max_retries;
        let time = self.server_time();

        for i in indexes {
            let record = self.transactions.get(i);
            let status = record.status;
            let exhausted = record.retry_count >= max_retries;
            match status {
                TransactionStatus::NeedsAbort => {
                    self.revert_transaction(i, None);
                }
                TransactionStatus::Run if exhausted => {
                    debug!(path = %record.path, retries = record.retry_count, "transaction out of retries");
                    self.revert_transaction(i, Some(DatabaseError::from_code(ErrorCode::MaxRetries)));
                }
                TransactionStatus::Run => {
                    let path = record.path.clone();
                    let input = self.tree.latest_state(&path, &ignore);
                    let record = self.transactions.get_mut(i);
                    record.needs_rerun = false;
                    record.current_input = input.clone();
                    match run_handler(&mut record.handler, &input) {
                        Ok(Some(output)) => {
                            let resolved = resolve_deferred_value(&output, &input, time);
                            let apply_locally = record.apply_locally;
                            let old_write_id = record.current_write_id;
                            record.current_output_raw = output;
                            record.current_output_resolved = resolved.clone();
                            let write_id = self.next_write_id();
                            self.transactions.get_mut(i).current_write_id = Some(write_id);
                            ignore.retain(|id| Some(*id) != old_write_id);
                            self.tree
                                .apply_user_overwrite(write_id, &path, resolved, apply_locally);
                            if let Some(old) = old_write_id {
                                self.tree.ack_user_write(old, true, None);
                            }
                        }
                        Ok(None) => self.revert_transaction(i, None),
                        Err(error) => self.revert_transaction(i, Some(error)),
                    }
                }
                _ => {}
            }
        }

        self.raise_events(&root);
        self.prune_completed();
        self.send_ready_transactions();
        root
    }

    /// Reverts a record's write and marks it completed. `reason` replaces the
    /// stored abort reason when given.
    fn revert_transaction(&mut self, index: usize, reason: Option<DatabaseError>) {
        let record = self.transactions.get_mut(index);
        if reason.is_some() {
            record.abort_reason = reason;
        }
        record.status = TransactionStatus::Completed;
        if let Some(write_id) = record.current_write_id.take() {
            self.tree.ack_user_write(write_id, true, None);
        }
    }

    /// Removes completed records, drops their keep-alive listeners and runs
    /// any completion that has not run yet.
    fn prune_completed(&mut self) {
        for mut record in self.transactions.take_completed() {
            self.remove_listener(record.keep_alive);
            let reason = record.abort_reason.take();
            let input = record.current_input.clone();
            // No-op when the ack already completed it.
            record.complete(reason, false, input);
        }
    }

    /// Aborts transactions at, above or below `path`. Sent ones complete
    /// when the server answers. Returns the root-most queued path containing
    /// `path`.
    pub(super) fn abort_transactions(&mut self, path: &Path, code: ErrorCode) -> Path {
        let affected = self.transactions.root_most_for(path);
        let reason = DatabaseError::from_code(code);
        let mut reverted = false;
        for i in 0..self.transactions.len() {
            let record = self.transactions.get_mut(i);
            if !record.path.overlaps(path) {
                continue;
            }
            match record.status {
                TransactionStatus::Sent => {
                    record.status = TransactionStatus::SentNeedsAbort;
                    record.abort_reason = Some(reason.clone());
                }
                TransactionStatus::Run | TransactionStatus::NeedsAbort => {
                    self.revert_transaction(i, Some(reason.clone()));
                    reverted = true;
                }
                TransactionStatus::SentNeedsAbort | TransactionStatus::Completed => {}
            }
        }
        if reverted {
            debug!(path = %path, reason = %reason.code, "aborted transactions");
            self.raise_events(&affected);
            self.prune_completed();
        }
        affected
    }

    /// Moves sent transactions back to be aborted after a disconnect.
    pub(super) fn abort_sent_transactions(&mut self) {
        let mut any = false;
        for i in 0..self.transactions.len() {
            let record = self.transactions.get_mut(i);
            match record.status {
                TransactionStatus::Sent => {
                    record.status = TransactionStatus::NeedsAbort;
                    record.abort_reason = Some(DatabaseError::from_code(ErrorCode::Disconnected));
                }
                TransactionStatus::SentNeedsAbort => record.status = TransactionStatus::NeedsAbort,
                _ => continue,
            }
            any = true;
        }
        if any {
            self.rerun_transactions(&Path::root());
        }
    }
}
