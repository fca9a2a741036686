//! One invocation of `Runner::run`: the single-threaded event loop driving
//! every hook through pending -> starting -> ready -> waiting -> closing ->
//! done.
//!
//! Each potentially blocking hook operation runs as its own task reporting
//! back over a channel; all state mutation happens on the loop. Trusted
//! async operations (spawn-only starts, cancel-only closes) are handled
//! inline without a task.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cancel::{CancelSource, CancelToken, Cancelled, Cause, DeadlineExceeded};
use crate::error::BoxError;
use crate::runtime::error::{LifecyclePhase, RunError, UnexpectedOkRunResult};
use crate::runtime::graph::LcGraph;
use crate::runtime::runner::RunnerConfig;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
enum PhaseDone {
    #[default]
    None,
    Skipped,
    Completed,
}

impl PhaseDone {
    fn is_done(self) -> bool {
        self != PhaseDone::None
    }
}

#[derive(Default)]
struct RunState {
    is_starting: bool,
    start_done: PhaseDone,
    /// Retained so shutdown can abort an in-flight start; also disarms the
    /// timeout watchdog once the start reports back.
    cancel_start: Option<CancelSource>,
    is_waiting: bool,
    wait_done: PhaseDone,
    is_closing: bool,
    close_done: PhaseDone,
    closed_dependencies: usize,
    done_dependents: usize,
    ready_deps: usize,
}

impl RunState {
    fn is_done(&self) -> bool {
        self.wait_done.is_done() && self.close_done.is_done()
    }
}

type PhaseResult = (usize, Result<(), BoxError>);

pub(crate) struct Session {
    graph: Arc<LcGraph>,
    cfg: RunnerConfig,
    on_ready: Option<Box<dyn FnOnce() + Send>>,
    states: Vec<RunState>,
    remaining_waits: usize,
    remaining_closes: usize,
    remaining_ready: usize,
    shutdown_err: Option<RunError>,
    shutdown_cause: Option<Cause>,
    start_tx: mpsc::Sender<PhaseResult>,
    start_rx: Option<mpsc::Receiver<PhaseResult>>,
    wait_tx: mpsc::Sender<PhaseResult>,
    wait_rx: Option<mpsc::Receiver<PhaseResult>>,
    close_tx: mpsc::Sender<usize>,
    close_rx: Option<mpsc::Receiver<usize>>,
}

fn cancel_cause(ctx: &CancelToken) -> Cause {
    ctx.cause().unwrap_or_else(|| Cause::new(Cancelled))
}

impl Session {
    pub(crate) fn new(
        graph: Arc<LcGraph>,
        cfg: RunnerConfig,
        on_ready: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        let count = graph.len();
        let capacity = count.max(1);
        let (start_tx, start_rx) = mpsc::channel(capacity);
        let (wait_tx, wait_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = mpsc::channel(capacity);
        Self {
            graph,
            cfg,
            on_ready,
            states: (0..count).map(|_| RunState::default()).collect(),
            remaining_waits: count,
            remaining_closes: count,
            remaining_ready: count,
            shutdown_err: None,
            shutdown_cause: None,
            start_tx,
            start_rx: Some(start_rx),
            wait_tx,
            wait_rx: Some(wait_rx),
            close_tx,
            close_rx: Some(close_rx),
        }
    }

    pub(crate) async fn run(mut self, ctx: CancelToken) -> Result<(), RunError> {
        if ctx.is_cancelled() {
            return Err(RunError::Cancelled {
                cause: cancel_cause(&ctx),
            });
        }
        if self.graph.nodes.is_empty() {
            if let Some(ready) = self.on_ready.take() {
                ready();
            }
            return Ok(());
        }

        for idx in self.graph.leaves.clone() {
            if self.try_start_node(idx) {
                return self.finish();
            }
        }
        self.event_loop(ctx).await
    }

    async fn event_loop(&mut self, ctx: CancelToken) -> Result<(), RunError> {
        let mut start_rx = self.start_rx.take().expect("session already consumed");
        let mut wait_rx = self.wait_rx.take().expect("session already consumed");
        let mut close_rx = self.close_rx.take().expect("session already consumed");

        loop {
            tokio::select! {
                Some((idx, result)) = start_rx.recv() => {
                    if self.handle_node_start_result(idx, result, PhaseDone::Completed) {
                        return self.finish();
                    }
                }
                Some((idx, result)) = wait_rx.recv() => {
                    if self.handle_node_waited(idx, result, PhaseDone::Completed) {
                        return self.finish();
                    }
                }
                Some(idx) = close_rx.recv() => {
                    if self.handle_node_closed(idx, PhaseDone::Completed) {
                        return self.finish();
                    }
                }
                _ = ctx.cancelled() => {
                    let cause = cancel_cause(&ctx);
                    let err = RunError::Cancelled { cause: cause.clone() };
                    if self.try_shutdown(err, cause) {
                        return self.finish();
                    }
                    // a cancelled ctx would win every select from now on;
                    // continue on the phase channels alone
                    break;
                }
            }
        }

        loop {
            tokio::select! {
                Some((idx, result)) = start_rx.recv() => {
                    if self.handle_node_start_result(idx, result, PhaseDone::Completed) {
                        return self.finish();
                    }
                }
                Some((idx, result)) = wait_rx.recv() => {
                    if self.handle_node_waited(idx, result, PhaseDone::Completed) {
                        return self.finish();
                    }
                }
                Some(idx) = close_rx.recv() => {
                    if self.handle_node_closed(idx, PhaseDone::Completed) {
                        return self.finish();
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> Result<(), RunError> {
        debug_assert_eq!(self.remaining_waits, 0);
        debug_assert_eq!(self.remaining_closes, 0);
        match self.shutdown_err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_all_done(&self) -> bool {
        self.remaining_waits + self.remaining_closes == 0
    }

    fn ok_result_as_error(&self, idx: usize) -> bool {
        self.cfg.ok_result_as_error || self.graph.nodes[idx].hook.waiter_cfg.ok_result_as_error
    }

    fn mark_dependencies_done_dependent(&mut self, idx: usize) {
        let deps = self.graph.nodes[idx].depends_on.clone();
        for dep in deps {
            self.states[dep].done_dependents += 1;
        }
    }

    fn mark_dependents_closed_dependency(&mut self, idx: usize) {
        let dependents = self.graph.nodes[idx].dependents.clone();
        for dependent in dependents {
            self.states[dependent].closed_dependencies += 1;
        }
    }

    fn try_start_node(&mut self, idx: usize) -> bool {
        let graph = self.graph.clone();
        let node = &graph.nodes[idx];
        {
            let st = &self.states[idx];
            if st.start_done.is_done() {
                debug_assert!(false, "node started twice");
                return self.is_all_done();
            }
            if st.is_starting {
                return false;
            }
            if st.ready_deps < node.depends_on.len() {
                return false;
            }
            debug_assert_eq!(st.ready_deps, node.depends_on.len());
        }

        self.cfg.listeners.on_start(&node.info);
        tracing::debug!(hook = %node.info, "starting");

        if node.hook.starter.is_none() {
            return self.handle_node_start_result(idx, Ok(()), PhaseDone::Skipped);
        }
        if node.hook.is_trusted_async_starter() {
            // spawning the run task cannot block; skip the task round-trip
            let result = node.hook.start_now();
            return self.handle_node_start_result(idx, result, PhaseDone::Completed);
        }

        self.states[idx].is_starting = true;
        let (token, source) = self.make_start_ctx(idx);
        self.states[idx].cancel_start = Some(source);
        let hook = node.hook.clone();
        let tx = self.start_tx.clone();
        tokio::spawn(async move {
            let result = hook.start(token).await;
            let _ = tx.send((idx, result)).await;
        });
        false
    }

    fn make_start_ctx(&self, idx: usize) -> (CancelToken, CancelSource) {
        let source = CancelSource::new();
        let timeout = self.graph.nodes[idx]
            .hook
            .starter_cfg
            .start_timeout
            .or(self.cfg.start_timeout);
        if let Some(timeout) = timeout {
            if !timeout.is_zero() {
                source.cancel_after(timeout, Cause::new(DeadlineExceeded));
            }
        }
        (source.token(), source)
    }

    fn handle_node_start_result(
        &mut self,
        idx: usize,
        result: Result<(), BoxError>,
        done_state: PhaseDone,
    ) -> bool {
        {
            let st = &mut self.states[idx];
            debug_assert_eq!(st.ready_deps, self.graph.nodes[idx].depends_on.len());
            st.is_starting = false;
            st.start_done = done_state;
            if let Some(source) = st.cancel_start.take() {
                // disarms a pending timeout watchdog
                source.cancel();
            }
        }

        match result {
            Err(err) => self.handle_node_start_error(idx, err),
            Ok(()) => {
                if self.handle_node_is_ready(idx) {
                    return true;
                }
                if self.try_wait_for_node(idx) {
                    return true;
                }
                if self.shutdown_err.is_some() {
                    // shutdown skipped this node while it was starting; close
                    // it now, without reporting readiness to anyone
                    let cause = self.shutdown_cause.clone();
                    return self.try_close_node(idx, cause);
                }
                self.is_all_done()
            }
        }
    }

    fn handle_node_start_error(&mut self, idx: usize, err: BoxError) -> bool {
        let graph = self.graph.clone();
        debug_assert!(graph.nodes[idx].hook.starter.is_some());
        // unblocks the dependencies' shutdown
        self.mark_dependencies_done_dependent(idx);
        let run_err = RunError::HookFailed {
            hook: graph.nodes[idx].info.clone(),
            phase: LifecyclePhase::Start,
            cause: Cause::from_boxed(err),
        };
        {
            let st = &mut self.states[idx];
            // a node that failed to start is neither waited nor closed
            st.close_done = PhaseDone::Skipped;
            st.wait_done = PhaseDone::Skipped;
        }
        self.remaining_closes -= 1;
        self.remaining_waits -= 1;
        tracing::warn!(hook = %graph.nodes[idx].info, error = %run_err, "start failed");
        let done_cause = Cause::new(run_err.clone());
        self.cfg
            .listeners
            .on_done(&graph.nodes[idx].info, Some(&done_cause));
        if self.try_shutdown(run_err.clone(), Cause::new(run_err)) {
            return true;
        }
        self.try_close_node_dependencies(idx)
    }

    fn handle_node_is_ready(&mut self, idx: usize) -> bool {
        let graph = self.graph.clone();
        self.cfg.listeners.on_ready(&graph.nodes[idx].info);
        tracing::debug!(hook = %graph.nodes[idx].info, "ready");
        self.remaining_ready -= 1;

        // readiness only propagates while shutdown has not begun
        if self.shutdown_err.is_none() {
            if self.remaining_ready == 0 {
                if let Some(ready) = self.on_ready.take() {
                    tracing::info!("lifecycle graph is ready");
                    ready();
                }
            } else {
                let dependents = graph.nodes[idx].dependents.clone();
                for dependent in dependents {
                    self.states[dependent].ready_deps += 1;
                    if self.try_start_node(dependent) {
                        return true;
                    }
                }
            }
        }
        self.is_all_done()
    }

    fn try_wait_for_node(&mut self, idx: usize) -> bool {
        {
            let st = &self.states[idx];
            if st.is_waiting {
                return false;
            }
            if st.wait_done.is_done() {
                return self.is_all_done();
            }
        }
        let graph = self.graph.clone();
        if graph.nodes[idx].hook.waiter.is_none() {
            return self.handle_node_waited(idx, Ok(()), PhaseDone::Skipped);
        }
        self.states[idx].is_waiting = true;
        let hook = graph.nodes[idx].hook.clone();
        let tx = self.wait_tx.clone();
        tokio::spawn(async move {
            let result = hook.wait().await;
            let _ = tx.send((idx, result)).await;
        });
        false
    }

    fn handle_node_waited(
        &mut self,
        idx: usize,
        result: Result<(), BoxError>,
        done_state: PhaseDone,
    ) -> bool {
        let graph = self.graph.clone();
        self.remaining_waits -= 1;
        {
            let st = &mut self.states[idx];
            st.is_waiting = false;
            st.wait_done = done_state;
        }

        let mut failure: Option<Cause> = None;
        if done_state == PhaseDone::Completed {
            debug_assert!(graph.nodes[idx].hook.waiter.is_some());
            failure = match result {
                Err(err) => Some(Cause::from_boxed(err)),
                Ok(()) if self.ok_result_as_error(idx) => Some(Cause::new(UnexpectedOkRunResult)),
                Ok(()) => None,
            };
            let skip_close = {
                let st = &self.states[idx];
                !st.is_closing && st.close_done == PhaseDone::None
            };
            if skip_close {
                // the run shapes merge wait-end and close-end
                self.states[idx].close_done = PhaseDone::Skipped;
                self.remaining_closes -= 1;
            }
        }

        if self.states[idx].is_done() {
            self.cfg
                .listeners
                .on_done(&graph.nodes[idx].info, failure.as_ref());
            self.mark_dependencies_done_dependent(idx);
        }

        if self.shutdown_err.is_none() {
            if let Some(cause) = failure {
                let run_err = RunError::HookFailed {
                    hook: graph.nodes[idx].info.clone(),
                    phase: LifecyclePhase::Wait,
                    cause,
                };
                tracing::warn!(hook = %graph.nodes[idx].info, error = %run_err, "wait failed");
                if self.try_shutdown(run_err.clone(), Cause::new(run_err)) {
                    return true;
                }
            }
        }
        if self.shutdown_err.is_some() {
            let cause = self.shutdown_cause.clone();
            return self.try_close_node(idx, cause);
        }
        self.is_all_done()
    }

    fn try_close_node(&mut self, idx: usize, cause: Option<Cause>) -> bool {
        let graph = self.graph.clone();
        let node = &graph.nodes[idx];
        {
            let st = &self.states[idx];
            if st.is_starting || st.is_closing {
                // a starting node aborts via its start context and reports
                // back; a closing node reports back on its own
                return false;
            }
            if st.close_done.is_done() {
                if st.closed_dependencies < node.depends_on.len() {
                    return self.try_close_node_dependencies(idx);
                }
                return self.is_all_done();
            }
        }

        if self.states[idx].start_done == PhaseDone::None {
            // shutdown reached the node before it ever started
            {
                let st = &mut self.states[idx];
                st.start_done = PhaseDone::Skipped;
                st.wait_done = PhaseDone::Skipped;
            }
            self.remaining_waits -= 1;
            if node.hook.starter.is_some() {
                // an unstarted starter needs no close
                return self.handle_node_closed(idx, PhaseDone::Skipped);
            }
        } else if self.states[idx].is_waiting {
            let st = &self.states[idx];
            // a waiting node closes only after every dependent finished
            if st.done_dependents < node.dependents.len() {
                return false;
            }
            debug_assert_eq!(st.done_dependents, node.dependents.len());
        }

        self.cfg.listeners.on_close(&node.info, cause.as_ref());
        tracing::debug!(hook = %node.info, "closing");

        if !node.hook.has_closer()
            || (node.hook.waiter.is_some() && self.states[idx].wait_done.is_done())
        {
            return self.handle_node_closed(idx, PhaseDone::Skipped);
        }
        if node.hook.is_trusted_async_closer() {
            // cancelling the run context cannot block; no task needed
            node.hook.close_now(cause);
            return self.handle_node_closed(idx, PhaseDone::Completed);
        }

        self.states[idx].is_closing = true;
        let hook = node.hook.clone();
        let tx = self.close_tx.clone();
        tokio::spawn(async move {
            hook.close(cause).await;
            let _ = tx.send(idx).await;
        });
        false
    }

    fn handle_node_closed(&mut self, idx: usize, done_state: PhaseDone) -> bool {
        {
            let st = &mut self.states[idx];
            st.is_closing = false;
            debug_assert_eq!(st.close_done, PhaseDone::None, "node closed twice");
            st.close_done = done_state;
        }
        self.remaining_closes -= 1;
        self.mark_dependents_closed_dependency(idx);

        if self.states[idx].is_done() {
            self.mark_dependencies_done_dependent(idx);
            return self.try_close_node_dependencies(idx);
        }
        // the wait phase is still outstanding
        false
    }

    fn try_close_node_dependencies(&mut self, idx: usize) -> bool {
        let deps = self.graph.nodes[idx].depends_on.clone();
        for dep in deps {
            let cause = self.shutdown_cause.clone();
            if self.try_close_node(dep, cause) {
                return true;
            }
        }
        self.is_all_done()
    }

    fn try_shutdown(&mut self, err: RunError, cause: Cause) -> bool {
        if self.shutdown_err.is_some() {
            return self.is_all_done();
        }
        tracing::info!(%cause, "shutting down lifecycle graph");
        self.cfg.listeners.on_shutdown(&cause);
        self.shutdown_err = Some(err);
        self.shutdown_cause = Some(cause.clone());
        self.interrupt_starts(&cause);

        let roots = self.graph.roots.clone();
        for root in roots {
            let root_cause = self.shutdown_cause.clone();
            if self.try_close_node(root, root_cause) {
                return true;
            }
        }
        self.is_all_done()
    }

    /// Cancels every retained start context so in-flight starts can abort
    /// before closes begin.
    fn interrupt_starts(&mut self, cause: &Cause) {
        let mut pending: Vec<usize> = self.graph.roots.clone();
        while let Some(idx) = pending.pop() {
            if let Some(source) = &self.states[idx].cancel_start {
                source.cancel_with(cause.clone());
            }
            pending.extend(self.graph.nodes[idx].depends_on.iter().copied());
        }
    }
}
