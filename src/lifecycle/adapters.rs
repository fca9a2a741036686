//! Adapters that turn the single-method run shapes into the internal
//! start / wait / close trio sharing one spawned task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::cancel::{CancelSource, CancelToken, Cause};
use crate::error::BoxError;
use crate::lifecycle::traits::{ReadinessRunnable, ReadySignal, Runnable};
use crate::runtime::error::RunError;

struct PhasedState {
    cancel_run: Option<CancelSource>,
    result: Option<oneshot::Receiver<Result<(), BoxError>>>,
}

impl PhasedState {
    fn empty() -> Self {
        Self {
            cancel_run: None,
            result: None,
        }
    }
}

fn recv_result(
    received: Result<Result<(), BoxError>, oneshot::error::RecvError>,
) -> Result<(), BoxError> {
    // a dropped sender means the run task died without reporting, i.e. the
    // user future panicked
    received.unwrap_or_else(|_| Err("run task ended without a result (panicked?)".into()))
}

/// [`Runnable`] adapted into phases. Starting spawns the run task and cannot
/// fail or block (a trusted async starter); closing cancels the run context
/// without blocking (a trusted async closer); waiting blocks on the run
/// result.
pub(crate) struct PhasedRunnable {
    runnable: Arc<dyn Runnable>,
    is_running: Arc<AtomicBool>,
    state: Mutex<PhasedState>,
}

impl PhasedRunnable {
    pub(crate) fn new(runnable: Arc<dyn Runnable>) -> Arc<Self> {
        Arc::new(Self {
            runnable,
            is_running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(PhasedState::empty()),
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PhasedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the run task. Must be called inside a tokio runtime.
    pub(crate) fn start_now(&self) -> Result<(), BoxError> {
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Err(Box::new(RunError::AlreadyRunning));
        }
        let source = CancelSource::new();
        let token = source.token();
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.lock_state();
            st.cancel_run = Some(source);
            st.result = Some(rx);
        }
        let runnable = self.runnable.clone();
        let is_running = self.is_running.clone();
        tokio::spawn(async move {
            let result = runnable.run(token).await;
            is_running.store(false, Ordering::Release);
            let _ = tx.send(result);
        });
        Ok(())
    }

    pub(crate) async fn wait(&self) -> Result<(), BoxError> {
        let rx = self.lock_state().result.take();
        match rx {
            Some(rx) => recv_result(rx.await),
            None => Ok(()),
        }
    }

    pub(crate) fn close_now(&self, cause: Option<Cause>) {
        let source = self.lock_state().cancel_run.take();
        if let Some(source) = source {
            match cause {
                Some(cause) => source.cancel_with(cause),
                None => source.cancel(),
            };
        }
    }
}

/// [`ReadinessRunnable`] adapted into phases. Starting spawns the run task
/// and blocks until the ready signal fires, the run result arrives early
/// (a failure), or the start context is cancelled. Closing cancels the run
/// context without blocking; waiting blocks on the run result.
pub(crate) struct PhasedReadinessRunnable {
    runnable: Arc<dyn ReadinessRunnable>,
    is_running: Arc<AtomicBool>,
    state: Mutex<PhasedState>,
}

impl PhasedReadinessRunnable {
    pub(crate) fn new(runnable: Arc<dyn ReadinessRunnable>) -> Arc<Self> {
        Arc::new(Self {
            runnable,
            is_running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(PhasedState::empty()),
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PhasedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn start(&self, ctx: CancelToken) -> Result<(), BoxError> {
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Err(Box::new(RunError::AlreadyRunning));
        }
        let source = CancelSource::new();
        let token = source.token();
        let (tx, mut rx) = oneshot::channel();
        let (ready, ready_notify) = ReadySignal::new();
        {
            let mut st = self.lock_state();
            st.cancel_run = Some(source);
            st.result = None;
        }
        let runnable = self.runnable.clone();
        let is_running = self.is_running.clone();
        tokio::spawn(async move {
            let result = runnable.run(token, ready).await;
            is_running.store(false, Ordering::Release);
            let _ = tx.send(result);
        });

        tokio::select! {
            result = &mut rx => {
                // the run ended before signaling readiness: a start failure
                // (or an early Ok, which still means nothing to wait for)
                recv_result(result)
            }
            _ = ready_notify.notified() => {
                self.lock_state().result = Some(rx);
                Ok(())
            }
            _ = ctx.cancelled() => {
                self.close_now(ctx.cause());
                recv_result(rx.await)
            }
        }
    }

    pub(crate) async fn wait(&self) -> Result<(), BoxError> {
        let rx = self.lock_state().result.take();
        match rx {
            Some(rx) => recv_result(rx.await),
            None => Ok(()),
        }
    }

    pub(crate) fn close_now(&self, cause: Option<Cause>) {
        let source = self.lock_state().cancel_run.take();
        if let Some(source) = source {
            match cause {
                Some(cause) => source.cancel_with(cause),
                None => source.cancel(),
            };
        }
    }
}
