//! Seam between the queue monitor and the build-execution workers.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::step::Step;

/// Receives steps whose dependencies are all satisfied. Implemented by the
/// worker dispatcher; the queue core only ever pushes.
pub trait Dispatcher: Send + Sync {
    fn make_runnable(&self, step: &Arc<Step>);
}

/// Channel-backed [`Dispatcher`]: runnable steps are queued on an unbounded
/// channel for whatever consumes them (the worker pool in the daemon, a
/// collecting loop in tests).
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Arc<Step>>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<Step>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn make_runnable(&self, step: &Arc<Step>) {
        if self.tx.send(step.clone()).is_err() {
            warn!(drv = %step.drv_path(), "dispatcher gone; dropping runnable step");
        }
    }
}
