use crate::sinks::ControlMetricsSink;
use std::time::Instant;

/// Observes the dispatch-duration histogram for the enclosing scope on drop.
pub struct DispatchTimer<'a> {
    sink: &'a dyn ControlMetricsSink,
    start: Instant,
}

impl<'a> DispatchTimer<'a> {
    /// Starts the timer against `sink`.
    pub fn new(sink: &'a dyn ControlMetricsSink) -> Self {
        Self {
            sink,
            start: Instant::now(),
        }
    }
}

impl Drop for DispatchTimer<'_> {
    fn drop(&mut self) {
        self.sink
            .observe_dispatch_duration(self.start.elapsed().as_secs_f64());
    }
}
