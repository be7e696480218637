use crate::sinks::OrchestratorMetricsSink;
use std::time::Instant;

/// RAII timer that reports its scope's duration as a tick observation.
pub struct TickTimer<'a> {
    sink: &'a dyn OrchestratorMetricsSink,
    start: Instant,
}

impl<'a> TickTimer<'a> {
    pub fn new(sink: &'a dyn OrchestratorMetricsSink) -> Self {
        Self {
            sink,
            start: Instant::now(),
        }
    }
}

impl Drop for TickTimer<'_> {
    fn drop(&mut self) {
        self.sink
            .observe_tick_duration(self.start.elapsed().as_secs_f64());
    }
}
