/// Decides when the user counts as idle based on the probe's idle timer.
pub struct IdleEvaluator {
    threshold_secs: f64,
}

impl IdleEvaluator {
    pub fn from_seconds(threshold_secs: f64) -> Self {
        Self { threshold_secs }
    }

    pub fn is_idle(&self, idle_secs: f64) -> bool {
        idle_secs >= self.threshold_secs
    }

    pub fn threshold_secs(&self) -> f64 {
        self.threshold_secs
    }
}
