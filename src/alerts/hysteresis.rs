/// Output of one [`SustainedCondition::update`] step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SustainedUpdate {
    /// Continuous time the condition has held in the current episode.
    pub sustained_ms: u64,
    /// Time added to the episode by this step (0 when the episode starts or ends).
    pub accumulated_ms: u64,
    pub alert: bool,
    /// True only on the step where `alert` went from false to true.
    pub rising_edge: bool,
}

/// Hysteresis timer for one binary condition.
///
/// Time accumulates only between two consecutive results that both report the
/// condition and are no further apart than `gap_reset_ms`. A false result ends
/// the episode and drops the alert at once; an oversized gap starts a fresh
/// episode at the later result.
#[derive(Debug, Clone)]
pub struct SustainedCondition {
    threshold_ms: u64,
    gap_reset_ms: u64,
    in_episode: bool,
    sustained_ms: u64,
    alert: bool,
    last_timestamp_ms: Option<i64>,
}

impl SustainedCondition {
    pub fn new(threshold_ms: u64, gap_reset_ms: u64) -> Self {
        Self {
            threshold_ms,
            gap_reset_ms,
            in_episode: false,
            sustained_ms: 0,
            alert: false,
            last_timestamp_ms: None,
        }
    }

    pub fn sustained_ms(&self) -> u64 {
        self.sustained_ms
    }

    pub fn alert(&self) -> bool {
        self.alert
    }

    pub fn update(&mut self, timestamp_ms: i64, condition: bool) -> SustainedUpdate {
        let elapsed_ms = self
            .last_timestamp_ms
            .map(|previous| timestamp_ms.saturating_sub(previous).max(0) as u64);
        self.last_timestamp_ms = Some(timestamp_ms);

        if !condition {
            self.in_episode = false;
            self.sustained_ms = 0;
            self.alert = false;
            return SustainedUpdate::default();
        }

        let mut accumulated_ms = 0;
        match elapsed_ms {
            Some(elapsed) if self.in_episode && elapsed <= self.gap_reset_ms => {
                accumulated_ms = elapsed;
                self.sustained_ms = self.sustained_ms.saturating_add(elapsed);
            }
            _ => {
                self.in_episode = true;
                self.sustained_ms = 0;
            }
        }

        let was_alert = self.alert;
        self.alert = self.sustained_ms >= self.threshold_ms;

        SustainedUpdate {
            sustained_ms: self.sustained_ms,
            accumulated_ms,
            alert: self.alert,
            rising_edge: self.alert && !was_alert,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.threshold_ms, self.gap_reset_ms);
    }
}
