//! Result record of one sampled operation

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

pub const RESPONSE_OK: &str = "200";
pub const RESPONSE_FAILED: &str = "FAILED";

/// Outcome of one sample. Built through a [`SampleRecorder`] and immutable
/// once [`SampleRecorder::finish`] returns it.
#[derive(Debug, Clone, Serialize)]
pub struct SampleResult {
    label: String,
    success: bool,
    response_code: String,
    response_message: String,
    sampler_data: String,
    response_headers: String,
    response_data: String,
    started_at: Option<DateTime<Local>>,
    ended_at: Option<DateTime<Local>>,
    elapsed_ms: u64,
    message_count: u64,
}

impl SampleResult {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn response_code(&self) -> &str {
        &self.response_code
    }

    pub fn response_message(&self) -> &str {
        &self.response_message
    }

    pub fn sampler_data(&self) -> &str {
        &self.sampler_data
    }

    pub fn response_headers(&self) -> &str {
        &self.response_headers
    }

    /// Concatenated payload text, one payload per line
    pub fn response_data(&self) -> &str {
        &self.response_data
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Local>> {
        self.ended_at
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }
}

impl fmt::Display for SampleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first_line = self.response_message.lines().next().unwrap_or_default();
        write!(
            f,
            "[{}] {} {} ms - {}",
            self.response_code, self.label, self.elapsed_ms, first_line
        )
    }
}

/// Mutable builder for a [`SampleResult`]. Starts out optimistic: success
/// until a failure is recorded.
#[derive(Debug)]
pub struct SampleRecorder {
    result: SampleResult,
    started: Option<Instant>,
    ended: Option<Instant>,
}

impl SampleRecorder {
    pub fn new(label: &str) -> Self {
        Self {
            result: SampleResult {
                label: label.to_string(),
                success: true,
                response_code: RESPONSE_OK.to_string(),
                response_message: String::new(),
                sampler_data: String::new(),
                response_headers: String::new(),
                response_data: String::new(),
                started_at: None,
                ended_at: None,
                elapsed_ms: 0,
                message_count: 0,
            },
            started: None,
            ended: None,
        }
    }

    pub fn sample_start(&mut self) {
        self.started = Some(Instant::now());
        self.result.started_at = Some(Local::now());
    }

    /// Stops the clock; later calls keep the first end time
    pub fn sample_end(&mut self) {
        if self.ended.is_some() {
            return;
        }
        if let Some(started) = self.started {
            let now = Instant::now();
            self.ended = Some(now);
            self.result.ended_at = Some(Local::now());
            self.result.elapsed_ms = now.duration_since(started).as_millis() as u64;
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.success
    }

    pub fn ok(&mut self) -> &mut Self {
        self.result.success = true;
        self.result.response_code = RESPONSE_OK.to_string();
        self
    }

    pub fn fail(&mut self, message: impl Into<String>) -> &mut Self {
        self.result.success = false;
        self.result.response_code = RESPONSE_FAILED.to_string();
        self.result.response_message = message.into();
        self
    }

    pub fn message(&mut self, message: impl Into<String>) -> &mut Self {
        self.result.response_message = message.into();
        self
    }

    pub fn sampler_data(&mut self, data: impl Into<String>) -> &mut Self {
        self.result.sampler_data = data.into();
        self
    }

    pub fn headers(&mut self, headers: impl Into<String>) -> &mut Self {
        self.result.response_headers = headers.into();
        self
    }

    pub fn data(&mut self, data: impl Into<String>) -> &mut Self {
        self.result.response_data = data.into();
        self
    }

    pub fn message_count(&mut self, count: u64) -> &mut Self {
        self.result.message_count = count;
        self
    }

    pub fn finish(mut self) -> SampleResult {
        self.sample_end();
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_is_optimistic() {
        let result = SampleRecorder::new("sub").finish();
        assert!(result.is_success());
        assert_eq!(result.response_code(), RESPONSE_OK);
        assert!(result.started_at().is_none());
        assert_eq!(result.elapsed(), Duration::ZERO);
    }

    #[test]
    fn failure_sets_code_and_message() {
        let mut recorder = SampleRecorder::new("sub");
        recorder.sample_start();
        recorder.fail("No messages received from broker: tcp://b:1883");
        let result = recorder.finish();

        assert!(!result.is_success());
        assert_eq!(result.response_code(), RESPONSE_FAILED);
        assert!(result.started_at().is_some());
        assert!(result.ended_at() >= result.started_at());
        assert!(result.to_string().starts_with("[FAILED] sub"));
    }

    #[test]
    fn end_time_is_kept_from_first_call() {
        let mut recorder = SampleRecorder::new("pub");
        recorder.sample_start();
        recorder.sample_end();
        let first = recorder.ended;
        std::thread::sleep(Duration::from_millis(5));
        recorder.sample_end();
        assert_eq!(recorder.ended, first);
    }
}
