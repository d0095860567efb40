//! # Load-Test Runner
//!
//! Drives a [`TestPlan`]: one tokio task per virtual user, started with an
//! even ramp-up delay. Each user creates its sampler (thread-start), runs the
//! configured number of samples and force-closes its connection
//! (thread-finish). When every user is done the registry is drained
//! (test-end).
//!
//! ```text
//! LoadTest::run
//!   ├── user 0 ──► Sampler::new ──► sample() × iterations ──► close()
//!   ├── user 1 ──► ...
//!   └── join all ──► ConnectionRegistry::drain ──► RunReport
//! ```

use crate::config::SamplerConfig;
use crate::error::LoadTestError;
use crate::mqtt::transport::TransportFactory;
use crate::registry::ConnectionRegistry;
use crate::sampler::{Role, SampleResult, Sampler, SessionHandle};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TestPlan {
    /// Number of concurrent virtual users
    pub users: usize,
    /// Samples each user takes
    pub iterations: u64,
    pub role: Role,
    /// Time over which user starts are spread
    pub ramp_up_ms: u64,
    pub sampler: SamplerConfig,
}

impl Default for TestPlan {
    fn default() -> Self {
        Self {
            users: 1,
            iterations: 1,
            role: Role::Subscriber,
            ramp_up_ms: 0,
            sampler: SamplerConfig::default(),
        }
    }
}

impl TestPlan {
    pub fn from_toml(text: &str) -> Result<Self, LoadTestError> {
        toml::from_str(text).map_err(|e| LoadTestError::Config(format!("invalid plan: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self, LoadTestError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LoadTestError::Config(format!("cannot read plan {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), LoadTestError> {
        if self.users == 0 {
            return Err(LoadTestError::Config("users must be at least 1".to_string()));
        }
        if self.iterations == 0 {
            return Err(LoadTestError::Config(
                "iterations must be at least 1".to_string(),
            ));
        }
        self.sampler.validate()
    }

    /// Sampler config of user `index`. With several users and no random
    /// suffix the index is appended so client ids stay unique.
    pub fn user_config(&self, index: usize) -> SamplerConfig {
        let mut config = self.sampler.clone();
        if self.users > 1 && !config.random_suffix {
            config.client_id = format!("{}-{}", config.client_id, index);
        }
        config
    }

    fn ramp_up_delay(&self) -> Duration {
        if self.users > 1 {
            Duration::from_millis(self.ramp_up_ms) / self.users as u32
        } else {
            Duration::ZERO
        }
    }
}

/// Outcome of one virtual user
#[derive(Debug, Clone)]
pub struct UserReport {
    pub index: usize,
    pub client_id: String,
    pub results: Vec<SampleResult>,
    /// Set when the sampler could not be created
    pub setup_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub users: Vec<UserReport>,
    pub drained: usize,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn results(&self) -> impl Iterator<Item = &SampleResult> {
        self.users.iter().flat_map(|u| u.results.iter())
    }

    pub fn samples(&self) -> usize {
        self.results().count()
    }

    pub fn successes(&self) -> usize {
        self.results().filter(|r| r.is_success()).count()
    }

    pub fn failures(&self) -> usize {
        self.samples() - self.successes()
    }

    pub fn setup_errors(&self) -> usize {
        self.users.iter().filter(|u| u.setup_error.is_some()).count()
    }

    pub fn messages(&self) -> u64 {
        self.results().map(|r| r.message_count()).sum()
    }

    pub fn mean_elapsed(&self) -> Duration {
        let samples = self.samples();
        if samples == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.results().map(|r| r.elapsed()).sum();
        total / samples as u32
    }

    pub fn is_success(&self) -> bool {
        self.failures() == 0 && self.setup_errors() == 0 && self.samples() > 0
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== MQTT load test summary ===")?;
        writeln!(f, "Users:        {}", self.users.len())?;
        writeln!(f, "Samples:      {}", self.samples())?;
        writeln!(f, "Successes:    {}", self.successes())?;
        writeln!(f, "Failures:     {}", self.failures())?;
        if self.setup_errors() > 0 {
            writeln!(f, "Setup errors: {}", self.setup_errors())?;
        }
        writeln!(f, "Messages:     {}", self.messages())?;
        writeln!(f, "Mean elapsed: {} ms", self.mean_elapsed().as_millis())?;
        write!(f, "Wall time:    {} ms", self.elapsed.as_millis())
    }
}

pub struct LoadTest {
    plan: TestPlan,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
    handles: Arc<Mutex<Vec<SessionHandle>>>,
}

impl LoadTest {
    pub fn new(plan: TestPlan, factory: Arc<dyn TransportFactory>) -> Result<Self, LoadTestError> {
        plan.validate()?;
        Ok(Self {
            plan,
            registry: Arc::new(ConnectionRegistry::new(factory)),
            cancel: CancellationToken::new(),
            handles: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn plan(&self) -> &TestPlan {
        &self.plan
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops every user and force-closes all connections that started so far
    pub async fn interrupt(&self) {
        warn!("Interrupting load test");
        self.cancel.cancel();
        let handles = self.handles.lock().await.clone();
        for handle in handles {
            handle.interrupt().await;
        }
    }

    pub async fn run(&self) -> RunReport {
        let started = Instant::now();
        let ramp_up = self.plan.ramp_up_delay();
        info!(
            "Starting {} {} users, {} samples each",
            self.plan.users, self.plan.role, self.plan.iterations
        );

        let mut tasks: Vec<JoinHandle<UserReport>> = Vec::with_capacity(self.plan.users);
        for index in 0..self.plan.users {
            if self.cancel.is_cancelled() {
                break;
            }
            tasks.push(tokio::spawn(run_user(
                index,
                self.plan.role,
                self.plan.user_config(index),
                self.plan.iterations,
                self.registry.clone(),
                self.cancel.child_token(),
                self.handles.clone(),
            )));

            if index + 1 < self.plan.users && !ramp_up.is_zero() {
                debug!("Waiting {} ms before starting the next user", ramp_up.as_millis());
                tokio::select! {
                    _ = tokio::time::sleep(ramp_up) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        let mut users = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.into_iter().enumerate() {
            match task.await {
                Ok(report) => users.push(report),
                Err(e) => {
                    error!("User {} task failed: {}", index, e);
                    users.push(UserReport {
                        index,
                        client_id: String::new(),
                        results: Vec::new(),
                        setup_error: Some(e.to_string()),
                    });
                }
            }
        }

        let drained = self.registry.drain().await;
        let report = RunReport {
            users,
            drained,
            elapsed: started.elapsed(),
        };
        info!(
            "Load test finished: {} samples, {} failures",
            report.samples(),
            report.failures()
        );
        report
    }
}

async fn run_user(
    index: usize,
    role: Role,
    config: SamplerConfig,
    iterations: u64,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
    handles: Arc<Mutex<Vec<SessionHandle>>>,
) -> UserReport {
    let mut sampler = match Sampler::new(role, config.clone(), registry, cancel.clone()) {
        Ok(sampler) => sampler,
        Err(e) => {
            error!("User {} cannot start: {}", index, e);
            return UserReport {
                index,
                client_id: config.client_id,
                results: Vec::new(),
                setup_error: Some(e.to_string()),
            };
        }
    };
    handles.lock().await.push(sampler.handle());
    debug!(client_id = %sampler.client_id(), "User {} started", index);

    let mut results = Vec::new();
    for _ in 0..iterations {
        if cancel.is_cancelled() {
            break;
        }
        let result = sampler.sample().await;
        if result.is_success() {
            debug!(client_id = %sampler.client_id(), "{}", result);
        } else {
            warn!(client_id = %sampler.client_id(), "{}", result);
        }
        results.push(result);
    }

    sampler.close().await;
    UserReport {
        index,
        client_id: sampler.client_id().to_string(),
        results,
        setup_error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Aggregate;

    #[test]
    fn plan_from_toml() {
        let plan = TestPlan::from_toml(
            r#"
            users = 3
            iterations = 2
            role = "publisher"
            ramp_up_ms = 300

            [sampler]
            HOST = "tcp://broker:1883"
            TOPIC = "a,b"
            AGGREGATE = 10
            "#,
        )
        .unwrap();

        assert_eq!(plan.users, 3);
        assert_eq!(plan.role, Role::Publisher);
        assert_eq!(plan.sampler.aggregate, Aggregate::Limited(10));
        assert_eq!(plan.ramp_up_delay(), Duration::from_millis(100));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn user_configs_get_distinct_ids() {
        let plan = TestPlan {
            users: 2,
            ..TestPlan::default()
        };
        assert_eq!(plan.user_config(0).client_id, "mqtt-loadtest-0");
        assert_eq!(plan.user_config(1).client_id, "mqtt-loadtest-1");

        let single = TestPlan::default();
        assert_eq!(single.user_config(0).client_id, "mqtt-loadtest");
    }

    #[test]
    fn zero_users_is_invalid() {
        let plan = TestPlan {
            users: 0,
            ..TestPlan::default()
        };
        assert!(matches!(plan.validate(), Err(LoadTestError::Config(_))));
    }

    #[test]
    fn empty_report_is_not_a_success() {
        let report = RunReport {
            users: Vec::new(),
            drained: 0,
            elapsed: Duration::ZERO,
        };
        assert!(!report.is_success());
        assert_eq!(report.mean_elapsed(), Duration::ZERO);
    }
}
