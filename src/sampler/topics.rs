use crate::config::Strategy;
use crate::error::LoadTestError;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks the publish topic for each message
#[derive(Debug)]
pub struct TopicSelector {
    topics: Vec<String>,
    strategy: Strategy,
    cursor: AtomicUsize,
}

impl TopicSelector {
    pub fn new(topics: Vec<String>, strategy: Strategy) -> Result<Self, LoadTestError> {
        if topics.is_empty() {
            return Err(LoadTestError::Config(
                "topic selector needs at least one topic".to_string(),
            ));
        }
        Ok(Self {
            topics,
            strategy,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn next(&self) -> &str {
        let index = match self.strategy {
            Strategy::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed) % self.topics.len(),
            Strategy::Random => rand::thread_rng().gen_range(0..self.topics.len()),
        };
        &self.topics[index]
    }
}
