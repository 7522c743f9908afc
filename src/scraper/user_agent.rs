use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How the next user agent is picked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    Random,
    RoundRobin,
    /// Always the first configured agent
    Fixed,
}

/// User agent rotation over the configured agents
pub struct UserAgentRotator {
    user_agents: Arc<Vec<String>>,
    strategy: RotationStrategy,
    cursor: AtomicUsize,
}

impl UserAgentRotator {
    pub fn new(user_agents: &[String], strategy: RotationStrategy) -> Self {
        let agents: Vec<String> = user_agents
            .iter()
            .map(|ua| ua.trim().to_string())
            .filter(|ua| !ua.is_empty())
            .collect();

        let agents = if agents.is_empty() {
            Self::default_user_agents()
        } else {
            agents
        };

        Self {
            user_agents: Arc::new(agents),
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Next user agent according to the strategy
    pub fn next_user_agent(&self) -> &str {
        match self.strategy {
            RotationStrategy::Random => {
                let mut rng = rand::thread_rng();
                self.user_agents
                    .choose(&mut rng)
                    .map(String::as_str)
                    .unwrap_or(Self::FALLBACK)
            }
            RotationStrategy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed);
                self.get_user_agent_by_index(index)
            }
            RotationStrategy::Fixed => self.get_user_agent_by_index(0),
        }
    }

    pub fn get_user_agent_by_index(&self, index: usize) -> &str {
        if self.user_agents.is_empty() {
            return Self::FALLBACK;
        }
        &self.user_agents[index % self.user_agents.len()]
    }

    pub fn count(&self) -> usize {
        self.user_agents.len()
    }

    const FALLBACK: &'static str = "ai-data-collector/0.1 (+https://github.com/ai-data-collector)";

    fn default_user_agents() -> Vec<String> {
        vec![
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15".to_string(),
            "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0".to_string(),
        ]
    }
}
