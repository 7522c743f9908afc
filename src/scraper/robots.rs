use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Fetches, parses and caches robots.txt per origin
pub struct RobotsChecker {
    client: reqwest::Client,
    cache: Cache<String, Arc<RobotsRules>>,
    fetch_timeout: Duration,
    max_crawl_delay: Duration,
}

/// Parsed robots.txt for one origin
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    pub groups: Vec<RobotGroup>,
}

/// Rules that apply to a set of user agents
#[derive(Debug, Clone, Default)]
pub struct RobotGroup {
    pub user_agents: Vec<String>,
    pub rules: Vec<PathRule>,
    pub crawl_delay: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathRule {
    pub allow: bool,
    pub pattern: String,
}

impl RobotsChecker {
    pub fn new(
        client: reqwest::Client,
        cache_ttl: Duration,
        fetch_timeout: Duration,
        max_crawl_delay: Duration,
    ) -> Self {
        Self {
            client,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(cache_ttl)
                .build(),
            fetch_timeout,
            max_crawl_delay,
        }
    }

    /// Whether `user_agent` may fetch `url`
    pub async fn is_allowed(&self, url: &Url, user_agent: &str) -> bool {
        let rules = self.rules_for(url).await;
        let allowed = rules.is_allowed(url, user_agent);
        if !allowed {
            debug!("robots.txt disallows {}", url);
        }
        allowed
    }

    /// Crawl-delay declared for `user_agent` on the URL's origin, capped at the configured maximum
    pub async fn crawl_delay(&self, url: &Url, user_agent: &str) -> Option<Duration> {
        let declared = self.rules_for(url).await.crawl_delay(user_agent)?;
        if declared > self.max_crawl_delay {
            warn!(
                "Crawl-delay of {}s for {} capped at {}s",
                declared.as_secs(),
                url,
                self.max_crawl_delay.as_secs()
            );
        }
        Some(declared.min(self.max_crawl_delay))
    }

    async fn rules_for(&self, url: &Url) -> Arc<RobotsRules> {
        let origin = url.origin().ascii_serialization();

        if let Some(rules) = self.cache.get(&origin).await {
            return rules;
        }

        let rules = Arc::new(self.fetch_rules(&origin).await);
        self.cache.insert(origin, rules.clone()).await;
        rules
    }

    /// Missing or unreachable robots.txt allows everything
    async fn fetch_rules(&self, origin: &str) -> RobotsRules {
        let robots_url = format!("{}/robots.txt", origin);
        debug!("Fetching {}", robots_url);

        let response = match self
            .client
            .get(&robots_url)
            .timeout(self.fetch_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Could not fetch {}: {}", robots_url, e);
                return RobotsRules::default();
            }
        };

        if !response.status().is_success() {
            debug!("{} returned {}, allowing all", robots_url, response.status());
            return RobotsRules::default();
        }

        match response.text().await {
            Ok(body) => RobotsRules::parse(&body),
            Err(e) => {
                warn!("Could not read {}: {}", robots_url, e);
                RobotsRules::default()
            }
        }
    }
}

impl RobotsRules {
    pub fn parse(content: &str) -> Self {
        let mut groups: Vec<RobotGroup> = Vec::new();
        let mut current = RobotGroup::default();
        // Consecutive user-agent lines share one group
        let mut collecting_agents = false;

        for raw in content.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_ascii_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    if !collecting_agents && !current.user_agents.is_empty() {
                        groups.push(std::mem::take(&mut current));
                    }
                    current.user_agents.push(value.to_ascii_lowercase());
                    collecting_agents = true;
                }
                "allow" | "disallow" => {
                    collecting_agents = false;
                    if current.user_agents.is_empty() {
                        continue;
                    }
                    // An empty Disallow allows everything and adds no rule
                    if !value.is_empty() {
                        current.rules.push(PathRule {
                            allow: directive == "allow",
                            pattern: value.to_string(),
                        });
                    }
                }
                "crawl-delay" => {
                    collecting_agents = false;
                    if !current.user_agents.is_empty() {
                        // NaN fails the comparison
                        current.crawl_delay = value.parse::<f64>().ok().filter(|d| *d >= 0.0);
                    }
                }
                _ => {}
            }
        }

        if !current.user_agents.is_empty() {
            groups.push(current);
        }

        Self { groups }
    }

    /// Group for the most specific matching agent, falling back to `*`
    fn group_for(&self, user_agent: &str) -> Option<&RobotGroup> {
        let ua = user_agent.to_ascii_lowercase();

        let specific = self
            .groups
            .iter()
            .filter_map(|group| {
                group
                    .user_agents
                    .iter()
                    .filter(|agent| agent.as_str() != "*" && ua.contains(agent.as_str()))
                    .map(|agent| agent.len())
                    .max()
                    .map(|len| (len, group))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, group)| group);

        specific.or_else(|| {
            self.groups
                .iter()
                .find(|group| group.user_agents.iter().any(|agent| agent == "*"))
        })
    }

    /// Longest matching pattern wins; Allow wins a tie
    pub fn is_allowed(&self, url: &Url, user_agent: &str) -> bool {
        let Some(group) = self.group_for(user_agent) else {
            return true;
        };

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        if target == "/robots.txt" {
            return true;
        }

        let mut best: Option<(usize, bool)> = None;
        for rule in &group.rules {
            if matches_pattern(&target, &rule.pattern) {
                let len = rule.pattern.len();
                best = match best {
                    Some((best_len, best_allow)) if best_len > len || (best_len == len && best_allow) => {
                        Some((best_len, best_allow))
                    }
                    _ => Some((len, rule.allow)),
                };
            }
        }

        best.map(|(_, allow)| allow).unwrap_or(true)
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        self.group_for(user_agent)
            .and_then(|group| group.crawl_delay)
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }
}

/// Robots path pattern with `*` wildcards and a `$` end anchor
fn matches_pattern(path: &str, pattern: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };

    if !pattern.contains('*') {
        return if anchored { path == pattern } else { path.starts_with(pattern) };
    }

    let mut regex_pattern = String::from("^");
    for (i, part) in pattern.split('*').enumerate() {
        if i > 0 {
            regex_pattern.push_str(".*");
        }
        regex_pattern.push_str(&regex::escape(part));
    }
    if anchored {
        regex_pattern.push('$');
    }

    regex::Regex::new(&regex_pattern)
        .map(|re| re.is_match(path))
        .unwrap_or_else(|_| path.starts_with(pattern.trim_end_matches('*')))
}
