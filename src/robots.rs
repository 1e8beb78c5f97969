//! Per-host robots.txt rules and crawl-delay selection.

use std::time::Duration;

use robotstxt::DefaultMatcher;
use url::Url;

use crate::network::HttpClient;

/// Robots rules for one host, held for the lifetime of a fetcher's claim.
/// A host without usable rules is fully permissive.
pub struct HostRobots {
    body: Option<String>,
    user_agent: String,
}

impl HostRobots {
    /// Fetch and parse `http://<host>/robots.txt`. Network errors, non-200
    /// statuses, and unparseable bodies all degrade to "no rules".
    pub async fn fetch(http: &HttpClient, host: &str, user_agent: &str) -> Self {
        let body = match Url::parse(&format!("http://{host}/robots.txt")) {
            Ok(robots_url) => match http.fetch_text(&robots_url).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::info!(host, error = %e, "could not fetch robots.txt, allowing all");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(host, error = %e, "could not build robots.txt URL");
                None
            }
        };

        Self {
            body,
            user_agent: user_agent.to_string(),
        }
    }

    pub fn permissive(user_agent: &str) -> Self {
        Self {
            body: None,
            user_agent: user_agent.to_string(),
        }
    }

    /// Whether the configured agent may fetch this URL.
    pub fn allowed(&self, url: &str) -> bool {
        match &self.body {
            Some(body) => {
                DefaultMatcher::default().one_agent_allowed_by_robots(body, &self.user_agent, url)
            }
            None => true,
        }
    }

    /// Effective politeness delay: the robots `Crawl-delay` when it exceeds
    /// the configured default, capped at `max`.
    pub fn crawl_delay(&self, default: Duration, max: Duration) -> Duration {
        let advertised = self
            .body
            .as_deref()
            .and_then(|body| extract_crawl_delay(body, &self.user_agent));

        match advertised {
            Some(delay) if delay > default => delay.min(max),
            _ => default.min(max),
        }
    }
}

/// Pull the `Crawl-delay` directive out of the agent group matching
/// `user_agent`, falling back to the `*` group. The matcher crate does not
/// surface this directive, so it is parsed line-wise here.
fn extract_crawl_delay(robots_txt: &str, user_agent: &str) -> Option<Duration> {
    #[derive(Clone, Copy, PartialEq)]
    enum Group {
        None,
        Star,
        Agent,
    }

    let mut group = Group::None;
    let mut star_delay = None;
    let mut agent_delay = None;

    for line in robots_txt.lines() {
        let line = line.split('#').next().unwrap_or("").trim();

        if let Some(agent) = strip_directive(line, "user-agent") {
            group = if user_agent.to_lowercase().contains(&agent.to_lowercase()) {
                Group::Agent
            } else if agent == "*" {
                Group::Star
            } else {
                Group::None
            };
        } else if let Some(value) = strip_directive(line, "crawl-delay") {
            if let Ok(secs) = value.parse::<f64>() {
                if secs >= 0.0 {
                    match group {
                        Group::Agent => agent_delay = Some(Duration::from_secs_f64(secs)),
                        Group::Star => star_delay = Some(Duration::from_secs_f64(secs)),
                        Group::None => {}
                    }
                }
            }
        }
    }

    agent_delay.or(star_delay)
}

fn strip_directive<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    if key.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}
