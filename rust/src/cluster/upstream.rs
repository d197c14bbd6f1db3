//! Which directory a service node dials, and when to fail over to a backup.

use rand::Rng;
use tracing::info;

use super::config::ClusterConfig;

fn is_http(prefix: &str) -> bool {
    prefix.starts_with("http://") || prefix.starts_with("https://")
}

/// Endpoint selection for the down link. The chosen prefix is sticky until a
/// failover picks another one or the link is reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    url_prefix: Option<String>,
    preferred: Option<String>,
    requesting: Option<String>,
    failed_retries: u32,
    first_failed: u64,
    last_index: isize,
    announced: Option<String>,
}

impl Default for UpstreamTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamTarget {
    pub fn new() -> Self {
        Self {
            url_prefix: None,
            preferred: None,
            requesting: None,
            failed_retries: 0,
            first_failed: 0,
            last_index: 0,
            announced: None,
        }
    }

    /// Prefix to dial now. `global` is the current global directory prefix.
    pub fn current(&mut self, global: &str) -> String {
        if let Some(prefix) = &self.url_prefix {
            return prefix.clone();
        }
        let prefix = match self.preferred.take() {
            Some(p) if is_http(&p) => p,
            _ => global.to_string(),
        };
        self.url_prefix = Some(prefix.clone());
        self.requesting = Some(prefix.clone());
        prefix
    }

    /// Count a failed connect. Returns true when a backup prefix was chosen.
    pub fn record_failure<R: Rng>(
        &mut self,
        config: &ClusterConfig,
        global: &str,
        now: u64,
        rng: &mut R,
    ) -> bool {
        self.failed_retries = self.failed_retries.saturating_add(1);
        if self.first_failed == 0 {
            self.first_failed = now;
        }
        let elapsed = now.saturating_sub(self.first_failed);
        if self.failed_retries <= config.min_reconnect_retries
            || elapsed < config.max_reconnect_interval_ms
        {
            return false;
        }
        info!(
            retries = self.failed_retries,
            elapsed_ms = elapsed,
            "directory unreachable, switching to another prefix"
        );
        self.url_prefix = None;
        self.preferred = None;
        let backups = &config.global_backup_servers;
        if backups.is_empty() {
            return false;
        }
        let requesting = self.requesting.clone().unwrap_or_default();
        if config.backup_server_strategy == 1 {
            self.last_index = self.last_index.max(0);
            let next = backups
                .iter()
                .enumerate()
                .skip(self.last_index as usize)
                .find(|(_, p)| **p != requesting && is_http(p));
            match next {
                Some((i, prefix)) => {
                    self.last_index = i as isize;
                    self.preferred = Some(prefix.clone());
                }
                None => {
                    self.last_index = -1;
                    self.preferred = Some(global.to_string());
                }
            }
        } else {
            let mut draws = backups.len() * config.backup_server_random_factor.max(1);
            while draws > 0 {
                draws -= 1;
                let index = rng.gen_range(0..backups.len());
                if index as isize == self.last_index {
                    continue;
                }
                let prefix = &backups[index];
                if !is_http(prefix) {
                    continue;
                }
                if *prefix == requesting && backups.len() > 1 && draws > 0 {
                    continue;
                }
                self.preferred = Some(prefix.clone());
                self.last_index = index as isize;
                break;
            }
        }
        self.preferred.is_some()
    }

    /// The link connected. Returns the prefix it connected through.
    pub fn record_success(&mut self) -> Option<String> {
        self.failed_retries = 0;
        self.first_failed = 0;
        self.url_prefix.clone()
    }

    /// Forget the sticky prefix so the next dial resolves it again.
    pub fn reset(&mut self) {
        self.url_prefix = None;
        self.preferred = None;
    }

    /// Remember the global prefix last announced to this node, returning the
    /// one announced before it.
    pub fn announce(&mut self, prefix: Option<&str>) -> Option<String> {
        std::mem::replace(&mut self.announced, prefix.map(String::from))
    }

    pub fn failed_retries(&self) -> u32 {
        self.failed_retries
    }
}
