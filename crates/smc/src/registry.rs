//! Run registry: one stream and one producer per distinct command invocation.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use longbuffer::Stream;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identifies a run: the command slug plus its substituted argv.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub slug: String,
    pub args: Vec<String>,
}

impl RunKey {
    pub fn new(slug: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            slug: slug.into(),
            args,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.slug, self.args.join("/"))
    }
}

/// A stream and the token that stops its producer.
#[derive(Debug, Clone)]
pub struct Run {
    pub stream: Stream,
    pub cancel: CancellationToken,
}

impl Run {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub open: usize,
    pub closed: usize,
}

/// Concurrent map of runs, shared by every request handler.
#[derive(Clone, Default)]
pub struct Registry {
    runs: Arc<DashMap<RunKey, Run>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the run for `key`, creating it with `create` if there is none.
    ///
    /// The boolean is true when this call created the run. `create` runs at
    /// most once per key, under the map's shard lock, so keep it short.
    pub fn get_or_create<F, E>(&self, key: RunKey, create: F) -> Result<(Run, bool), E>
    where
        F: FnOnce() -> Result<Run, E>,
    {
        match self.runs.entry(key) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), false)),
            Entry::Vacant(entry) => {
                let run = create()?;
                tracing::info!(
                    run.key = %entry.key(),
                    stream.id = %run.stream.id(),
                    "Run created"
                );
                entry.insert(run.clone());
                Ok((run, true))
            }
        }
    }

    pub fn get(&self, key: &RunKey) -> Option<Run> {
        self.runs.get(key).map(|run| run.clone())
    }

    /// Cancel the producer of `key`. Returns the run, `None` if unknown.
    ///
    /// Cancelling twice is harmless.
    pub fn cancel(&self, key: &RunKey) -> Option<Run> {
        let run = self.get(key)?;
        if !run.cancel.is_cancelled() {
            tracing::info!(run.key = %key, stream.id = %run.stream.id(), "Run cancelled");
        }
        run.cancel.cancel();
        Some(run)
    }

    /// Cancel every producer, for shutdown.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for run in self.runs.iter() {
            if !run.cancel.is_cancelled() {
                run.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for run in self.runs.iter() {
            stats.total += 1;
            if run.stream.is_closed() {
                stats.closed += 1;
            } else {
                stats.open += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::TempDir;

    fn key(slug: &str, args: &[&str]) -> RunKey {
        RunKey::new(slug, args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_get_or_create_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = Registry::new();
        let mut calls = 0;

        let (first, fresh) = registry.get_or_create(key("nmap", &["host"]), || {
            calls += 1;
            Stream::create(temp_dir.path(), 64).map(Run::new)
        })?;
        assert!(fresh);

        let (second, fresh) = registry.get_or_create(key("nmap", &["host"]), || {
            calls += 1;
            Stream::create(temp_dir.path(), 64).map(Run::new)
        })?;
        assert!(!fresh);

        assert_eq!(calls, 1);
        assert_eq!(first.stream.id(), second.stream.id());
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn test_slug_is_part_of_the_key() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = Registry::new();

        for slug in ["ping", "dig"] {
            let (_, fresh) = registry.get_or_create(key(slug, &["example.org"]), || {
                Stream::create(temp_dir.path(), 64).map(Run::new)
            })?;
            assert!(fresh);
        }
        assert_eq!(registry.len(), 2);
        Ok(())
    }

    #[test]
    fn test_create_failure_leaves_no_entry() {
        let registry = Registry::new();
        let result: Result<(Run, bool), &str> =
            registry.get_or_create(key("x", &[]), || Err("disk full"));
        assert_eq!(result.unwrap_err(), "disk full");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = Registry::new();
        let k = key("nmap", &["host"]);
        registry.get_or_create(k.clone(), || Stream::create(temp_dir.path(), 64).map(Run::new))?;

        let run = registry.cancel(&k).expect("run exists");
        assert!(run.cancel.is_cancelled());
        assert!(registry.cancel(&k).is_some());
        assert!(registry.cancel(&key("nmap", &["other"])).is_none());
        Ok(())
    }

    #[test]
    fn test_stats_and_cancel_all() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = Registry::new();
        let (done, _) = registry.get_or_create(key("a", &[]), || {
            Stream::create(temp_dir.path(), 64).map(Run::new)
        })?;
        registry.get_or_create(key("b", &[]), || Stream::create(temp_dir.path(), 64).map(Run::new))?;
        done.stream.close()?;

        assert_eq!(
            registry.stats(),
            RegistryStats {
                total: 2,
                open: 1,
                closed: 1
            }
        );
        assert_eq!(registry.cancel_all(), 2);
        assert_eq!(registry.cancel_all(), 0);
        Ok(())
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key("dig", &["a", "b"]).to_string(), "dig:a/b");
    }
}
