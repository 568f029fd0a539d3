//! Profile lookups with bounded retry and a per-user cache.
//!
//! Each user is resolved at most once at a time, with attempts running one
//! after another under the directory's [`RetryPolicy`]. A user whose lookups
//! are exhausted keeps the `"User {id}"` placeholder for the lifetime of the
//! directory and is not looked up again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use bazaar_shared::{ChatError, Profile, UserId};

use crate::backend::ProfileResolver;
use crate::debounce::lock;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
enum Entry {
    Resolving,
    Resolved(Profile),
    Exhausted,
}

struct DirectoryInner {
    resolver: Arc<dyn ProfileResolver>,
    policy: RetryPolicy,
    entries: Mutex<HashMap<UserId, Entry>>,
    /// Bumped every time a lookup settles.
    version: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct ProfileDirectory {
    inner: Arc<DirectoryInner>,
}

impl ProfileDirectory {
    pub fn new(resolver: Arc<dyn ProfileResolver>, policy: RetryPolicy) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(DirectoryInner {
                resolver,
                policy,
                entries: Mutex::new(HashMap::new()),
                version,
            }),
        }
    }

    /// The resolved profile, if the lookup already succeeded.
    pub fn get(&self, user: UserId) -> Option<Profile> {
        match lock(&self.inner.entries).get(&user) {
            Some(Entry::Resolved(profile)) => Some(profile.clone()),
            _ => None,
        }
    }

    /// Resolved profile, or the placeholder while pending or after giving up.
    pub fn display(&self, user: UserId) -> Profile {
        self.get(user).unwrap_or_else(|| Profile::placeholder(user))
    }

    /// True once the lookup succeeded or gave up.
    pub fn is_settled(&self, user: UserId) -> bool {
        matches!(
            lock(&self.inner.entries).get(&user),
            Some(Entry::Resolved(_)) | Some(Entry::Exhausted)
        )
    }

    /// Notified whenever a lookup settles.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Start a background lookup for `user` unless one ran or is running.
    pub fn ensure(&self, user: UserId) {
        if !self.claim(user) {
            return;
        }
        let directory = self.clone();
        tokio::spawn(async move {
            directory.run_lookup(user).await;
        });
    }

    /// Resolve `user`, waiting for a lookup already in flight if needed.
    /// Never fails: gives the placeholder when lookups are exhausted.
    pub async fn resolve(&self, user: UserId) -> Profile {
        if self.claim(user) {
            return self.run_lookup(user).await;
        }

        let mut updates = self.updates();
        loop {
            if self.is_settled(user) {
                return self.display(user);
            }
            if updates.changed().await.is_err() {
                return self.display(user);
            }
        }
    }

    /// Mark `user` as resolving. False when it already is, or has settled.
    fn claim(&self, user: UserId) -> bool {
        let mut entries = lock(&self.inner.entries);
        if entries.contains_key(&user) {
            return false;
        }
        entries.insert(user, Entry::Resolving);
        true
    }

    async fn run_lookup(&self, user: UserId) -> Profile {
        let resolver = self.inner.resolver.clone();
        let outcome = self
            .inner
            .policy
            .run(|attempt| {
                let resolver = resolver.clone();
                async move {
                    debug!(user = %user, attempt, "resolving profile");
                    resolver.resolve(user).await
                }
            })
            .await;

        let (entry, profile) = match outcome {
            Ok(profile) => {
                info!(user = %user, name = %profile.name, "profile resolved");
                (Entry::Resolved(profile.clone()), profile)
            }
            Err(exhausted) => {
                let err = ChatError::ProfileResolutionExhausted {
                    user,
                    attempts: exhausted.attempts,
                };
                warn!(error = %err, last_error = %exhausted.last_error, "using placeholder name");
                (Entry::Exhausted, Profile::placeholder(user))
            }
        };

        lock(&self.inner.entries).insert(user, entry);
        self.inner.version.send_modify(|v| *v += 1);
        profile
    }
}
