// Accounts: the isolation boundary for subjects.
//
// Each account owns one matcher plus the refcounts that drive route interest
// propagation. Matcher mutation and refcount updates happen under the same
// write lock so a publish matching concurrently never observes one without
// the other.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use plume_subject::{MatchResult, Matcher};

use crate::connection::{ConnectionId, Subscription};

/// Account used when a client does not name one in CONNECT.
pub const DEFAULT_ACCOUNT: &str = "$default";

/// Outbound interest change to broadcast across every route. `Sub` with a
/// queue doubles as the weight-update message when the group grows or
/// shrinks without emptying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Propagation {
    None,
    Sub {
        subject: String,
        queue: Option<String>,
        weight: u32,
        rsid: String,
    },
    Unsub {
        subject: String,
        queue: Option<String>,
        rsid: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InterestKey {
    subject: String,
    queue: Option<String>,
}

#[derive(Debug)]
struct InterestEntry {
    /// Local client subscriptions coalesced under this key.
    count: u32,
    /// The serial id our peers know this interest by.
    rsid: String,
}

#[derive(Debug)]
struct AccountState {
    matcher: Matcher<Arc<Subscription>>,
    interest: HashMap<InterestKey, InterestEntry>,
}

#[derive(Debug)]
pub struct Account {
    pub name: String,
    state: RwLock<AccountState>,
    clients: Mutex<HashSet<ConnectionId>>,
    empty_since: Mutex<Option<Instant>>,
}

impl Account {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: RwLock::new(AccountState {
                matcher: Matcher::new(),
                interest: HashMap::new(),
            }),
            clients: Mutex::new(HashSet::new()),
            empty_since: Mutex::new(None),
        })
    }

    /// Add a client-owned subscription. The matcher insert and the interest
    /// refcount bump are one critical section; an invalid pattern leaves no
    /// partial state behind.
    pub fn insert_client_sub(
        &self,
        sub: Arc<Subscription>,
        next_rsid: &AtomicU64,
    ) -> plume_subject::Result<Propagation> {
        let mut state = self.state.write().expect("account lock");
        state.matcher.insert(Arc::clone(&sub))?;
        let key = InterestKey {
            subject: sub.subject.clone(),
            queue: sub.queue.clone(),
        };
        let entry = state.interest.entry(key).or_insert_with(|| InterestEntry {
            count: 0,
            rsid: next_rsid.fetch_add(1, Ordering::Relaxed).to_string(),
        });
        entry.count += 1;
        let first = entry.count == 1;
        if first || sub.queue.is_some() {
            // 0 -> 1 announces the interest; queue joins re-announce to keep
            // the remote weight accurate.
            Ok(Propagation::Sub {
                subject: sub.subject.clone(),
                queue: sub.queue.clone(),
                weight: entry.count,
                rsid: entry.rsid.clone(),
            })
        } else {
            Ok(Propagation::None)
        }
    }

    /// Remove a client-owned subscription, returning the interest change to
    /// broadcast (if any).
    pub fn remove_client_sub(&self, sub: &Arc<Subscription>) -> Propagation {
        let mut state = self.state.write().expect("account lock");
        if !state.matcher.remove(sub) {
            return Propagation::None;
        }
        let key = InterestKey {
            subject: sub.subject.clone(),
            queue: sub.queue.clone(),
        };
        let Some(entry) = state.interest.get_mut(&key) else {
            return Propagation::None;
        };
        entry.count = entry.count.saturating_sub(1);
        if entry.count == 0 {
            let rsid = entry.rsid.clone();
            state.interest.remove(&key);
            Propagation::Unsub {
                subject: sub.subject.clone(),
                queue: sub.queue.clone(),
                rsid,
            }
        } else if sub.queue.is_some() {
            Propagation::Sub {
                subject: sub.subject.clone(),
                queue: sub.queue.clone(),
                weight: entry.count,
                rsid: entry.rsid.clone(),
            }
        } else {
            Propagation::None
        }
    }

    /// Index remote interest received over a route. Synthetic subs never
    /// feed back into propagation; a routed message is never re-forwarded.
    pub fn insert_route_sub(&self, sub: Arc<Subscription>) -> plume_subject::Result<()> {
        let mut state = self.state.write().expect("account lock");
        state.matcher.insert(sub)
    }

    pub fn remove_route_sub(&self, sub: &Arc<Subscription>) -> bool {
        let mut state = self.state.write().expect("account lock");
        state.matcher.remove(sub)
    }

    pub fn match_subject(&self, subject: &str) -> MatchResult<Arc<Subscription>> {
        self.state.read().expect("account lock").matcher.match_subject(subject)
    }

    /// Fast negative probe used by routes to gate fanout.
    pub fn has_interest(&self, subject: &str) -> bool {
        self.state.read().expect("account lock").matcher.has_interest(subject)
    }

    pub fn sub_count(&self) -> usize {
        self.state.read().expect("account lock").matcher.count()
    }

    /// Current coalesced interest, replayed to a route on (re)connect.
    pub fn interest_snapshot(&self) -> Vec<Propagation> {
        let state = self.state.read().expect("account lock");
        state
            .interest
            .iter()
            .map(|(key, entry)| Propagation::Sub {
                subject: key.subject.clone(),
                queue: key.queue.clone(),
                weight: entry.count,
                rsid: entry.rsid.clone(),
            })
            .collect()
    }

    pub fn add_client(&self, id: ConnectionId) {
        self.clients.lock().expect("clients lock").insert(id);
    }

    pub fn remove_client(&self, id: ConnectionId) {
        self.clients.lock().expect("clients lock").remove(&id);
    }

    pub fn num_clients(&self) -> usize {
        self.clients.lock().expect("clients lock").len()
    }

    pub fn is_empty(&self) -> bool {
        if !self.clients.lock().expect("clients lock").is_empty() {
            return false;
        }
        let state = self.state.read().expect("account lock");
        state.matcher.count() == 0 && state.interest.is_empty()
    }

    /// Grace-period bookkeeping for the account sweeper. Returns true once
    /// the account has been continuously empty for `grace`.
    pub fn sweep(&self, grace: Duration) -> bool {
        let mut empty_since = self.empty_since.lock().expect("empty lock");
        if !self.is_empty() {
            *empty_since = None;
            return false;
        }
        match *empty_since {
            None => {
                *empty_since = Some(Instant::now());
                false
            }
            Some(since) => since.elapsed() >= grace,
        }
    }
}
