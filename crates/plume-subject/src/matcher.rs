// Token-tree interest matcher.
//
// Each node represents one subject token position. Literal tokens live in
// `children`, the `*` branch in `wc`, and `>` interest attaches to the node
// reached by the tokens before it. Callers arbitrate concurrent access; a
// match performed under a read guard sees a consistent snapshot because
// matched handles are cloned out before the guard drops.
use std::collections::HashMap;

use crate::{Result, TOKEN_FULL_WILDCARD, TOKEN_WILDCARD, validate_pattern};

/// An expression of interest the matcher can index: a pattern, an optional
/// queue group, and a key that is unique for the lifetime of the entry.
pub trait Interest {
    fn pattern(&self) -> &str;
    fn queue(&self) -> Option<&str>;
    fn key(&self) -> u64;
}

impl<T: Interest + ?Sized> Interest for std::sync::Arc<T> {
    fn pattern(&self) -> &str {
        (**self).pattern()
    }

    fn queue(&self) -> Option<&str> {
        (**self).queue()
    }

    fn key(&self) -> u64 {
        (**self).key()
    }
}

/// Subscriptions matching one concrete subject, split into the plain bag
/// (every entry is delivered) and per-queue-group bags (one entry each).
#[derive(Debug)]
pub struct MatchResult<S> {
    pub plain: Vec<S>,
    pub queues: Vec<QueueMatch<S>>,
}

#[derive(Debug)]
pub struct QueueMatch<S> {
    pub name: String,
    pub members: Vec<S>,
}

impl<S> Default for MatchResult<S> {
    fn default() -> Self {
        Self {
            plain: Vec::new(),
            queues: Vec::new(),
        }
    }
}

impl<S> MatchResult<S> {
    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.queues.is_empty()
    }

    // Queue bags from different tree nodes merge by group name so a group
    // spanning `foo.bar` and `foo.*` still delivers exactly once.
    fn queue_bag(&mut self, name: &str) -> &mut Vec<S> {
        if let Some(idx) = self.queues.iter().position(|q| q.name == name) {
            return &mut self.queues[idx].members;
        }
        self.queues.push(QueueMatch {
            name: name.to_string(),
            members: Vec::new(),
        });
        &mut self.queues.last_mut().expect("just pushed").members
    }
}

#[derive(Debug)]
struct Node<S> {
    children: HashMap<String, Node<S>>,
    wc: Option<Box<Node<S>>>,
    plain: Vec<S>,
    queues: HashMap<String, Vec<S>>,
    fwc_plain: Vec<S>,
    fwc_queues: HashMap<String, Vec<S>>,
}

impl<S> Default for Node<S> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            wc: None,
            plain: Vec::new(),
            queues: HashMap::new(),
            fwc_plain: Vec::new(),
            fwc_queues: HashMap::new(),
        }
    }
}

impl<S> Node<S> {
    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.wc.is_none()
            && self.plain.is_empty()
            && self.queues.is_empty()
            && self.fwc_plain.is_empty()
            && self.fwc_queues.is_empty()
    }
}

/// Wildcard-aware interest index over dot-separated subjects.
#[derive(Debug)]
pub struct Matcher<S> {
    root: Node<S>,
    count: usize,
}

impl<S> Default for Matcher<S> {
    fn default() -> Self {
        Self {
            root: Node::default(),
            count: 0,
        }
    }
}

impl<S: Interest + Clone> Matcher<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total interest entries currently indexed.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Index `sub` under its pattern. Rejects invalid patterns without
    /// touching the tree.
    pub fn insert(&mut self, sub: S) -> Result<()> {
        validate_pattern(sub.pattern())?;
        let pattern = sub.pattern().to_string();
        let tokens: Vec<&str> = pattern.split('.').collect();
        let fwc = *tokens.last().expect("validated non-empty") == TOKEN_FULL_WILDCARD;
        let walk = if fwc {
            &tokens[..tokens.len() - 1]
        } else {
            &tokens[..]
        };

        let mut node = &mut self.root;
        for token in walk {
            node = if *token == TOKEN_WILDCARD {
                node.wc.get_or_insert_with(Box::default).as_mut()
            } else {
                node.children.entry(token.to_string()).or_default()
            };
        }

        let queue = sub.queue().map(str::to_string);
        match (fwc, queue) {
            (false, None) => node.plain.push(sub),
            (false, Some(q)) => node.queues.entry(q).or_default().push(sub),
            (true, None) => node.fwc_plain.push(sub),
            (true, Some(q)) => node.fwc_queues.entry(q).or_default().push(sub),
        }
        self.count += 1;
        Ok(())
    }

    /// Remove `sub` by its (pattern, queue, key) identity, pruning branches
    /// left empty. Returns false when the entry is not present.
    pub fn remove(&mut self, sub: &S) -> bool {
        if validate_pattern(sub.pattern()).is_err() {
            return false;
        }
        let pattern = sub.pattern().to_string();
        let tokens: Vec<&str> = pattern.split('.').collect();
        let fwc = *tokens.last().expect("validated non-empty") == TOKEN_FULL_WILDCARD;
        let walk = if fwc {
            &tokens[..tokens.len() - 1]
        } else {
            &tokens[..]
        };
        let removed = Self::remove_at(&mut self.root, walk, fwc, sub);
        if removed {
            self.count -= 1;
        }
        removed
    }

    fn remove_at(node: &mut Node<S>, walk: &[&str], fwc: bool, sub: &S) -> bool {
        let Some((token, rest)) = walk.split_first() else {
            return Self::detach(node, fwc, sub);
        };
        if *token == TOKEN_WILDCARD {
            let Some(wc) = node.wc.as_mut() else {
                return false;
            };
            let removed = Self::remove_at(wc, rest, fwc, sub);
            if removed && wc.is_empty() {
                node.wc = None;
            }
            removed
        } else {
            let Some(child) = node.children.get_mut(*token) else {
                return false;
            };
            let removed = Self::remove_at(child, rest, fwc, sub);
            if removed && child.is_empty() {
                node.children.remove(*token);
            }
            removed
        }
    }

    fn detach(node: &mut Node<S>, fwc: bool, sub: &S) -> bool {
        fn take<S: Interest>(bag: &mut Vec<S>, key: u64) -> bool {
            match bag.iter().position(|s| s.key() == key) {
                Some(idx) => {
                    bag.swap_remove(idx);
                    true
                }
                None => false,
            }
        }
        let key = sub.key();
        match (fwc, sub.queue()) {
            (false, None) => take(&mut node.plain, key),
            (true, None) => take(&mut node.fwc_plain, key),
            (false, Some(q)) => {
                let Some(bag) = node.queues.get_mut(q) else {
                    return false;
                };
                let removed = take(bag, key);
                if removed && bag.is_empty() {
                    node.queues.remove(q);
                }
                removed
            }
            (true, Some(q)) => {
                let Some(bag) = node.fwc_queues.get_mut(q) else {
                    return false;
                };
                let removed = take(bag, key);
                if removed && bag.is_empty() {
                    node.fwc_queues.remove(q);
                }
                removed
            }
        }
    }

    /// Enumerate every indexed entry whose pattern accepts the literal
    /// `subject`. The subject must already be validated as a literal.
    pub fn match_subject(&self, subject: &str) -> MatchResult<S> {
        let tokens: Vec<&str> = subject.split('.').collect();
        let mut result = MatchResult::default();
        Self::collect(&self.root, &tokens, &mut result);
        result
    }

    fn collect(node: &Node<S>, remaining: &[&str], result: &mut MatchResult<S>) {
        let Some((token, rest)) = remaining.split_first() else {
            result.plain.extend(node.plain.iter().cloned());
            for (name, members) in &node.queues {
                result.queue_bag(name).extend(members.iter().cloned());
            }
            return;
        };
        // `>` attached here matches the remainder (at least one token left).
        result.plain.extend(node.fwc_plain.iter().cloned());
        for (name, members) in &node.fwc_queues {
            result.queue_bag(name).extend(members.iter().cloned());
        }
        if let Some(child) = node.children.get(*token) {
            Self::collect(child, rest, result);
        }
        if let Some(wc) = &node.wc {
            Self::collect(wc, rest, result);
        }
    }

    /// Fast boolean probe used to gate fanout without building a result set.
    pub fn has_interest(&self, subject: &str) -> bool {
        let tokens: Vec<&str> = subject.split('.').collect();
        Self::probe(&self.root, &tokens)
    }

    fn probe(node: &Node<S>, remaining: &[&str]) -> bool {
        let Some((token, rest)) = remaining.split_first() else {
            return !node.plain.is_empty() || !node.queues.is_empty();
        };
        if !node.fwc_plain.is_empty() || !node.fwc_queues.is_empty() {
            return true;
        }
        if let Some(child) = node.children.get(*token)
            && Self::probe(child, rest)
        {
            return true;
        }
        match &node.wc {
            Some(wc) => Self::probe(wc, rest),
            None => false,
        }
    }
}
