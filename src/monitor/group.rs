//! Rule groups.
//!
//! A `RuleGroup` is the mutable set of rules attached to one file. Rules can
//! be added and removed while lines are being dispatched: membership lives
//! behind a lock, and dispatch works on a snapshot so it never holds the lock
//! while blocked on a slow rule.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::{select, Receiver, Sender};

use crate::error::{ExecutionError, LogmonError, LogmonResult};

use super::rule::{MetricSample, Rule, RuleSpec};

fn lock_err(context: &'static str) -> LogmonError {
    LogmonError::internal(format!("poisoned lock: {context}"))
}

/// Result of dispatching one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to this many rules.
    Delivered(usize),
    /// The cancel signal fired while waiting on a rule.
    Cancelled,
}

/// Named collection of rules sharing one line stream.
#[derive(Debug)]
pub struct RuleGroup {
    rules: RwLock<BTreeMap<String, Arc<Rule>>>,
    generation: AtomicU64,
    input_capacity: usize,
    output: Sender<MetricSample>,
}

impl RuleGroup {
    /// Creates an empty group whose rules emit into `output`.
    #[must_use]
    pub fn new(input_capacity: usize, output: Sender<MetricSample>) -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
            input_capacity: input_capacity.max(1),
            output,
        }
    }

    /// Compiles and starts a rule under `spec.name`.
    ///
    /// # Errors
    ///
    /// `ExecutionError::DuplicateRule` if the name is taken, or the rule's
    /// creation error. On error nothing is registered.
    pub fn add(&self, spec: &RuleSpec) -> LogmonResult<Arc<Rule>> {
        let mut rules = self.rules.write().map_err(|_| lock_err("rule group"))?;
        if rules.contains_key(&spec.name) {
            return Err(ExecutionError::DuplicateRule {
                name: spec.name.clone(),
            }
            .into());
        }
        let rule = Arc::new(Rule::start(spec, self.input_capacity, self.output.clone())?);
        rules.insert(spec.name.clone(), Arc::clone(&rule));
        self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(rule = %spec.name, aggregation = %spec.aggregation, "rule added");
        Ok(rule)
    }

    /// Stops and unregisters a rule.
    ///
    /// # Errors
    ///
    /// `ExecutionError::RuleNotFound` (a lookup error) if no such rule exists.
    pub fn remove(&self, name: &str) -> LogmonResult<()> {
        let removed = {
            let mut rules = self.rules.write().map_err(|_| lock_err("rule group"))?;
            rules.remove(name)
        };
        let Some(rule) = removed else {
            return Err(ExecutionError::RuleNotFound {
                name: name.to_string(),
            }
            .into());
        };
        self.generation.fetch_add(1, Ordering::AcqRel);
        rule.stop();
        Ok(())
    }

    /// Stops and unregisters every rule. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let drained: Vec<Arc<Rule>> = match self.rules.write() {
            Ok(mut rules) => std::mem::take(&mut *rules).into_values().collect(),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()).into_values().collect(),
        };
        self.generation.fetch_add(1, Ordering::AcqRel);
        for rule in &drained {
            rule.stop();
        }
        drained.len()
    }

    /// Whether a rule with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.rules.read().is_ok_and(|rules| rules.contains_key(name))
    }

    /// Names of current rules, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.rules
            .read()
            .map(|rules| rules.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.read().map_or(0, |rules| rules.len())
    }

    /// Whether the group has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter bumped on every membership change.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Current members.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Rule>> {
        self.rules
            .read()
            .map(|rules| rules.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Hands `line` to every current rule, in name order.
    ///
    /// Blocks on a rule whose input queue is full; a slow rule throttles the
    /// whole file rather than losing lines. Rules stopped mid-dispatch are
    /// skipped. Returns early if `cancel` fires.
    pub fn dispatch(&self, line: &Arc<str>, cancel: &Receiver<()>) -> Dispatch {
        dispatch_to(&self.snapshot(), line, cancel)
    }
}

/// Delivers one line to each rule in `rules`.
pub(crate) fn dispatch_to(rules: &[Arc<Rule>], line: &Arc<str>, cancel: &Receiver<()>) -> Dispatch {
    let mut delivered = 0;
    for rule in rules {
        if rule.is_stopped() {
            continue;
        }
        let sent = select! {
            send(rule.input(), Arc::clone(line)) -> res => Some(res.is_ok()),
            recv(cancel) -> _ => None,
        };
        match sent {
            Some(true) => delivered += 1,
            Some(false) => {}
            None => return Dispatch::Cancelled,
        }
    }
    Dispatch::Delivered(delivered)
}

impl Drop for RuleGroup {
    fn drop(&mut self) {
        self.clear();
    }
}
