//! Attribute and limit constraint matching
//!
//! Pure predicates over host attributes, used when weighing a task against
//! an offered host. Attribute lookups are cached per scheduling decision so
//! one decision sees a consistent view.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use crate::domain::{
    Attribute, ConstraintKind, LimitConstraint, ScheduledTask, TaskConstraint, ValueConstraint,
};

/// Supplies the attributes of a host.
pub trait AttributeLoader {
    fn attributes(&self, host: &str) -> BTreeSet<Attribute>;
}

impl<F> AttributeLoader for F
where
    F: Fn(&str) -> BTreeSet<Attribute>,
{
    fn attributes(&self, host: &str) -> BTreeSet<Attribute> {
        self(host)
    }
}

/// Caches host lookups for the lifetime of one scheduling decision.
pub struct CachingAttributeLoader<'a> {
    inner: &'a dyn AttributeLoader,
    cache: RefCell<HashMap<String, BTreeSet<Attribute>>>,
}

impl<'a> CachingAttributeLoader<'a> {
    pub fn new(inner: &'a dyn AttributeLoader) -> Self {
        Self {
            inner,
            cache: RefCell::new(HashMap::new()),
        }
    }
}

impl AttributeLoader for CachingAttributeLoader<'_> {
    fn attributes(&self, host: &str) -> BTreeSet<Attribute> {
        if let Some(hit) = self.cache.borrow().get(host) {
            return hit.clone();
        }
        let fetched = self.inner.attributes(host);
        self.cache
            .borrow_mut()
            .insert(host.to_string(), fetched.clone());
        fetched
    }
}

/// Whether a value constraint is satisfied by the host's attributes.
///
/// Matches iff `negated XOR (some constraint value appears among the host's
/// attribute values)`. An empty value set never matches un-negated and always
/// matches negated.
pub fn matches_value(attributes: &BTreeSet<Attribute>, constraint: &ValueConstraint) -> bool {
    let all_values: BTreeSet<&String> = attributes.iter().flat_map(|a| &a.values).collect();
    let hit = constraint.values.iter().any(|v| all_values.contains(v));
    constraint.negated ^ hit
}

/// Whether a limit constraint admits one more task of the job on this host.
///
/// Counts active tasks of the same (role, job) whose host carries any
/// attribute in common with the candidate host; satisfied while that count is
/// strictly below the limit.
pub fn matches_limit(
    candidate_attributes: &BTreeSet<Attribute>,
    role: &str,
    job_name: &str,
    constraint: &LimitConstraint,
    active_tasks: &[ScheduledTask],
    loader: &dyn AttributeLoader,
) -> bool {
    let occupied = active_tasks
        .iter()
        .filter(|task| task.role() == role && task.job_name() == job_name)
        .filter(|task| match &task.assigned_task.slave_host {
            Some(host) => loader
                .attributes(host)
                .iter()
                .any(|a| candidate_attributes.contains(a)),
            None => false,
        })
        .count();
    occupied < constraint.limit as usize
}

/// Whether every constraint of a task admits the candidate host.
pub fn satisfies_constraints(
    constraints: &[TaskConstraint],
    candidate_host: &str,
    role: &str,
    job_name: &str,
    active_tasks: &[ScheduledTask],
    loader: &dyn AttributeLoader,
) -> bool {
    let loader = CachingAttributeLoader::new(loader);
    let candidate_attributes = loader.attributes(candidate_host);

    constraints.iter().all(|c| {
        // A constraint names one attribute; value matching considers only it.
        let named: BTreeSet<Attribute> = candidate_attributes
            .iter()
            .filter(|a| a.name == c.name)
            .cloned()
            .collect();
        match &c.constraint {
            ConstraintKind::Value(value) => matches_value(&named, value),
            ConstraintKind::Limit(limit) => matches_limit(
                &named,
                role,
                job_name,
                limit,
                active_tasks,
                &loader,
            ),
        }
    })
}
