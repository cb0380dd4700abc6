use std::collections::VecDeque;

use crate::driver::Offer;
use crate::scheduler::job::{Job, Resources};

/// Jobs chosen for one offer, plus what is left of the offer afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job_ids: Vec<u64>,
    pub remaining: Resources,
}

impl Assignment {
    pub fn is_empty(&self) -> bool {
        self.job_ids.is_empty()
    }
}

/// Greedily pack `queued` (already in ascending id order) into `available`.
///
/// Jobs are taken first-fit in the order given: a job that does not fit in
/// what is left is skipped, and later, smaller jobs may still be placed.
/// A job is either placed whole or not at all.
pub fn assign<'a, I>(available: &Resources, queued: I) -> Assignment
where
    I: IntoIterator<Item = &'a Job>,
{
    let mut remaining = *available;
    let mut job_ids = Vec::new();
    for job in queued {
        if let Some(rest) = remaining.checked_sub(&job.resources) {
            remaining = rest;
            job_ids.push(job.id);
        }
    }
    Assignment { job_ids, remaining }
}

/// Offers received but not yet consumed, oldest first.
///
/// Bounded: pushing into a full stock evicts the oldest offer, which the caller
/// must decline.
#[derive(Debug)]
pub struct OfferStock {
    offers: VecDeque<Offer>,
    capacity: usize,
}

impl OfferStock {
    pub fn new(capacity: usize) -> Self {
        Self {
            offers: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Keep `offer` for later. Returns the offer that no longer fits, if any.
    pub fn push(&mut self, offer: Offer) -> Option<Offer> {
        if self.capacity == 0 {
            return Some(offer);
        }
        let evicted = if self.offers.len() >= self.capacity {
            self.offers.pop_front()
        } else {
            None
        };
        self.offers.push_back(offer);
        evicted
    }

    /// Remove and return the oldest stocked offer large enough for `request`.
    pub fn take_fitting(&mut self, request: &Resources) -> Option<Offer> {
        let pos = self
            .offers
            .iter()
            .position(|o| request.fits_in(&o.resources))?;
        self.offers.remove(pos)
    }

    pub fn rescind(&mut self, offer_id: &str) -> Option<Offer> {
        let pos = self.offers.iter().position(|o| o.id == offer_id)?;
        self.offers.remove(pos)
    }

    pub fn drain(&mut self) -> Vec<Offer> {
        self.offers.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    /// Sum of everything stocked from one agent.
    pub fn total_for(&self, agent_id: &str) -> Resources {
        self.offers
            .iter()
            .filter(|o| o.agent_id == agent_id)
            .fold(Resources::default(), |acc, o| acc.saturating_add(&o.resources))
    }

    /// Remove every stocked offer from `agent_id`.
    pub fn take_agent(&mut self, agent_id: &str) -> Vec<Offer> {
        let (taken, kept): (Vec<Offer>, Vec<Offer>) = self
            .offers
            .drain(..)
            .partition(|o| o.agent_id == agent_id);
        self.offers = kept.into();
        taken
    }

    /// Find the first agent whose stocked offers hold `request` only when
    /// taken together, and remove all of that agent's offers. Declining them
    /// lets the resource manager offer the agent's pool again in one piece.
    pub fn take_fragmented(&mut self, request: &Resources) -> Vec<Offer> {
        let agent = self
            .offers
            .iter()
            .map(|o| o.agent_id.as_str())
            .find(|agent| request.fits_in(&self.total_for(agent)))
            .map(str::to_string);
        match agent {
            Some(agent) => self.take_agent(&agent),
            None => Vec::new(),
        }
    }
}
