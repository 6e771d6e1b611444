use std::collections::{BTreeSet, HashMap};

use crate::{
    actor::Actor,
    error::Error,
    message::validate_queue_name,
};

/// Name → actor lookup, built once at startup and shared by handle with the
/// broker and the worker pool.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    actors: HashMap<String, Actor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, actor: Actor) -> Result<(), Error> {
        validate_queue_name(actor.queue_name())?;

        if self.actors.contains_key(actor.name()) {
            return Err(Error::duplicate_actor(actor.name()));
        }

        tracing::debug!(actor = actor.name(), queue = actor.queue_name(), "Registered actor");

        self.actors.insert(actor.name().to_owned(), actor);
        Ok(())
    }

    /// Builder-style [`Registry::register`].
    pub fn with(mut self, actor: Actor) -> Result<Self, Error> {
        self.register(actor)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Actor> {
        self.actors.get(name)
    }

    pub fn lookup(&self, name: &str) -> Result<&Actor, Error> {
        self.get(name).ok_or_else(|| Error::unknown_actor(name))
    }

    /// Every queue some actor sends to.
    pub fn queues(&self) -> BTreeSet<String> {
        self.actors
            .values()
            .map(|a| a.queue_name().to_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}
