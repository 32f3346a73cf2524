// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Registry
//!
//! Every transport client keeps its live channels in a `ChannelRegistry`,
//! keyed by the logical channel name and split by direction. Names are unique
//! per direction: registering the same name twice replaces the earlier entry.

use std::collections::HashMap;
use tracing::warn;

/// Whether a channel sends or receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelDirection {
    Producer,
    Consumer,
}

/// A registered channel: the broker-side destination it is bound to and the
/// SDK handle used to talk to it.
#[derive(Debug, Clone)]
pub struct ChannelEntry<H> {
    pub destination: String,
    pub direction: ChannelDirection,
    pub handle: H,
}

#[derive(Debug)]
pub struct ChannelRegistry<H> {
    producers: HashMap<String, ChannelEntry<H>>,
    consumers: HashMap<String, ChannelEntry<H>>,
}

impl<H> Default for ChannelRegistry<H> {
    fn default() -> Self {
        ChannelRegistry {
            producers: HashMap::default(),
            consumers: HashMap::default(),
        }
    }
}

impl<H> ChannelRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel, returning the entry it replaced, if any.
    pub fn insert(
        &mut self,
        name: &str,
        destination: &str,
        direction: ChannelDirection,
        handle: H,
    ) -> Option<ChannelEntry<H>> {
        let entry = ChannelEntry {
            destination: destination.to_owned(),
            direction,
            handle,
        };

        let previous = self.map_mut(direction).insert(name.to_owned(), entry);
        if previous.is_some() {
            warn!(channel = name, ?direction, "channel re-registered, replacing entry");
        }
        previous
    }

    pub fn get(&self, name: &str, direction: ChannelDirection) -> Option<&ChannelEntry<H>> {
        self.map(direction).get(name)
    }

    pub fn contains(&self, name: &str, direction: ChannelDirection) -> bool {
        self.map(direction).contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.producers.len() + self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(
        &self,
        direction: ChannelDirection,
    ) -> impl Iterator<Item = (&String, &ChannelEntry<H>)> {
        self.map(direction).iter()
    }

    fn map(&self, direction: ChannelDirection) -> &HashMap<String, ChannelEntry<H>> {
        match direction {
            ChannelDirection::Producer => &self.producers,
            ChannelDirection::Consumer => &self.consumers,
        }
    }

    fn map_mut(&mut self, direction: ChannelDirection) -> &mut HashMap<String, ChannelEntry<H>> {
        match direction {
            ChannelDirection::Producer => &mut self.producers,
            ChannelDirection::Consumer => &mut self.consumers,
        }
    }
}
