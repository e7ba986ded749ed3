// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Descriptors
//!
//! A topology descriptor lists the exchanges, queues and bindings an
//! application expects to find on the broker. Descriptors live as JSON files in
//! a migrations directory:
//!
//! ```json
//! {
//!   "exchanges": [{ "name": "orders", "type": "topic", "durable": true }],
//!   "queues":    [{ "name": "orders.created", "durable": true }],
//!   "bindings":  [{ "source": "orders", "destination": "orders.created", "routingKey": "created" }]
//! }
//! ```
//!
//! Every regular file of the directory is decoded in file-name order and the
//! results are concatenated. Repeated declarations are fine as long as they
//! agree; the same exchange or queue declared with different parameters is a
//! conflict.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path};
use tracing::{debug, error};

/// Ordered aggregation of exchanges, queues and bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopologyDescriptor {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub bindings: Vec<QueueBinding>,
}

impl TopologyDescriptor {
    pub fn new() -> TopologyDescriptor {
        TopologyDescriptor::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }

    /// Decodes one descriptor document. `source` only labels errors.
    pub fn from_json(source: &str, raw: &str) -> Result<TopologyDescriptor, AmqpError> {
        serde_json::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), file = source, "failure to parse topology file");
            AmqpError::DescriptorParseError(source.to_owned(), err.to_string())
        })
    }

    /// Loads and merges every descriptor file found in `dir`.
    ///
    /// Sub-directories are skipped. A missing directory, an unreadable file,
    /// an undecodable file or a conflicting declaration fails the whole load.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<TopologyDescriptor, AmqpError> {
        let dir = dir.as_ref();
        let dir_label = dir.display().to_string();
        let read_err = |label: &str, err: std::io::Error| {
            error!(error = err.to_string(), path = label, "failure to read topology files");
            AmqpError::DescriptorReadError(label.to_owned(), err.to_string())
        };

        let mut paths = vec![];
        for entry in fs::read_dir(dir).map_err(|err| read_err(&dir_label, err))? {
            let entry = entry.map_err(|err| read_err(&dir_label, err))?;
            let file_type = entry.file_type().map_err(|err| read_err(&dir_label, err))?;
            if file_type.is_dir() {
                continue;
            }
            paths.push(entry.path());
        }
        paths.sort();

        let mut descriptor = TopologyDescriptor::new();
        for path in paths {
            let label = path.display().to_string();
            debug!("loading topology file: {}", label);

            let raw = fs::read_to_string(&path).map_err(|err| read_err(&label, err))?;
            descriptor.merge(Self::from_json(&label, &raw)?)?;
        }

        debug!(
            exchanges = descriptor.exchanges.len(),
            queues = descriptor.queues.len(),
            bindings = descriptor.bindings.len(),
            "topology files loaded"
        );

        Ok(descriptor)
    }

    /// Appends `other` to this descriptor, then checks the result for
    /// conflicting declarations.
    pub fn merge(&mut self, other: TopologyDescriptor) -> Result<(), AmqpError> {
        self.exchanges.extend(other.exchanges);
        self.queues.extend(other.queues);
        self.bindings.extend(other.bindings);
        self.check_conflicts()
    }

    /// Fails when one exchange or queue name is declared with different
    /// parameters.
    pub fn check_conflicts(&self) -> Result<(), AmqpError> {
        let mut exchanges: HashMap<&str, &ExchangeDefinition> = HashMap::new();
        for exch in &self.exchanges {
            match exchanges.get(exch.name.as_str()) {
                Some(seen) if seen.durable != exch.durable => {
                    return Err(conflict(&exch.name, "exchange declared with different durability"));
                }
                Some(seen) if seen.kind != exch.kind => {
                    return Err(conflict(&exch.name, "exchange declared with different types"));
                }
                Some(_) => {}
                None => {
                    exchanges.insert(&exch.name, exch);
                }
            }
        }

        let mut queues: HashMap<&str, bool> = HashMap::new();
        for queue in &self.queues {
            match queues.get(queue.name.as_str()) {
                Some(durable) if *durable != queue.durable => {
                    return Err(conflict(&queue.name, "queue declared with different durability"));
                }
                Some(_) => {}
                None => {
                    queues.insert(&queue.name, queue.durable);
                }
            }
        }

        Ok(())
    }
}

fn conflict(name: &str, reason: &str) -> AmqpError {
    error!(name = name, reason = reason, "conflicting topology declaration");
    AmqpError::TopologyConflictError(name.to_owned(), reason.to_owned())
}
