// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod descriptor;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod reporter;
pub mod service;
pub mod topology;

pub use service::RabbitMQ;
