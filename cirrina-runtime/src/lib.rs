//! # cirrina-runtime
//!
//! Execution runtime for cirrina collaborative state machines.
//!
//! This crate provides:
//! - State machine instances with a command queue and an execution lock
//! - The command interpreter for transitions, events and actions
//! - Periodic timeout actions
//! - Pluggable scheduling and the runtime loop
//! - In-process event broker with delivery observers
//! - Service implementation selection
//! - Key-value backed shared contexts
//! - Job-based instantiation through a coordination service

pub mod broker;
pub mod command;
pub mod config;
pub mod coordination;
pub mod error;
pub mod instance;
pub mod kv;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod timeout;

pub use broker::{
    create_broker, Delivery, DeliveryFilter, EventHandler, EventListener, LocalEventBroker,
};
pub use command::{Command, CommandKind};
pub use config::{BrokerConfig, Config, ConfigError, CoordinationConfig, RuntimeConfig, SchedulerPolicy};
pub use coordination::{
    CoordinationService, InMemoryCoordination, JobDescription, JobMonitor, WatchEvent,
};
pub use error::RuntimeError;
pub use instance::{ExecutionGuard, InstanceEnvironment, InstanceStatus, StateMachineInstance};
pub use kv::{KeyValueContext, KeyValueStore, MemoryKeyValueStore};
pub use runtime::Runtime;
pub use scheduler::{RoundRobinScheduler, RuntimeScheduler};
pub use service::{FunctionServiceImplementation, ServiceImplementation, ServiceImplementationSelector};
pub use timeout::TimeoutActionManager;
