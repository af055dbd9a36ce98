//! # Warden Agent
//!
//! Worker-side half of the supervisor protocol. A worker creates an
//! [`Agent`], registers callbacks for the events it cares about, and calls
//! [`Agent::start`]; from then on a background thread owns the socket.
//!
//! ```no_run
//! use warden_agent::{Agent, AgentConfig};
//! use warden_common::message::{Event, Signal};
//!
//! let agent = Agent::new(AgentConfig::new("/var/run/warden"));
//! agent.register_callback(Event::RollLogFiles, |_| println!("roll"));
//! agent.start()?;
//! agent.signal(Signal::CacheWarning, b"disk 2 slow".to_vec());
//! agent.stop();
//! # Ok::<(), warden_agent::AgentError>(())
//! ```

#![deny(missing_docs)]

pub mod agent;

pub use crate::agent::{Agent, AgentConfig, AgentError, FatalHandler};
