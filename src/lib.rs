//! weft: the execution core of a coding-agent runtime.
//!
//! A model turn streams in as text; [`stream_transform`] pulls tool tags out
//! of it as they arrive, [`tools`] validates each call, and the
//! [`agent_loop`] dispatcher runs calls concurrently while keeping calls on
//! the same resource in issuance order. [`agent::AgentRuntime`] wraps a whole
//! run with retries and cancellation, and [`fanout`] runs best-of-N.
//!
//! # Quick Start
//!
//! ```ignore
//! use weft::prelude::*;
//!
//! let templates = AgentTemplates::new().with(
//!     AgentTemplate::builder()
//!         .id("base")
//!         .tool_names(vec!["write_file".into(), "end_turn".into()])
//!         .build(),
//! );
//! let runtime = AgentRuntime::builder()
//!     .provider(provider)
//!     .templates(templates)
//!     .build();
//! let run = runtime
//!     .run(RunOptions::builder().agent_type("base").prompt("Hello").build())
//!     .await;
//! println!("{}", run.to_json()?);
//! ```

pub mod agent;
pub mod agent_loop;
pub mod config;
pub mod error;
pub mod fanout;
pub mod prelude;
pub mod provider;
pub mod stream_transform;
pub mod tools;
pub mod types;
pub mod util;
