#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
mod log;
pub mod agent_options;
pub mod ckpt_gate;
pub mod ckpt_image;
pub mod connection;
pub mod error;
pub mod fdinfo;
pub mod flags;
pub mod interceptor;
mod kernel_metadata;
pub mod namespace;
pub mod orchestrator;
pub mod plugin;
#[cfg(feature = "preload")]
mod preload;
pub mod process_context;
pub mod real;
pub mod registry;
pub mod remap;
pub mod scoped_fd;
pub mod sig;
pub mod thread_plugin;
