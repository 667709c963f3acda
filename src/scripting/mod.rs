/// `scripting/` — embedded Lua host for transducer extensions
///
/// A `Session` owns one Lua runtime (mlua). Extensions are scripts loaded on
/// demand into their own namespace layer; the engine calls their functions
/// through the mirror isolator and notifies the main extension of events.
/// Script errors are returned as `ElgError` values, never raised across the
/// host boundary.
pub mod api;
pub mod dispatch;
pub mod engine;
pub mod extension;
pub mod mirror;
pub mod sandbox;
pub mod source;
pub mod trigger;
pub mod value;

pub use dispatch::{Cursor, TokenView};
pub use engine::Session;
pub use mirror::CallOutcome;
pub use value::{HostValue, NativeHandle};
