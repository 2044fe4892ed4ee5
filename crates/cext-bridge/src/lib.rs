//! A handle bridge between a garbage-collected host runtime and native
//! extension code.
//!
//! Native extensions see managed objects as machine-word addresses. The
//! bridge hands out one stable [`NativeAddress`] per live object (its
//! [`Handle`]), frees the backing native resource exactly once after the
//! object is collected, and lets native memory keep objects alive through an
//! explicit mark protocol.
//!
//! # Pieces
//!
//! - [`Gil`]: the re-entrant execution lock every native call runs under.
//! - [`Handle`] and the cleaner list: one handle per object, disposed by the
//!   reaper thread once its object is gone.
//! - Mark passes: native resources report the objects they reference through
//!   [`Marker`]; the bridge keeps those alive until the next pass.
//! - Call adapters: [`Bridge::call_method`] runs an `extern "C"` function with
//!   handle arguments and turns raised exceptions into [`BridgeError::Raised`].
//! - [`UPCALLS`]: the C ABI native code calls back through.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cext_bridge::native::MallocAllocator;
//! use cext_bridge::{Bridge, ManagedObject, ObjectKind, Value};
//!
//! let bridge = Bridge::new(Arc::new(MallocAllocator::new())).unwrap();
//!
//! let object = ManagedObject::new(ObjectKind::Object);
//! let address = bridge.handle_for(&Value::from(Arc::clone(&object))).unwrap();
//! assert_eq!(bridge.handle_for(&Value::from(Arc::clone(&object))).unwrap(), address);
//!
//! // Immediates never allocate.
//! assert!(bridge.handle_for(&Value::Nil).unwrap().is_immediate());
//!
//! drop(object);
//! assert!(bridge.quiesce(Duration::from_secs(5)));
//! assert_eq!(bridge.live_handles(), 0);
//! ```
//!
//! # Custom data
//!
//! ```ignore
//! use cext_bridge::{Mark, NativeAddress};
//!
//! #[derive(Mark)]
//! struct Parser {
//!     source: NativeAddress,
//!     #[cext_bridge(skip)]
//!     position: usize,
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod bridge;
pub mod cleaner;
pub mod config;
mod context;
pub mod error;
pub mod extension;
mod gc;
pub mod gil;
pub mod handle;
pub mod mark;
pub mod method;
pub mod metrics;
pub mod native;
pub mod object;
mod tracing;
pub mod upcall;
pub mod value;

pub use bridge::Bridge;
pub use cleaner::{CleanerList, SlotKey};
pub use config::BridgeConfig;
pub use error::{BridgeError, ExtensionError, GilError, NativeError, NativeException};
pub use extension::Extension;
pub use gc::{CleanupRequest, PassStats};
pub use gil::{Gil, GilCell, GilGuard, Interrupt};
pub use handle::{Handle, HandleState};
pub use mark::{Mark, MarkSink, Marker};
pub use method::{Arity, NativeFunction, NativeMethod};
pub use metrics::MetricsSnapshot;
pub use native::NativeAllocator;
pub use object::{DataCell, DataType, ManagedObject, ObjectId, ObjectKind, ObjectRef};
pub use upcall::{UpcallTable, UPCALLS};
pub use value::{Immediate, NativeAddress, SymbolId, Value};

// Re-export derive macro when feature is enabled
#[cfg(feature = "derive")]
pub use cext_bridge_derive::Mark;
