//! In-process function interception and frame-pointer backtraces.
//!
//! A [`HookDescriptor`] names what to intercept: a symbol, a non-virtual
//! member function or a virtual one. The [`HookRegistry`] resolves it,
//! hands the address to a [`Patcher`] and stores the original entry point in
//! a typed [`Hook`] slot that the replacement forwards through.
//!
//! For diagnostics, [`Backtrace`] walks the frame pointer chain of the
//! current thread and [`AddressClassifier`] turns return addresses into
//! offsets relative to the main executable.

mod abi;
mod backtrace;
mod breakpoint;
mod classify;
mod descriptor;
mod dynamic;
mod error;
mod hook;
mod image;
mod patch;
mod registry;
mod report;
mod resolver;
mod watch;

pub use abi::{ItaniumAbi, MemberAbi, MemberFnPtr};
pub use backtrace::{
    caller_return_address, current_frame_pointer, current_thread_stack, log_backtrace, Backtrace,
    StackFrame, StackWalker, MAX_TRACE_DEPTH,
};
pub use breakpoint::pause;
pub use classify::{AddressClassifier, ModuleBase, Offset, Rendered, DEFAULT_DISPLAY_BIAS};
pub use descriptor::{HookDescriptor, HookId, VtableSource};
pub use dynamic::DynamicSymbols;
pub use error::{HookError, ImageError, PatchError, ResolveError};
pub use hook::{Hook, HookFn};
pub use image::{defined_functions, undefined_functions, ProcessImage};
pub use patch::{write_slot, ImportPatcher, Patcher};
pub use registry::{HookRecord, HookRegistry};
pub use report::ReportSink;
pub use resolver::{AddressResolver, StaticSymbols, SymbolLookup};
pub use watch::WatchRegistry;
