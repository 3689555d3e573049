//! Built-in middlewares.

use std::sync::Arc;

use crate::context::ExecutionContext;

pub mod print;
pub mod progress;

pub use print::PrintMiddleware;
pub use progress::ProgressMiddleware;

/// Installs the default chain: progress logging outermost, then `@print` handling.
pub fn use_defaults(ctx: &ExecutionContext) {
    ctx.use_middleware(Arc::new(ProgressMiddleware));
    ctx.use_middleware(Arc::new(PrintMiddleware));
}
