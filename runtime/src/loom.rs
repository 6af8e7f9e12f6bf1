//! Swaps in `loom`'s synchronization primitives when model-checking with
//! `--cfg loom`, `std`'s otherwise — the same shim pattern used by the
//! teacher workspace's `mpsc-queue`/`kasync2`/`async-kit` crates for their
//! own concurrency-sensitive data structures. The task queue, the structure
//! every worker thread touches on every scheduling decision, goes through
//! this module instead of `std::sync` directly so a `cargo test --cfg loom`
//! run can explore its interleavings with `loom`'s model checker.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync;
        pub(crate) use loom::thread;

        /// Runs `f` under loom's exhaustive interleaving search. Outside a
        /// `--cfg loom` build this just calls `f` once.
        pub(crate) fn model(f: impl Fn() + Sync + Send + 'static) {
            loom::model(f);
        }
    } else {
        pub(crate) mod sync {
            pub use std::sync::*;
        }

        pub(crate) mod thread {
            pub use std::thread::*;
        }

        pub(crate) fn model(f: impl FnOnce()) {
            f();
        }
    }
}
