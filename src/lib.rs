//! Workspace meta-crate. The runtime lives in the `lib/*` member crates; this
//! crate only anchors the workspace-wide integration tests under `tests/`.

pub use wavelet;
