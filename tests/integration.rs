//! End-to-end tests that drive [`buildwright::Engine`] against scratch
//! projects, with a counting fake tool backend in place of `curl`/`go`.

mod common;

mod integration {
    pub mod failures;
    pub mod matrix;
    pub mod pipeline;
}
