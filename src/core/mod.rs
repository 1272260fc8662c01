pub mod compiler;
pub mod diagnostics;
pub mod hardware;
pub mod loader;
pub mod runtime;
pub mod selector;
pub mod verifier;
